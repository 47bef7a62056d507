//! Parameter values handed over by the type adaptation layer.
//!
//! The driver does not convert Rust values to PostgreSQL values itself. An
//! adapter (such as [`crate::json::JsonRegistry`]) encodes a value into a
//! [`Param`], and the driver ships the bytes unchanged.

use crate::protocol::types::{FormatCode, Oid, oid};

/// A single encoded query parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    /// Encoded value, `None` for SQL NULL.
    pub value: Option<Vec<u8>>,
    /// Wire format of `value`.
    pub format: FormatCode,
    /// Parameter type, `0` lets the server infer it.
    pub oid: Oid,
}

impl Param {
    /// A text-format parameter with an inferred type.
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into().into_bytes()),
            format: FormatCode::Text,
            oid: oid::UNSPECIFIED,
        }
    }

    /// A binary-format parameter of the given type.
    pub fn binary(value: Vec<u8>, oid: Oid) -> Self {
        Self {
            value: Some(value),
            format: FormatCode::Binary,
            oid,
        }
    }

    /// SQL NULL with an inferred type.
    pub fn null() -> Self {
        Self {
            value: None,
            format: FormatCode::Text,
            oid: oid::UNSPECIFIED,
        }
    }

    /// Override the parameter type.
    pub fn with_oid(mut self, oid: Oid) -> Self {
        self.oid = oid;
        self
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Param::text(value)
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(value: Option<T>) -> Self {
        value.map_or_else(Param::null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_maps_to_null() {
        let p: Param = None::<&str>.into();
        assert_eq!(p, Param::null());
        let p: Param = Some("7").into();
        assert_eq!(p.value.as_deref(), Some(&b"7"[..]));
        assert_eq!(p.format, FormatCode::Text);
    }
}
