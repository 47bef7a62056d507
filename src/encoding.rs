//! Client encoding used to decode server text.

use crate::error::{Error, Result};

/// Text encoding announced by the server's `client_encoding` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// UTF8 (the encoding requested at startup)
    #[default]
    Utf8,
    /// LATIN1 / ISO-8859-1
    Latin1,
    /// SQL_ASCII or any encoding without a dedicated decoder
    Other,
}

impl Encoding {
    /// Map a `client_encoding` value to an [`Encoding`].
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_uppercase().replace(['-', '_'], "").as_str() {
            "UTF8" | "UNICODE" => Encoding::Utf8,
            "LATIN1" | "ISO88591" => Encoding::Latin1,
            _ => Encoding::Other,
        }
    }

    /// Decode server bytes into a `String`.
    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        match self {
            Encoding::Utf8 => simdutf8::basic::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|e| Error::Data(format!("invalid UTF-8 from server: {e}"))),
            Encoding::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            Encoding::Other => Ok(String::from_utf8_lossy(bytes).into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(Encoding::from_name("UTF8"), Encoding::Utf8);
        assert_eq!(Encoding::from_name("utf-8"), Encoding::Utf8);
        assert_eq!(Encoding::from_name("LATIN1"), Encoding::Latin1);
        assert_eq!(Encoding::from_name("SQL_ASCII"), Encoding::Other);
    }

    #[test]
    fn decode_latin1_and_utf8() {
        assert_eq!(Encoding::Latin1.decode(&[0x63, 0xe9]).unwrap(), "cé");
        assert!(Encoding::Utf8.decode(&[0xe9]).is_err());
        assert_eq!(Encoding::Utf8.decode("é".as_bytes()).unwrap(), "é");
    }
}
