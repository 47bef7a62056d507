//! Query result backend messages.

use crate::error::{Error, Result};
use crate::protocol::codec::{read_bytes, read_cstr, read_i16, read_i32};

/// Size of the fixed part following each field name in RowDescription.
const FIELD_TAIL_SIZE: usize = 18;

/// RowDescription message - the column names of a result set.
///
/// Only names are kept; every result is requested in text format.
#[derive(Debug)]
pub struct RowDescription<'a> {
    names: Vec<&'a str>,
}

impl<'a> RowDescription<'a> {
    /// Parse a RowDescription message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (num_fields, mut data) = read_i16(payload)?;
        let mut names = Vec::with_capacity(num_fields.max(0) as usize);
        for _ in 0..num_fields {
            let (name, rest) = read_cstr(data)?;
            let (_, rest) = read_bytes(rest, FIELD_TAIL_SIZE)?;
            names.push(name);
            data = rest;
        }
        Ok(Self { names })
    }

    /// Column names in order.
    pub fn names(&self) -> &[&'a str] {
        &self.names
    }
}

/// DataRow message - contains a single row of data.
#[derive(Debug)]
pub struct DataRow<'a> {
    values: Vec<Option<&'a [u8]>>,
}

impl<'a> DataRow<'a> {
    /// Parse a DataRow message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (num_columns, mut data) = read_i16(payload)?;
        let mut values = Vec::with_capacity(num_columns.max(0) as usize);
        for _ in 0..num_columns {
            let (len, rest) = read_i32(data)?;
            if len < 0 {
                values.push(None);
                data = rest;
            } else {
                let (value, rest) = read_bytes(rest, len as usize)?;
                values.push(Some(value));
                data = rest;
            }
        }
        Ok(Self { values })
    }

    /// Raw column values, `None` for NULL.
    pub fn values(&self) -> &[Option<&'a [u8]>] {
        &self.values
    }
}

/// CommandComplete message - a command finished.
#[derive(Debug, Clone, Copy)]
pub struct CommandComplete<'a> {
    /// Command tag, e.g. `INSERT 0 5` or `BEGIN`
    pub tag: &'a str,
}

impl<'a> CommandComplete<'a> {
    /// Parse a CommandComplete message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (tag, _) = read_cstr(payload)?;
        Ok(Self { tag })
    }

    /// Number of rows affected, taken from the last word of the tag.
    ///
    /// Tags without a count (`BEGIN`, `SET`, ...) return `None`.
    pub fn rows_affected(&self) -> Option<u64> {
        let mut words = self.tag.split_whitespace();
        words.next()?;
        words.last()?.parse().ok()
    }
}

/// Reject a message that has no place in the current state.
pub(crate) fn unexpected(context: &str, type_byte: u8) -> Error {
    Error::Protocol(format!(
        "Unexpected message in {}: '{}'",
        context, type_byte as char
    ))
}
