//! Two-phase commit transaction identifiers.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{Error, Result};

const MAX_PART_LEN: usize = 64;

/// A transaction id as used by two-phase commit.
///
/// Ids built with [`Xid::new`] follow the XA model (format id, global
/// transaction id, branch qualifier) and are sent to the server as
/// `"<format_id>_<base64 gtrid>_<base64 bqual>"`. A prepared transaction
/// whose gid is not in that form is represented with no format id and the
/// whole gid as `gtrid`.
///
/// Ids returned by [`tpc_recover`](crate::tokio::Conn::tpc_recover) also
/// carry the `prepared`, `owner` and `database` columns of
/// `pg_prepared_xacts`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    format_id: Option<i32>,
    gtrid: String,
    bqual: Option<String>,
    prepared: Option<String>,
    owner: Option<String>,
    database: Option<String>,
}

impl Xid {
    /// Build an XA-style id.
    ///
    /// `gtrid` and `bqual` are limited to 64 bytes and `format_id` must not
    /// be negative.
    pub fn new(format_id: i32, gtrid: impl Into<String>, bqual: impl Into<String>) -> Result<Self> {
        let gtrid = gtrid.into();
        let bqual = bqual.into();
        if format_id < 0 {
            return Err(Error::InvalidUsage(format!(
                "format_id must be a non-negative 32-bit integer, got {}",
                format_id
            )));
        }
        if gtrid.len() > MAX_PART_LEN {
            return Err(Error::InvalidUsage("gtrid must be a string no longer than 64 characters".into()));
        }
        if bqual.len() > MAX_PART_LEN {
            return Err(Error::InvalidUsage("bqual must be a string no longer than 64 characters".into()));
        }
        Ok(Self {
            format_id: Some(format_id),
            gtrid,
            bqual: Some(bqual),
            prepared: None,
            owner: None,
            database: None,
        })
    }

    /// Interpret a server-side transaction id (a `pg_prepared_xacts.gid`).
    ///
    /// Never fails: a gid that is not in XA form becomes an id with no
    /// format id.
    pub fn from_gid(gid: &str) -> Self {
        Self::parse_xa(gid).unwrap_or_else(|| Self {
            format_id: None,
            gtrid: gid.to_string(),
            bqual: None,
            prepared: None,
            owner: None,
            database: None,
        })
    }

    fn parse_xa(gid: &str) -> Option<Self> {
        let mut parts = gid.splitn(3, '_');
        let (format_id, gtrid, bqual) = (parts.next()?, parts.next()?, parts.next()?);
        if format_id.is_empty() || !format_id.bytes().all(|b| b.is_ascii_digit()) || bqual.contains('_') {
            return None;
        }
        let decode = |part: &str| {
            BASE64
                .decode(part)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        };
        Self::new(format_id.parse().ok()?, decode(gtrid)?, decode(bqual)?).ok()
    }

    pub(crate) fn with_recovery_info(
        mut self,
        prepared: Option<String>,
        owner: Option<String>,
        database: Option<String>,
    ) -> Self {
        self.prepared = prepared;
        self.owner = owner;
        self.database = database;
        self
    }

    /// Format id, `None` for a gid not in XA form.
    pub fn format_id(&self) -> Option<i32> {
        self.format_id
    }

    /// Global transaction id.
    pub fn gtrid(&self) -> &str {
        &self.gtrid
    }

    /// Branch qualifier, `None` for a gid not in XA form.
    pub fn bqual(&self) -> Option<&str> {
        self.bqual.as_deref()
    }

    /// Time the transaction was prepared, as reported by the server.
    pub fn prepared(&self) -> Option<&str> {
        self.prepared.as_deref()
    }

    /// Role that prepared the transaction.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Database the transaction was prepared in.
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// The gid sent to the server.
    pub fn gid(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format_id {
            None => f.write_str(&self.gtrid),
            Some(format_id) => write!(
                f,
                "{}_{}_{}",
                format_id,
                BASE64.encode(&self.gtrid),
                BASE64.encode(self.bqual.as_deref().unwrap_or_default())
            ),
        }
    }
}

impl From<&str> for Xid {
    fn from(gid: &str) -> Self {
        Self::from_gid(gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xa_gid_parses_back() {
        let xid = Xid::new(42, "tx-1", "branch").unwrap();
        let gid = xid.gid();
        assert_eq!(gid, "42_dHgtMQ==_YnJhbmNo");
        assert_eq!(Xid::from_gid(&gid), xid);
    }

    #[test]
    fn foreign_gid() {
        let xid = Xid::from_gid("some_random_gid_with_parts");
        assert_eq!(xid.format_id(), None);
        assert_eq!(xid.gtrid(), "some_random_gid_with_parts");
        assert_eq!(xid.bqual(), None);
        assert_eq!(xid.gid(), "some_random_gid_with_parts");

        // digits but not base64
        assert_eq!(Xid::from_gid("1_***_x").format_id(), None);
    }

    #[test]
    fn limits() {
        assert!(Xid::new(-1, "a", "b").is_err());
        assert!(Xid::new(i32::MAX, "a", "b").is_ok());
        assert!(Xid::new(0, "x".repeat(65), "b").is_err());
        assert!(Xid::new(0, "a", "y".repeat(65)).is_err());
        assert!(Xid::new(0, "x".repeat(64), "y".repeat(64)).is_ok());
    }
}
