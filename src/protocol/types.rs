//! Common PostgreSQL wire protocol types.

/// PostgreSQL Object Identifier (OID)
pub type Oid = u32;

/// Well-known type OIDs used by the driver.
pub mod oid {
    use super::Oid;

    /// Let the server infer the parameter type
    pub const UNSPECIFIED: Oid = 0;
    /// text
    pub const TEXT: Oid = 25;
    /// json
    pub const JSON: Oid = 114;
    /// jsonb
    pub const JSONB: Oid = 3802;
}

/// Data format code in PostgreSQL protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u16)]
pub enum FormatCode {
    /// Text format (human-readable)
    #[default]
    Text = 0,
    /// Binary format (type-specific packed representation)
    Binary = 1,
}

impl FormatCode {
    /// Create a FormatCode from a raw u16 value.
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => FormatCode::Binary,
            _ => FormatCode::Text, // Default to text for unknown values
        }
    }
}

/// Transaction status of a connection.
///
/// `Idle`, `InTransaction` and `InError` come from the server's ReadyForQuery
/// message. `Active` is reported while a command is in flight and `Unknown`
/// once the connection is broken or closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// Idle (not in transaction block)
    #[default]
    Idle,
    /// In transaction block
    InTransaction,
    /// In failed transaction block (queries will be rejected until rollback)
    InError,
    /// A command is in progress
    Active,
    /// Connection is unusable
    Unknown,
}

impl TransactionStatus {
    /// Create a TransactionStatus from a ReadyForQuery status byte.
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            b'I' => Some(TransactionStatus::Idle),
            b'T' => Some(TransactionStatus::InTransaction),
            b'E' => Some(TransactionStatus::InError),
            _ => None,
        }
    }

    /// Returns true if currently in a transaction (either active or failed).
    pub fn in_transaction(self) -> bool {
        matches!(
            self,
            TransactionStatus::InTransaction | TransactionStatus::InError
        )
    }

    /// Short upper-case name, as used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            TransactionStatus::Idle => "IDLE",
            TransactionStatus::InTransaction => "INTRANS",
            TransactionStatus::InError => "INERROR",
            TransactionStatus::Active => "ACTIVE",
            TransactionStatus::Unknown => "UNKNOWN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_from_ready_byte() {
        assert_eq!(TransactionStatus::from_byte(b'I'), Some(TransactionStatus::Idle));
        assert_eq!(
            TransactionStatus::from_byte(b'E'),
            Some(TransactionStatus::InError)
        );
        assert_eq!(TransactionStatus::from_byte(b'x'), None);
        assert!(TransactionStatus::InError.in_transaction());
        assert!(!TransactionStatus::Active.in_transaction());
    }
}
