//! SQL text for transaction control commands.

use std::fmt;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// The level as written after `ISOLATION LEVEL`.
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Characteristics applied to every transaction the connection starts.
///
/// `None` leaves the server default in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxSettings {
    pub isolation_level: Option<IsolationLevel>,
    pub read_only: Option<bool>,
    pub deferrable: Option<bool>,
}

impl TxSettings {
    /// The `BEGIN` command carrying these settings.
    pub fn begin_command(&self) -> String {
        let mut sql = String::from("BEGIN");
        if let Some(level) = self.isolation_level {
            sql.push_str(" ISOLATION LEVEL ");
            sql.push_str(level.as_sql());
        }
        match self.read_only {
            Some(true) => sql.push_str(" READ ONLY"),
            Some(false) => sql.push_str(" READ WRITE"),
            None => {}
        }
        match self.deferrable {
            Some(true) => sql.push_str(" DEFERRABLE"),
            Some(false) => sql.push_str(" NOT DEFERRABLE"),
            None => {}
        }
        sql
    }
}

/// Quote `name` as an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote `value` as an SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Name given to an unnamed savepoint opened at nesting `depth` (1-based).
pub fn generated_savepoint_name(depth: usize) -> String {
    format!("_zp_{}", depth)
}

pub fn savepoint(name: &str) -> String {
    format!("SAVEPOINT {}", quote_ident(name))
}

pub fn release_savepoint(name: &str) -> String {
    format!("RELEASE SAVEPOINT {}", quote_ident(name))
}

/// Commands undoing a savepoint. Sent one by one so they also work in a
/// pipeline, where a statement may not hold several commands.
pub fn rollback_to_savepoint(name: &str) -> [String; 2] {
    [
        format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name)),
        release_savepoint(name),
    ]
}

pub fn prepare_transaction(gid: &str) -> String {
    format!("PREPARE TRANSACTION {}", quote_literal(gid))
}

pub fn commit_prepared(gid: &str) -> String {
    format!("COMMIT PREPARED {}", quote_literal(gid))
}

pub fn rollback_prepared(gid: &str) -> String {
    format!("ROLLBACK PREPARED {}", quote_literal(gid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_with_settings() {
        assert_eq!(TxSettings::default().begin_command(), "BEGIN");
        let settings = TxSettings {
            isolation_level: Some(IsolationLevel::Serializable),
            read_only: Some(true),
            deferrable: Some(false),
        };
        assert_eq!(
            settings.begin_command(),
            "BEGIN ISOLATION LEVEL SERIALIZABLE READ ONLY NOT DEFERRABLE"
        );
    }

    #[test]
    fn quoting() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(
            rollback_to_savepoint("sp"),
            [
                "ROLLBACK TO SAVEPOINT \"sp\"".to_string(),
                "RELEASE SAVEPOINT \"sp\"".to_string()
            ]
        );
        assert_eq!(prepare_transaction("1_x_y"), "PREPARE TRANSACTION '1_x_y'");
    }
}
