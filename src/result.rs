//! Text-format command results.

/// The result of one SQL command.
///
/// Values are kept in PostgreSQL text format; turning them into typed values
/// is the job of the adaptation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    /// Command tag, e.g. `SELECT 2` or `BEGIN`. Empty for an empty query.
    pub tag: String,
    /// Column names, empty for commands that return no rows.
    pub columns: Vec<String>,
    /// Rows of text values, `None` for NULL.
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    /// Number of rows affected, taken from the command tag.
    pub fn rows_affected(&self) -> Option<u64> {
        let mut words = self.tag.split_whitespace();
        words.next()?;
        words.last()?.parse().ok()
    }

    /// Value at `row`, `column`; `None` when out of range or NULL.
    pub fn get(&self, row: usize, column: usize) -> Option<&str> {
        self.rows.get(row)?.get(column)?.as_deref()
    }

    /// Index of the column called `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}
