use datacave_core::Column;

/// A server-side prepared statement owned by one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub(crate) name: String,
    pub(crate) sql: String,
    pub(crate) param_types: Vec<i32>,
    pub(crate) columns: Vec<Column>,
}

impl Statement {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameter type OIDs as resolved by the server.
    pub fn param_types(&self) -> &[i32] {
        &self.param_types
    }

    /// Result columns; empty for statements that return no rows.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
}
