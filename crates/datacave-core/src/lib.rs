pub mod error;
pub mod types;

pub use error::{DatacaveError, Result, ServerError};
pub use types::{oid, rows_affected_from_tag, Column, DataRow, DataValue, QueryResult};
