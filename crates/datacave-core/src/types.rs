use crate::error::{DatacaveError, Result};
use serde::{Deserialize, Serialize};

/// PostgreSQL `pg_type` OIDs the client knows how to decode.
pub mod oid {
    pub const UNSPECIFIED: i32 = 0;
    pub const BOOL: i32 = 16;
    pub const BYTEA: i32 = 17;
    pub const INT8: i32 = 20;
    pub const INT2: i32 = 21;
    pub const INT4: i32 = 23;
    pub const TEXT: i32 = 25;
    pub const OID: i32 = 26;
    pub const FLOAT4: i32 = 700;
    pub const FLOAT8: i32 = 701;
    pub const VARCHAR: i32 = 1043;
    pub const NUMERIC: i32 = 1700;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DataValue {
    Null,
    Int64(i64),
    Float64(f64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
}

impl DataValue {
    /// Type OID declared for this value when it is bound as a parameter.
    ///
    /// Strings and NULLs are left unspecified so the server infers the type
    /// from the statement context.
    pub fn type_oid(&self) -> i32 {
        match self {
            DataValue::Null | DataValue::String(_) => oid::UNSPECIFIED,
            DataValue::Int64(_) => oid::INT8,
            DataValue::Float64(_) => oid::FLOAT8,
            DataValue::Bool(_) => oid::BOOL,
            DataValue::Bytes(_) => oid::BYTEA,
        }
    }

    /// Text-format wire representation, `None` for SQL NULL.
    pub fn to_text(&self) -> Option<Vec<u8>> {
        match self {
            DataValue::Null => None,
            DataValue::Int64(v) => Some(v.to_string().into_bytes()),
            DataValue::Float64(v) => Some(float_text(*v).into_bytes()),
            DataValue::Bool(v) => Some(if *v { b"t".to_vec() } else { b"f".to_vec() }),
            DataValue::String(v) => Some(v.clone().into_bytes()),
            DataValue::Bytes(v) => Some(format!("\\x{}", hex::encode(v)).into_bytes()),
        }
    }

    /// Decode a text-format column value according to its type OID.
    pub fn from_text(type_oid: i32, raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| DatacaveError::protocol(format!("invalid utf-8 in column of type {type_oid}")))?;
        let value = match type_oid {
            oid::INT2 | oid::INT4 | oid::INT8 | oid::OID => text
                .parse::<i64>()
                .map(DataValue::Int64)
                .map_err(|e| DatacaveError::protocol(format!("invalid integer {text:?}: {e}")))?,
            oid::FLOAT4 | oid::FLOAT8 => text
                .parse::<f64>()
                .map(DataValue::Float64)
                .map_err(|e| DatacaveError::protocol(format!("invalid float {text:?}: {e}")))?,
            oid::BOOL => match text {
                "t" | "true" => DataValue::Bool(true),
                "f" | "false" => DataValue::Bool(false),
                other => return Err(DatacaveError::protocol(format!("invalid bool {other:?}"))),
            },
            oid::BYTEA => {
                let digits = text
                    .strip_prefix("\\x")
                    .ok_or_else(|| DatacaveError::protocol("bytea value is not hex encoded"))?;
                DataValue::Bytes(
                    hex::decode(digits)
                        .map_err(|e| DatacaveError::protocol(format!("invalid bytea: {e}")))?,
                )
            }
            _ => DataValue::String(text.to_string()),
        };
        Ok(value)
    }
}

/// `f64` in the server's float input syntax.
fn float_text(v: f64) -> String {
    if v.is_nan() {
        "NaN".into()
    } else if v == f64::INFINITY {
        "Infinity".into()
    } else if v == f64::NEG_INFINITY {
        "-Infinity".into()
    } else {
        v.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Column {
    pub name: String,
    pub type_oid: i32,
}

impl Column {
    pub fn new(name: impl Into<String>, type_oid: i32) -> Self {
        Self {
            name: name.into(),
            type_oid,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataRow {
    pub values: Vec<DataValue>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<Column>,
    pub rows: Vec<DataRow>,
    pub rows_affected: u64,
    /// Command tag of the last completed statement, e.g. `INSERT 0 3`.
    pub tag: String,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// Extract the affected-row count from a command tag.
///
/// `INSERT 0 5` and `UPDATE 5` both report 5; tags without a trailing count
/// (`CREATE TABLE`, `BEGIN`) report 0.
pub fn rows_affected_from_tag(tag: &str) -> u64 {
    tag.rsplit(' ')
        .next()
        .and_then(|last| last.parse().ok())
        .unwrap_or(0)
}
