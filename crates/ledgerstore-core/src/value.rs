use std::fmt::Display;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::storage::StorageError;

// Fixed width so that text comparison orders timestamps.
const TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z");

/// A column value as it crosses the storage boundary, independent of the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn kind(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Integer(_) => "integer",
            SqlValue::Real(_) => "real",
            SqlValue::Text(_) => "text",
            SqlValue::Blob(_) => "blob",
        }
    }
}

impl Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Integer(i) => write!(f, "{}", i),
            SqlValue::Real(r) => write!(f, "{}", r),
            SqlValue::Text(s) => write!(f, "'{}'", s),
            SqlValue::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

/// Ids and positions are `u64` in the API and signed 64-bit in every engine.
impl TryFrom<u64> for SqlValue {
    type Error = StorageError;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        i64::try_from(v)
            .map(SqlValue::Integer)
            .map_err(|_| StorageError::OutOfRange(format!("{} does not fit a 64-bit signed column", v)))
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => SqlValue::Null,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported stored representation: {0}")]
    UnsupportedRepresentation(&'static str),
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("column {0} out of range")]
    MissingColumn(usize),
    #[error("column {index}: expected {expected}, found {found}")]
    UnexpectedType {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid timestamp: {0}")]
    Timestamp(String),
}

/// Decodes a JSON document stored in a single column.
///
/// `NULL` yields `None`. Text and blob columns are parsed; any other
/// representation is rejected.
pub fn decode_json<T: DeserializeOwned>(value: &SqlValue) -> Result<Option<T>, DecodeError> {
    match value {
        SqlValue::Null => Ok(None),
        SqlValue::Text(s) => Ok(Some(serde_json::from_str(s)?)),
        SqlValue::Blob(b) => Ok(Some(serde_json::from_slice(b)?)),
        other => Err(DecodeError::UnsupportedRepresentation(other.kind())),
    }
}

pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<SqlValue, DecodeError> {
    Ok(SqlValue::Text(serde_json::to_string(value)?))
}

pub fn encode_timestamp(ts: OffsetDateTime) -> Result<String, DecodeError> {
    ts.to_offset(UtcOffset::UTC)
        .format(TIMESTAMP_FORMAT)
        .map_err(|e| DecodeError::Timestamp(e.to_string()))
}

pub fn decode_timestamp(s: &str) -> Result<OffsetDateTime, DecodeError> {
    PrimitiveDateTime::parse(s, TIMESTAMP_FORMAT)
        .map(|dt| dt.assume_utc())
        .map_err(|e| DecodeError::Timestamp(e.to_string()))
}

/// One fetched row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row(pub Vec<SqlValue>);

impl Row {
    pub fn value(&self, index: usize) -> Result<&SqlValue, DecodeError> {
        self.0.get(index).ok_or(DecodeError::MissingColumn(index))
    }

    pub fn get_i64(&self, index: usize) -> Result<i64, DecodeError> {
        match self.value(index)? {
            SqlValue::Integer(i) => Ok(*i),
            other => Err(DecodeError::UnexpectedType {
                index,
                expected: "integer",
                found: other.kind(),
            }),
        }
    }

    /// Integer column where `NULL` (e.g. `SUM` over no rows) reads as zero.
    pub fn get_i64_or_zero(&self, index: usize) -> Result<i64, DecodeError> {
        match self.value(index)? {
            SqlValue::Null => Ok(0),
            _ => self.get_i64(index),
        }
    }

    pub fn get_string(&self, index: usize) -> Result<String, DecodeError> {
        match self.value(index)? {
            SqlValue::Text(s) => Ok(s.clone()),
            other => Err(DecodeError::UnexpectedType {
                index,
                expected: "text",
                found: other.kind(),
            }),
        }
    }

    pub fn get_opt_string(&self, index: usize) -> Result<Option<String>, DecodeError> {
        match self.value(index)? {
            SqlValue::Null => Ok(None),
            _ => self.get_string(index).map(Some),
        }
    }
}
