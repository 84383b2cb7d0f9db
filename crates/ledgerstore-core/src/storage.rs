use thiserror::Error;

use crate::{
    context::Context,
    flavor::Flavor,
    value::{DecodeError, Row, SqlValue},
};

/// Flavor-independent storage errors. Backends translate engine errors into these.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unregistered flavor: {0}")]
    UnregisteredFlavor(Flavor),
    #[error("no connector registered under backend name '{0}'")]
    UnknownBackend(String),
    #[error("database already initialized")]
    AlreadyInitialized,
    #[error("database not initialized")]
    NotInitialized,
    #[error("failed to run statement {index}: {source}")]
    Migration {
        index: usize,
        #[source]
        source: Box<StorageError>,
    },
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("connectivity failure: {0}")]
    Connectivity(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("connection closed")]
    Closed,
    #[error("value out of range: {0}")]
    OutOfRange(String),
    #[error("transaction {0} is already reverted")]
    RevertIsFinal(u64),
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("{0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// Index of the failing migration statement, if this error came from one.
    pub fn statement_index(&self) -> Option<usize> {
        match self {
            StorageError::Migration { index, .. } => Some(*index),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadWrite,
    /// Read-only, every statement sees the same point in time.
    ReadSnapshot,
}

/// An open connection to one database.
///
/// Every call takes a [`Context`]; implementations check it before running a
/// statement and between fetched rows, and abort the running statement when
/// the engine allows it.
pub trait Connection: Send {
    fn flavor(&self) -> Flavor;

    fn execute(&mut self, ctx: &Context, sql: &str, params: &[SqlValue]) -> Result<u64, StorageError>;

    /// Runs one or more statements without parameters.
    fn execute_batch(&mut self, ctx: &Context, sql: &str) -> Result<(), StorageError>;

    fn query(&mut self, ctx: &Context, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StorageError>;

    fn query_opt(&mut self, ctx: &Context, sql: &str, params: &[SqlValue]) -> Result<Option<Row>, StorageError> {
        Ok(self.query(ctx, sql, params)?.into_iter().next())
    }

    fn begin(&mut self, ctx: &Context, mode: TxMode) -> Result<(), StorageError>;
    fn commit(&mut self, ctx: &Context) -> Result<(), StorageError>;
    fn rollback(&mut self) -> Result<(), StorageError>;

    /// Releases the underlying handle. Further calls fail with [`StorageError::Closed`].
    fn close(&mut self) -> Result<(), StorageError>;
    fn is_closed(&self) -> bool;
}

/// Opens connections for one low-level backend.
pub trait Connector: Send + Sync {
    /// The backend name flavors are mapped onto.
    fn name(&self) -> &str;

    fn flavor(&self) -> Flavor;

    fn open(&self, ctx: &Context, conn_string: &str) -> Result<Box<dyn Connection>, StorageError>;
}
