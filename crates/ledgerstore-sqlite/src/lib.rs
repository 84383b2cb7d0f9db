//! SQLite backend for ledgerstore.
//!
//! Each [`SqliteConnection`] owns one `rusqlite::Connection`. Cancellation is
//! enforced by a progress handler installed for the duration of every call,
//! so a long-running statement is interrupted as soon as the caller's
//! [`Context`] is cancelled or runs past its deadline.

use std::{panic::AssertUnwindSafe, path::Path};

use ledgerstore_core::{
    storage::{Connection, Connector, StorageError, TxMode},
    Context, Flavor, Row, SqlValue,
};
use rusqlite::{params_from_iter, types::Value, types::ValueRef, ErrorCode};

pub const BACKEND_NAME: &str = "sqlite3";

pub const MEMORY_CONN_STRING: &str = ":memory:";

/// Virtual machine instructions between two cancellation checks.
const PROGRESS_STEPS: i32 = 1000;

pub fn file_conn_string(path: &Path) -> String {
    format!("file:{}", path.display())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteConnector;

impl Connector for SqliteConnector {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn flavor(&self) -> Flavor {
        Flavor::Sqlite
    }

    fn open(&self, ctx: &Context, conn_string: &str) -> Result<Box<dyn Connection>, StorageError> {
        Ok(Box::new(SqliteConnection::open(ctx, conn_string)?))
    }
}

pub struct SqliteConnection {
    conn: Option<rusqlite::Connection>,
}

impl SqliteConnection {
    pub fn open(ctx: &Context, conn_string: &str) -> Result<Self, StorageError> {
        ctx.check()?;
        let conn = if conn_string == MEMORY_CONN_STRING {
            rusqlite::Connection::open_in_memory()
        } else {
            rusqlite::Connection::open(conn_string)
        }
        .map_err(|e| StorageError::Connectivity(e.to_string()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA recursive_triggers=ON;")
            .map_err(|e| map_error(ctx, e))?;

        tracing::debug!(conn_string, "SQLite connection opened");
        Ok(Self { conn: Some(conn) })
    }

    /// Runs `f` with the cancellation handler installed.
    fn with_conn<T>(
        &self,
        ctx: &Context,
        f: impl FnOnce(&rusqlite::Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let conn = self.conn.as_ref().ok_or(StorageError::Closed)?;
        ctx.check()?;
        let watched = AssertUnwindSafe(ctx.clone());
        conn.progress_handler(PROGRESS_STEPS, Some(move || watched.is_done()));
        let result = f(conn);
        conn.progress_handler(0, None::<fn() -> bool>);
        result
    }
}

fn to_sqlite(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(*i),
        SqlValue::Real(r) => Value::Real(*r),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Blob(b) => Value::Blob(b.clone()),
    }
}

fn from_sqlite(value: ValueRef<'_>) -> Result<SqlValue, StorageError> {
    Ok(match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(r) => SqlValue::Real(r),
        ValueRef::Text(t) => SqlValue::Text(
            String::from_utf8(t.to_vec()).map_err(|e| StorageError::Backend(e.to_string()))?,
        ),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    })
}

/// Translates a rusqlite error into a flavor-independent one.
fn map_error(ctx: &Context, e: rusqlite::Error) -> StorageError {
    match &e {
        rusqlite::Error::SqliteFailure(err, msg) => match err.code {
            ErrorCode::OperationInterrupted => ctx.check().err().unwrap_or(StorageError::Cancelled),
            ErrorCode::ConstraintViolation => {
                StorageError::ConstraintViolation(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::SystemIoFailure => {
                StorageError::Connectivity(e.to_string())
            }
            _ => StorageError::Backend(e.to_string()),
        },
        _ => StorageError::Backend(e.to_string()),
    }
}

impl Connection for SqliteConnection {
    fn flavor(&self) -> Flavor {
        Flavor::Sqlite
    }

    fn execute(&mut self, ctx: &Context, sql: &str, params: &[SqlValue]) -> Result<u64, StorageError> {
        self.with_conn(ctx, |conn| {
            conn.execute(sql, params_from_iter(params.iter().map(to_sqlite)))
                .map(|n| n as u64)
                .map_err(|e| map_error(ctx, e))
        })
    }

    fn execute_batch(&mut self, ctx: &Context, sql: &str) -> Result<(), StorageError> {
        self.with_conn(ctx, |conn| conn.execute_batch(sql).map_err(|e| map_error(ctx, e)))
    }

    fn query(&mut self, ctx: &Context, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StorageError> {
        self.with_conn(ctx, |conn| {
            let mut stmt = conn.prepare(sql).map_err(|e| map_error(ctx, e))?;
            let columns = stmt.column_count();
            let mut rows = stmt
                .query(params_from_iter(params.iter().map(to_sqlite)))
                .map_err(|e| map_error(ctx, e))?;

            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(|e| map_error(ctx, e))? {
                ctx.check()?;
                let mut values = Vec::with_capacity(columns);
                for i in 0..columns {
                    values.push(from_sqlite(row.get_ref(i).map_err(|e| map_error(ctx, e))?)?);
                }
                out.push(Row(values));
            }
            Ok(out)
        })
    }

    fn begin(&mut self, ctx: &Context, mode: TxMode) -> Result<(), StorageError> {
        let sql = match mode {
            TxMode::ReadWrite => "BEGIN IMMEDIATE",
            TxMode::ReadSnapshot => "BEGIN DEFERRED",
        };
        self.execute_batch(ctx, sql)?;
        tracing::debug!(?mode, "SQLite transaction started");
        Ok(())
    }

    fn commit(&mut self, ctx: &Context) -> Result<(), StorageError> {
        self.execute_batch(ctx, "COMMIT")?;
        tracing::debug!("SQLite transaction committed");
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        // must run even when the caller's context is already done
        self.execute_batch(&Context::background(), "ROLLBACK")?;
        tracing::debug!("SQLite transaction rolled back");
        Ok(())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        match self.conn.take() {
            Some(conn) => conn
                .close()
                .map_err(|(_, e)| StorageError::Backend(e.to_string())),
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.conn.is_none()
    }
}
