//! A named ledger store on top of one connection.
//!
//! The store applies the schema, writes transactions and metadata, and runs
//! the read and aggregation queries. Multi-statement reads run inside a
//! [`TxMode::ReadSnapshot`] transaction so every part of a result sees the
//! same point in time.

mod accounts;
mod aggregations;
mod transactions;

use std::sync::{Arc, MutexGuard};

use ledgerstore_core::{Connection, Context, Flavor, StorageError, TxMode};

use crate::{driver::SharedConnection, migrations::Migrations};

pub struct Store {
    ledger: String,
    flavor: Flavor,
    conn: SharedConnection,
    owns_connection: bool,
    migrations: Arc<Migrations>,
}

impl Store {
    pub(crate) fn new(
        ledger: &str,
        flavor: Flavor,
        conn: SharedConnection,
        owns_connection: bool,
        migrations: Arc<Migrations>,
    ) -> Self {
        Self {
            ledger: ledger.to_string(),
            flavor,
            conn,
            owns_connection,
            migrations,
        }
    }

    pub fn name(&self) -> &str {
        &self.ledger
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    /// Table reference for this ledger, schema-qualified where the flavor supports it.
    pub fn table(&self, name: &str) -> String {
        self.flavor.table(&self.ledger, name)
    }

    /// Runs every migration statement in order, stopping at the first failure.
    ///
    /// Statements are not wrapped in a single transaction: a failure leaves
    /// the statements before it applied.
    #[tracing::instrument(skip(self, ctx), fields(ledger = %self.ledger, flavor = %self.flavor), err)]
    pub fn initialize(&self, ctx: &Context) -> Result<(), StorageError> {
        let statements = self.migrations.statements(self.flavor, &self.ledger)?;
        let mut conn = self.conn()?;
        for (index, statement) in statements.iter().enumerate() {
            tracing::debug!(index, statement = statement.trim(), "running statement");
            conn.execute_batch(ctx, statement)
                .map_err(|e| StorageError::Migration {
                    index,
                    source: Box::new(e),
                })?;
        }
        tracing::info!(statements = statements.len(), "migrations applied");
        Ok(())
    }

    /// Closes the connection when this store owns it. A borrowed shared
    /// connection stays open until its driver is closed.
    pub fn close(&self, _ctx: &Context) -> Result<(), StorageError> {
        if !self.owns_connection {
            return Ok(());
        }
        self.conn()?.close()?;
        tracing::debug!(ledger = %self.ledger, "store closed");
        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Box<dyn Connection>>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Backend("connection lock poisoned".to_string()))
    }

    /// Rewrites `?` placeholders into the flavor's bind syntax.
    pub(crate) fn rebind(&self, sql: &str) -> String {
        if self.flavor != Flavor::PostgreSql {
            return sql.to_string();
        }
        let mut out = String::with_capacity(sql.len() + 8);
        let mut n = 0;
        for c in sql.chars() {
            if c == '?' {
                n += 1;
                out.push_str(&self.flavor.placeholder(n));
            } else {
                out.push(c);
            }
        }
        out
    }

    /// Runs `f` inside a database transaction. Any error, including a failed
    /// or skipped `COMMIT`, rolls the transaction back before returning, so
    /// the connection is never left inside an open transaction.
    pub(crate) fn in_tx<T>(
        &self,
        ctx: &Context,
        mode: TxMode,
        f: impl FnOnce(&mut dyn Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut conn = self.conn()?;
        conn.begin(ctx, mode)?;
        let result = f(&mut **conn).and_then(|value| conn.commit(ctx).map(|()| value));
        if let Err(e) = &result {
            tracing::debug!(error = %e, "rolling back");
            if let Err(rollback) = conn.rollback() {
                tracing::warn!(error = %rollback, "rollback failed");
            }
        }
        result
    }
}
