//! Connection lifecycle strategies.
//!
//! [`PerStoreDriver`] opens a fresh connection for every store and hands its
//! ownership to that store. [`SharedDriver`] opens one connection at
//! [`Driver::initialize`] and lends it to every store it creates.

use std::sync::{Arc, Mutex};

use ledgerstore_core::{Connection, Context, Flavor, StorageError};
use ledgerstore_sqlite::MEMORY_CONN_STRING;

use crate::{migrations::Migrations, registry::DriverRegistry, store::Store};

pub(crate) type SharedConnection = Arc<Mutex<Box<dyn Connection>>>;

/// Maps a ledger name to the connection string of its database.
pub type ConnStringResolver = Arc<dyn Fn(&str) -> String + Send + Sync>;

pub trait Driver: Send + Sync {
    fn name(&self) -> &str;
    fn initialize(&self, ctx: &Context) -> Result<(), StorageError>;
    fn new_store(&self, ctx: &Context, name: &str) -> Result<Store, StorageError>;
    fn close(&self, ctx: &Context) -> Result<(), StorageError>;
}

pub struct PerStoreDriver {
    name: String,
    flavor: Flavor,
    conn_string: ConnStringResolver,
    registry: Arc<DriverRegistry>,
    migrations: Arc<Migrations>,
}

impl PerStoreDriver {
    pub fn new(
        name: &str,
        flavor: Flavor,
        conn_string: ConnStringResolver,
        registry: Arc<DriverRegistry>,
        migrations: Arc<Migrations>,
    ) -> Self {
        Self {
            name: name.to_string(),
            flavor,
            conn_string,
            registry,
            migrations,
        }
    }
}

impl Driver for PerStoreDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self, _ctx: &Context) -> Result<(), StorageError> {
        Ok(())
    }

    fn new_store(&self, ctx: &Context, name: &str) -> Result<Store, StorageError> {
        let connector = self.registry.resolve(self.flavor)?;
        let conn = connector.open(ctx, &(self.conn_string)(name))?;
        tracing::debug!(driver = %self.name, ledger = name, backend = connector.name(), "store opened");
        Ok(Store::new(
            name,
            self.flavor,
            Arc::new(Mutex::new(conn)),
            true,
            self.migrations.clone(),
        ))
    }

    fn close(&self, _ctx: &Context) -> Result<(), StorageError> {
        Ok(())
    }
}

pub struct SharedDriver {
    name: String,
    flavor: Flavor,
    conn_string: String,
    registry: Arc<DriverRegistry>,
    migrations: Arc<Migrations>,
    conn: Mutex<Option<SharedConnection>>,
}

impl SharedDriver {
    pub fn new(
        name: &str,
        flavor: Flavor,
        conn_string: &str,
        registry: Arc<DriverRegistry>,
        migrations: Arc<Migrations>,
    ) -> Self {
        Self {
            name: name.to_string(),
            flavor,
            conn_string: conn_string.to_string(),
            registry,
            migrations,
            conn: Mutex::new(None),
        }
    }

    /// A shared in-memory SQLite database, mostly useful for tests.
    pub fn in_memory_sqlite(registry: Arc<DriverRegistry>, migrations: Arc<Migrations>) -> Self {
        Self::new("sqlite-memory", Flavor::Sqlite, MEMORY_CONN_STRING, registry, migrations)
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<SharedConnection>>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Backend("driver lock poisoned".to_string()))
    }
}

impl Driver for SharedDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self, ctx: &Context) -> Result<(), StorageError> {
        let mut slot = self.slot()?;
        if slot.is_some() {
            return Err(StorageError::AlreadyInitialized);
        }
        let connector = self.registry.resolve(self.flavor)?;
        let conn = connector.open(ctx, &self.conn_string)?;
        *slot = Some(Arc::new(Mutex::new(conn)));
        tracing::info!(driver = %self.name, backend = connector.name(), "shared connection opened");
        Ok(())
    }

    fn new_store(&self, _ctx: &Context, name: &str) -> Result<Store, StorageError> {
        self.registry.resolve(self.flavor)?;
        let conn = self.slot()?.clone().ok_or(StorageError::NotInitialized)?;
        Ok(Store::new(name, self.flavor, conn, false, self.migrations.clone()))
    }

    fn close(&self, _ctx: &Context) -> Result<(), StorageError> {
        let Some(conn) = self.slot()?.take() else {
            return Ok(());
        };
        let mut conn = conn
            .lock()
            .map_err(|_| StorageError::Backend("connection lock poisoned".to_string()))?;
        conn.close()?;
        tracing::info!(driver = %self.name, "shared connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> SharedDriver {
        SharedDriver::in_memory_sqlite(
            Arc::new(DriverRegistry::with_defaults()),
            Arc::new(Migrations::embedded()),
        )
    }

    #[test]
    fn test_shared_initialize_twice() {
        let ctx = Context::background();
        let driver = shared();
        driver.initialize(&ctx).unwrap();
        let err = driver.initialize(&ctx).unwrap_err();
        assert_eq!(err.to_string(), "database already initialized");
    }

    #[test]
    fn test_shared_store_before_initialize() {
        let err = shared().new_store(&Context::background(), "l").err().unwrap();
        assert!(matches!(err, StorageError::NotInitialized));
    }

    #[test]
    fn test_shared_close_without_initialize() {
        shared().close(&Context::background()).unwrap();
    }

    #[test]
    fn test_per_store_unregistered_flavor() {
        let driver = PerStoreDriver::new(
            "mysql",
            Flavor::MySql,
            Arc::new(|name: &str| format!("mysql://localhost/{}", name)),
            Arc::new(DriverRegistry::with_defaults()),
            Arc::new(Migrations::embedded()),
        );
        let err = driver.new_store(&Context::background(), "l").err().unwrap();
        assert!(matches!(err, StorageError::UnregisteredFlavor(Flavor::MySql)));
    }
}
