use std::{collections::HashMap, sync::Arc};

use ledgerstore_core::{Connector, Flavor, StorageError};
use ledgerstore_postgres::PostgresConnector;
use ledgerstore_sqlite::SqliteConnector;

/// Maps each flavor to the name of the backend that serves it, and backend
/// names to the connectors that open connections for them.
///
/// Built once at startup and handed to the drivers. Mappings can be
/// overridden while the registry is still owned, before it is shared.
pub struct DriverRegistry {
    drivers: HashMap<Flavor, String>,
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl DriverRegistry {
    pub fn empty() -> Self {
        Self {
            drivers: HashMap::new(),
            connectors: HashMap::new(),
        }
    }

    /// sqlite on `sqlite3`, postgres on `postgres`. MySQL has no default.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register_connector(Arc::new(SqliteConnector));
        registry.register_connector(Arc::new(PostgresConnector));
        registry.update_driver_mapping(Flavor::Sqlite, ledgerstore_sqlite::BACKEND_NAME);
        registry.update_driver_mapping(Flavor::PostgreSql, ledgerstore_postgres::BACKEND_NAME);
        registry
    }

    pub fn register_connector(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.insert(connector.name().to_string(), connector);
    }

    pub fn update_driver_mapping(&mut self, flavor: Flavor, backend: &str) {
        tracing::debug!(%flavor, backend, "driver mapping updated");
        self.drivers.insert(flavor, backend.to_string());
    }

    pub fn driver_name(&self, flavor: Flavor) -> Option<&str> {
        self.drivers.get(&flavor).map(String::as_str)
    }

    pub fn resolve(&self, flavor: Flavor) -> Result<Arc<dyn Connector>, StorageError> {
        let name = self
            .driver_name(flavor)
            .ok_or(StorageError::UnregisteredFlavor(flavor))?;
        self.connectors
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UnknownBackend(name.to_string()))
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mappings() {
        let registry = DriverRegistry::with_defaults();
        assert_eq!(registry.driver_name(Flavor::Sqlite), Some("sqlite3"));
        assert_eq!(registry.driver_name(Flavor::PostgreSql), Some("postgres"));
        assert_eq!(registry.driver_name(Flavor::MySql), None);
        assert_eq!(registry.resolve(Flavor::Sqlite).unwrap().flavor(), Flavor::Sqlite);
    }

    #[test]
    fn test_unregistered_flavor() {
        let registry = DriverRegistry::with_defaults();
        let err = registry.resolve(Flavor::MySql).err().unwrap();
        assert!(matches!(err, StorageError::UnregisteredFlavor(Flavor::MySql)));
    }

    #[test]
    fn test_override_to_unknown_backend() {
        let mut registry = DriverRegistry::with_defaults();
        registry.update_driver_mapping(Flavor::Sqlite, "sqlcipher");
        let err = registry.resolve(Flavor::Sqlite).err().unwrap();
        assert!(matches!(err, StorageError::UnknownBackend(ref name) if name == "sqlcipher"));
    }
}
