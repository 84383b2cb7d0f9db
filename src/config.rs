use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use serde::Deserialize;

use ledgerstore_core::{Context, Flavor, StorageError};
use ledgerstore_sqlite::{file_conn_string, MEMORY_CONN_STRING};

use crate::{
    driver::{Driver, PerStoreDriver, SharedDriver},
    migrations::Migrations,
    registry::DriverRegistry,
};

#[derive(Parser, Debug)]
#[command(name = "ledgerstore", about = "Ledger storage administration")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "ledgerstore.toml")]
    pub config: String,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Storage flavor (overrides config file)
    #[arg(long)]
    pub flavor: Option<Flavor>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Apply the schema for a ledger
    Migrate { ledger: String },
    /// Show the per-asset volumes of one account
    Volumes { ledger: String, address: String },
    /// Show aggregated balances, optionally filtered by an address pattern
    Balances {
        ledger: String,
        #[arg(short, long)]
        address: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 0)]
        page_size: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    PerStore,
    Shared,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,

    /// Flavor name to backend name overrides, e.g. `postgres = "postgres"`.
    #[serde(default)]
    pub drivers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_flavor")]
    pub flavor: Flavor,

    #[serde(default)]
    pub strategy: Option<Strategy>,

    /// Where per-ledger SQLite files live.
    #[serde(default = "default_directory")]
    pub directory: String,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub statement_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_flavor() -> Flavor {
    Flavor::Sqlite
}

fn default_directory() -> String {
    "data".to_string()
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            flavor: default_flavor(),
            strategy: None,
            directory: default_directory(),
            url: None,
            statement_timeout_ms: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        default_logging()
    }
}

impl StorageConfig {
    /// Per-store for SQLite, shared for server engines, unless set explicitly.
    pub fn strategy(&self) -> Strategy {
        self.strategy.unwrap_or(match self.flavor {
            Flavor::Sqlite => Strategy::PerStore,
            _ => Strategy::Shared,
        })
    }

    pub fn context(&self) -> Context {
        match self.statement_timeout_ms {
            Some(ms) => Context::with_timeout(Duration::from_millis(ms)),
            None => Context::background(),
        }
    }
}

impl Config {
    pub fn load(cli: &CliArgs) -> Self {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Config::default()
            }),
            Err(_) => Config::default(),
        };

        // CLI overrides
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }
        if let Some(flavor) = cli.flavor {
            config.storage.flavor = flavor;
        }

        config
    }

    /// Default registry with the `[drivers]` overrides applied.
    pub fn registry(&self) -> Result<DriverRegistry, StorageError> {
        let mut registry = DriverRegistry::with_defaults();
        for (flavor, backend) in &self.drivers {
            let flavor: Flavor = flavor.parse().map_err(StorageError::Backend)?;
            registry.update_driver_mapping(flavor, backend);
        }
        Ok(registry)
    }

    pub fn driver(&self, registry: Arc<DriverRegistry>) -> Result<Box<dyn Driver>, StorageError> {
        let storage = &self.storage;
        let migrations = Arc::new(Migrations::embedded());
        let strategy = storage.strategy();
        let name = match strategy {
            Strategy::PerStore => format!("{}-per-store", storage.flavor),
            Strategy::Shared => format!("{}-shared", storage.flavor),
        };

        let driver: Box<dyn Driver> = match strategy {
            Strategy::PerStore => match (storage.flavor, &storage.url) {
                (Flavor::Sqlite, _) => {
                    let directory = PathBuf::from(&storage.directory);
                    std::fs::create_dir_all(&directory)?;
                    Box::new(PerStoreDriver::new(
                        &name,
                        storage.flavor,
                        Arc::new(move |ledger: &str| file_conn_string(&directory.join(format!("{}.db", ledger)))),
                        registry,
                        migrations,
                    ))
                }
                (_, Some(url)) => {
                    let url = url.clone();
                    Box::new(PerStoreDriver::new(
                        &name,
                        storage.flavor,
                        Arc::new(move |_: &str| url.clone()),
                        registry,
                        migrations,
                    ))
                }
                (flavor, None) => {
                    return Err(StorageError::Connectivity(format!("no url configured for {}", flavor)));
                }
            },
            Strategy::Shared => {
                let url = match (storage.flavor, &storage.url) {
                    (_, Some(url)) => url.clone(),
                    (Flavor::Sqlite, None) => MEMORY_CONN_STRING.to_string(),
                    (flavor, None) => {
                        return Err(StorageError::Connectivity(format!("no url configured for {}", flavor)));
                    }
                };
                Box::new(SharedDriver::new(&name, storage.flavor, &url, registry, migrations))
            }
        };
        tracing::debug!(driver = driver.name(), "driver configured");
        Ok(driver)
    }
}
