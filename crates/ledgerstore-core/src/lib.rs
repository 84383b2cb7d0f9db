//! Core types and traits for ledgerstore storage backends.
//!
//! This crate holds the volume/balance model, metadata and revert state, the
//! query specification, and the `Connection`/`Connector` traits that the
//! engine-specific crates implement.

pub mod context;
pub mod cursor;
pub mod flavor;
pub mod metadata;
pub mod models;
pub mod query;
pub mod storage;
pub mod value;
pub mod volumes;

// Re-export key types at crate root for convenience
pub use context::{CancelHandle, Context};
pub use cursor::Cursor;
pub use flavor::Flavor;
pub use metadata::{Metadata, MetadataValue};
pub use models::{Account, MetaTarget, Posting, Transaction};
pub use query::{AccountsQuery, BalancesQuery, TransactionsQuery};
pub use storage::{Connection, Connector, StorageError, TxMode};
pub use value::{DecodeError, Row, SqlValue};
pub use volumes::{AggregatedBalances, AggregatedVolumes, Balances, Volume, Volumes};
