pub mod bus;
pub mod config;
pub mod driver;
pub mod migrations;
pub mod registry;
pub mod report;
pub mod store;

pub use driver::{ConnStringResolver, Driver, PerStoreDriver, SharedDriver};
pub use migrations::Migrations;
pub use registry::DriverRegistry;
pub use store::Store;
