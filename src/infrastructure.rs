//! Infrastructure layer for the database, the directory API and runtime plumbing
//!
//! SQLite persistence, the retrying HTTP client, bounded concurrency and
//! paging helpers, configuration loading and logging setup.

pub mod config;
pub mod database_connection;
pub mod directory_client;
pub mod executor;
pub mod logging;
pub mod page_fetcher;
pub mod retry_policy;
pub mod sqlite_store;

pub use config::{AppConfig, ConfigError, ConfigManager};
pub use database_connection::DatabaseConnection;
pub use directory_client::HttpDirectoryClient;
pub use executor::run_bounded;
pub use page_fetcher::PageFetcher;
pub use retry_policy::RetryPolicy;
pub use sqlite_store::SqliteSyncStore;
