//! Directory Sync - mirrors a remote organisational directory into SQLite
//!
//! Groups, users and institutions are pulled from the directory API on a
//! daily schedule and reconciled against the local store, one partition at
//! a time.

pub mod application;
pub mod domain;
pub mod error;
pub mod infrastructure;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{SyncError, SyncResult};
