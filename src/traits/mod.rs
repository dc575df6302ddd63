//! Trait definitions for the pluggable storage backends
//!
//! Both daemons talk to their storage through these traits so alternative
//! backends can be registered by URL scheme.

mod collectd_backend;
mod fetcher_backend;

pub use collectd_backend::CollectdBackend;
pub use fetcher_backend::{DomainList, DomainReport, FetcherBackend, PoliciesByRecord, PolicyCounters};

use thiserror::Error;

/// Errors raised by storage backends and the registry.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Database has wrong purpose, expected {expected} but got {actual}")]
    WrongPurpose { expected: String, actual: String },
    #[error("Database has wrong version, expected 1 but got {0}")]
    WrongVersion(i64),
    #[error("Database setup failed: {0}")]
    SetupFailed(String),
    #[error("Invalid storage URL '{0}'")]
    BadUrl(String),
    #[error("No {scheme} implementation found for {group}")]
    NoImplementation { group: String, scheme: String },
    #[error("Missing key '{0}' in datagram")]
    MissingKey(&'static str),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl StoreError {
    /// Process exit code for errors that are fatal at startup.
    pub fn exit_code(&self) -> i32 {
        match self {
            StoreError::WrongPurpose { .. } | StoreError::WrongVersion(_) => {
                crate::exit::EXIT_WRONG_DB_VERSION
            }
            StoreError::SetupFailed(_) => crate::exit::EXIT_DB_SETUP_FAILURE,
            StoreError::BadUrl(_) | StoreError::NoImplementation { .. } => crate::exit::EXIT_USAGE,
            _ => crate::exit::EXIT_OTHER,
        }
    }
}
