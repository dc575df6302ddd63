//! Storage backend registry
//!
//! Backends are selected by the scheme of their storage URL. The two
//! built-in schemes (`sqlite:`, `dummy:`) are resolved directly; external
//! implementations can be registered under additional schemes.

mod dummy;
mod sqlite_collectd;
mod sqlite_fetcher;
mod versioned;

pub use dummy::DummyCollectdBackend;
pub use sqlite_collectd::{collectd_db_purpose, SqliteCollectdBackend};
pub use sqlite_fetcher::SqliteFetcherBackend;
pub use versioned::{check_database, open_versioned, setup_database};

use std::collections::HashMap;

use url::Url;

use crate::config::{CollectdConfig, FetcherConfig};
use crate::traits::{CollectdBackend, FetcherBackend, StoreError};

pub type CollectdCtor = fn(&str, &CollectdConfig) -> Result<Box<dyn CollectdBackend>, StoreError>;
pub type FetcherCtor = fn(&str, &FetcherConfig) -> Result<Box<dyn FetcherBackend>, StoreError>;

/// Scheme of a storage URL.
pub fn storage_scheme(url: &str) -> Result<String, StoreError> {
    let parsed = Url::parse(url).map_err(|_| StoreError::BadUrl(url.to_string()))?;
    Ok(parsed.scheme().to_string())
}

/// Filesystem path carried by a storage URL.
pub fn storage_path(url: &str) -> Result<String, StoreError> {
    let parsed = Url::parse(url).map_err(|_| StoreError::BadUrl(url.to_string()))?;
    Ok(parsed.path().to_string())
}

/// Maps URL schemes to backend constructors for one group of plugins.
pub struct PluginRegistry {
    collectd: HashMap<String, CollectdCtor>,
    fetcher: HashMap<String, FetcherCtor>,
}

impl PluginRegistry {
    /// Registry with the built-in sqlite and dummy implementations.
    pub fn builtin() -> Self {
        let mut registry = Self { collectd: HashMap::new(), fetcher: HashMap::new() };
        registry.register_collectd("sqlite", |url, cfg| {
            Ok(Box::new(SqliteCollectdBackend::open(url, cfg)?))
        });
        registry.register_collectd("dummy", |url, _cfg| {
            Ok(Box::new(DummyCollectdBackend::open(url)?))
        });
        registry.register_fetcher("sqlite", |url, cfg| {
            Ok(Box::new(SqliteFetcherBackend::open(url, cfg)?))
        });
        registry
    }

    pub fn register_collectd(&mut self, scheme: &str, ctor: CollectdCtor) {
        self.collectd.insert(scheme.to_string(), ctor);
    }

    pub fn register_fetcher(&mut self, scheme: &str, ctor: FetcherCtor) {
        self.fetcher.insert(scheme.to_string(), ctor);
    }

    /// Construct a collectd backend for a storage URL.
    pub fn collectd_backend(
        &self,
        url: &str,
        cfg: &CollectdConfig,
    ) -> Result<Box<dyn CollectdBackend>, StoreError> {
        let scheme = storage_scheme(url)?;
        match self.collectd.get(&scheme) {
            Some(ctor) => ctor(url, cfg),
            None => Err(StoreError::NoImplementation {
                group: "collectd".to_string(),
                scheme,
            }),
        }
    }

    /// Construct a fetcher backend for a storage URL.
    pub fn fetcher_backend(
        &self,
        url: &str,
        cfg: &FetcherConfig,
    ) -> Result<Box<dyn FetcherBackend>, StoreError> {
        let scheme = storage_scheme(url)?;
        match self.fetcher.get(&scheme) {
            Some(ctor) => ctor(url, cfg),
            None => Err(StoreError::NoImplementation {
                group: "fetcher".to_string(),
                scheme,
            }),
        }
    }
}
