//! Log-only collectd backend
//!
//! Used to exercise support for multiple storage backends without touching
//! disk. `dummy:?log` logs every datagram, a bare `dummy:` stays silent.

use serde_json::Value;
use url::Url;

use crate::traits::{CollectdBackend, StoreError};

#[derive(Debug)]
pub struct DummyCollectdBackend {
    dolog: bool,
}

impl DummyCollectdBackend {
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let parsed = Url::parse(url).map_err(|_| StoreError::BadUrl(url.to_string()))?;
        if parsed.scheme() != "dummy" {
            return Err(StoreError::BadUrl(url.to_string()));
        }
        Ok(Self { dolog: parsed.query() == Some("log") })
    }
}

impl CollectdBackend for DummyCollectdBackend {
    fn add_datagram(&mut self, datagram: &Value) -> Result<(), StoreError> {
        if self.dolog {
            tracing::info!("Dummy collectd got datagram {}", datagram);
        }
        Ok(())
    }

    fn socket_timeout(&mut self) -> Result<(), StoreError> {
        if self.dolog {
            tracing::info!("Dummy collectd got socket timeout");
        }
        Ok(())
    }

    fn switch_to_next_day(&mut self, _develmode: bool) -> Result<(), StoreError> {
        Ok(())
    }
}
