//! Test doubles for the storage backend seams
//!
//! In-memory implementations used by unit and integration tests to observe
//! what the daemons feed into their backends.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::traits::{CollectdBackend, StoreError};

/// Collectd backend recording every call for assertions.
#[derive(Clone, Default, Debug)]
pub struct RecordingBackend {
    datagrams: Arc<Mutex<Vec<Value>>>,
    timeouts: Arc<Mutex<u64>>,
    rollovers: Arc<Mutex<Vec<bool>>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn datagrams(&self) -> Vec<Value> {
        self.datagrams.lock().unwrap().clone()
    }

    pub fn timeout_count(&self) -> u64 {
        *self.timeouts.lock().unwrap()
    }

    pub fn rollovers(&self) -> Vec<bool> {
        self.rollovers.lock().unwrap().clone()
    }
}

impl CollectdBackend for RecordingBackend {
    fn add_datagram(&mut self, datagram: &Value) -> Result<(), StoreError> {
        self.datagrams.lock().unwrap().push(datagram.clone());
        Ok(())
    }

    fn socket_timeout(&mut self) -> Result<(), StoreError> {
        *self.timeouts.lock().unwrap() += 1;
        Ok(())
    }

    fn switch_to_next_day(&mut self, develmode: bool) -> Result<(), StoreError> {
        self.rollovers.lock().unwrap().push(develmode);
        Ok(())
    }
}
