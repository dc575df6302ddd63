//! Backend trait for collectd storage implementations

use std::fmt::Debug;

use serde_json::Value;

use super::StoreError;

/// A storage backend of the collectd daemon.
///
/// Production: sqlite per-day stores. Testing/diagnostics: the dummy
/// backend and recording doubles.
pub trait CollectdBackend: Send + Debug {
    /// Process one received datagram.
    fn add_datagram(&mut self, datagram: &Value) -> Result<(), StoreError>;

    /// Process a timeout on the receiving socket, committing pending data.
    fn socket_timeout(&mut self) -> Result<(), StoreError>;

    /// Switch to the next day after UTC midnight.
    ///
    /// In development mode today's rows are relabeled to yesterday first so
    /// the reporter can be exercised against fresh data.
    fn switch_to_next_day(&mut self, develmode: bool) -> Result<(), StoreError>;
}
