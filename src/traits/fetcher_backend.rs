//! Backend trait for fetcher storage implementations and the
//! fetcher/reportd interchange types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::StoreError;

/// Aggregated counters of one policy within one TLSRPT record.
///
/// `failures` maps the serialized failure detail to its session count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCounters {
    pub cntrtotal: u64,
    pub cntrfailure: u64,
    pub failures: BTreeMap<String, u64>,
}

/// TLSRPT record text -> serialized policy -> counters.
pub type PoliciesByRecord = BTreeMap<String, BTreeMap<String, PolicyCounters>>;

/// The domain-details document exchanged over the fetcher stdout protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainReport {
    pub d: String,
    pub policies: PoliciesByRecord,
}

/// Result of a domain-list query against a finalized day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainList {
    /// First completed day recorded in the store, if any.
    pub available_day: Option<String>,
    pub domains: Vec<String>,
}

/// A storage backend of the fetcher, opened read-only on the rolled-over store.
pub trait FetcherBackend {
    /// List the domains contained in the store for a specific day.
    fn fetch_domain_list(&self, day: &str) -> Result<DomainList, StoreError>;

    /// Collect the aggregated details for one domain on a specific day.
    fn fetch_domain_details(&self, day: &str, domain: &str) -> Result<DomainReport, StoreError>;
}
