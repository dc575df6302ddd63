//! Fetcher stdout protocol
//!
//! The fetcher is spawned by the reportd with a day and optionally a
//! domain, writes one reply to stdout and exits. stdout is the sole
//! channel; a reader hanging up early is tolerated.

use std::io::Write;

use crate::traits::{FetcherBackend, StoreError};
use crate::util::utc_time_now;

/// Write the domain-list reply: version banner, current UTC time, the
/// available day, one domain per line and a terminating dot.
pub fn print_domain_list(
    backend: &dyn FetcherBackend,
    day: &str,
    out: &mut dyn Write,
) -> Result<(), StoreError> {
    let list = backend.fetch_domain_list(day)?;
    let mut write_all = || -> std::io::Result<()> {
        // protocol header line 1: the protocol version
        writeln!(out, "{}", crate::FETCHER_VERSION_STRING_V1)?;
        // line 2: current time so the reportd can detect clock drift
        writeln!(out, "{}", utc_time_now().format(crate::TIMEFORMAT))?;
        // line 3: available day
        writeln!(out, "{}", list.available_day.as_deref().unwrap_or(""))?;
        for domain in &list.domains {
            writeln!(out, "{domain}")?;
        }
        // terminate the domain list with a single dot
        writeln!(out, ".")?;
        out.flush()
    };
    if let Err(err) = write_all() {
        // the reader may simply have gone away, a retry can succeed
        tracing::warn!("Error writing domain list: {}", err);
    }
    Ok(())
}

/// Write the domain-details reply, one JSON document.
pub fn print_domain_details(
    backend: &dyn FetcherBackend,
    day: &str,
    domain: &str,
    out: &mut dyn Write,
) -> Result<(), StoreError> {
    let details = backend.fetch_domain_details(day, domain)?;
    let json = serde_json::to_string_pretty(&details)
        .map_err(|e| StoreError::Database(e.to_string()))?;
    if let Err(err) = writeln!(out, "{json}").and_then(|()| out.flush()) {
        tracing::warn!("Error writing domain details: {}", err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CollectdConfig, FetcherConfig};
    use crate::store::{SqliteCollectdBackend, SqliteFetcherBackend};
    use crate::traits::{CollectdBackend, DomainReport};
    use crate::util::utc_date_yesterday;
    use serde_json::json;

    fn prepare_backend(dir: &std::path::Path) -> (SqliteFetcherBackend, String) {
        let (mut cfg, _, _) = CollectdConfig::finalize(Default::default()).unwrap();
        let url = format!("sqlite:{}", dir.join("collectd.sqlite").display());
        cfg.storage = url.clone();
        let mut collectd = SqliteCollectdBackend::open(&url, &cfg).unwrap();
        collectd
            .add_datagram(&json!({
                "d": "example.com",
                "pr": "v=TLSRPTv1;rua=mailto:reports@example.com",
                "dpv": "1",
                "policies": [{"policy-type": 9, "f": 0, "t": 0}]
            }))
            .unwrap();
        collectd.switch_to_next_day(true).unwrap();
        let fetcher_cfg = FetcherConfig::finalize(&mut Default::default()).unwrap().0;
        let backend = SqliteFetcherBackend::open(&url, &fetcher_cfg).unwrap();
        (backend, utc_date_yesterday().format("%Y-%m-%d").to_string())
    }

    #[test]
    fn test_domain_list_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, yesterday) = prepare_backend(dir.path());
        let mut out = Vec::new();
        print_domain_list(&backend, &yesterday, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], crate::FETCHER_VERSION_STRING_V1);
        assert!(chrono::NaiveDateTime::parse_from_str(lines[1], crate::TIMEFORMAT).is_ok());
        assert_eq!(lines[2], yesterday);
        assert_eq!(lines[3], "example.com");
        assert_eq!(*lines.last().unwrap(), ".");
    }

    #[test]
    fn test_domain_list_unknown_day_has_no_domains() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _) = prepare_backend(dir.path());
        let mut out = Vec::new();
        print_domain_list(&backend, "1999-01-01", &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        // header plus terminating dot only
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[3], ".");
    }

    #[test]
    fn test_domain_details_document() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, yesterday) = prepare_backend(dir.path());
        let mut out = Vec::new();
        print_domain_details(&backend, &yesterday, "example.com", &mut out).unwrap();
        let report: DomainReport = serde_json::from_slice(&out).unwrap();
        assert_eq!(report.d, "example.com");
        let record = &report.policies["v=TLSRPTv1;rua=mailto:reports@example.com"];
        assert_eq!(record.values().next().unwrap().cntrtotal, 1);
    }

    /// A writer that fails like a closed pipe.
    struct BrokenPipe;
    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_broken_pipe_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, yesterday) = prepare_backend(dir.path());
        print_domain_list(&backend, &yesterday, &mut BrokenPipe).unwrap();
        print_domain_details(&backend, &yesterday, "example.com", &mut BrokenPipe).unwrap();
    }
}
