//! TLSRPT Reporter - aggregate SMTP TLS Reporting data and deliver RFC 8460 reports
//!
//! The pipeline consists of three programs sharing this library:
//! collectd (datagram ingestion into a per-day store), fetcher (one-shot
//! stdout bridge exposing a finalized day) and reportd (scheduler that
//! renders and delivers the reports). Storage backends sit behind traits
//! so alternative implementations can be registered by URL scheme.

pub mod collectd;
pub mod config;
pub mod delivery;
pub mod fetcher;
pub mod mocks;
pub mod randpool;
pub mod record;
pub mod report;
pub mod report_store;
pub mod reportd;
pub mod store;
pub mod traits;
pub mod util;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Suffix appended to the purpose string of every store, bumped on schema changes.
pub const DB_PURPOSE_SUFFIX: &str = "-v1-2025-06";

/// First line of the fetcher domain-list protocol.
pub const FETCHER_VERSION_STRING_V1: &str = "TLSRPT FETCHER v1 domain list";

/// Timestamp format used on the fetcher protocol and in log-friendly times.
pub const TIMEFORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Upper bound on a single fetcher stdout read.
pub const MAX_READ_FETCHER: usize = 16 * 1024 * 1024;

/// Upper bound on a single datagram read.
pub const MAX_READ_COLLECTD: usize = 16 * 1024 * 1024;

/// Process exit codes shared by the three binaries.
pub mod exit {
    pub const EXIT_USAGE: i32 = 2;
    pub const EXIT_DB_SETUP_FAILURE: i32 = 3;
    pub const EXIT_WRONG_DB_VERSION: i32 = 4;
    pub const EXIT_SHUTDOWN_SOCKETCLOSE: i32 = 5;
    pub const EXIT_SHUTDOWN_COLLECTDPLUGIN: i32 = 6;
    pub const EXIT_SOCKET: i32 = 7;
    pub const EXIT_OTHER: i32 = 8;
}

/// Initialize logging to stderr and, when `logfilename` is non-empty, to that file.
///
/// Returns the appender guard which must stay alive for the duration of the
/// process so buffered log lines are flushed on exit.
pub fn init_logging(
    logfilename: &str,
    log_level: &str,
    component: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if logfilename.is_empty() {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        tracing::debug!("{} logging to stderr only", component);
        return None;
    }

    let path = std::path::Path::new(logfilename);
    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let file = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    let appender = tracing_appender::rolling::never(dir, file);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();
    tracing::debug!("{} logging to stderr and {}", component, logfilename);
    Some(guard)
}
