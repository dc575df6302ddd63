//! TLSRPT fetcher entry point
//!
//! Used by the reportd to read the database entries a collectd wrote for
//! the previous day. One invocation answers exactly one request on stdout.

use clap::Parser;

use tlsrpt_reporter::config::{log_config_info, FetcherArgs, FetcherConfig};
use tlsrpt_reporter::store::PluginRegistry;
use tlsrpt_reporter::traits::StoreError;
use tlsrpt_reporter::{exit, fetcher, init_logging};

fn main() {
    let mut args = FetcherArgs::parse();
    let day = args.day.clone();
    let domain = args.domain.clone();
    let (cfg, settings, warnings) = match FetcherConfig::finalize(&mut args) {
        Ok(finalized) => finalized,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(exit::EXIT_USAGE);
        }
    };
    let _guard = init_logging(&cfg.logfilename, &cfg.log_level, "tlsrpt_fetcher");
    log_config_info(&settings, &warnings);

    if day.is_empty() {
        tracing::error!("Invalid value for parameter 'day': '{}'", day);
        std::process::exit(exit::EXIT_USAGE);
    }

    // The fetcher uses the first configured storage; extras are ignored to
    // stay option-compatible with the collectd.
    let mut urls = cfg.storage.split(',');
    let url = urls.next().unwrap_or_default().to_string();
    for ignored_url in urls {
        tracing::warn!("Ignoring additional storage: {}", ignored_url);
    }

    let registry = PluginRegistry::builtin();
    let backend = match registry.fetcher_backend(&url, &cfg) {
        Ok(backend) => backend,
        Err(e) => {
            tracing::error!("Can not create fetcher from storage URL '{}': {}", url, e);
            let code = match e {
                StoreError::WrongPurpose { .. }
                | StoreError::WrongVersion(_)
                | StoreError::SetupFailed(_) => e.exit_code(),
                _ => exit::EXIT_USAGE,
            };
            std::process::exit(code);
        }
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let result = match domain {
        None => fetcher::print_domain_list(backend.as_ref(), &day, &mut out),
        Some(domain) => fetcher::print_domain_details(backend.as_ref(), &day, &domain, &mut out),
    };
    if let Err(e) = result {
        tracing::error!("Fetcher failed: {}", e);
        std::process::exit(exit::EXIT_OTHER);
    }
}
