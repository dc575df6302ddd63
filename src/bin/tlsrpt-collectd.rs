//! TLSRPT collectd entry point
//!
//! Listens on a unix domain socket to receive TLSRPT datagrams from the
//! MTA (e.g. Postfix) and writes them to the configured storage backends.

use clap::Parser;

use tlsrpt_reporter::config::{log_config_info, CollectdArgs, CollectdConfig};
use tlsrpt_reporter::store::PluginRegistry;
use tlsrpt_reporter::{collectd, exit, init_logging};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = CollectdArgs::parse();
    let (cfg, settings, warnings) = match CollectdConfig::finalize(args) {
        Ok(finalized) => finalized,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(exit::EXIT_USAGE);
        }
    };
    let _guard = init_logging(&cfg.logfilename, &cfg.log_level, "tlsrpt_collectd");
    log_config_info(&settings, &warnings);

    let registry = PluginRegistry::builtin();
    let exitcode = collectd::run(&cfg, &registry).await;
    if exitcode != 0 {
        tracing::error!("process terminates with exit code {}", exitcode);
    } else {
        tracing::info!("process terminates with exit code {}", exitcode);
    }
    std::process::exit(exitcode);
}
