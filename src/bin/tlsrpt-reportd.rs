//! TLSRPT reportd entry point
//!
//! The reportd renders the aggregate reports and sends them to the
//! endpoints the other MTA operators have published.

use clap::Parser;

use tlsrpt_reporter::config::{log_config_info, ReportdArgs, ReportdConfig};
use tlsrpt_reporter::reportd::{Reportd, ReportdError};
use tlsrpt_reporter::{exit, init_logging};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = ReportdArgs::parse();
    let (cfg, settings, warnings) = match ReportdConfig::finalize(args) {
        Ok(finalized) => finalized,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(exit::EXIT_USAGE);
        }
    };
    let _guard = init_logging(&cfg.logfilename, &cfg.log_level, "tlsrpt_reportd");
    log_config_info(&settings, &warnings);

    tracing::info!("TLSRPT reportd starting");

    let mut reportd = match Reportd::new(cfg) {
        Ok(reportd) => reportd,
        Err(e) => {
            tracing::error!("Setup error for tlsrpt_reportd: {}", e);
            let code = match e {
                ReportdError::Store(store) => store.exit_code(),
                _ => exit::EXIT_OTHER,
            };
            tracing::error!("process terminates with exit code {}", code);
            std::process::exit(code);
        }
    };
    let exitcode = reportd.run().await;
    if exitcode != 0 {
        tracing::error!("process terminates with exit code {}", exitcode);
    } else {
        tracing::info!("process terminates with exit code {}", exitcode);
    }
    std::process::exit(exitcode);
}
