//! Daemon configuration from command line and environment
//!
//! Every option can be given on the command line or through an environment
//! variable named after the component prefix plus the upper-cased option
//! name, e.g. `TLSRPT_COLLECTD_SOCKETNAME`. Precedence is command line over
//! environment over built-in default. Unknown prefixed environment
//! variables are collected as warnings, never treated as errors.

use std::fmt::Display;
use std::str::FromStr;

use clap::Parser;
use thiserror::Error;

pub const ENV_PREFIX_COLLECTD: &str = "TLSRPT_COLLECTD_";
pub const ENV_PREFIX_FETCHER: &str = "TLSRPT_FETCHER_";
pub const ENV_PREFIX_REPORTD: &str = "TLSRPT_REPORTD_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' in environment variable {var}")]
    InvalidEnvValue { var: String, value: String },
}

/// Option name, source (`cmd`/`env`/`def`) and effective value, for the startup dump.
pub type SettingsLog = Vec<(&'static str, &'static str, String)>;

/// Environment access behind a seam so tests can inject their own variables.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;
    fn keys(&self) -> Vec<String>;
}

/// The real process environment.
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn keys(&self) -> Vec<String> {
        std::env::vars().map(|(key, _)| key).collect()
    }
}

/// Resolve one option from command line, environment or default, recording the source.
fn pick<T>(
    name: &'static str,
    cli: Option<T>,
    prefix: &str,
    env: &dyn EnvSource,
    default: T,
    log: &mut SettingsLog,
) -> Result<T, ConfigError>
where
    T: FromStr + Display,
{
    if let Some(v) = cli {
        log.push((name, "cmd", v.to_string()));
        return Ok(v);
    }
    let var = format!("{}{}", prefix, name.to_uppercase());
    if let Some(raw) = env.get(&var) {
        let v: T = raw
            .parse()
            .map_err(|_| ConfigError::InvalidEnvValue { var, value: raw.clone() })?;
        log.push((name, "env", v.to_string()));
        return Ok(v);
    }
    log.push((name, "def", default.to_string()));
    Ok(default)
}

/// Warn about environment variables carrying the component prefix but not
/// naming any known option.
fn scan_environment(prefix: &str, env: &dyn EnvSource, known: &[&str]) -> Vec<String> {
    let mut warnings = Vec::new();
    for key in env.keys() {
        if let Some(option) = key.strip_prefix(prefix) {
            let option = option.to_lowercase();
            if !known.contains(&option.as_str()) {
                warnings.push(format!(
                    "'{option}' is no valid config option to be configured by environment variable {key}"
                ));
            }
        }
    }
    warnings
}

/// Log the effective configuration and any environment-scan warnings.
pub fn log_config_info(log: &SettingsLog, warnings: &[String]) {
    tracing::info!("CONFIGURATION with {} settings:", log.len());
    for (name, source, value) in log {
        tracing::info!("CONFIG from {} option {} is {}", source, name, value);
    }
    for w in warnings {
        tracing::warn!("{}", w);
    }
}

// ============================================================================
// collectd
// ============================================================================

#[derive(Debug, Clone)]
pub struct CollectdConfig {
    pub storage: String,
    pub socketname: String,
    pub socketuser: String,
    pub socketgroup: String,
    pub socketmode: String,
    pub sockettimeout: u64,
    pub max_uncommited_datagrams: u32,
    pub retry_commit_datagram_count: u32,
    pub logfilename: String,
    pub log_level: String,
    pub daily_rollover_script: String,
    pub dump_path_for_invalid_datagram: String,
}

/// Command line options of tlsrpt-collectd.
#[derive(Debug, Default, Parser)]
#[command(name = "tlsrpt-collectd", version, about = "TLSRPT datagram collector daemon")]
pub struct CollectdArgs {
    /// Storage backend, multiple backends separated by comma
    #[arg(long)]
    pub storage: Option<String>,
    /// Name of the unix domain socket to receive data
    #[arg(long)]
    pub socketname: Option<String>,
    /// User owning the unix domain socket to receive data
    #[arg(long)]
    pub socketuser: Option<String>,
    /// Group of the unix domain socket to receive data
    #[arg(long)]
    pub socketgroup: Option<String>,
    /// Permissions of the unix domain socket in octal, eg 0220
    #[arg(long)]
    pub socketmode: Option<String>,
    /// Read timeout for the socket in seconds
    #[arg(long)]
    pub sockettimeout: Option<u64>,
    /// Commit after that many datagrams were received
    #[arg(long)]
    pub max_uncommited_datagrams: Option<u32>,
    /// Retry commit after that many datagrams more were received
    #[arg(long)]
    pub retry_commit_datagram_count: Option<u32>,
    /// Log file name for collectd
    #[arg(long)]
    pub logfilename: Option<String>,
    /// Choose log level: debug, info, warn, error
    #[arg(long)]
    pub log_level: Option<String>,
    /// Hook script to run after day has changed
    #[arg(long)]
    pub daily_rollover_script: Option<String>,
    /// Filename to save an invalid datagram
    #[arg(long)]
    pub dump_path_for_invalid_datagram: Option<String>,
}

const COLLECTD_OPTIONS: &[&str] = &[
    "storage",
    "socketname",
    "socketuser",
    "socketgroup",
    "socketmode",
    "sockettimeout",
    "max_uncommited_datagrams",
    "retry_commit_datagram_count",
    "logfilename",
    "log_level",
    "daily_rollover_script",
    "dump_path_for_invalid_datagram",
];

impl CollectdConfig {
    /// Merge command line, process environment and defaults.
    pub fn finalize(args: CollectdArgs) -> Result<(Self, SettingsLog, Vec<String>), ConfigError> {
        Self::finalize_from(args, &ProcessEnv)
    }

    pub fn finalize_from(
        args: CollectdArgs,
        env: &dyn EnvSource,
    ) -> Result<(Self, SettingsLog, Vec<String>), ConfigError> {
        let p = ENV_PREFIX_COLLECTD;
        let mut log = SettingsLog::new();
        let cfg = Self {
            storage: pick("storage", args.storage, p, env, String::new(), &mut log)?,
            socketname: pick("socketname", args.socketname, p, env, String::new(), &mut log)?,
            socketuser: pick("socketuser", args.socketuser, p, env, String::new(), &mut log)?,
            socketgroup: pick("socketgroup", args.socketgroup, p, env, String::new(), &mut log)?,
            socketmode: pick("socketmode", args.socketmode, p, env, String::new(), &mut log)?,
            sockettimeout: pick("sockettimeout", args.sockettimeout, p, env, 5, &mut log)?,
            max_uncommited_datagrams: pick(
                "max_uncommited_datagrams",
                args.max_uncommited_datagrams,
                p,
                env,
                1000,
                &mut log,
            )?,
            retry_commit_datagram_count: pick(
                "retry_commit_datagram_count",
                args.retry_commit_datagram_count,
                p,
                env,
                1000,
                &mut log,
            )?,
            logfilename: pick("logfilename", args.logfilename, p, env, String::new(), &mut log)?,
            log_level: pick("log_level", args.log_level, p, env, "warn".to_string(), &mut log)?,
            daily_rollover_script: pick(
                "daily_rollover_script",
                args.daily_rollover_script,
                p,
                env,
                String::new(),
                &mut log,
            )?,
            dump_path_for_invalid_datagram: pick(
                "dump_path_for_invalid_datagram",
                args.dump_path_for_invalid_datagram,
                p,
                env,
                String::new(),
                &mut log,
            )?,
        };
        let warnings = scan_environment(p, env, COLLECTD_OPTIONS);
        Ok((cfg, log, warnings))
    }
}

// ============================================================================
// fetcher
// ============================================================================

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub storage: String,
    pub logfilename: String,
    pub log_level: String,
}

/// Command line options of tlsrpt-fetcher.
#[derive(Debug, Default, Parser)]
#[command(name = "tlsrpt-fetcher", version, about = "TLSRPT fetcher for finalized collector days")]
pub struct FetcherArgs {
    /// Storage backend; only the first comma-separated entry is used to fetch data from
    #[arg(long)]
    pub storage: Option<String>,
    /// Log file name for fetcher
    #[arg(long)]
    pub logfilename: Option<String>,
    /// Choose log level: debug, info, warn, error
    #[arg(long)]
    pub log_level: Option<String>,
    /// Day to fetch data for
    pub day: String,
    /// Domain to fetch data for, if omitted fetch list of domains
    pub domain: Option<String>,
}

const FETCHER_OPTIONS: &[&str] = &["storage", "logfilename", "log_level"];

impl FetcherConfig {
    pub fn finalize(args: &mut FetcherArgs) -> Result<(Self, SettingsLog, Vec<String>), ConfigError> {
        Self::finalize_from(args, &ProcessEnv)
    }

    pub fn finalize_from(
        args: &mut FetcherArgs,
        env: &dyn EnvSource,
    ) -> Result<(Self, SettingsLog, Vec<String>), ConfigError> {
        let p = ENV_PREFIX_FETCHER;
        let mut log = SettingsLog::new();
        let cfg = Self {
            storage: pick("storage", args.storage.take(), p, env, String::new(), &mut log)?,
            logfilename: pick("logfilename", args.logfilename.take(), p, env, String::new(), &mut log)?,
            log_level: pick("log_level", args.log_level.take(), p, env, "warn".to_string(), &mut log)?,
        };
        let warnings = scan_environment(p, env, FETCHER_OPTIONS);
        Ok((cfg, log, warnings))
    }
}

// ============================================================================
// reportd
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReportdConfig {
    pub logfilename: String,
    pub log_level: String,
    pub debug_send_mail_dest: String,
    pub debug_send_http_dest: String,
    pub debug_send_file_dest: String,
    pub dbname: String,
    pub keep_days: u32,
    pub fetchers: String,
    pub organization_name: String,
    pub contact_info: String,
    pub sender_address: String,
    pub compression_level: i32,
    pub http_script: String,
    pub http_timeout: u64,
    pub sendmail_script: String,
    pub sendmail_timeout: u64,
    pub spread_out_delivery: u64,
    pub interval_main_loop: u64,
    pub max_collectd_timeout: u64,
    pub max_collectd_timediff: i64,
    pub max_retries_delivery: u32,
    pub min_wait_delivery: u64,
    pub max_wait_delivery: u64,
    pub max_retries_domainlist: u32,
    pub min_wait_domainlist: u64,
    pub max_wait_domainlist: u64,
    pub max_retries_domaindetails: u32,
    pub min_wait_domaindetails: u64,
    pub max_wait_domaindetails: u64,
}

/// Command line options of tlsrpt-reportd.
#[derive(Debug, Default, Parser)]
#[command(name = "tlsrpt-reportd", version, about = "TLSRPT report scheduler and delivery daemon")]
pub struct ReportdArgs {
    /// Log file name for reportd
    #[arg(long)]
    pub logfilename: Option<String>,
    /// Choose log level: debug, info, warn, error
    #[arg(long)]
    pub log_level: Option<String>,
    /// Send all report mails to this address instead
    #[arg(long)]
    pub debug_send_mail_dest: Option<String>,
    /// Post all reports to this server instead
    #[arg(long)]
    pub debug_send_http_dest: Option<String>,
    /// Save all reports to this directory additionally
    #[arg(long)]
    pub debug_send_file_dest: Option<String>,
    /// Name of database file
    #[arg(long)]
    pub dbname: Option<String>,
    /// Days to keep old data
    #[arg(long)]
    pub keep_days: Option<u32>,
    /// Comma-separated list of fetchers to collect data
    #[arg(long)]
    pub fetchers: Option<String>,
    /// The name of the organization sending out the TLSRPT reports
    #[arg(long)]
    pub organization_name: Option<String>,
    /// The contact information of the sending organization
    #[arg(long)]
    pub contact_info: Option<String>,
    /// The From: address to send the report email from
    #[arg(long)]
    pub sender_address: Option<String>,
    /// Gzip compression level used to create reports, -1 for the default
    #[arg(long)]
    pub compression_level: Option<i32>,
    /// HTTP upload script
    #[arg(long)]
    pub http_script: Option<String>,
    /// Timeout for HTTPS uploads in seconds
    #[arg(long)]
    pub http_timeout: Option<u64>,
    /// Sendmail script
    #[arg(long)]
    pub sendmail_script: Option<String>,
    /// Timeout for the sendmail script in seconds
    #[arg(long)]
    pub sendmail_timeout: Option<u64>,
    /// Time range in seconds to spread out report delivery
    #[arg(long)]
    pub spread_out_delivery: Option<u64>,
    /// Maximum sleep interval in main loop in seconds
    #[arg(long)]
    pub interval_main_loop: Option<u64>,
    /// Maximum expected collectd timeout in seconds
    #[arg(long)]
    pub max_collectd_timeout: Option<u64>,
    /// Maximum expected collectd time difference in seconds
    #[arg(long)]
    pub max_collectd_timediff: Option<i64>,
    /// Maximum attempts to deliver a report
    #[arg(long)]
    pub max_retries_delivery: Option<u32>,
    /// Minimum time in seconds between two delivery attempts
    #[arg(long)]
    pub min_wait_delivery: Option<u64>,
    /// Maximum time in seconds between two delivery attempts
    #[arg(long)]
    pub max_wait_delivery: Option<u64>,
    /// Maximum attempts to fetch the list of domains
    #[arg(long)]
    pub max_retries_domainlist: Option<u32>,
    /// Minimum time in seconds between two domain list fetch attempts
    #[arg(long)]
    pub min_wait_domainlist: Option<u64>,
    /// Maximum time in seconds between two domain list fetch attempts
    #[arg(long)]
    pub max_wait_domainlist: Option<u64>,
    /// Maximum attempts to fetch domain details
    #[arg(long)]
    pub max_retries_domaindetails: Option<u32>,
    /// Minimum time in seconds between two domain detail fetch attempts
    #[arg(long)]
    pub min_wait_domaindetails: Option<u64>,
    /// Maximum time in seconds between two domain detail fetch attempts
    #[arg(long)]
    pub max_wait_domaindetails: Option<u64>,
}

const REPORTD_OPTIONS: &[&str] = &[
    "logfilename",
    "log_level",
    "debug_send_mail_dest",
    "debug_send_http_dest",
    "debug_send_file_dest",
    "dbname",
    "keep_days",
    "fetchers",
    "organization_name",
    "contact_info",
    "sender_address",
    "compression_level",
    "http_script",
    "http_timeout",
    "sendmail_script",
    "sendmail_timeout",
    "spread_out_delivery",
    "interval_main_loop",
    "max_collectd_timeout",
    "max_collectd_timediff",
    "max_retries_delivery",
    "min_wait_delivery",
    "max_wait_delivery",
    "max_retries_domainlist",
    "min_wait_domainlist",
    "max_wait_domainlist",
    "max_retries_domaindetails",
    "min_wait_domaindetails",
    "max_wait_domaindetails",
];

pub const DEFAULT_HTTP_SCRIPT: &str =
    "curl --silent --header 'Content-Type: application/tlsrpt+gzip' --data-binary @-";
pub const DEFAULT_SENDMAIL_SCRIPT: &str = "sendmail -i -t";

impl ReportdConfig {
    pub fn finalize(args: ReportdArgs) -> Result<(Self, SettingsLog, Vec<String>), ConfigError> {
        Self::finalize_from(args, &ProcessEnv)
    }

    pub fn finalize_from(
        args: ReportdArgs,
        env: &dyn EnvSource,
    ) -> Result<(Self, SettingsLog, Vec<String>), ConfigError> {
        let p = ENV_PREFIX_REPORTD;
        let mut log = SettingsLog::new();
        let cfg = Self {
            logfilename: pick("logfilename", args.logfilename, p, env, String::new(), &mut log)?,
            log_level: pick("log_level", args.log_level, p, env, "warn".to_string(), &mut log)?,
            debug_send_mail_dest: pick("debug_send_mail_dest", args.debug_send_mail_dest, p, env, String::new(), &mut log)?,
            debug_send_http_dest: pick("debug_send_http_dest", args.debug_send_http_dest, p, env, String::new(), &mut log)?,
            debug_send_file_dest: pick("debug_send_file_dest", args.debug_send_file_dest, p, env, String::new(), &mut log)?,
            dbname: pick("dbname", args.dbname, p, env, String::new(), &mut log)?,
            keep_days: pick("keep_days", args.keep_days, p, env, 10, &mut log)?,
            fetchers: pick("fetchers", args.fetchers, p, env, String::new(), &mut log)?,
            organization_name: pick("organization_name", args.organization_name, p, env, String::new(), &mut log)?,
            contact_info: pick("contact_info", args.contact_info, p, env, String::new(), &mut log)?,
            sender_address: pick("sender_address", args.sender_address, p, env, String::new(), &mut log)?,
            compression_level: pick("compression_level", args.compression_level, p, env, -1, &mut log)?,
            http_script: pick("http_script", args.http_script, p, env, DEFAULT_HTTP_SCRIPT.to_string(), &mut log)?,
            http_timeout: pick("http_timeout", args.http_timeout, p, env, 10, &mut log)?,
            sendmail_script: pick("sendmail_script", args.sendmail_script, p, env, DEFAULT_SENDMAIL_SCRIPT.to_string(), &mut log)?,
            sendmail_timeout: pick("sendmail_timeout", args.sendmail_timeout, p, env, 10, &mut log)?,
            spread_out_delivery: pick("spread_out_delivery", args.spread_out_delivery, p, env, 36000, &mut log)?,
            interval_main_loop: pick("interval_main_loop", args.interval_main_loop, p, env, 300, &mut log)?,
            max_collectd_timeout: pick("max_collectd_timeout", args.max_collectd_timeout, p, env, 10, &mut log)?,
            max_collectd_timediff: pick("max_collectd_timediff", args.max_collectd_timediff, p, env, 10, &mut log)?,
            max_retries_delivery: pick("max_retries_delivery", args.max_retries_delivery, p, env, 5, &mut log)?,
            min_wait_delivery: pick("min_wait_delivery", args.min_wait_delivery, p, env, 300, &mut log)?,
            max_wait_delivery: pick("max_wait_delivery", args.max_wait_delivery, p, env, 1800, &mut log)?,
            max_retries_domainlist: pick("max_retries_domainlist", args.max_retries_domainlist, p, env, 5, &mut log)?,
            min_wait_domainlist: pick("min_wait_domainlist", args.min_wait_domainlist, p, env, 30, &mut log)?,
            max_wait_domainlist: pick("max_wait_domainlist", args.max_wait_domainlist, p, env, 300, &mut log)?,
            max_retries_domaindetails: pick("max_retries_domaindetails", args.max_retries_domaindetails, p, env, 5, &mut log)?,
            min_wait_domaindetails: pick("min_wait_domaindetails", args.min_wait_domaindetails, p, env, 30, &mut log)?,
            max_wait_domaindetails: pick("max_wait_domaindetails", args.max_wait_domaindetails, p, env, 300, &mut log)?,
        };
        let warnings = scan_environment(p, env, REPORTD_OPTIONS);
        Ok((cfg, log, warnings))
    }

    /// Split the configured fetcher commands.
    pub fn fetcher_list(&self) -> Vec<String> {
        self.fetchers.split(',').map(str::to_string).collect()
    }
}
