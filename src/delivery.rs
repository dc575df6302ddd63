//! Report delivery
//!
//! Reports leave the system through external programs: a sendmail-like
//! script for `mailto:` destinations and an HTTP upload script for `https:`
//! destinations. Both get the payload on stdin and signal success through
//! their exit code.

use std::io::Write as _;
use std::process::Stdio;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use mail_builder::headers::raw::Raw;
use mail_builder::MessageBuilder;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::ReportdConfig;
use crate::report::{report_filename, report_id};

/// Results for report delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    Succeeded,
    TryAgain,
    UnknownRua,
}

/// Gzip a rendered report. A level of -1 selects the default compression.
pub fn gzip_report(report: &str, compression_level: i32) -> std::io::Result<Vec<u8>> {
    let compression = if compression_level < 0 {
        Compression::default()
    } else {
        Compression::new(compression_level.min(9) as u32)
    };
    let mut encoder = GzEncoder::new(Vec::with_capacity(report.len()), compression);
    encoder.write_all(report.as_bytes())?;
    encoder.finish()
}

/// Quote one argument for `sh -c`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Domain part of the configured sender address, for Message-ID synthesis.
fn sender_domain(sender_address: &str) -> &str {
    sender_address.rsplit('@').next().unwrap_or(sender_address)
}

/// Synthesize a unique Message-ID local part under the given domain.
fn make_msgid(domain: &str) -> String {
    let now = crate::util::utc_time_now().timestamp_micros();
    let unique: u64 = rand::random();
    format!("{now}.{unique:016x}@{domain}")
}

/// Subject line carrying the report id as required by RFC 8460.
pub fn create_email_subject(organization_name: &str, dom: &str, report_id: &str) -> String {
    format!("Report Domain: {dom} Submitter: {organization_name} Report-ID: <{report_id}@{organization_name}>")
}

/// Build the RFC 2822 report message with the gzip report attached.
pub fn build_report_email(
    cfg: &ReportdConfig,
    day: &str,
    dom: &str,
    uniqid: i64,
    destination: &str,
    zreport: &[u8],
) -> std::io::Result<String> {
    let rid = report_id(day, uniqid, dom);
    let filename = report_filename(&cfg.organization_name, dom, day, uniqid)
        .unwrap_or_else(|| format!("{}!{}!{}.json.gz", cfg.organization_name, dom, uniqid));
    let intro = format!("This is an aggregate TLS report from {}", cfg.organization_name);

    let message = MessageBuilder::new()
        .subject(create_email_subject(&cfg.organization_name, dom, &rid))
        .from(cfg.sender_address.as_str())
        .to(destination)
        .message_id(make_msgid(sender_domain(&cfg.sender_address)))
        .header("TLS-Report-Domain", Raw::new(dom))
        .header("TLS-Report-Submitter", Raw::new(cfg.organization_name.as_str()))
        .header("TLS-Required", Raw::new("No"))
        .text_body(intro)
        .attachment("application/tlsrpt+gzip", filename, zreport)
        .write_to_string()?;

    // RFC 8460 asks for a report envelope, not a generic mixed multipart.
    Ok(message.replacen("multipart/mixed", "multipart/report; report-type=tlsrpt", 1))
}

/// Pipe a payload into a shell command and wait for its exit code.
async fn run_delivery_script(script: &str, payload: &[u8], timeout: u64) -> DeliveryResult {
    let child = Command::new("sh")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::piped())
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            tracing::error!("Could not start delivery script '{}': {}", script, e);
            return DeliveryResult::TryAgain;
        }
    };
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(payload).await {
            tracing::error!("Error writing to delivery script '{}': {}", script, e);
        }
        // closing stdin lets the script see EOF
        drop(stdin);
    }
    match tokio::time::timeout(Duration::from_secs(timeout), child.wait()).await {
        Ok(Ok(status)) if status.success() => DeliveryResult::Succeeded,
        Ok(Ok(status)) => {
            tracing::warn!("Delivery script exit code {:?}", status.code());
            DeliveryResult::TryAgain
        }
        Ok(Err(e)) => {
            tracing::error!("Error waiting for delivery script '{}': {}", script, e);
            DeliveryResult::TryAgain
        }
        Err(_) => {
            tracing::error!("Timeout after {} seconds running delivery script '{}'", timeout, script);
            let _ = child.kill().await;
            DeliveryResult::TryAgain
        }
    }
}

/// Save a copy of a report or report email for debugging.
fn send_out_report_to_file(dom: &str, d_r_id: i64, destination: &str, content: &str, debugdir: &str) {
    let filename = format!(
        "{}/testreport-{}-{}-{}.json",
        debugdir,
        dom,
        d_r_id,
        destination.replace('/', "_")
    );
    tracing::debug!("Would send out report {} to {}, saving to {}", d_r_id, destination, filename);
    if let Err(e) = std::fs::write(&filename, content) {
        tracing::error!("Could not save report to {}: {}", filename, e);
    }
}

async fn send_out_report_to_mail(
    cfg: &ReportdConfig,
    day: &str,
    dom: &str,
    d_r_id: i64,
    uniqid: i64,
    destination: &str,
    zreport: &[u8],
) -> DeliveryResult {
    let dest = if cfg.debug_send_mail_dest.is_empty() {
        destination.to_string()
    } else {
        tracing::warn!("Overriding destination {} to {}", destination, cfg.debug_send_mail_dest);
        cfg.debug_send_mail_dest.clone()
    };

    let email = match build_report_email(cfg, day, dom, uniqid, &dest, zreport) {
        Ok(email) => email,
        Err(e) => {
            tracing::error!("Could not build report email for {}: {}", dest, e);
            return DeliveryResult::TryAgain;
        }
    };
    if !cfg.debug_send_file_dest.is_empty() {
        let tag = format!("THE_EMAIL_TO_{destination}");
        send_out_report_to_file(dom, d_r_id, &tag, &email, &cfg.debug_send_file_dest);
    }
    tracing::debug!("Calling sendmail_script {}", cfg.sendmail_script);
    run_delivery_script(&cfg.sendmail_script, email.as_bytes(), cfg.sendmail_timeout).await
}

async fn send_out_report_to_http(
    cfg: &ReportdConfig,
    destination: &str,
    zreport: &[u8],
) -> DeliveryResult {
    let dest = if cfg.debug_send_http_dest.is_empty() {
        destination.to_string()
    } else {
        tracing::warn!("Overriding destination {} to {}", destination, cfg.debug_send_http_dest);
        cfg.debug_send_http_dest.clone()
    };
    let script = format!("{} {}", cfg.http_script, shell_quote(&dest));
    tracing::debug!("Calling http_script {}", script);
    run_delivery_script(&script, zreport, cfg.http_timeout).await
}

/// Send out one report to one destination, HTTP(S) or SMTP.
///
/// If `debug_send_file_dest` is configured an additional copy is saved to a
/// local file.
pub async fn send_out_report(
    cfg: &ReportdConfig,
    day: &str,
    dom: &str,
    d_r_id: i64,
    uniqid: i64,
    destination: &str,
    report: &str,
) -> DeliveryResult {
    if !cfg.debug_send_file_dest.is_empty() {
        send_out_report_to_file(dom, d_r_id, destination, report, &cfg.debug_send_file_dest);
    }
    let zreport = match gzip_report(report, cfg.compression_level) {
        Ok(zreport) => zreport,
        Err(e) => {
            tracing::error!("Failed to compress report: {}", e);
            return DeliveryResult::TryAgain;
        }
    };
    if let Some(mailaddr) = destination.strip_prefix("mailto:") {
        send_out_report_to_mail(cfg, day, dom, d_r_id, uniqid, mailaddr, &zreport).await
    } else if destination.starts_with("https:") {
        send_out_report_to_http(cfg, destination, &zreport).await
    } else {
        tracing::error!("Unknown RUA scheme in report destination '{}'", destination);
        DeliveryResult::UnknownRua
    }
}
