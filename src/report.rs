//! RFC 8460 report rendering
//!
//! Turns the aggregated per-policy counters into the final JSON report
//! document: policy type codes become their RFC names, the short failure
//! detail keys of the collector protocol become the long RFC 8460 keys and
//! the summary is derived from the counters.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::traits::PolicyCounters;
use crate::util::{report_end_datetime, report_start_datetime};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Undefined policy type code {0}")]
    UnknownPolicyType(Value),
    #[error("Invalid policy JSON: {0}")]
    BadPolicyJson(String),
}

/// Mapping of internal policy type codes to RFC 8460 policy-type names.
fn policy_type_name(code: i64) -> Option<&'static str> {
    match code {
        1 => Some("tlsa"),
        2 => Some("sts"),
        9 => Some("no-policy-found"),
        _ => None,
    }
}

/// Mapping of failure detail short keys to RFC 8460 keys. The numeric `c`
/// code is handled separately through `result_type_name`.
const FAILURE_DETAIL_KEYS: &[(&str, &str)] = &[
    ("a", "additional-information"),
    ("f", "failure-reason-code"),
    ("h", "receiving-mx-helo"),
    ("n", "receiving-mx-hostname"),
    ("r", "receiving-ip"),
    ("s", "sending-mta-ip"),
];

/// Mapping of numeric collector result codes to RFC 8460 result-types.
fn result_type_name(code: i64) -> Option<&'static str> {
    match code {
        // TLS negotiation failures
        201 => Some("starttls-not-supported"),
        202 => Some("certificate-host-mismatch"),
        203 => Some("certificate-not-trusted"),
        204 => Some("certificate-expired"),
        205 => Some("validation-failure"),
        // mta-sts related failures
        301 => Some("sts-policy-fetch-error"),
        302 => Some("sts-policy-invalid"),
        303 => Some("sts-webpki-invalid"),
        // dns related failures
        304 => Some("tlsa-invalid"),
        305 => Some("dnssec-invalid"),
        306 => Some("dane-required"),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DateRange {
    pub start_datetime: String,
    pub end_datetime: String,
}

/// A complete RFC 8460 aggregate report for one day, one domain and one
/// TLSRPT record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Report {
    pub organization_name: String,
    pub date_range: DateRange,
    pub contact_info: String,
    pub report_id: String,
    pub policies: Vec<Value>,
}

/// The report-id used in the JSON document and the email subject.
pub fn report_id(day: &str, report_index: i64, report_domain: &str) -> String {
    format!("{}_idx{}_{}", report_start_datetime(day), report_index, report_domain)
}

/// The attachment file name defined by RFC 8460:
/// `<org>!<domain>!<start>!<end>!<index>.json.gz`
pub fn report_filename(org: &str, dom: &str, day: &str, nr: i64) -> Option<String> {
    let start = crate::util::report_start_timestamp(day)?;
    let end = crate::util::report_end_timestamp(day)?;
    Some(format!("{org}!{dom}!{start}!{end}!{nr}.json.gz"))
}

/// Merge one fetcher's counters for a single TLSRPT record into the
/// aggregate, summing totals, failures and per-detail counts.
pub fn aggregate_counters(
    aggregate: &mut BTreeMap<String, PolicyCounters>,
    data: &BTreeMap<String, PolicyCounters>,
) {
    for (spolicy, counters) in data {
        let merged = aggregate.entry(spolicy.clone()).or_default();
        merged.cntrtotal += counters.cntrtotal;
        merged.cntrfailure += counters.cntrfailure;
        for (reason, cntr) in &counters.failures {
            *merged.failures.entry(reason.clone()).or_insert(0) += cntr;
        }
    }
}

fn render_failure_detail(sfailure: &str, count: u64) -> Result<Value, RenderError> {
    let failure: Value = serde_json::from_str(sfailure)
        .map_err(|e| RenderError::BadPolicyJson(e.to_string()))?;
    let mut fdet = Map::new();
    for (short, long) in FAILURE_DETAIL_KEYS {
        if let Some(v) = failure.get(*short) {
            fdet.insert((*long).to_string(), v.clone());
        }
    }
    if let Some(code) = failure.get("c") {
        match code.as_i64().and_then(result_type_name) {
            Some(name) => {
                fdet.insert("result-type".to_string(), Value::from(name));
            }
            None => tracing::error!("Undefined result type code {}", code),
        }
    }
    fdet.insert("failed-session-count".to_string(), Value::from(count));
    Ok(Value::Object(fdet))
}

fn render_policy(spolicy: &str, counters: &PolicyCounters) -> Result<Value, RenderError> {
    let mut policy: Value = serde_json::from_str(spolicy)
        .map_err(|e| RenderError::BadPolicyJson(e.to_string()))?;
    let type_code = policy
        .get("policy-type")
        .cloned()
        .unwrap_or(Value::Null);
    let name = type_code
        .as_i64()
        .and_then(policy_type_name)
        .ok_or(RenderError::UnknownPolicyType(type_code))?;
    policy["policy-type"] = Value::from(name);

    let mut failure_details = Vec::with_capacity(counters.failures.len());
    for (sfailure, count) in &counters.failures {
        failure_details.push(render_failure_detail(sfailure, *count)?);
    }

    let mut npol = Map::new();
    npol.insert(
        "summary".to_string(),
        serde_json::json!({
            "total-failure-session-count": counters.cntrfailure,
            "total-successful-session-count": counters.cntrtotal.saturating_sub(counters.cntrfailure),
        }),
    );
    npol.insert("policy".to_string(), policy);
    npol.insert("failure-details".to_string(), Value::Array(failure_details));
    Ok(Value::Object(npol))
}

/// Render a report into its final form.
///
/// An unknown policy type aborts the whole render; a report must never go
/// out with a numeric policy-type.
pub fn render_report(
    organization_name: &str,
    contact_info: &str,
    day: &str,
    uniqid: i64,
    domain: &str,
    data: &BTreeMap<String, PolicyCounters>,
) -> Result<Report, RenderError> {
    let mut policies = Vec::with_capacity(data.len());
    for (spolicy, counters) in data {
        policies.push(render_policy(spolicy, counters)?);
    }
    Ok(Report {
        organization_name: organization_name.to_string(),
        date_range: DateRange {
            start_datetime: report_start_datetime(day),
            end_datetime: report_end_datetime(day),
        },
        contact_info: contact_info.to_string(),
        report_id: report_id(day, uniqid, domain),
        policies,
    })
}
