//! End-to-end tests for the TLSRPT reporting pipeline.
//!
//! Drives the full flow: datagram -> collectd store -> day rollover ->
//! fetcher binary (spawned by the reportd stages, exactly like in
//! production) -> rendered report -> delivery through a stub sendmail
//! script.

use std::time::Duration;

use serde_json::json;

use tlsrpt_reporter::collectd::process_datagram;
use tlsrpt_reporter::config::{CollectdConfig, ReportdConfig};
use tlsrpt_reporter::report_store::ReportStore;
use tlsrpt_reporter::reportd::Reportd;
use tlsrpt_reporter::store::PluginRegistry;
use tlsrpt_reporter::traits::CollectdBackend;
use tlsrpt_reporter::util::utc_date_yesterday;

fn collectd_config(dir: &std::path::Path) -> CollectdConfig {
    let (mut cfg, _, _) = CollectdConfig::finalize(Default::default()).unwrap();
    cfg.storage = format!("sqlite:{}", dir.join("collectd.sqlite").display());
    cfg.dump_path_for_invalid_datagram = dir.join("invalid.dump").display().to_string();
    cfg
}

fn reportd_config(dir: &std::path::Path, collectd_cfg: &CollectdConfig) -> ReportdConfig {
    let (mut cfg, _, _) = ReportdConfig::finalize(Default::default()).unwrap();
    cfg.dbname = dir.join("reportd.sqlite").display().to_string();
    cfg.fetchers = format!(
        "{} --storage {}",
        env!("CARGO_BIN_EXE_tlsrpt-fetcher"),
        collectd_cfg.storage
    );
    cfg.organization_name = "Example Inc".to_string();
    cfg.contact_info = "tlsrpt@example.org".to_string();
    cfg.sender_address = "tlsrpt@example.org".to_string();
    cfg.spread_out_delivery = 1;
    cfg.sendmail_script = format!("cat >> {}", dir.join("sent-mails.txt").display());
    cfg
}

/// Feed datagrams into a collectd store and roll the day over so the
/// fetcher can see the data as yesterday's.
fn ingest_and_rollover(cfg: &CollectdConfig, datagrams: &[serde_json::Value]) {
    let registry = PluginRegistry::builtin();
    let mut backends = tlsrpt_reporter::collectd::create_backends(cfg, &registry).unwrap();
    for datagram in datagrams {
        process_datagram(cfg, &mut backends, datagram.to_string().as_bytes()).unwrap();
    }
    for backend in backends.iter_mut() {
        backend.switch_to_next_day(true).unwrap();
    }
}

async fn settle() {
    // scheduling timestamps have millisecond resolution
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[tokio::test]
async fn test_single_success_report_is_rendered_and_sent() {
    let dir = tempfile::tempdir().unwrap();
    let collectd_cfg = collectd_config(dir.path());
    ingest_and_rollover(
        &collectd_cfg,
        &[json!({
            "d": "example.com",
            "pr": "v=TLSRPTv1;rua=mailto:r@x.test",
            "dpv": "1",
            "policies": [{"policy-type": 9, "f": 0, "t": 0}]
        })],
    );

    let cfg = reportd_config(dir.path(), &collectd_cfg);
    let store = ReportStore::open(&cfg.dbname).unwrap();
    let mut reportd = Reportd::with_store(cfg, store);
    let yesterday = utc_date_yesterday().format("%Y-%m-%d").to_string();

    reportd.check_day().unwrap();
    settle().await;
    reportd.collect_domains().await.unwrap();
    settle().await;
    reportd.fetch_data().await.unwrap();
    reportd.create_reports().unwrap();
    settle().await;

    // one destination with the published rua, due for delivery
    let now = chrono::Utc::now().timestamp_millis() + 1100;
    let due = reportd.store().due_destinations(now).unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].destination, "mailto:r@x.test");

    let report: serde_json::Value = serde_json::from_str(&due[0].report).unwrap();
    assert_eq!(
        report["report-id"],
        format!("{yesterday}T00:00:00Z_idx1_example.com")
    );
    assert_eq!(report["organization-name"], "Example Inc");
    assert_eq!(report["date-range"]["start-datetime"], format!("{yesterday}T00:00:00Z"));
    let summary = &report["policies"][0]["summary"];
    assert_eq!(summary["total-successful-session-count"], 1);
    assert_eq!(summary["total-failure-session-count"], 0);
    assert_eq!(report["policies"][0]["policy"]["policy-type"], "no-policy-found");

    // wait until the spread-out delivery time has passed, then deliver
    tokio::time::sleep(Duration::from_millis(1100)).await;
    reportd.send_out_reports().await.unwrap();
    let (status, retries, _) = reportd
        .store()
        .destination_state("mailto:r@x.test", due[0].d_r_id)
        .unwrap()
        .unwrap();
    assert_eq!(status.as_deref(), Some("sent"));
    assert_eq!(retries, 0);

    let mail = std::fs::read_to_string(dir.path().join("sent-mails.txt")).unwrap();
    assert!(mail.contains("TLS-Report-Domain: example.com"));
    assert!(mail.contains("multipart/report; report-type=tlsrpt"));
    assert!(mail.contains(&format!("{yesterday}T00:00:00Z_idx1_example.com@Example")));
}

#[tokio::test]
async fn test_failure_sessions_aggregate_across_datagrams() {
    let dir = tempfile::tempdir().unwrap();
    let collectd_cfg = collectd_config(dir.path());
    let datagram = json!({
        "d": "fail.example",
        "pr": "v=TLSRPTv1;rua=mailto:agg@x.test",
        "dpv": "1",
        "policies": [{
            "policy-type": 2,
            "policy-domain": "fail.example",
            "f": 1,
            "t": 1,
            "failure-details": [{"c": 204}]
        }]
    });
    ingest_and_rollover(&collectd_cfg, &[datagram.clone(), datagram.clone(), datagram]);

    let cfg = reportd_config(dir.path(), &collectd_cfg);
    let store = ReportStore::open(&cfg.dbname).unwrap();
    let mut reportd = Reportd::with_store(cfg, store);

    reportd.check_day().unwrap();
    settle().await;
    reportd.collect_domains().await.unwrap();
    settle().await;
    reportd.fetch_data().await.unwrap();
    reportd.create_reports().unwrap();
    settle().await;

    let now = chrono::Utc::now().timestamp_millis() + 1100;
    let due = reportd.store().due_destinations(now).unwrap();
    assert_eq!(due.len(), 1);
    let report: serde_json::Value = serde_json::from_str(&due[0].report).unwrap();
    let policy = &report["policies"][0];
    assert_eq!(policy["summary"]["total-failure-session-count"], 3);
    assert_eq!(policy["summary"]["total-successful-session-count"], 0);
    let detail = &policy["failure-details"][0];
    assert_eq!(detail["result-type"], "certificate-expired");
    assert_eq!(detail["failed-session-count"], 3);
}

#[tokio::test]
async fn test_unparseable_record_keeps_report_but_no_destinations() {
    let dir = tempfile::tempdir().unwrap();
    let collectd_cfg = collectd_config(dir.path());
    ingest_and_rollover(
        &collectd_cfg,
        &[json!({
            "d": "norecord.example",
            "pr": "not a record",
            "dpv": "1",
            "policies": [{"policy-type": 9, "f": 0, "t": 0}]
        })],
    );

    let cfg = reportd_config(dir.path(), &collectd_cfg);
    let store = ReportStore::open(&cfg.dbname).unwrap();
    let mut reportd = Reportd::with_store(cfg, store);
    let yesterday = utc_date_yesterday().format("%Y-%m-%d").to_string();

    reportd.check_day().unwrap();
    settle().await;
    reportd.collect_domains().await.unwrap();
    settle().await;
    reportd.fetch_data().await.unwrap();
    reportd.create_reports().unwrap();

    // report row exists, destinations do not
    assert_eq!(reportd.store().next_uniqid(&yesterday, "norecord.example").unwrap(), 2);
    let now = chrono::Utc::now().timestamp_millis() + 1100;
    assert!(reportd.store().due_destinations(now).unwrap().is_empty());
}

#[tokio::test]
async fn test_domains_from_multiple_records_get_separate_reports() {
    let dir = tempfile::tempdir().unwrap();
    let collectd_cfg = collectd_config(dir.path());
    ingest_and_rollover(
        &collectd_cfg,
        &[
            json!({
                "d": "multi.example",
                "pr": "v=TLSRPTv1;rua=mailto:one@x.test",
                "dpv": "1",
                "policies": [{"policy-type": 9, "f": 0, "t": 0}]
            }),
            json!({
                "d": "multi.example",
                "pr": "v=TLSRPTv1;rua=mailto:two@x.test,https://collector.test/up",
                "dpv": "1",
                "policies": [{"policy-type": 9, "f": 0, "t": 0}]
            }),
        ],
    );

    let cfg = reportd_config(dir.path(), &collectd_cfg);
    let store = ReportStore::open(&cfg.dbname).unwrap();
    let mut reportd = Reportd::with_store(cfg, store);
    let yesterday = utc_date_yesterday().format("%Y-%m-%d").to_string();

    reportd.check_day().unwrap();
    settle().await;
    reportd.collect_domains().await.unwrap();
    settle().await;
    reportd.fetch_data().await.unwrap();
    reportd.create_reports().unwrap();
    settle().await;

    // two reports (uniqid 1 and 2) with three destinations in total
    assert_eq!(reportd.store().next_uniqid(&yesterday, "multi.example").unwrap(), 3);
    let now = chrono::Utc::now().timestamp_millis() + 1100;
    let due = reportd.store().due_destinations(now).unwrap();
    assert_eq!(due.len(), 3);
    let mut destinations: Vec<&str> = due.iter().map(|j| j.destination.as_str()).collect();
    destinations.sort_unstable();
    assert_eq!(destinations, [
        "https://collector.test/up",
        "mailto:one@x.test",
        "mailto:two@x.test",
    ]);
}
