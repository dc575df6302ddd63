//! Report scheduler daemon
//!
//! A single cooperative loop runs five idempotent stages per iteration:
//! detect new days, collect domain lists from the fetchers, fetch domain
//! details, render reports and deliver them. Each stage commits its own
//! state transitions, so a crashed or interrupted daemon resumes where it
//! left off.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};

use crate::config::ReportdConfig;
use crate::delivery::{send_out_report, DeliveryResult};
use crate::randpool::RandPool;
use crate::record::parse_tlsrpt_record;
use crate::report::{aggregate_counters, render_report};
use crate::report_store::{DetailJob, FetchJob, ReportStore};
use crate::traits::{PoliciesByRecord, PolicyCounters, StoreError};
use crate::util::{utc_date_now, utc_date_yesterday, utc_time_now, Stopwatch};

#[derive(Debug, Error)]
pub enum ReportdError {
    #[error("No fetchers setup")]
    NoFetchers,
    #[error("Empty fetcher configured")]
    EmptyFetcher,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Scheduling timestamps are epoch milliseconds.
fn now_ts() -> i64 {
    utc_time_now().timestamp_millis()
}

#[derive(Debug)]
pub struct Reportd {
    cfg: ReportdConfig,
    store: ReportStore,
    fetchers: Vec<String>,
    rand_pool_delivery: RandPool,
    wakeuptime: DateTime<Utc>,
}

impl Reportd {
    pub fn new(cfg: ReportdConfig) -> Result<Self, ReportdError> {
        if cfg.fetchers.is_empty() {
            return Err(ReportdError::NoFetchers);
        }
        let fetchers = cfg.fetcher_list();
        if fetchers.iter().any(|f| f.trim().is_empty()) {
            return Err(ReportdError::EmptyFetcher);
        }
        let store = ReportStore::open(&cfg.dbname)?;
        Ok(Self {
            rand_pool_delivery: RandPool::new(cfg.spread_out_delivery),
            wakeuptime: utc_time_now(),
            fetchers,
            cfg,
            store,
        })
    }

    /// Build a reportd on an already opened store (for testing).
    pub fn with_store(cfg: ReportdConfig, store: ReportStore) -> Self {
        Self {
            rand_pool_delivery: RandPool::new(cfg.spread_out_delivery),
            wakeuptime: utc_time_now(),
            fetchers: cfg.fetcher_list(),
            cfg,
            store,
        }
    }

    pub fn store(&self) -> &ReportStore {
        &self.store
    }

    // ------------------------------------------------------------------
    // wait calculation and wake-up scheduling
    // ------------------------------------------------------------------

    fn wait_uniform(&self, smin: u64, smax: u64) -> u64 {
        rand::thread_rng().gen_range(smin..=smax.max(smin))
    }

    fn wait_domainlist(&self) -> u64 {
        self.wait_uniform(self.cfg.min_wait_domainlist, self.cfg.max_wait_domainlist)
    }

    fn wait_domaindetails(&self) -> u64 {
        self.wait_uniform(self.cfg.min_wait_domaindetails, self.cfg.max_wait_domaindetails)
    }

    fn wait_retry_report_delivery(&self) -> u64 {
        self.wait_uniform(self.cfg.min_wait_delivery, self.cfg.max_wait_delivery)
    }

    /// Delivery time for a new destination, drawn from the spread pool.
    fn schedule_report_delivery(&mut self) -> i64 {
        let secs = self.rand_pool_delivery.get();
        now_ts() + (secs as i64) * 1000
    }

    /// Schedule the next main loop run in `secs` seconds.
    fn wake_up_in(&mut self, secs: u64, force: bool) -> DateTime<Utc> {
        let t = utc_time_now() + chrono::Duration::seconds(secs as i64);
        self.wake_up_at(t, force)
    }

    /// Schedule the next main loop run at time `t`, keeping an earlier wake
    /// time unless forced.
    fn wake_up_at(&mut self, t: DateTime<Utc>, force: bool) -> DateTime<Utc> {
        if self.wakeuptime > t {
            tracing::debug!("Changing wake up time from {} to {}", self.wakeuptime, t);
            self.wakeuptime = t;
        } else if force {
            tracing::debug!("Enforcing wake up time from {} to {}", self.wakeuptime, t);
            self.wakeuptime = t;
        } else {
            tracing::debug!("Not changing wake up time from {} to {}", self.wakeuptime, t);
        }
        t
    }

    // ------------------------------------------------------------------
    // stage A: check day
    // ------------------------------------------------------------------

    /// Create fetch jobs once a new day has finished, purging expired rows.
    pub fn check_day(&mut self) -> Result<(), ReportdError> {
        tracing::debug!("Check day");
        let yesterday = utc_date_yesterday().format("%Y-%m-%d").to_string();
        self.store.purge_old_data(utc_date_now(), self.cfg.keep_days)?;
        if self.store.have_fetchjobs_for(&yesterday)? {
            // jobs already exist, just look again in a few minutes
            self.wake_up_in(300, false);
            return Ok(());
        }
        self.store.insert_fetchjobs(&yesterday, &self.fetchers, now_ts())?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // stage B: collect domain lists
    // ------------------------------------------------------------------

    pub async fn collect_domains(&mut self) -> Result<(), ReportdError> {
        tracing::debug!("Collect domains");
        for job in self.store.due_fetchjobs(now_ts())? {
            if self.collect_domains_from(&job).await {
                tracing::info!("Fetcher {} {} finished in run {}", job.fetcherindex, job.fetcher, job.retries);
                self.store.mark_fetchjob_ok(&job.day, job.fetcherindex)?;
            } else if job.retries < self.cfg.max_retries_domainlist {
                tracing::warn!("Fetcher {} {} failed in run {}", job.fetcherindex, job.fetcher, job.retries);
                let t = self.wake_up_in(self.wait_domainlist(), false);
                self.store.retry_fetchjob(&job.day, job.fetcherindex, t.timestamp_millis())?;
            } else {
                tracing::warn!(
                    "Fetcher {} {} timedout after {} retries",
                    job.fetcherindex,
                    job.fetcher,
                    job.retries
                );
                self.store.mark_fetchjob_timedout(&job.day, job.fetcherindex)?;
            }
        }
        Ok(())
    }

    /// Fetch the list of domains from one fetcher.
    ///
    /// Returns true if the job completed, false if a retry is necessary.
    async fn collect_domains_from(&mut self, job: &FetchJob) -> bool {
        tracing::debug!("Collect domains from {} {}", job.fetcherindex, job.fetcher);
        let mut watch = Stopwatch::start();

        let mut parts = job.fetcher.split_whitespace();
        let program = match parts.next() {
            Some(program) => program,
            None => {
                tracing::error!("Empty fetcher command for index {}", job.fetcherindex);
                return false;
            }
        };
        let child = Command::new(program)
            .args(parts)
            .arg(&job.day)
            .stdout(Stdio::piped())
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("Could not collect domains from fetcher '{}': {}", job.fetcher, e);
                return false;
            }
        };
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => return false,
        };
        let mut lines = BufReader::new(stdout).lines();

        let versionheader = lines.next_line().await.ok().flatten().unwrap_or_default();
        tracing::debug!("From fetcher {} got version header: {}", job.fetcherindex, versionheader);
        if versionheader.trim_end() != crate::FETCHER_VERSION_STRING_V1 {
            tracing::error!(
                "Unsupported protocol version from fetcher {} '{}' :{}",
                job.fetcherindex,
                job.fetcher,
                versionheader
            );
            let _ = child.kill().await;
            return false;
        }

        // Line 2: the collectd side's clock, to surface clock drift between
        // the two hosts.
        let time_line = lines.next_line().await.ok().flatten().unwrap_or_default();
        match NaiveDateTime::parse_from_str(time_line.trim_end(), crate::TIMEFORMAT) {
            Ok(collectd_time) => {
                let collectd_time = collectd_time.and_utc();
                let reportd_time = utc_time_now();
                let dt = (reportd_time - collectd_time).num_seconds().abs();
                if dt > self.cfg.max_collectd_timediff {
                    tracing::warn!(
                        "Collectd time {} and reportd time {} differ more then {} on fetcher {} {}",
                        collectd_time,
                        reportd_time,
                        self.cfg.max_collectd_timediff,
                        job.fetcherindex,
                        job.fetcher
                    );
                }
            }
            Err(e) => {
                tracing::error!(
                    "Unparseable time '{}' from fetcher {} {}: {}",
                    time_line,
                    job.fetcherindex,
                    job.fetcher,
                    e
                );
                let _ = child.kill().await;
                return false;
            }
        }

        // Line 3: available day
        let available_day = lines.next_line().await.ok().flatten().unwrap_or_default();
        if available_day.trim_end() != job.day {
            tracing::warn!(
                "Fetcher not ready {} {}: expected {} but got {}",
                job.fetcherindex,
                job.fetcher,
                job.day,
                available_day
            );
            let _ = child.kill().await;
            return false;
        }

        if let Err(e) = self.store.begin_domainlist() {
            tracing::error!("Could not open domainlist savepoint: {}", e);
            let _ = child.kill().await;
            return false;
        }
        let mut result = true;
        let mut dc: u64 = 0;
        loop {
            let dom = match lines.next_line().await {
                Ok(Some(dom)) => dom.trim_end().to_string(),
                Ok(None) => {
                    // a remote connection may have been interrupted, a retry
                    // can still succeed
                    tracing::warn!("Unexpected end of domain list");
                    result = false;
                    break;
                }
                Err(e) => {
                    tracing::error!("Error reading domain list: {}", e);
                    result = false;
                    break;
                }
            };
            tracing::debug!("Got line '{}'", dom);
            if dom == "." {
                break;
            }
            match self.store.insert_reportdata(&job.day, &dom, job.fetcherindex, &job.fetcher, now_ts()) {
                Ok(true) => dc += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Unexpected error inserting domain {}: {}", dom, e);
                    result = false;
                    break;
                }
            }
        }

        if result {
            tracing::info!("DB-commit for fetcher {} {}", job.fetcherindex, job.fetcher);
            if let Err(e) = self.store.release_domainlist() {
                tracing::error!("Could not release domainlist savepoint: {}", e);
                result = false;
            }
        } else {
            tracing::info!("DB-rollback for fetcher {} {}", job.fetcherindex, job.fetcher);
            if let Err(e) = self.store.rollback_domainlist() {
                tracing::error!("Could not roll back domainlist savepoint: {}", e);
            }
        }
        let _ = child.wait().await;
        watch.add(dc);
        tracing::info!(
            "Fetching {} domains took {:.3}s, {:.1} domains per second",
            dc,
            watch.elapsed_secs(),
            watch.rate()
        );
        result
    }

    // ------------------------------------------------------------------
    // stage C: fetch domain details
    // ------------------------------------------------------------------

    pub async fn fetch_data(&mut self) -> Result<(), ReportdError> {
        tracing::debug!("Fetch data");
        let incompletedays = self.store.incomplete_days()?;
        if !incompletedays.is_empty() {
            tracing::debug!("There are {} incomplete days: {:?}", incompletedays.len(), incompletedays);
        }
        for job in self.store.due_domain_details(now_ts())? {
            if self.fetch_data_from_fetcher_for_domain(&job).await {
                continue;
            }
            if job.retries < self.cfg.max_retries_domaindetails {
                let t = self.wake_up_in(self.wait_domaindetails(), false);
                self.store
                    .retry_reportdata(&job.day, job.fetcherindex, &job.domain, t.timestamp_millis())?;
            } else {
                tracing::warn!(
                    "Details for domain {} timedout on fetcher {} after {} retries",
                    job.domain,
                    job.fetcherindex,
                    job.retries
                );
                self.store
                    .mark_reportdata_timedout(&job.day, job.fetcherindex, &job.domain)?;
            }
        }
        Ok(())
    }

    /// Fetch details for one domain from one fetcher for a specific day.
    async fn fetch_data_from_fetcher_for_domain(&mut self, job: &DetailJob) -> bool {
        tracing::debug!("Fetch data from {} {} for domain {}", job.fetcherindex, job.fetcher, job.domain);
        let mut parts = job.fetcher.split_whitespace();
        let program = match parts.next() {
            Some(program) => program,
            None => return false,
        };
        let child = Command::new(program)
            .args(parts)
            .arg(&job.day)
            .arg(&job.domain)
            .stdout(Stdio::piped())
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("Could not run fetcher {}: {}", job.fetcher, e);
                return false;
            }
        };
        let mut alldata = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            if let Err(e) = stdout
                .take(crate::MAX_READ_FETCHER as u64)
                .read_to_end(&mut alldata)
                .await
            {
                tracing::error!("Error reading from fetcher {}: {}", job.fetcher, e);
                let _ = child.kill().await;
                return false;
            }
        }
        let _ = child.wait().await;

        let report: crate::traits::DomainReport = match serde_json::from_slice(&alldata) {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Invalid JSON: {}", e);
                return false;
            }
        };
        if report.d != job.domain {
            tracing::error!("Domain mismatch! Asked for {} but got reply for {}", job.domain, report.d);
            return false;
        }
        let data = match serde_json::to_string(&report.policies) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!("Could not serialize policies for {}: {}", job.domain, e);
                return false;
            }
        };
        match self
            .store
            .set_reportdata_fetched(&job.day, job.fetcherindex, &job.domain, &data)
        {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Could not store details for {}: {}", job.domain, e);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // stage D: create reports
    // ------------------------------------------------------------------

    /// Create all reports possible, i.e. where no data is pending.
    pub fn create_reports(&mut self) -> Result<(), ReportdError> {
        tracing::debug!("Create reports");
        for (fetcherindex, domain) in self.store.incomplete_reportdata()? {
            tracing::warn!("Incomplete data for domain {} by fetcher index {}", domain, fetcherindex);
        }
        for (day, dom) in self.store.days_domains_ready()? {
            self.create_report_for(&day, &dom)?;
        }
        Ok(())
    }

    /// Create one or multiple reports for a domain and a specific day.
    ///
    /// Multiple reports exist when the fetchers saw different TLSRPT
    /// records and therefore different recipients. Report rows and their
    /// destinations become visible together.
    fn create_report_for(&mut self, day: &str, dom: &str) -> Result<(), ReportdError> {
        self.store.begin_report()?;
        let result = self.render_reports_for(day, dom);
        match &result {
            Ok(()) => self.store.commit_report()?,
            Err(_) => {
                if let Err(e) = self.store.rollback_report() {
                    tracing::error!("Could not roll back report creation: {}", e);
                }
            }
        }
        result
    }

    fn render_reports_for(&mut self, day: &str, dom: &str) -> Result<(), ReportdError> {
        tracing::debug!("Will create report for day {} domain {}", day, dom);
        let mut reports_by_record: BTreeMap<String, BTreeMap<String, PolicyCounters>> = BTreeMap::new();
        for data in self.store.reportdata_for(day, dom)? {
            let parsed: PoliciesByRecord = match serde_json::from_str(&data) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::error!("Invalid stored report data for day {} domain {}: {}", day, dom, e);
                    continue;
                }
            };
            for (tlsrptrecord, policies) in parsed {
                aggregate_counters(reports_by_record.entry(tlsrptrecord).or_default(), &policies);
            }
        }

        for (tlsrptrecord, rawreport) in &reports_by_record {
            let uniqid = self.store.next_uniqid(day, dom)?;
            let report = match render_report(
                &self.cfg.organization_name,
                &self.cfg.contact_info,
                day,
                uniqid,
                dom,
                rawreport,
            ) {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!("Could not render report on day {} for domain {}: {}", day, dom, e);
                    continue;
                }
            };
            let json = match serde_json::to_string(&report) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Could not serialize report on day {} for domain {}: {}", day, dom, e);
                    continue;
                }
            };
            let r_id = self.store.insert_report(day, dom, uniqid, tlsrptrecord, &json)?;
            match parse_tlsrpt_record(tlsrptrecord) {
                Ok(ruas) => {
                    for rua in ruas {
                        let nexttry = self.schedule_report_delivery();
                        self.store.insert_destination(&rua, r_id, nexttry)?;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        "Bad TLSRPT record on day {} for domain {}: '{}' => {}",
                        day,
                        dom,
                        tlsrptrecord,
                        e
                    );
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // stage E: send out reports
    // ------------------------------------------------------------------

    pub async fn send_out_reports(&mut self) -> Result<(), ReportdError> {
        tracing::debug!("Send out reports");
        for job in self.store.due_destinations(now_ts())? {
            let result = send_out_report(
                &self.cfg,
                &job.day,
                &job.domain,
                job.d_r_id,
                job.uniqid,
                &job.destination,
                &job.report,
            )
            .await;
            match result {
                DeliveryResult::Succeeded => {
                    tracing::info!(
                        "Report delivery {} for domain {} succeeded in run {}",
                        job.d_r_id,
                        job.domain,
                        job.retries
                    );
                    self.store.mark_destination(&job.destination, job.d_r_id, "sent")?;
                }
                DeliveryResult::UnknownRua => {
                    self.store
                        .mark_destination(&job.destination, job.d_r_id, "unknownrua")?;
                }
                DeliveryResult::TryAgain if job.retries < self.cfg.max_retries_delivery => {
                    tracing::warn!(
                        "Report delivery {} for domain {} failed in run {}",
                        job.d_r_id,
                        job.domain,
                        job.retries
                    );
                    let t = self.wake_up_in(self.wait_retry_report_delivery(), false);
                    self.store
                        .retry_destination(&job.destination, job.d_r_id, t.timestamp_millis())?;
                }
                DeliveryResult::TryAgain => {
                    tracing::warn!(
                        "Report delivery {} for domain {} timedout after {} retries",
                        job.d_r_id,
                        job.domain,
                        job.retries
                    );
                    self.store
                        .mark_destination(&job.destination, job.d_r_id, "timedout")?;
                }
            }
        }
        Ok(())
    }

    /// Run one full pass over all stages. Errors are logged; every stage is
    /// recoverable on a later iteration.
    pub async fn run_stages(&mut self) {
        if let Err(e) = self.check_day() {
            tracing::error!("check_day failed: {}", e);
        }
        if let Err(e) = self.collect_domains().await {
            tracing::error!("collect_domains failed: {}", e);
        }
        if let Err(e) = self.fetch_data().await {
            tracing::error!("fetch_data failed: {}", e);
        }
        if let Err(e) = self.create_reports() {
            tracing::error!("create_reports failed: {}", e);
        }
        if let Err(e) = self.send_out_reports().await {
            tracing::error!("send_out_reports failed: {}", e);
        }
    }

    /// Main loop processing the various jobs and stages.
    pub async fn run(&mut self) -> i32 {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!("Could not install signal handler: {}", e);
                return crate::exit::EXIT_OTHER;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!("Could not install signal handler: {}", e);
                return crate::exit::EXIT_OTHER;
            }
        };
        loop {
            self.wake_up_in(self.cfg.interval_main_loop, true);
            self.run_stages().await;
            let dt = self.wakeuptime - utc_time_now();
            let millis = dt.num_milliseconds();
            let sleep_for = if millis >= 0 {
                tracing::info!("Sleeping for {} seconds", millis / 1000);
                Duration::from_millis(millis as u64)
            } else {
                tracing::info!("Skipping sleeping for negative {} seconds", millis / 1000);
                Duration::ZERO
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = sigint.recv() => {
                    tracing::info!("Caught SIGINT, cleaning up");
                    return 0;
                }
                _ = sigterm.recv() => {
                    tracing::info!("Caught SIGTERM, cleaning up");
                    return 0;
                }
            }
        }
    }
}
