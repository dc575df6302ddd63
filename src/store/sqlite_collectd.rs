//! SQLite collectd backend
//!
//! Aggregates datagrams into the live per-day store, commits in batches and
//! hands the finished day over to the fetcher side by renaming the file at
//! UTC midnight.

use std::path::Path;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;

use super::versioned::{check_database, setup_database};
use crate::config::CollectdConfig;
use crate::traits::{CollectdBackend, StoreError};
use crate::util::{make_yesterday_dbname, utc_date_now, utc_date_yesterday, utc_time_now};

/// Purpose stamp shared by the live store and its rolled-over copies.
pub fn collectd_db_purpose() -> String {
    format!("TLSRPT-Collectd-DB{}", crate::DB_PURPOSE_SUFFIX)
}

pub(crate) const COLLECTD_DDL: &[&str] = &[
    "CREATE TABLE finalresults(day TEXT, domain TEXT, tlsrptrecord TEXT, policy TEXT, \
     cntrtotal INTEGER, cntrfailure INTEGER, its TEXT DEFAULT CURRENT_TIMESTAMP, \
     PRIMARY KEY(day, domain, tlsrptrecord, policy))",
    "CREATE TABLE failures(day TEXT, domain TEXT, tlsrptrecord TEXT, policy TEXT, \
     reason TEXT, cntr INTEGER, \
     PRIMARY KEY(day, domain, tlsrptrecord, policy, reason))",
    "CREATE TABLE daystatus(daycomplete TEXT, its TEXT DEFAULT CURRENT_TIMESTAMP, \
     PRIMARY KEY(daycomplete))",
    "CREATE TABLE dbversion(version INTEGER, installdate TEXT, purpose TEXT)",
];

#[derive(Debug)]
pub struct SqliteCollectdBackend {
    cfg: CollectdConfig,
    url: String,
    dbname: String,
    conn: Connection,
    today: NaiveDate,
    uncommitted_datagrams: u32,
    total_datagrams_read: u64,
    commit_every: u32,
    next_commit: DateTime<Utc>,
}

impl SqliteCollectdBackend {
    /// Open (or create) the live store named by a `sqlite:` storage URL.
    pub fn open(url: &str, cfg: &CollectdConfig) -> Result<Self, StoreError> {
        let scheme = super::storage_scheme(url)?;
        if scheme != "sqlite" {
            return Err(StoreError::BadUrl(url.to_string()));
        }
        let dbname = super::storage_path(url)?;
        tracing::debug!("Try to open database '{}'", dbname);
        let conn = Connection::open(&dbname)?;
        let mut backend = Self {
            cfg: cfg.clone(),
            url: url.to_string(),
            dbname,
            conn,
            today: utc_date_now(),
            uncommitted_datagrams: 0,
            total_datagrams_read: 0,
            commit_every: cfg.max_uncommited_datagrams,
            next_commit: utc_time_now(),
        };
        if check_database(&backend.conn, &collectd_db_purpose())? {
            tracing::info!("Database {} looks OK", backend.dbname);
        } else {
            tracing::info!("Create new database {}", backend.dbname);
            setup_database(&backend.conn, COLLECTD_DDL, &collectd_db_purpose())?;
        }
        backend.conn.execute_batch("BEGIN")?;
        Ok(backend)
    }

    /// Flush aggregated data to disk so the fetcher can see it.
    fn db_commit(&mut self, reason: &str) {
        // Advance next_commit before the commit itself: a failing commit
        // must wait for the next batch instead of being retried after every
        // single datagram.
        self.next_commit = utc_time_now() + Duration::seconds(self.cfg.sockettimeout as i64);
        if self.uncommitted_datagrams == 0 {
            return;
        }
        match self.conn.execute_batch("COMMIT; BEGIN") {
            Ok(()) => {
                tracing::debug!(
                    "{} with {} datagrams ({} total)",
                    reason,
                    self.uncommitted_datagrams,
                    self.total_datagrams_read
                );
                self.uncommitted_datagrams = 0;
            }
            Err(e) => {
                tracing::error!("Failed {} with {} datagrams: {}", reason, self.uncommitted_datagrams, e);
            }
        }
    }

    fn timed_commit(&mut self) {
        self.db_commit("Database commit due to timeout");
    }

    fn commit_after_n_datagrams(&mut self) {
        if utc_time_now() > self.next_commit {
            self.db_commit("Database commit due to overdue");
        }
        if self.uncommitted_datagrams >= self.commit_every {
            // A stuck store can make a commit attempt hang; only retry after
            // retry_commit_datagram_count further datagrams have accumulated.
            let over = self.uncommitted_datagrams - self.commit_every;
            if over % self.cfg.retry_commit_datagram_count.max(1) == 0 {
                self.db_commit("Database commit");
            }
        }
    }

    /// Record one policy result of a datagram.
    fn add_policy(
        &mut self,
        day: &str,
        domain: &str,
        tlsrptrecord: &str,
        policy: &Value,
    ) -> Result<(), StoreError> {
        let normalized = crate::util::normalize_domain_name(domain);
        if normalized != domain {
            tracing::debug!("Normalized domain name '{}' to '{}'", domain, normalized);
        }
        let obj = match policy.as_object() {
            Some(obj) => obj,
            None => return Err(StoreError::MissingKey("policy")),
        };
        let policy_failed = obj
            .get("f")
            .and_then(Value::as_i64)
            .ok_or(StoreError::MissingKey("f"))?;
        let failures: Vec<Value> = obj
            .get("failure-details")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let failure_count = obj.get("t").and_then(Value::as_i64);
        if failure_count != Some(failures.len() as i64) {
            tracing::error!(
                "Failure count mismatch in received datagram: {:?} reported versus {} failure details: {}",
                failure_count,
                failures.len(),
                serde_json::to_string(&failures).unwrap_or_default()
            );
        }
        // The policy key is the policy object without the session-level
        // result fields.
        let mut stripped = obj.clone();
        stripped.remove("f");
        stripped.remove("t");
        stripped.remove("failure-details");
        let p = Value::Object(stripped).to_string();

        self.conn.execute(
            "INSERT INTO finalresults (day, domain, tlsrptrecord, policy, cntrtotal, cntrfailure) \
             VALUES(?1,?2,?3,?4,1,?5) \
             ON CONFLICT(day, domain, tlsrptrecord, policy) \
             DO UPDATE SET cntrtotal=cntrtotal+1, cntrfailure=cntrfailure+?5",
            params![day, normalized, tlsrptrecord, p, policy_failed],
        )?;

        for f in &failures {
            self.conn.execute(
                "INSERT INTO failures (day, domain, tlsrptrecord, policy, reason, cntr) \
                 VALUES(?1,?2,?3,?4,?5,1) \
                 ON CONFLICT(day, domain, tlsrptrecord, policy, reason) \
                 DO UPDATE SET cntr=cntr+1",
                params![day, normalized, tlsrptrecord, p, f.to_string()],
            )?;
        }
        Ok(())
    }

    fn add_policies_from_datagram(&mut self, day: &str, datagram: &Value) -> Result<(), StoreError> {
        let policies = match datagram.get("policies").and_then(Value::as_array) {
            Some(policies) => policies,
            None => {
                tracing::warn!("No policies found in datagram: {}", datagram);
                return Ok(());
            }
        };
        match datagram.get("dpv").and_then(Value::as_str) {
            None => tracing::debug!("No datagram protocol version found in datagram: {}", datagram),
            Some("1") => {}
            Some(dpv) => tracing::error!(
                "Wrong datagram protocol version: Expected '1' but got '{}' in datagram: {}",
                dpv,
                datagram
            ),
        }
        let domain = datagram
            .get("d")
            .and_then(Value::as_str)
            .ok_or(StoreError::MissingKey("d"))?;
        let tlsrptrecord = datagram
            .get("pr")
            .and_then(Value::as_str)
            .ok_or(StoreError::MissingKey("pr"))?;
        for policy in policies {
            self.add_policy(day, domain, tlsrptrecord, policy)?;
        }
        Ok(())
    }

    /// Test hook: read back a finalresults row.
    #[cfg(test)]
    fn counters(&self, day: &str, domain: &str) -> Option<(u64, u64)> {
        self.conn
            .query_row(
                "SELECT cntrtotal, cntrfailure FROM finalresults WHERE day=?1 AND domain=?2",
                params![day, domain],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .ok()
    }
}

impl CollectdBackend for SqliteCollectdBackend {
    fn add_datagram(&mut self, datagram: &Value) -> Result<(), StoreError> {
        let datenow = utc_date_now();
        if self.today != datenow {
            self.switch_to_next_day(false)?;
        }
        let day = datenow.format("%Y-%m-%d").to_string();
        self.add_policies_from_datagram(&day, datagram)?;
        self.uncommitted_datagrams += 1;
        self.total_datagrams_read += 1;
        self.commit_after_n_datagrams();
        Ok(())
    }

    fn socket_timeout(&mut self) -> Result<(), StoreError> {
        let datenow = utc_date_now();
        if self.today != datenow {
            self.switch_to_next_day(false)?;
        }
        self.timed_commit();
        Ok(())
    }

    fn switch_to_next_day(&mut self, develmode: bool) -> Result<(), StoreError> {
        let yesterday = utc_date_yesterday().format("%Y-%m-%d").to_string();
        let mut commit_message = "Midnight UTC database rollover".to_string();
        if develmode {
            commit_message.push_str(" FOR DEVELOPMENT");
            self.db_commit(&commit_message);
            let today = self.today.format("%Y-%m-%d").to_string();
            let n = self.conn.execute(
                "UPDATE finalresults SET day=?1 WHERE day=?2",
                params![yesterday, today],
            )?;
            tracing::debug!("Updated {} rows in finalresults", n);
            let n = self.conn.execute(
                "UPDATE failures SET day=?1 WHERE day=?2",
                params![yesterday, today],
            )?;
            tracing::debug!("Updated {} rows in failures", n);
        }
        self.db_commit(&commit_message);
        self.conn
            .execute("INSERT INTO daystatus (daycomplete) VALUES(?1)", params![yesterday])?;
        self.conn.execute_batch("COMMIT")?;

        // Hand the file over to the fetcher side.
        let placeholder = Connection::open_in_memory()?;
        let old = std::mem::replace(&mut self.conn, placeholder);
        if let Err((_conn, e)) = old.close() {
            tracing::error!("Error closing database {}: {}", self.dbname, e);
        }
        let yesterdaydbname = make_yesterday_dbname(&self.dbname);
        if Path::new(&yesterdaydbname).is_file() {
            std::fs::remove_file(&yesterdaydbname)
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }
        std::fs::rename(&self.dbname, &yesterdaydbname)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        // Start the new day.
        self.today = utc_date_now();
        tracing::info!("Create new database {}", self.dbname);
        self.conn = Connection::open(&self.dbname)?;
        self.total_datagrams_read = 0;
        if self.uncommitted_datagrams != 0 {
            tracing::error!(
                "{} uncommitted datagrams during day roll-over",
                self.uncommitted_datagrams
            );
            self.uncommitted_datagrams = 0;
        }
        setup_database(&self.conn, COLLECTD_DDL, &collectd_db_purpose())?;
        self.conn.execute_batch("BEGIN")?;

        let script = self.cfg.daily_rollover_script.clone();
        if !script.is_empty() {
            let mut parts = script.split_whitespace();
            let program = parts.next().unwrap_or_default();
            let spawned = std::process::Command::new(program)
                .args(parts)
                .arg(&self.url)
                .arg(&yesterdaydbname)
                .spawn();
            if let Err(e) = spawned {
                tracing::error!(
                    "Unexpected problem while starting daily rollover script '{}': {}",
                    script,
                    e
                );
            }
        }
        Ok(())
    }
}

impl Drop for SqliteCollectdBackend {
    fn drop(&mut self) {
        if self.uncommitted_datagrams > 0 {
            self.db_commit("Database commit on close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config(dir: &Path) -> (CollectdConfig, String) {
        let (mut cfg, _, _) = CollectdConfig::finalize(Default::default()).unwrap();
        cfg.max_uncommited_datagrams = 2;
        cfg.retry_commit_datagram_count = 2;
        let url = format!("sqlite:{}", dir.join("collectd.sqlite").display());
        cfg.storage = url.clone();
        (cfg, url)
    }

    fn datagram(failed: i64, details: Value) -> Value {
        json!({
            "d": "Example.COM.",
            "pr": "v=TLSRPTv1;rua=mailto:reports@example.com",
            "dpv": "1",
            "policies": [
                {"policy-type": 9, "f": failed, "t": details.as_array().map_or(0, Vec::len), "failure-details": details}
            ]
        })
    }

    #[test]
    fn test_aggregation_normalizes_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, url) = test_config(dir.path());
        let mut backend = SqliteCollectdBackend::open(&url, &cfg).unwrap();
        let day = utc_date_now().format("%Y-%m-%d").to_string();

        backend.add_datagram(&datagram(0, json!([]))).unwrap();
        backend.add_datagram(&datagram(1, json!([{"c": 204}]))).unwrap();
        backend.add_datagram(&datagram(1, json!([{"c": 204}]))).unwrap();

        let (total, failed) = backend.counters(&day, "example.com").unwrap();
        assert_eq!(total, 3);
        assert_eq!(failed, 2);
        assert!(failed <= total);

        let cntr: u64 = backend
            .conn
            .query_row("SELECT cntr FROM failures WHERE day=?1", params![day], |r| r.get(0))
            .unwrap();
        assert_eq!(cntr, 2);
    }

    #[test]
    fn test_missing_policies_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, url) = test_config(dir.path());
        let mut backend = SqliteCollectdBackend::open(&url, &cfg).unwrap();
        backend
            .add_datagram(&json!({"d": "example.com", "pr": "v=TLSRPTv1;rua=mailto:r@x"}))
            .unwrap();
        let day = utc_date_now().format("%Y-%m-%d").to_string();
        assert!(backend.counters(&day, "example.com").is_none());
    }

    #[test]
    fn test_missing_domain_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, url) = test_config(dir.path());
        let mut backend = SqliteCollectdBackend::open(&url, &cfg).unwrap();
        let err = backend
            .add_datagram(&json!({"pr": "x", "policies": [{"policy-type": 9, "f": 0, "t": 0}]}))
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingKey("d")));
    }

    #[test]
    fn test_development_rollover_moves_rows_to_yesterday_store() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, url) = test_config(dir.path());
        let mut backend = SqliteCollectdBackend::open(&url, &cfg).unwrap();
        backend.add_datagram(&datagram(0, json!([]))).unwrap();
        backend.switch_to_next_day(true).unwrap();

        let yesterday = utc_date_yesterday().format("%Y-%m-%d").to_string();
        let ydb = make_yesterday_dbname(&super::super::storage_path(&url).unwrap());
        let conn = Connection::open(&ydb).unwrap();
        let (total, day_complete): (u64, String) = conn
            .query_row(
                "SELECT cntrtotal, (SELECT daycomplete FROM daystatus) FROM finalresults WHERE day=?1",
                params![yesterday],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(day_complete, yesterday);

        // the new live store is empty but well-formed
        let rows: u64 = backend
            .conn
            .query_row("SELECT COUNT(*) FROM finalresults", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_rollover_replaces_stale_yesterday_file() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, url) = test_config(dir.path());
        let ydb = make_yesterday_dbname(&super::super::storage_path(&url).unwrap());
        std::fs::write(&ydb, b"stale").unwrap();

        let mut backend = SqliteCollectdBackend::open(&url, &cfg).unwrap();
        backend.add_datagram(&datagram(0, json!([]))).unwrap();
        backend.switch_to_next_day(true).unwrap();

        let conn = Connection::open(&ydb).unwrap();
        let rows: u64 = conn
            .query_row("SELECT COUNT(*) FROM finalresults", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }
}
