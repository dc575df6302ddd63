//! Reportd job store
//!
//! One sqlite database holds the whole reporting state machine: fetch jobs
//! per day and fetcher, per-domain report data, rendered reports and their
//! delivery destinations. Rows move through their status columns
//! (`NULL` -> terminal) with retry counters and nexttry timestamps.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};

use crate::store::{check_database, setup_database};
use crate::traits::StoreError;

/// Purpose stamp of the reportd store.
pub fn reportd_db_purpose() -> String {
    format!("TLSRPT-Reportd-DB{}", crate::DB_PURPOSE_SUFFIX)
}

const REPORTD_DDL: &[&str] = &[
    "CREATE TABLE fetchjobs(day TEXT, fetcherindex INTEGER, fetcher TEXT, retries INTEGER, \
     status TEXT, nexttry INTEGER, its TEXT DEFAULT CURRENT_TIMESTAMP, \
     PRIMARY KEY(day, fetcherindex))",
    "CREATE TABLE reportdata(day TEXT, domain TEXT, data TEXT, fetcher TEXT, \
     fetcherindex INTEGER, retries INTEGER, status TEXT, nexttry INTEGER, \
     its TEXT DEFAULT CURRENT_TIMESTAMP, \
     PRIMARY KEY(day, domain, fetcher))",
    "CREATE TABLE reports(r_id INTEGER PRIMARY KEY ASC, day TEXT, domain TEXT, uniqid INTEGER, \
     tlsrptrecord TEXT, report TEXT, its TEXT DEFAULT CURRENT_TIMESTAMP)",
    "CREATE TABLE destinations(destination TEXT, d_r_id INTEGER, retries INTEGER, \
     status TEXT, nexttry INTEGER, its TEXT DEFAULT CURRENT_TIMESTAMP, \
     PRIMARY KEY(destination, d_r_id), \
     FOREIGN KEY(d_r_id) REFERENCES reports(r_id))",
    "CREATE TABLE dbversion(version INTEGER, installdate TEXT, purpose TEXT)",
];

/// One due fetchjobs row.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub day: String,
    pub fetcherindex: i64,
    pub fetcher: String,
    pub retries: u32,
}

/// One due reportdata row still missing its details.
#[derive(Debug, Clone)]
pub struct DetailJob {
    pub day: String,
    pub fetcher: String,
    pub fetcherindex: i64,
    pub domain: String,
    pub retries: u32,
}

/// One due destinations row joined with its report.
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub destination: String,
    pub d_r_id: i64,
    pub uniqid: i64,
    pub report: String,
    pub domain: String,
    pub day: String,
    pub retries: u32,
}

#[derive(Debug)]
pub struct ReportStore {
    conn: Connection,
}

impl ReportStore {
    /// Open or create the reportd store.
    pub fn open(dbname: &str) -> Result<Self, StoreError> {
        let conn = crate::store::open_versioned(dbname, &reportd_db_purpose(), REPORTD_DDL)?;
        Ok(Self { conn })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        if !check_database(&conn, &reportd_db_purpose())? {
            setup_database(&conn, REPORTD_DDL, &reportd_db_purpose())?;
        }
        Ok(Self { conn })
    }

    // ------------------------------------------------------------------
    // maintenance
    // ------------------------------------------------------------------

    /// Delete rows older than `keep_days` from all tables.
    pub fn purge_old_data(&self, today: NaiveDate, keep_days: u32) -> Result<(), StoreError> {
        let cutoff = (today - chrono::Duration::days(keep_days as i64))
            .format("%Y-%m-%d")
            .to_string();
        let d = self.conn.execute("DELETE FROM fetchjobs WHERE day<=?1", params![cutoff])?;
        if d > 0 {
            tracing::info!("Deleted {} old fetchjobs", d);
        }
        let d = self.conn.execute("DELETE FROM reportdata WHERE day<=?1", params![cutoff])?;
        if d > 0 {
            tracing::info!("Deleted {} old reportdata", d);
        }
        let d = self.conn.execute(
            "DELETE FROM destinations WHERE d_r_id IN (SELECT r_id FROM reports WHERE day<=?1)",
            params![cutoff],
        )?;
        if d > 0 {
            tracing::info!("Deleted {} old destinations", d);
        }
        let d = self.conn.execute("DELETE FROM reports WHERE day<=?1", params![cutoff])?;
        if d > 0 {
            tracing::info!("Deleted {} old reports", d);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // fetchjobs
    // ------------------------------------------------------------------

    pub fn have_fetchjobs_for(&self, day: &str) -> Result<bool, StoreError> {
        let row = self
            .conn
            .query_row("SELECT day FROM fetchjobs WHERE day=?1", params![day], |_| Ok(()))
            .optional()?;
        Ok(row.is_some())
    }

    /// Create one fetchjobs row per configured fetcher, indexed from one.
    pub fn insert_fetchjobs(&self, day: &str, fetchers: &[String], now: i64) -> Result<(), StoreError> {
        for (i, fetcher) in fetchers.iter().enumerate() {
            self.conn.execute(
                "INSERT INTO fetchjobs (day, fetcherindex, fetcher, retries, status, nexttry) \
                 VALUES (?1,?2,?3,0,NULL,?4)",
                params![day, i as i64 + 1, fetcher, now],
            )?;
        }
        Ok(())
    }

    pub fn due_fetchjobs(&self, now: i64) -> Result<Vec<FetchJob>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT day, fetcherindex, fetcher, retries FROM fetchjobs \
             WHERE status IS NULL AND nexttry<?1",
        )?;
        let jobs = stmt
            .query_map(params![now], |r| {
                Ok(FetchJob {
                    day: r.get(0)?,
                    fetcherindex: r.get(1)?,
                    fetcher: r.get(2)?,
                    retries: r.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn mark_fetchjob_ok(&self, day: &str, fetcherindex: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE fetchjobs SET status='ok' WHERE day=?1 AND fetcherindex=?2",
            params![day, fetcherindex],
        )?;
        Ok(())
    }

    pub fn retry_fetchjob(&self, day: &str, fetcherindex: i64, nexttry: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE fetchjobs SET retries=retries+1, nexttry=?1 WHERE day=?2 AND fetcherindex=?3",
            params![nexttry, day, fetcherindex],
        )?;
        Ok(())
    }

    pub fn mark_fetchjob_timedout(&self, day: &str, fetcherindex: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE fetchjobs SET status='timedout' WHERE day=?1 AND fetcherindex=?2",
            params![day, fetcherindex],
        )?;
        Ok(())
    }

    /// Days whose domain lists are not complete yet.
    pub fn incomplete_days(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT day FROM fetchjobs WHERE status IS NULL")?;
        let days = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(days)
    }

    // ------------------------------------------------------------------
    // reportdata
    // ------------------------------------------------------------------

    /// Scope the streamed domain list of one fetcher so it can be rolled
    /// back as a whole on a truncated list.
    pub fn begin_domainlist(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("SAVEPOINT domainlist")?;
        Ok(())
    }

    pub fn release_domainlist(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("RELEASE SAVEPOINT domainlist")?;
        Ok(())
    }

    pub fn rollback_domainlist(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("ROLLBACK TO SAVEPOINT domainlist; RELEASE SAVEPOINT domainlist")?;
        Ok(())
    }

    /// Insert one pending reportdata row; duplicates are logged and skipped.
    pub fn insert_reportdata(
        &self,
        day: &str,
        domain: &str,
        fetcherindex: i64,
        fetcher: &str,
        now: i64,
    ) -> Result<bool, StoreError> {
        let res = self.conn.execute(
            "INSERT INTO reportdata \
             (day, domain, data, fetcherindex, fetcher, retries, status, nexttry) \
             VALUES (?1,?2,NULL,?3,?4,0,NULL,?5)",
            params![day, domain, fetcherindex, fetcher, now],
        );
        match res {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, msg))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                tracing::warn!(
                    "Duplicate domain {} for day {} from fetcher {}: {}",
                    domain,
                    day,
                    fetcherindex,
                    msg.unwrap_or_default()
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Detail jobs that are due and whose day has a complete domain list.
    pub fn due_domain_details(&self, now: i64) -> Result<Vec<DetailJob>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT day, fetcher, fetcherindex, domain, retries FROM reportdata \
             WHERE data IS NULL AND status IS NULL AND nexttry<?1 \
             AND day NOT IN (SELECT day FROM fetchjobs WHERE status IS NULL)",
        )?;
        let jobs = stmt
            .query_map(params![now], |r| {
                Ok(DetailJob {
                    day: r.get(0)?,
                    fetcher: r.get(1)?,
                    fetcherindex: r.get(2)?,
                    domain: r.get(3)?,
                    retries: r.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn set_reportdata_fetched(
        &self,
        day: &str,
        fetcherindex: i64,
        domain: &str,
        data: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE reportdata SET data=?1, status='fetched' \
             WHERE day=?2 AND fetcherindex=?3 AND domain=?4",
            params![data, day, fetcherindex, domain],
        )?;
        Ok(())
    }

    pub fn retry_reportdata(
        &self,
        day: &str,
        fetcherindex: i64,
        domain: &str,
        nexttry: i64,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE reportdata SET retries=retries+1, nexttry=?1 \
             WHERE day=?2 AND fetcherindex=?3 AND domain=?4",
            params![nexttry, day, fetcherindex, domain],
        )?;
        Ok(())
    }

    pub fn mark_reportdata_timedout(
        &self,
        day: &str,
        fetcherindex: i64,
        domain: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE reportdata SET status='timedout' \
             WHERE day=?1 AND fetcherindex=?2 AND domain=?3",
            params![day, fetcherindex, domain],
        )?;
        Ok(())
    }

    /// Rows still waiting for their details, for diagnostics.
    pub fn incomplete_reportdata(&self) -> Result<Vec<(i64, String)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT fetcherindex, domain FROM reportdata WHERE data IS NULL")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // reports and destinations
    // ------------------------------------------------------------------

    /// Scope one report render so the report row and its destinations
    /// become visible together.
    pub fn begin_report(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("SAVEPOINT createreport")?;
        Ok(())
    }

    pub fn commit_report(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("RELEASE SAVEPOINT createreport")?;
        Ok(())
    }

    pub fn rollback_report(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("ROLLBACK TO SAVEPOINT createreport; RELEASE SAVEPOINT createreport")?;
        Ok(())
    }

    /// Day/domain pairs with complete data and no report yet.
    pub fn days_domains_ready(&self) -> Result<Vec<(String, String)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT day, domain FROM reportdata WHERE status='fetched' \
             AND (day, domain) NOT IN (SELECT day, domain FROM reportdata WHERE status IS NULL) \
             AND (day, domain) NOT IN (SELECT day, domain FROM reports)",
        )?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn reportdata_for(&self, day: &str, domain: &str) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM reportdata WHERE day=?1 AND domain=?2 AND data IS NOT NULL")?;
        let rows = stmt
            .query_map(params![day, domain], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Running index for the next report of a day and domain.
    pub fn next_uniqid(&self, day: &str, domain: &str) -> Result<i64, StoreError> {
        let n = self.conn.query_row(
            "SELECT COUNT(*)+1 FROM reports WHERE day=?1 AND domain=?2",
            params![day, domain],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    pub fn insert_report(
        &self,
        day: &str,
        domain: &str,
        uniqid: i64,
        tlsrptrecord: &str,
        report: &str,
    ) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO reports (day, domain, uniqid, tlsrptrecord, report) VALUES(?1,?2,?3,?4,?5)",
            params![day, domain, uniqid, tlsrptrecord, report],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_destination(
        &self,
        destination: &str,
        d_r_id: i64,
        nexttry: i64,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO destinations (destination, d_r_id, retries, status, nexttry) \
             VALUES(?1,?2,0,NULL,?3)",
            params![destination, d_r_id, nexttry],
        )?;
        Ok(())
    }

    pub fn due_destinations(&self, now: i64) -> Result<Vec<DeliveryJob>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT destination, d_r_id, uniqid, report, domain, day, retries FROM destinations \
             LEFT JOIN reports ON r_id=d_r_id \
             WHERE destinations.status IS NULL AND nexttry<?1",
        )?;
        let jobs = stmt
            .query_map(params![now], |r| {
                Ok(DeliveryJob {
                    destination: r.get(0)?,
                    d_r_id: r.get(1)?,
                    uniqid: r.get(2)?,
                    report: r.get(3)?,
                    domain: r.get(4)?,
                    day: r.get(5)?,
                    retries: r.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn mark_destination(
        &self,
        destination: &str,
        d_r_id: i64,
        status: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE destinations SET status=?1 WHERE destination=?2 AND d_r_id=?3",
            params![status, destination, d_r_id],
        )?;
        Ok(())
    }

    pub fn retry_destination(
        &self,
        destination: &str,
        d_r_id: i64,
        nexttry: i64,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE destinations SET retries=retries+1, nexttry=?1 \
             WHERE destination=?2 AND d_r_id=?3",
            params![nexttry, destination, d_r_id],
        )?;
        Ok(())
    }

    /// Reschedule a destination without touching its retry counter.
    pub fn set_destination_nexttry(
        &self,
        destination: &str,
        d_r_id: i64,
        nexttry: i64,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE destinations SET nexttry=?1 WHERE destination=?2 AND d_r_id=?3",
            params![nexttry, destination, d_r_id],
        )?;
        Ok(())
    }

    /// Status and retry counter of one destination row.
    pub fn destination_state(
        &self,
        destination: &str,
        d_r_id: i64,
    ) -> Result<Option<(Option<String>, u32, i64)>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT status, retries, nexttry FROM destinations \
                 WHERE destination=?1 AND d_r_id=?2",
                params![destination, d_r_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ReportStore {
        ReportStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_fetchjobs_lifecycle() {
        let store = store();
        let fetchers = vec!["fetch-a".to_string(), "fetch-b".to_string()];
        assert!(!store.have_fetchjobs_for("2026-07-31").unwrap());
        store.insert_fetchjobs("2026-07-31", &fetchers, 100).unwrap();
        assert!(store.have_fetchjobs_for("2026-07-31").unwrap());

        let due = store.due_fetchjobs(101).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].fetcherindex, 1);
        assert_eq!(due[1].fetcher, "fetch-b");

        store.mark_fetchjob_ok("2026-07-31", 1).unwrap();
        store.mark_fetchjob_timedout("2026-07-31", 2).unwrap();
        assert!(store.due_fetchjobs(101).unwrap().is_empty());
        assert!(store.incomplete_days().unwrap().is_empty());
    }

    #[test]
    fn test_fetchjob_not_due_before_nexttry() {
        let store = store();
        store.insert_fetchjobs("2026-07-31", &["f".to_string()], 100).unwrap();
        assert!(store.due_fetchjobs(100).unwrap().is_empty());
        store.retry_fetchjob("2026-07-31", 1, 500).unwrap();
        assert!(store.due_fetchjobs(400).unwrap().is_empty());
        let due = store.due_fetchjobs(501).unwrap();
        assert_eq!(due[0].retries, 1);
    }

    #[test]
    fn test_duplicate_reportdata_is_skipped() {
        let store = store();
        assert!(store.insert_reportdata("2026-07-31", "example.com", 1, "f", 100).unwrap());
        assert!(!store.insert_reportdata("2026-07-31", "example.com", 1, "f", 100).unwrap());
    }

    #[test]
    fn test_domainlist_savepoint_rolls_back() {
        let store = store();
        store.begin_domainlist().unwrap();
        store.insert_reportdata("2026-07-31", "a.test", 1, "f", 100).unwrap();
        store.insert_reportdata("2026-07-31", "b.test", 1, "f", 100).unwrap();
        store.rollback_domainlist().unwrap();
        store.insert_fetchjobs("2026-07-31", &["f".to_string()], 100).unwrap();
        store.mark_fetchjob_ok("2026-07-31", 1).unwrap();
        assert!(store.due_domain_details(101).unwrap().is_empty());
    }

    #[test]
    fn test_details_wait_for_complete_domain_list() {
        let store = store();
        store.insert_fetchjobs("2026-07-31", &["f".to_string()], 100).unwrap();
        store.insert_reportdata("2026-07-31", "example.com", 1, "f", 100).unwrap();
        // fetchjob still pending: nothing is due
        assert!(store.due_domain_details(101).unwrap().is_empty());
        store.mark_fetchjob_ok("2026-07-31", 1).unwrap();
        let due = store.due_domain_details(101).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].domain, "example.com");
    }

    #[test]
    fn test_reportdata_detail_retry_and_timeout() {
        let store = store();
        store.insert_fetchjobs("2026-07-31", &["f".to_string()], 100).unwrap();
        store.mark_fetchjob_ok("2026-07-31", 1).unwrap();
        store.insert_reportdata("2026-07-31", "example.com", 1, "f", 100).unwrap();
        store.retry_reportdata("2026-07-31", 1, "example.com", 900).unwrap();
        assert!(store.due_domain_details(101).unwrap().is_empty());
        assert_eq!(store.due_domain_details(901).unwrap()[0].retries, 1);
        store.mark_reportdata_timedout("2026-07-31", 1, "example.com").unwrap();
        assert!(store.due_domain_details(901).unwrap().is_empty());
    }

    #[test]
    fn test_ready_requires_all_rows_fetched() {
        let store = store();
        store.insert_reportdata("2026-07-31", "example.com", 1, "f1", 100).unwrap();
        store.insert_reportdata("2026-07-31", "example.com", 2, "f2", 100).unwrap();
        store.set_reportdata_fetched("2026-07-31", 1, "example.com", "{}").unwrap();
        assert!(store.days_domains_ready().unwrap().is_empty());
        store.set_reportdata_fetched("2026-07-31", 2, "example.com", "{}").unwrap();
        assert_eq!(store.days_domains_ready().unwrap(),
                   [("2026-07-31".to_string(), "example.com".to_string())]);
    }

    #[test]
    fn test_reports_and_destinations() {
        let store = store();
        assert_eq!(store.next_uniqid("2026-07-31", "example.com").unwrap(), 1);
        let r_id = store
            .insert_report("2026-07-31", "example.com", 1, "v=TLSRPTv1;rua=mailto:r@x", "{}")
            .unwrap();
        assert_eq!(store.next_uniqid("2026-07-31", "example.com").unwrap(), 2);
        store.insert_destination("mailto:r@x", r_id, 100).unwrap();

        let due = store.due_destinations(101).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].uniqid, 1);
        assert_eq!(due[0].day, "2026-07-31");

        store.retry_destination("mailto:r@x", r_id, 900).unwrap();
        assert!(store.due_destinations(101).unwrap().is_empty());
        store.mark_destination("mailto:r@x", r_id, "sent").unwrap();
        assert!(store.due_destinations(1000).unwrap().is_empty());
        let (status, retries, _) = store.destination_state("mailto:r@x", r_id).unwrap().unwrap();
        assert_eq!(status.as_deref(), Some("sent"));
        assert_eq!(retries, 1);
    }

    #[test]
    fn test_purge_old_data() {
        let store = store();
        store.insert_fetchjobs("2026-07-01", &["f".to_string()], 100).unwrap();
        store.insert_reportdata("2026-07-01", "old.test", 1, "f", 100).unwrap();
        let r_id = store.insert_report("2026-07-01", "old.test", 1, "rec", "{}").unwrap();
        store.insert_destination("mailto:r@x", r_id, 100).unwrap();
        store.insert_fetchjobs("2026-07-30", &["f".to_string()], 100).unwrap();

        let today = NaiveDate::from_ymd_opt(2026, 7, 31).unwrap();
        store.purge_old_data(today, 10).unwrap();

        assert!(!store.have_fetchjobs_for("2026-07-01").unwrap());
        assert!(store.have_fetchjobs_for("2026-07-30").unwrap());
        assert!(store.destination_state("mailto:r@x", r_id).unwrap().is_none());
        assert_eq!(store.next_uniqid("2026-07-01", "old.test").unwrap(), 1);
    }
}
