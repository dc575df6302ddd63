//! SQLite fetcher backend
//!
//! Opens the rolled-over store of a `sqlite:` storage URL read-only. The
//! live store stays untouched, so the collectd never has a concurrent
//! reader on the file it is writing.

use rusqlite::{params, Connection, OpenFlags};

use super::sqlite_collectd::collectd_db_purpose;
use super::versioned::check_database;
use crate::config::FetcherConfig;
use crate::traits::{DomainList, DomainReport, FetcherBackend, PolicyCounters, StoreError};
use crate::util::make_yesterday_dbname;

pub struct SqliteFetcherBackend {
    dbname: String,
    conn: Connection,
}

impl SqliteFetcherBackend {
    /// Open the yesterday store derived from a `sqlite:` storage URL.
    pub fn open(url: &str, _cfg: &FetcherConfig) -> Result<Self, StoreError> {
        let scheme = super::storage_scheme(url)?;
        if scheme != "sqlite" {
            return Err(StoreError::BadUrl(url.to_string()));
        }
        let dbname = make_yesterday_dbname(&super::storage_path(url)?);
        tracing::debug!("Try to open database '{}'", dbname);
        let conn = Connection::open_with_flags(
            &dbname,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        if !check_database(&conn, &collectd_db_purpose())? {
            return Err(StoreError::Database(format!(
                "DB check failed for database {dbname}"
            )));
        }
        tracing::info!("Database {} looks OK", dbname);
        Ok(Self { dbname, conn })
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }
}

impl FetcherBackend for SqliteFetcherBackend {
    fn fetch_domain_list(&self, day: &str) -> Result<DomainList, StoreError> {
        tracing::info!("TLSRPT fetcher domain list starting for day {}", day);
        let available_day = self
            .conn
            .query_row("SELECT daycomplete FROM daystatus", [], |r| r.get::<_, String>(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::from(other)),
            })?;

        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT domain FROM finalresults WHERE day=?1")?;
        let domains = stmt
            .query_map(params![day], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DomainList { available_day, domains })
    }

    fn fetch_domain_details(&self, day: &str, domain: &str) -> Result<DomainReport, StoreError> {
        tracing::info!(
            "TLSRPT fetcher domain details starting for day {} and domain {}",
            day,
            domain
        );
        let mut policies = crate::traits::PoliciesByRecord::new();

        let mut stmt = self.conn.prepare(
            "SELECT policy, tlsrptrecord, cntrtotal, cntrfailure \
             FROM finalresults WHERE day=?1 AND domain=?2",
        )?;
        let rows = stmt.query_map(params![day, domain], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, u64>(2)?,
                r.get::<_, u64>(3)?,
            ))
        })?;
        for row in rows {
            let (policy, tlsrptrecord, cntrtotal, cntrfailure) = row?;
            let counters = policies
                .entry(tlsrptrecord)
                .or_default()
                .entry(policy)
                .or_insert_with(PolicyCounters::default);
            counters.cntrtotal += cntrtotal;
            counters.cntrfailure += cntrfailure;
        }

        let mut stmt = self.conn.prepare(
            "SELECT tlsrptrecord, policy, reason, cntr FROM failures WHERE day=?1 AND domain=?2",
        )?;
        let rows = stmt.query_map(params![day, domain], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, u64>(3)?,
            ))
        })?;
        for row in rows {
            let (tlsrptrecord, policy, reason, cntr) = row?;
            let counters = policies
                .entry(tlsrptrecord)
                .or_default()
                .entry(policy)
                .or_insert_with(PolicyCounters::default);
            *counters.failures.entry(reason).or_insert(0) += cntr;
        }

        Ok(DomainReport { d: domain.to_string(), policies })
    }
}
