//! UTC clock and naming helpers shared by all three programs

use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Current UTC time.
pub fn utc_time_now() -> DateTime<Utc> {
    Utc::now()
}

/// Current UTC calendar date.
pub fn utc_date_now() -> NaiveDate {
    utc_time_now().date_naive()
}

/// Yesterday's UTC calendar date.
pub fn utc_date_yesterday() -> NaiveDate {
    (utc_time_now() - Duration::days(1)).date_naive()
}

/// Start of the report range for a day, in the format required by RFC 8460.
pub fn report_start_datetime(day: &str) -> String {
    format!("{day}T00:00:00Z")
}

/// End of the report range for a day, in the format required by RFC 8460.
pub fn report_end_datetime(day: &str) -> String {
    format!("{day}T23:59:59Z")
}

/// Start of the report range as a unix timestamp (UTC midnight of `day`).
pub fn report_start_timestamp(day: &str) -> Option<i64> {
    let date = NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp())
}

/// End of the report range as a unix timestamp (last second of `day`).
pub fn report_end_timestamp(day: &str) -> Option<i64> {
    report_start_timestamp(day).map(|start| start + 24 * 3600 - 1)
}

/// Fold a recipient domain to lowercase and strip exactly one trailing dot.
pub fn normalize_domain_name(domain: &str) -> String {
    let lower = domain.to_lowercase();
    if lower.ends_with('.') && !lower.ends_with("..") {
        lower[..lower.len() - 1].to_string()
    } else {
        lower
    }
}

/// Derive the rolled-over database name from the live database name.
///
/// A `.sqlite` extension keeps its place: `data.sqlite` becomes
/// `data-yesterday.sqlite`, anything else just gets the suffix appended.
pub fn make_yesterday_dbname(dbname: &str) -> String {
    const SUFFIX: &str = ".sqlite";
    match dbname.strip_suffix(SUFFIX) {
        Some(stem) => format!("{stem}-yesterday{SUFFIX}"),
        None => format!("{dbname}-yesterday"),
    }
}

/// Wall-clock duration and rate measurement for fetch statistics.
pub struct Stopwatch {
    begin: DateTime<Utc>,
    count: u64,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self { begin: utc_time_now(), count: 0 }
    }

    pub fn add(&mut self, n: u64) {
        self.count += n;
    }

    /// Elapsed seconds since start, never below one millisecond to keep rates finite.
    pub fn elapsed_secs(&self) -> f64 {
        let millis = (utc_time_now() - self.begin).num_milliseconds().max(1);
        millis as f64 / 1000.0
    }

    pub fn rate(&self) -> f64 {
        self.count as f64 / self.elapsed_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_no_change() {
        for d in ["", ".", "example.com"] {
            assert_eq!(normalize_domain_name(d), d);
        }
    }

    #[test]
    fn test_normalize_uppercase() {
        for d in ["name.tld", "Name.tld", "NAME.tld", "name.Tld", "name.TLD", "NAME.TLD"] {
            assert_eq!(normalize_domain_name(d), "name.tld");
        }
    }

    #[test]
    fn test_normalize_trailing_dot() {
        assert_eq!(normalize_domain_name("name.tld"), "name.tld");
        assert_eq!(normalize_domain_name("name.tld."), "name.tld");
        assert_eq!(normalize_domain_name("name.tld.."), "name.tld..");
        assert_eq!(normalize_domain_name("name.tld..."), "name.tld...");
    }

    #[test]
    fn test_normalize_idempotent() {
        for d in ["NAME.TLD.", "name.tld", "Name.Tld."] {
            let once = normalize_domain_name(d);
            assert_eq!(normalize_domain_name(&once), once);
        }
    }

    #[test]
    fn test_report_range_datetimes() {
        assert_eq!(report_start_datetime("2016-04-01"), "2016-04-01T00:00:00Z");
        assert_eq!(report_end_datetime("2016-04-01"), "2016-04-01T23:59:59Z");
    }

    #[test]
    fn test_report_start_timestamp_is_midnight() {
        for day in ["1970-01-02", "2016-04-01", "2026-08-01"] {
            let start = report_start_timestamp(day).unwrap();
            assert_eq!(start % 86400, 0, "start of {day} not at UTC midnight");
            assert_eq!(report_end_timestamp(day).unwrap(), start + 86399);
        }
    }

    #[test]
    fn test_report_start_timestamp_invalid_day() {
        assert!(report_start_timestamp("not-a-day").is_none());
        assert!(report_start_timestamp("2016-13-01").is_none());
    }

    #[test]
    fn test_make_yesterday_dbname() {
        assert_eq!(make_yesterday_dbname("/var/lib/tlsrpt/collectd.sqlite"),
                   "/var/lib/tlsrpt/collectd-yesterday.sqlite");
        assert_eq!(make_yesterday_dbname("/var/lib/tlsrpt/collectd.db"),
                   "/var/lib/tlsrpt/collectd.db-yesterday");
    }
}
