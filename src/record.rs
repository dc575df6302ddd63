//! TLSRPT DNS record parsing

use thiserror::Error;

/// Errors raised for records that do not follow `v=TLSRPTv1; rua=...`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("Malformed TLSRPT record: No semicolon found")]
    NoSemicolon,
    #[error("Unsupported TLSRPT version: {0}")]
    UnsupportedVersion(String),
    #[error("Malformed TLSRPT record: No rua found")]
    NoRua,
}

/// Extract the `rua=` destination URIs from a TLSRPT DNS record.
///
/// The record text is taken as published in DNS: fields separated by
/// semicolons, the first field the exact version tag, the second the
/// comma-separated destination list. Destinations are returned verbatim.
pub fn parse_tlsrpt_record(record: &str) -> Result<Vec<String>, RecordError> {
    let mut parts = record.split(';');
    let version = parts.next().unwrap_or("");
    let rua = match parts.next() {
        Some(rua) => rua,
        None => return Err(RecordError::NoSemicolon),
    };
    if version != "v=TLSRPTv1" {
        return Err(RecordError::UnsupportedVersion(version.to_string()));
    }
    let rua = rua.trim_start();
    let uris = match rua.strip_prefix("rua=") {
        Some(uris) => uris,
        None => return Err(RecordError::NoRua),
    };
    Ok(uris.split(',').map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_format() {
        assert_eq!(parse_tlsrpt_record("not a tlsrpt record"),
                   Err(RecordError::NoSemicolon));
    }

    #[test]
    fn test_invalid_version() {
        assert_eq!(parse_tlsrpt_record("v=TLSRPTv99;rua=mailto:reports@example.com"),
                   Err(RecordError::UnsupportedVersion("v=TLSRPTv99".to_string())));
    }

    #[test]
    fn test_missing_rua() {
        assert_eq!(parse_tlsrpt_record("v=TLSRPTv1;foo=bar"), Err(RecordError::NoRua));
    }

    #[test]
    fn test_single_destination() {
        let ruas = parse_tlsrpt_record("v=TLSRPTv1;rua=mailto:reports@example.com").unwrap();
        assert_eq!(ruas, ["mailto:reports@example.com"]);
    }

    #[test]
    fn test_single_destination_trailing_semicolon() {
        let ruas = parse_tlsrpt_record("v=TLSRPTv1;rua=mailto:reports@example.com;").unwrap();
        assert_eq!(ruas, ["mailto:reports@example.com"]);
    }

    #[test]
    fn test_multiple_destinations() {
        let ruas = parse_tlsrpt_record(
            "v=TLSRPTv1;rua=mailto:reports@example.com,mailto:hostmaster@example.com,https://reportbot.example.com:12345/tlsrpt",
        )
        .unwrap();
        assert_eq!(ruas, [
            "mailto:reports@example.com",
            "mailto:hostmaster@example.com",
            "https://reportbot.example.com:12345/tlsrpt",
        ]);
    }

    #[test]
    fn test_space_after_semicolon() {
        let ruas = parse_tlsrpt_record(
            "v=TLSRPTv1; rua=mailto:reports@example.com,https://reportbot.example.com:12345/tlsrpt",
        )
        .unwrap();
        assert_eq!(ruas.len(), 2);
        assert_eq!(ruas[0], "mailto:reports@example.com");
    }

    #[test]
    fn test_round_trip() {
        let xs = ["mailto:a@x.test", "https://r.test/up", "mailto:b@y.test"];
        let record = format!("v=TLSRPTv1;rua={}", xs.join(","));
        assert_eq!(parse_tlsrpt_record(&record).unwrap(), xs);
    }
}
