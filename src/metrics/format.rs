use serde::{Deserialize, Serialize};

use crate::certificate::{CertificateRecord, DiscoveryPayload};
use crate::error::Result;

/// Key of the batch-wide low-level discovery item.
pub const DISCOVERY_KEY: &str = "ssl_cert.discovery";

/// A Zabbix item key and the value to send for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    pub key: String,
    pub value: String,
}

impl Metric {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Metric {
            key: key.into(),
            value: value.into(),
        }
    }
}

pub fn days_remaining_key(common_name: &str) -> String {
    format!("ssl_cert.days_remaining[\"{}\"]", common_name)
}

pub fn notafter_key(common_name: &str) -> String {
    format!("ssl_cert.notafter[\"{}\"]", common_name)
}

/// Backslash-escapes double quotes so the text survives inside a quoted
/// command-line argument.
pub fn escape_quotes(text: &str) -> String {
    text.replace('"', "\\\"")
}

/// Inverse of [`escape_quotes`], giving back the value the backend should
/// receive when the sender is run without a shell.
pub fn unescape_quotes(text: &str) -> String {
    text.replace("\\\"", "\"")
}

/// Builds the metrics for a batch: `days_remaining` and `notafter` per
/// record in record order, then a single `discovery` metric.
///
/// Records with an empty common name are ignored.
pub fn format(records: &[CertificateRecord], discovery: &DiscoveryPayload) -> Result<Vec<Metric>> {
    let mut metrics = Vec::with_capacity(records.len() * 2 + 1);

    for record in records.iter().filter(|r| !r.common_name().is_empty()) {
        metrics.push(Metric::new(
            days_remaining_key(record.common_name()),
            record.days_to_expiry.to_string(),
        ));
        metrics.push(Metric::new(
            notafter_key(record.common_name()),
            record.not_after.timestamp().to_string(),
        ));
    }

    let discovery_json = serde_json::to_string(discovery)?;
    metrics.push(Metric::new(DISCOVERY_KEY, escape_quotes(&discovery_json)));

    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::{DiscoveryEntry, SubjectFields};
    use chrono::{TimeZone, Utc};

    fn record(cn: &str, not_after: i64, days: i64) -> CertificateRecord {
        CertificateRecord {
            subject: SubjectFields {
                common_name: cn.to_string(),
                country: "US".to_string(),
                ..SubjectFields::default()
            },
            not_after: Utc.timestamp_opt(not_after, 0).unwrap(),
            days_to_expiry: days,
        }
    }

    fn discovery_for(records: &[CertificateRecord]) -> DiscoveryPayload {
        DiscoveryPayload {
            data: records
                .iter()
                .map(|r| DiscoveryEntry::from(&r.subject))
                .collect(),
        }
    }

    #[test]
    fn test_metric_order_and_keys() {
        let records = vec![
            record("example.com", 1_767_225_600, 30),
            record("Example Intermediate CA", 1_893_456_000, 1_500),
        ];
        let metrics = format(&records, &discovery_for(&records)).unwrap();

        let keys: Vec<&str> = metrics.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "ssl_cert.days_remaining[\"example.com\"]",
                "ssl_cert.notafter[\"example.com\"]",
                "ssl_cert.days_remaining[\"Example Intermediate CA\"]",
                "ssl_cert.notafter[\"Example Intermediate CA\"]",
                "ssl_cert.discovery",
            ]
        );
        assert_eq!(metrics[0].value, "30");
        assert_eq!(metrics[1].value, "1767225600");
        assert_eq!(metrics[2].value, "1500");
    }

    #[test]
    fn test_negative_days_are_kept() {
        let records = vec![record("expired.example.com", 1_600_000_000, -12)];
        let metrics = format(&records, &discovery_for(&records)).unwrap();
        assert_eq!(metrics[0].value, "-12");
    }

    #[test]
    fn test_discovery_value_is_escaped_json() {
        let records = vec![record("example.com", 1_767_225_600, 30)];
        let discovery = discovery_for(&records);
        let metrics = format(&records, &discovery).unwrap();

        let value = &metrics.last().unwrap().value;
        assert!(value.starts_with("{\\\"data\\\":["));
        assert!(!value.replace("\\\"", "").contains('"'));

        let unescaped = value.replace("\\\"", "\"");
        let parsed: DiscoveryPayload = serde_json::from_str(&unescaped).unwrap();
        assert_eq!(parsed, discovery);
    }

    #[test]
    fn test_unescape_reverses_escape() {
        let json = r#"{"data":[{"{#SSL_O}":"Example \"Quoted\" Inc","{#SSL_OU}":"a\\b"}]}"#;
        let escaped = escape_quotes(json);
        assert_ne!(escaped, json);
        assert_eq!(unescape_quotes(&escaped), json);
    }

    #[test]
    fn test_empty_batch_still_has_discovery() {
        let metrics = format(&[], &DiscoveryPayload::default()).unwrap();
        assert_eq!(metrics, vec![Metric::new(DISCOVERY_KEY, "{\\\"data\\\":[]}")]);
    }

    #[test]
    fn test_records_without_common_name_are_ignored() {
        let records = vec![record("", 1_767_225_600, 30)];
        let metrics = format(&records, &DiscoveryPayload::default()).unwrap();
        assert_eq!(metrics.len(), 1);
    }
}
