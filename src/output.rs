//! Human and machine readable summaries of extracted certificates.

use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Table};

use crate::certificate::CertificateRecord;
use crate::error::Result;

/// Pretty JSON array of the records.
pub fn records_json(records: &[CertificateRecord]) -> Result<String> {
    Ok(serde_json::to_string_pretty(records)?)
}

/// One row per certificate: CN, O, OU, notAfter and days remaining.
pub fn records_table(records: &[CertificateRecord], now: DateTime<Utc>) -> Table {
    let mut table = Table::new();
    table
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "Common Name",
            "Organization",
            "Organizational Unit",
            "Not After",
            "Days Left",
        ]);

    for record in records {
        let days = Cell::new(record.days_to_expiry);
        let days = if record.is_expired(now) {
            days.fg(Color::Red)
        } else if record.days_to_expiry <= 30 {
            days.fg(Color::Yellow)
        } else {
            days.fg(Color::Green)
        };

        table.add_row(vec![
            Cell::new(&record.subject.common_name),
            Cell::new(&record.subject.organization),
            Cell::new(&record.subject.organization_unit),
            Cell::new(record.not_after.format("%Y-%m-%d %H:%M:%S UTC")),
            days,
        ]);
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::SubjectFields;
    use chrono::TimeZone;

    fn sample() -> CertificateRecord {
        CertificateRecord {
            subject: SubjectFields {
                common_name: "example.com".to_string(),
                organization: "Example Inc".to_string(),
                ..SubjectFields::default()
            },
            not_after: Utc.with_ymd_and_hms(2026, 11, 15, 12, 0, 0).unwrap(),
            days_to_expiry: 29,
        }
    }

    #[test]
    fn test_table_contains_record() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();
        let rendered = records_table(&[sample()], now).to_string();

        assert!(rendered.contains("example.com"));
        assert!(rendered.contains("Example Inc"));
        assert!(rendered.contains("2026-11-15 12:00:00 UTC"));
    }

    #[test]
    fn test_json_uses_record_fields() {
        let json = records_json(&[sample()]).unwrap();
        let parsed: Vec<CertificateRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, vec![sample()]);
    }
}
