//! Certificate extraction: subject fields, notAfter and days to expiry.
//!
//! Extraction is pure. Given the same chain and the same `now` it produces
//! the same records, no I/O is involved.

use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::nid::Nid;
use openssl::x509::{X509NameRef, X509};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CertCheckError, Result};

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";
const SECONDS_PER_DAY: i64 = 86_400;

/// PEM encoded certificates in the order the server presented them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawCertificateChain {
    pems: Vec<String>,
}

impl RawCertificateChain {
    pub fn new(pems: Vec<String>) -> Self {
        RawCertificateChain { pems }
    }

    /// Splits a concatenated PEM bundle, such as `openssl s_client -showcerts`
    /// output, into one blob per certificate. Text outside the
    /// BEGIN/END markers is ignored.
    pub fn from_pem_bundle(bundle: &str) -> Self {
        let mut pems = Vec::new();
        let mut rest = bundle;
        while let Some(start) = rest.find(PEM_BEGIN) {
            let tail = &rest[start..];
            match tail.find(PEM_END) {
                Some(end) => {
                    let stop = end + PEM_END.len();
                    pems.push(format!("{}\n", &tail[..stop]));
                    rest = &tail[stop..];
                }
                None => break,
            }
        }
        RawCertificateChain { pems }
    }

    pub fn len(&self) -> usize {
        self.pems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pems.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.pems.iter().map(String::as_str)
    }
}

/// Subject DN attributes. Missing attributes are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectFields {
    pub country: String,
    pub common_name: String,
    pub locality: String,
    pub organization: String,
    pub organization_unit: String,
    pub state_or_province: String,
}

impl SubjectFields {
    /// Reads each attribute independently; the first entry wins.
    pub fn from_name(name: &X509NameRef) -> Self {
        SubjectFields {
            country: first_entry(name, Nid::COUNTRYNAME),
            common_name: first_entry(name, Nid::COMMONNAME),
            locality: first_entry(name, Nid::LOCALITYNAME),
            organization: first_entry(name, Nid::ORGANIZATIONNAME),
            organization_unit: first_entry(name, Nid::ORGANIZATIONALUNITNAME),
            state_or_province: first_entry(name, Nid::STATEORPROVINCENAME),
        }
    }
}

fn first_entry(name: &X509NameRef, nid: Nid) -> String {
    name.entries_by_nid(nid)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|value| value.to_string())
        .unwrap_or_default()
}

/// One parsed certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub subject: SubjectFields,
    pub not_after: DateTime<Utc>,
    pub days_to_expiry: i64,
}

impl CertificateRecord {
    pub fn common_name(&self) -> &str {
        &self.subject.common_name
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.not_after < now
    }
}

/// One entry of the low-level discovery payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryEntry {
    #[serde(rename = "{#SSL_C}")]
    pub country: String,
    #[serde(rename = "{#SSL_CN}")]
    pub common_name: String,
    #[serde(rename = "{#SSL_L}")]
    pub locality: String,
    #[serde(rename = "{#SSL_O}")]
    pub organization: String,
    #[serde(rename = "{#SSL_OU}")]
    pub organization_unit: String,
    #[serde(rename = "{#SSL_ST}")]
    pub state_or_province: String,
}

impl From<&SubjectFields> for DiscoveryEntry {
    fn from(subject: &SubjectFields) -> Self {
        DiscoveryEntry {
            country: subject.country.clone(),
            common_name: subject.common_name.clone(),
            locality: subject.locality.clone(),
            organization: subject.organization.clone(),
            organization_unit: subject.organization_unit.clone(),
            state_or_province: subject.state_or_province.clone(),
        }
    }
}

/// `{"data": [...]}` as consumed by Zabbix low-level discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub data: Vec<DiscoveryEntry>,
}

impl DiscoveryPayload {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Result of [`extract`].
#[derive(Debug, Default)]
pub struct Extraction {
    /// Records with a non-empty common name, in chain order
    pub records: Vec<CertificateRecord>,
    pub discovery: DiscoveryPayload,
    /// Position in the chain and error of every certificate that failed to parse
    pub skipped: Vec<(usize, CertCheckError)>,
}

impl Extraction {
    /// Turns the first per-certificate failure into an error, for callers
    /// that want a bad certificate to abort the batch.
    pub fn into_strict(mut self) -> Result<Self> {
        if self.skipped.is_empty() {
            Ok(self)
        } else {
            let (_, err) = self.skipped.remove(0);
            Err(err)
        }
    }
}

/// Parses every certificate of `chain` relative to `now`.
///
/// Certificates that fail to decode are logged and reported in
/// [`Extraction::skipped`]; certificates without a common name are dropped.
pub fn extract(chain: &RawCertificateChain, now: DateTime<Utc>) -> Extraction {
    let mut extraction = Extraction::default();

    for (index, pem) in chain.iter().enumerate() {
        let record = match parse_certificate(pem, now) {
            Ok(record) => record,
            Err(e) => {
                warn!(index, error = %e, "skipping certificate");
                extraction.skipped.push((index, e));
                continue;
            }
        };

        if record.subject.common_name.is_empty() {
            info!(index, "skipping certificate without common name");
            continue;
        }

        info!(
            index,
            cn = %record.subject.common_name,
            not_after = %record.not_after,
            days = record.days_to_expiry,
            "extracted certificate"
        );
        extraction
            .discovery
            .data
            .push(DiscoveryEntry::from(&record.subject));
        extraction.records.push(record);
    }

    extraction
}

/// Parses a single PEM certificate.
pub fn parse_certificate(pem: &str, now: DateTime<Utc>) -> Result<CertificateRecord> {
    let cert =
        X509::from_pem(pem.as_bytes()).map_err(|e| CertCheckError::MalformedCertificate {
            reason: e.to_string(),
        })?;

    let subject = SubjectFields::from_name(cert.subject_name());
    let not_after = asn1_to_datetime(cert.not_after())?;

    Ok(CertificateRecord {
        subject,
        not_after,
        days_to_expiry: days_between(now, not_after),
    })
}

/// Whole days from `now` to `not_after`, rounded toward negative infinity,
/// so a certificate that expired an hour ago reports -1.
pub fn days_between(now: DateTime<Utc>, not_after: DateTime<Utc>) -> i64 {
    (not_after - now).num_seconds().div_euclid(SECONDS_PER_DAY)
}

fn asn1_to_datetime(time: &Asn1TimeRef) -> Result<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0).map_err(|e| CertCheckError::DateParse {
        reason: e.to_string(),
    })?;
    let diff = epoch.diff(time).map_err(|e| CertCheckError::DateParse {
        reason: format!("{} ({})", e, time),
    })?;

    let seconds = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(seconds, 0).ok_or_else(|| CertCheckError::DateParse {
        reason: format!("timestamp {} out of range", seconds),
    })
}
