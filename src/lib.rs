//! Retrieve the TLS certificate chain of a host and report its expiry to Zabbix.
//!
//! The pipeline is [`connector::fetch_chain`] → [`certificate::extract`] →
//! [`metrics::format`], after which the metrics are handed to a
//! [`metrics::MetricSink`] such as [`metrics::Sender`].
//!
//! ```no_run
//! use ssl_cert_discovery::{check_host, CheckOptions, Target};
//!
//! let target = Target::parse("example.com", 443)?;
//! let report = check_host(&target, &CheckOptions::default(), chrono::Utc::now())?;
//! for metric in &report.metrics {
//!     println!("{} = {}", metric.key, metric.value);
//! }
//! # Ok::<(), ssl_cert_discovery::CertCheckError>(())
//! ```

pub mod certificate;
pub mod config;
pub mod connector;
pub mod error;
pub mod metrics;
pub mod output;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use strum_macros::{Display, EnumString};
use url::{Host, Url};

pub use certificate::{
    extract, CertificateRecord, DiscoveryPayload, Extraction, RawCertificateChain, SubjectFields,
};
pub use connector::fetch_chain;
pub use error::{CertCheckError, Result};
pub use metrics::Metric;

/// Options that shape a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOptions {
    /// Port used when the host argument carries none
    pub port: u16,
    /// Send the hostname as server name indication
    pub use_sni: bool,
    /// Deadline for connect + handshake + chain retrieval
    pub timeout: Duration,
    /// Print sender commands instead of running them
    pub dry_run: bool,
    /// Fail the check on the first certificate that cannot be parsed
    /// instead of skipping it
    pub strict: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        CheckOptions {
            port: config::DEFAULT_PORT,
            use_sni: false,
            timeout: Duration::from_secs(config::DEFAULT_TIMEOUT_SECS),
            dry_run: false,
            strict: false,
        }
    }
}

/// What goes to stdout besides the sender command lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OutputFormat {
    /// Only the sender command lines
    Commands,
    /// The extracted records as JSON
    Json,
    /// A table of the extracted records
    Table,
}

/// Host and port to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Domain name or IP address, without brackets
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        Target::parse(host, port)
    }

    /// Parses `host`, `host:port` or `scheme://host:port/path`.
    ///
    /// A port given in `input` wins over `default_port`.
    pub fn parse(input: &str, default_port: u16) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(invalid_host("cannot be empty"));
        }

        let has_scheme = input.contains("://");
        let url = if has_scheme {
            Url::parse(input)
        } else {
            Url::parse(&format!("tls://{}", input))
        }
        .map_err(|e| invalid_host(&e.to_string()))?;

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(invalid_host("no host name found")),
        };

        let explicit_port = if has_scheme {
            url.port_or_known_default()
        } else {
            url.port()
        };

        Ok(Target {
            host,
            port: explicit_port.unwrap_or(default_port),
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn invalid_host(reason: &str) -> CertCheckError {
    CertCheckError::InvalidInput {
        field: "hostname".to_string(),
        reason: reason.to_string(),
    }
}

/// Everything a check produced, ready for output and delivery.
#[derive(Debug)]
pub struct CheckReport {
    pub target: Target,
    pub extraction: Extraction,
    pub metrics: Vec<Metric>,
}

/// Extracts and formats an already fetched chain.
///
/// With [`CheckOptions::strict`] the first certificate that failed to parse
/// is returned as the error.
pub fn report_chain(
    target: Target,
    chain: &RawCertificateChain,
    options: &CheckOptions,
    now: DateTime<Utc>,
) -> Result<CheckReport> {
    let mut extraction = extract(chain, now);
    if options.strict {
        extraction = extraction.into_strict()?;
    }
    let metrics = metrics::format(&extraction.records, &extraction.discovery)?;
    Ok(CheckReport {
        target,
        extraction,
        metrics,
    })
}

/// Fetches the chain of `target` and turns it into metrics.
pub fn check_host(
    target: &Target,
    options: &CheckOptions,
    now: DateTime<Utc>,
) -> Result<CheckReport> {
    let chain = fetch_chain(target, options)?;
    report_chain(target.clone(), &chain, options, now)
}
