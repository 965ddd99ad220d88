//! Error types for certificate retrieval, parsing and delivery.
//!
//! Connector failures (`DnsResolution`, `ConnectionFailed`, `Timeout`,
//! `HandshakeFailed`) are fatal to a run. `MalformedCertificate` and
//! `DateParse` concern a single certificate and are normally skipped.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Error type for everything the checker can fail at.
#[derive(Debug, Error)]
pub enum CertCheckError {
    /// DNS resolution failed for the given hostname
    #[error("Failed to resolve hostname: {hostname}. Check that the hostname is spelled correctly and your DNS configuration is working.")]
    DnsResolution {
        /// The hostname that failed to resolve
        hostname: String,
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },

    /// TCP connection was refused or the host is unreachable
    #[error("Connection failed to: {address}. Verify the host is running a TLS service and is reachable.")]
    ConnectionFailed {
        /// The address (host:port) that connection failed to
        address: String,
        #[source]
        source: io::Error,
    },

    /// The connect/handshake deadline passed
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// TLS protocol-level failure
    #[error("TLS handshake failed: {details}")]
    HandshakeFailed { details: String },

    /// The certificate structure could not be decoded at all
    #[error("Malformed certificate: {reason}")]
    MalformedCertificate { reason: String },

    /// The notAfter field is present but could not be turned into a timestamp
    #[error("Unparseable notAfter date: {reason}")]
    DateParse { reason: String },

    /// Invalid input provided to the API
    #[error("Invalid input for '{field}': {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("OpenSSL error: {details}")]
    OpenSSLError { details: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {source}")]
    IoError {
        #[from]
        source: io::Error,
    },

    #[error("{message}")]
    Other { message: String },
}

impl CertCheckError {
    /// True for the errors that stop a run before any certificate is seen.
    pub fn is_connector_failure(&self) -> bool {
        matches!(
            self,
            Self::DnsResolution { .. }
                | Self::ConnectionFailed { .. }
                | Self::Timeout { .. }
                | Self::HandshakeFailed { .. }
        )
    }
}

impl From<&str> for CertCheckError {
    fn from(s: &str) -> Self {
        Self::Other {
            message: s.to_string(),
        }
    }
}

impl From<String> for CertCheckError {
    fn from(s: String) -> Self {
        Self::Other { message: s }
    }
}

impl From<openssl::error::ErrorStack> for CertCheckError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Self::OpenSSLError {
            details: e.to_string(),
        }
    }
}

impl<S: std::fmt::Debug> From<openssl::ssl::HandshakeError<S>> for CertCheckError {
    fn from(e: openssl::ssl::HandshakeError<S>) -> Self {
        Self::HandshakeFailed {
            details: format!("{}", e),
        }
    }
}

pub type Result<T> = std::result::Result<T, CertCheckError>;
