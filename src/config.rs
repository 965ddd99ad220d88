//! Configuration file management for the certificate checker.
//!
//! Settings are layered from three sources, later ones winning:
//!
//! 1. Default values (lowest priority)
//! 2. Configuration file (`ssl_cert.toml` or specified with `--config`)
//! 3. Command-line arguments (highest priority)
//!
//! # Example Configuration File
//!
//! ```toml
//! port = 443
//! timeout = 15
//! servername = true
//! dryrun = false
//! strict = false
//! output = "commands"
//!
//! [zabbix]
//! config = "/etc/zabbix/zabbix_agentd.conf"
//! sender = "zabbix_sender"
//! sender_timeout = 1
//! ```

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::zabbix::SenderConfig;
use crate::{CheckOptions, OutputFormat};

/// File looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "ssl_cert.toml";

pub const DEFAULT_PORT: u16 = 443;
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_AGENT_CONFIG: &str = "/etc/zabbix/zabbix_agentd.conf";
pub const DEFAULT_SENDER: &str = "zabbix_sender";
pub const DEFAULT_SENDER_TIMEOUT_SECS: u64 = 1;

/// Main configuration structure.
///
/// All fields are optional to support partial configuration and merging.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct Config {
    /// Port to connect to
    pub port: Option<u16>,
    /// Connect + handshake deadline in seconds
    pub timeout: Option<u64>,
    /// Send the hostname as SNI
    pub servername: Option<bool>,
    /// Print sender commands instead of running them
    pub dryrun: Option<bool>,
    /// Abort on the first certificate that cannot be parsed
    pub strict: Option<bool>,
    /// Output format: commands, json, table
    pub output: Option<String>,
    /// Zabbix sender settings
    pub zabbix: Option<ZabbixConfig>,
}

/// Where and how metrics are handed to `zabbix_sender`.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct ZabbixConfig {
    /// Path to the Zabbix agent configuration file passed with `-c`
    pub config: Option<String>,
    /// Path to the zabbix_sender binary
    pub sender: Option<String>,
    /// Seconds before a sender invocation is killed
    pub sender_timeout: Option<u64>,
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// # Returns
    ///
    /// * `Ok(Config)` - Successfully parsed configuration
    /// * `Err(ConfigError::Io)` - File could not be read
    /// * `Err(ConfigError::Parse)` - File contains invalid TOML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        Ok(config)
    }

    /// Loads the explicitly requested file, or the default file if it exists.
    ///
    /// A missing default file is not an error; a missing explicit one is.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::from_file(path),
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(DEFAULT_CONFIG_FILE)
            }
            None => Ok(Config::default()),
        }
    }

    /// Configuration holding the built-in defaults.
    pub fn defaults() -> Self {
        Config {
            port: Some(DEFAULT_PORT),
            timeout: Some(DEFAULT_TIMEOUT_SECS),
            servername: Some(false),
            dryrun: Some(false),
            strict: Some(false),
            output: Some(OutputFormat::Commands.to_string()),
            zabbix: Some(ZabbixConfig {
                config: Some(DEFAULT_AGENT_CONFIG.to_string()),
                sender: Some(DEFAULT_SENDER.to_string()),
                sender_timeout: Some(DEFAULT_SENDER_TIMEOUT_SECS),
            }),
        }
    }

    /// Merges this configuration with another, prioritizing the other's values.
    pub fn merge_with(mut self, other: Config) -> Self {
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.timeout.is_some() {
            self.timeout = other.timeout;
        }
        if other.servername.is_some() {
            self.servername = other.servername;
        }
        if other.dryrun.is_some() {
            self.dryrun = other.dryrun;
        }
        if other.strict.is_some() {
            self.strict = other.strict;
        }
        if other.output.is_some() {
            self.output = other.output;
        }
        if let Some(other_zbx) = other.zabbix {
            if let Some(ref mut self_zbx) = self.zabbix {
                if other_zbx.config.is_some() {
                    self_zbx.config = other_zbx.config;
                }
                if other_zbx.sender.is_some() {
                    self_zbx.sender = other_zbx.sender;
                }
                if other_zbx.sender_timeout.is_some() {
                    self_zbx.sender_timeout = other_zbx.sender_timeout;
                }
            } else {
                self.zabbix = Some(other_zbx);
            }
        }
        self
    }

    /// Validates the merged configuration and splits it into the option
    /// structs used by the connector, the sender and the output stage.
    ///
    /// Missing values fall back to the built-in defaults.
    pub fn resolve(self) -> Result<(CheckOptions, SenderConfig, OutputFormat), ConfigError> {
        let merged = Config::defaults().merge_with(self);

        let port = merged.port.unwrap_or(DEFAULT_PORT);
        if port == 0 {
            return Err(ConfigError::Validation("port must be non-zero".to_string()));
        }
        let timeout = merged.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout == 0 {
            return Err(ConfigError::Validation(
                "timeout must be at least 1 second".to_string(),
            ));
        }

        let output = match merged.output {
            Some(ref name) => OutputFormat::from_str(name).map_err(|_| {
                ConfigError::Validation(format!(
                    "unknown output format '{}' (expected commands, json or table)",
                    name
                ))
            })?,
            None => OutputFormat::Commands,
        };

        let zabbix = merged.zabbix.unwrap_or_default();
        let sender_timeout = zabbix.sender_timeout.unwrap_or(DEFAULT_SENDER_TIMEOUT_SECS);
        if sender_timeout == 0 {
            return Err(ConfigError::Validation(
                "zabbix.sender_timeout must be at least 1 second".to_string(),
            ));
        }

        let options = CheckOptions {
            port,
            use_sni: merged.servername.unwrap_or(false),
            timeout: Duration::from_secs(timeout),
            dry_run: merged.dryrun.unwrap_or(false),
            strict: merged.strict.unwrap_or(false),
        };
        let sender = SenderConfig {
            sender_binary: zabbix.sender.unwrap_or_else(|| DEFAULT_SENDER.to_string()),
            agent_config: zabbix
                .config
                .unwrap_or_else(|| DEFAULT_AGENT_CONFIG.to_string()),
            timeout: Duration::from_secs(sender_timeout),
        };

        Ok((options, sender, output))
    }

    /// Generates an example configuration file in TOML format.
    pub fn example_toml() -> String {
        let example = Config {
            servername: Some(true),
            ..Config::defaults()
        };

        toml::to_string_pretty(&example)
            .unwrap_or_else(|_| "# Error generating example".to_string())
    }
}

/// Errors that can occur during configuration loading and parsing.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// I/O error (file not found, permission denied, etc.)
    #[error("IO Error: {0}")]
    Io(String),
    /// TOML parsing error (invalid syntax, type mismatch, etc.)
    #[error("Parse Error: {0}")]
    Parse(String),
    /// Validation error (out-of-range or unknown values)
    #[error("Validation Error: {0}")]
    Validation(String),
}
