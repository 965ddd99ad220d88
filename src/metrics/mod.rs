//! Metric formatting and delivery.
//!
//! # Submodules
//!
//! - `format` - maps certificate records to Zabbix item keys and values
//! - `zabbix` - hands metrics to `zabbix_sender`

pub mod format;
pub mod zabbix;

pub use format::{format, Metric};
pub use zabbix::{MetricSink, Sender, SenderConfig, SubmissionReport};
