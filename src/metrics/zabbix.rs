use std::io::{self, Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::{DEFAULT_AGENT_CONFIG, DEFAULT_SENDER, DEFAULT_SENDER_TIMEOUT_SECS};
use crate::error::{CertCheckError, Result};
use crate::metrics::format::{escape_quotes, unescape_quotes, Metric};

/// How `zabbix_sender` is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderConfig {
    /// Path to the zabbix_sender binary
    pub sender_binary: String,
    /// Zabbix agent configuration file, passed with `-c`
    pub agent_config: String,
    /// A sender invocation still running after this long is killed
    pub timeout: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            sender_binary: DEFAULT_SENDER.to_string(),
            agent_config: DEFAULT_AGENT_CONFIG.to_string(),
            timeout: Duration::from_secs(DEFAULT_SENDER_TIMEOUT_SECS),
        }
    }
}

/// Renders the command line that submits one metric, as printed in dry-run
/// mode and before every real submission.
pub fn render_command(config: &SenderConfig, host: &str, metric: &Metric) -> String {
    format!(
        "{} -c {} -s {} -k \"{}\" -o \"{}\"",
        config.sender_binary,
        config.agent_config,
        host,
        escape_quotes(&metric.key),
        metric.value
    )
}

/// Destination for formatted metrics.
pub trait MetricSink {
    fn submit(&mut self, host: &str, metric: &Metric) -> Result<()>;
}

/// Outcome of [`submit_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmissionReport {
    pub submitted: usize,
    pub failed: usize,
}

/// Submits every metric in order. A failure is logged and counted and does
/// not stop the remaining submissions.
pub fn submit_all<S: MetricSink + ?Sized>(
    sink: &mut S,
    host: &str,
    metrics: &[Metric],
) -> SubmissionReport {
    let mut report = SubmissionReport::default();
    for metric in metrics {
        match sink.submit(host, metric) {
            Ok(()) => report.submitted += 1,
            Err(e) => {
                warn!(key = %metric.key, error = %e, "failed to submit metric");
                report.failed += 1;
            }
        }
    }
    report
}

/// Prints each sender command and, unless in dry-run mode, runs it.
pub struct Sender<W: Write> {
    config: SenderConfig,
    dry_run: bool,
    out: W,
}

impl<W: Write> Sender<W> {
    pub fn new(config: SenderConfig, dry_run: bool, out: W) -> Self {
        Sender {
            config,
            dry_run,
            out,
        }
    }

    pub fn submit_all(&mut self, host: &str, metrics: &[Metric]) -> SubmissionReport {
        submit_all(self, host, metrics)
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Runs the sender directly, without a shell, so nothing in a key or
    /// value is ever interpreted.
    fn run(&self, host: &str, metric: &Metric) -> Result<String> {
        let value = unescape_quotes(&metric.value);
        let mut child = Command::new(&self.config.sender_binary)
            .args(["-c", self.config.agent_config.as_str()])
            .args(["-s", host])
            .args(["-k", metric.key.as_str()])
            .args(["-o", value.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + self.config.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                kill(&mut child);
                return Err(CertCheckError::Timeout {
                    operation: format!("running {}", self.config.sender_binary),
                });
            }
            thread::sleep(Duration::from_millis(10));
        };

        let stdout = collect(stdout)?;
        if status.success() {
            Ok(stdout)
        } else {
            let stderr = collect(stderr)?;
            Err(CertCheckError::Other {
                message: format!(
                    "{} exited with {}: {}",
                    self.config.sender_binary,
                    status,
                    stderr.trim()
                ),
            })
        }
    }
}

impl<W: Write> MetricSink for Sender<W> {
    fn submit(&mut self, host: &str, metric: &Metric) -> Result<()> {
        let command_line = render_command(&self.config, host, metric);
        writeln!(self.out, "{}", command_line)?;

        if self.dry_run {
            return Ok(());
        }

        debug!(key = %metric.key, "running sender");
        let output = self.run(host, metric)?;
        writeln!(self.out, "{}", output)?;
        Ok(())
    }
}

/// Reads a child pipe to the end on its own thread so a chatty sender never
/// blocks on a full pipe.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<io::Result<String>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut text = String::new();
            pipe.read_to_string(&mut text)?;
            Ok(text)
        })
    })
}

fn collect(reader: Option<JoinHandle<io::Result<String>>>) -> Result<String> {
    match reader {
        Some(handle) => handle
            .join()
            .map_err(|_| CertCheckError::from("sender output reader panicked"))?
            .map_err(CertCheckError::from),
        None => Ok(String::new()),
    }
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(error = %e, "failed to kill sender");
    }
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(sender: &str) -> SenderConfig {
        SenderConfig {
            sender_binary: sender.to_string(),
            agent_config: "/etc/zabbix/zabbix_agentd.conf".to_string(),
            timeout: Duration::from_secs(2),
        }
    }

    fn metrics() -> Vec<Metric> {
        vec![
            Metric::new("ssl_cert.days_remaining[\"example.com\"]", "30"),
            Metric::new("ssl_cert.discovery", "{\\\"data\\\":[]}"),
        ]
    }

    #[test]
    fn test_render_command_format() {
        let line = render_command(&config("zabbix_sender"), "example.com", &metrics()[0]);
        assert_eq!(
            line,
            "zabbix_sender -c /etc/zabbix/zabbix_agentd.conf -s example.com \
             -k \"ssl_cert.days_remaining[\\\"example.com\\\"]\" -o \"30\""
        );
    }

    #[test]
    fn test_dry_run_prints_without_running() {
        // A sender that would fail if it were ever executed.
        let mut sender = Sender::new(config("/nonexistent/zabbix_sender"), true, Vec::new());
        let report = sender.submit_all("example.com", &metrics());

        assert_eq!(report, SubmissionReport { submitted: 2, failed: 0 });
        let printed = String::from_utf8(sender.into_inner()).unwrap();
        let lines: Vec<&str> = printed.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            render_command(&config("/nonexistent/zabbix_sender"), "example.com", &metrics()[0])
        );
        assert!(lines[1].ends_with("-o \"{\\\"data\\\":[]}\""));
    }

    /// Writes an executable shell script into `dir` and returns its path.
    #[cfg(unix)]
    fn script(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[test]
    fn test_sender_receives_unescaped_discovery_value() {
        let mut sender = Sender::new(config("echo"), false, Vec::new());
        let report = sender.submit_all("example.com", &metrics()[1..]);

        assert_eq!(report.failed, 0);
        let printed = String::from_utf8(sender.into_inner()).unwrap();
        assert!(printed.contains("-k ssl_cert.discovery -o {\"data\":[]}"));
    }

    #[cfg(unix)]
    #[test]
    fn test_common_name_is_never_interpreted() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("created");
        let hostile = format!(
            "$(touch {m}) `touch {m}`; touch {m} \\",
            m = marker.display()
        );
        let metric = Metric::new(
            crate::metrics::format::days_remaining_key(&hostile),
            "30",
        );

        let mut sender = Sender::new(config("echo"), false, Vec::new());
        let report = sender.submit_all("example.com", &[metric.clone()]);

        assert_eq!(report.failed, 0);
        assert!(!marker.exists());
        let printed = String::from_utf8(sender.into_inner()).unwrap();
        assert!(printed.contains(&format!("-k {}", metric.key)));
    }

    #[cfg(unix)]
    #[test]
    fn test_failures_do_not_stop_later_submissions() {
        let mut sender = Sender::new(config("false"), false, Vec::new());
        let report = sender.submit_all("example.com", &metrics());

        assert_eq!(report, SubmissionReport { submitted: 0, failed: 2 });
        let printed = String::from_utf8(sender.into_inner()).unwrap();
        assert_eq!(printed.lines().count(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_large_sender_output_does_not_stall() {
        let dir = tempfile::tempdir().unwrap();
        let chatty = script(
            &dir,
            "chatty_sender",
            "head -c 300000 /dev/zero | tr '\\0' x\nhead -c 300000 /dev/zero | tr '\\0' y >&2",
        );
        let mut sender = Sender::new(config(&chatty), false, Vec::new());

        let report = sender.submit_all("example.com", &metrics()[..1]);

        assert_eq!(report, SubmissionReport { submitted: 1, failed: 0 });
        let printed = String::from_utf8(sender.into_inner()).unwrap();
        assert!(printed.matches('x').count() >= 300_000);
    }

    #[cfg(unix)]
    #[test]
    fn test_hung_sender_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let hung = script(&dir, "hung_sender", "exec sleep 10");
        let mut cfg = config(&hung);
        cfg.timeout = Duration::from_millis(200);
        let mut sender = Sender::new(cfg, false, Vec::new());

        let started = Instant::now();
        let report = sender.submit_all("example.com", &metrics()[..1]);

        assert_eq!(report.failed, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    struct Recording(Vec<String>);

    impl MetricSink for Recording {
        fn submit(&mut self, _host: &str, metric: &Metric) -> Result<()> {
            self.0.push(metric.key.clone());
            if metric.key.contains("days_remaining") {
                Err("backend unreachable".into())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_submit_all_counts_each_metric() {
        let mut sink = Recording(Vec::new());
        let report = submit_all(&mut sink, "example.com", &metrics());

        assert_eq!(report, SubmissionReport { submitted: 1, failed: 1 });
        assert_eq!(sink.0.len(), 2);
    }
}
