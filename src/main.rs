use std::io;
use std::path::PathBuf;
use std::process::exit;

use chrono::Utc;
use clap::Parser;
use ssl_cert_discovery::config::{Config, ZabbixConfig};
use ssl_cert_discovery::metrics::Sender;
use ssl_cert_discovery::{check_host, output, CertCheckError, OutputFormat, Target};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Retrieve SSL certificate expiry for Zabbix checks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Retrieve SSL certificates from this hostname
    #[arg(value_name = "HOSTNAME", required_unless_present = "example_config")]
    hostname: Option<String>,

    /// The port to connect to (Default: 443)
    #[arg(long)]
    port: Option<u16>,

    /// Print the zabbix_sender commands without running them
    #[arg(long, overrides_with = "no_dryrun")]
    dryrun: bool,

    /// Run zabbix_sender even if the configuration file sets dryrun
    #[arg(long, overrides_with = "dryrun")]
    no_dryrun: bool,

    /// Seconds before the connection attempt is aborted (Default: 15)
    #[arg(long)]
    timeout: Option<u64>,

    /// Send the hostname as SNI. Needed when several names with distinct
    /// certificates are served from one IP address.
    #[arg(long, overrides_with = "no_servername")]
    servername: bool,

    /// Do not send SNI even if the configuration file sets servername
    #[arg(long, overrides_with = "servername")]
    no_servername: bool,

    /// Fail with exit code 2 when a certificate of the chain cannot be parsed
    #[arg(long, overrides_with = "no_strict")]
    strict: bool,

    /// Skip unparseable certificates even if the configuration file sets strict
    #[arg(long, overrides_with = "strict")]
    no_strict: bool,

    /// Path to the Zabbix agent configuration file, passed to zabbix_sender
    /// (Default: /etc/zabbix/zabbix_agentd.conf)
    #[arg(long = "zabbix-config", value_name = "PATH")]
    zabbix_config: Option<String>,

    /// Path to the zabbix_sender binary (Default: zabbix_sender)
    #[arg(long = "zabbix-sender", value_name = "PATH")]
    zabbix_sender: Option<String>,

    /// TOML configuration file (Default: ./ssl_cert.toml when present)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Extra output on stdout: commands, json or table
    #[arg(short, long)]
    output: Option<String>,

    /// Log debug information to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Print an example configuration file and exit
    #[arg(long)]
    example_config: bool,
}

impl Cli {
    /// Flags only override the file when they were actually given.
    fn as_config(&self) -> Config {
        Config {
            port: self.port,
            timeout: self.timeout,
            servername: switch(self.servername, self.no_servername),
            dryrun: switch(self.dryrun, self.no_dryrun),
            strict: switch(self.strict, self.no_strict),
            output: self.output.clone(),
            zabbix: Some(ZabbixConfig {
                config: self.zabbix_config.clone(),
                sender: self.zabbix_sender.clone(),
                sender_timeout: None,
            }),
        }
    }
}

/// Maps a `--flag` / `--no-flag` pair onto a config override.
fn switch(on: bool, off: bool) -> Option<bool> {
    if on {
        Some(true)
    } else if off {
        Some(false)
    } else {
        None
    }
}

/// 1 when the host could not be checked at all, 2 when the chain was fetched
/// but could not be turned into metrics.
fn check_exit_code(err: &CertCheckError) -> i32 {
    if err.is_connector_failure() {
        1
    } else {
        2
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    if cli.example_config {
        println!("{}", Config::example_toml());
        exit(0);
    }

    exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let file_config = match Config::discover(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };
    let (options, sender_config, output_format) =
        match file_config.merge_with(cli.as_config()).resolve() {
            Ok(resolved) => resolved,
            Err(e) => {
                error!("{}", e);
                return 1;
            }
        };

    let hostname = cli.hostname.unwrap_or_default();
    let target = match Target::parse(&hostname, options.port) {
        Ok(target) => target,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };

    let now = Utc::now();
    let report = match check_host(&target, &options, now) {
        Ok(report) => report,
        Err(e) if e.is_connector_failure() => {
            error!("Fail to check host: {}  {}", target, e);
            return check_exit_code(&e);
        }
        Err(e) => {
            error!("Fail to read certificates of {}: {}", target, e);
            return check_exit_code(&e);
        }
    };
    info!(
        host = %target,
        certificates = report.extraction.records.len(),
        skipped = report.extraction.skipped.len(),
        "extraction finished"
    );

    match output_format {
        OutputFormat::Commands => {}
        OutputFormat::Json => match output::records_json(&report.extraction.records) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("{}", e),
        },
        OutputFormat::Table => {
            println!("{}", output::records_table(&report.extraction.records, now))
        }
    }

    let mut sender = Sender::new(sender_config, options.dry_run, io::stdout().lock());
    let submission = sender.submit_all(&target.host, &report.metrics);
    if submission.failed > 0 {
        error!(
            "{} of {} metrics could not be submitted",
            submission.failed,
            report.metrics.len()
        );
    }

    0
}
