use anyhow::{Context, Result};
use clap::Parser;
use plugin_reload_conformance::{HarnessConfig, ScenarioRunner, SubprocessController};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Verifies that a broker plugin publishes its reload notification on SIGHUP.
#[derive(Parser, Debug)]
#[command(name = "plugin-reload-test", version, about)]
struct Cli {
    /// Harness configuration file (TOML); defaults apply to missing fields
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Broker executable to launch
    #[arg(long)]
    broker: Option<String>,

    /// Plugin shared object loaded by the broker
    #[arg(long)]
    plugin: Option<PathBuf>,

    /// First listener port to try
    #[arg(long)]
    base_port: Option<u16>,

    /// MQTT protocol version (3, 4 or 5)
    #[arg(long, value_parser = clap::value_parser!(u8).range(3..=5))]
    protocol_version: Option<u8>,

    /// per_listener_settings value to run (repeatable; default: false, then true)
    #[arg(long = "variant", action = clap::ArgAction::Append)]
    variants: Vec<bool>,

    /// Reload signal / notification cycles per run
    #[arg(long)]
    reload_cycles: Option<u32>,

    /// How long to wait for the notification (e.g., 10s, 500ms)
    #[arg(long, value_parser = parse_duration)]
    notification_timeout: Option<Duration>,

    /// Print the report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Run every variant even after a failure
    #[arg(long)]
    no_fail_fast: bool,

    /// Enable info logging
    #[arg(long, short)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn init_basic_tracing(verbose: bool, debug: bool) {
    let default = if debug {
        "plugin_reload_conformance=debug,plugin_reload_test=debug"
    } else if verbose {
        "plugin_reload_conformance=info,plugin_reload_test=info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn build_config(cli: &Cli) -> Result<HarnessConfig> {
    let mut config = match &cli.config {
        Some(path) => HarnessConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => HarnessConfig::default(),
    };

    if let Some(broker) = &cli.broker {
        config.broker.program.clone_from(broker);
    }
    if let Some(plugin) = &cli.plugin {
        config.plugin_path.clone_from(plugin);
    }
    if let Some(port) = cli.base_port {
        config.base_port = port;
    }
    if let Some(version) = cli.protocol_version {
        config.client.protocol_version = version;
    }
    if !cli.variants.is_empty() {
        config.variants.clone_from(&cli.variants);
    }
    if let Some(cycles) = cli.reload_cycles {
        config.reload_cycles = cycles;
    }
    if let Some(timeout) = cli.notification_timeout {
        config.timeouts.notification = timeout;
    }
    if cli.no_fail_fast {
        config.fail_fast = false;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<bool> {
    let config = build_config(&cli)?;
    debug!(?config, "configuration resolved");

    let controller =
        SubprocessController::new(config.broker.clone(), config.timeouts.shutdown_grace);
    let mut runner = ScenarioRunner::new(controller, config)?;
    let report = runner.run_all().await;

    if cli.json {
        println!("{}", report.generate_json().context("Failed to encode report")?);
    }
    if report.passed() {
        return Ok(true);
    }
    if !cli.json {
        eprint!("{}", report.generate_text());
    }
    Ok(false)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_basic_tracing(cli.verbose, cli.debug);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(2)
        }
    }
}
