use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod config;
mod control;
mod dispatcher;

use config::{Config, StateDirs};
use control::ControlHandle;
use dispatcher::Dispatcher;

#[derive(Debug, Parser)]
#[command(
    name = "mcscan",
    version,
    about = "Internet-scale Minecraft server discovery via Server List Ping"
)]
struct Cli {
    /// Config file (JSON). Defaults to <state-dir>/config.json.
    #[arg(long)]
    config: Option<PathBuf>,

    /// State directory. Defaults to ~/.minecraft-scanner.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Scan mode: smart-random, random, range, or targeted.
    #[arg(long)]
    mode: Option<String>,

    /// TCP port to probe.
    #[arg(long)]
    port: Option<u16>,

    /// Per-probe deadline in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Upper bound on in-flight probes.
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Candidates drawn per dispatch cycle.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Stop after this many probes.
    #[arg(long)]
    max_scans: Option<u64>,

    /// CIDRs to draw from in range/targeted modes (repeatable).
    #[arg(long = "range", value_name = "CIDR")]
    ranges: Vec<String>,

    /// Catalog text file path.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Log level: silent, error, warn, info, or debug.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(&self, cfg: &mut Config) {
        if let Some(mode) = &self.mode {
            cfg.scan_mode = mode.clone();
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(timeout) = self.timeout_ms {
            cfg.timeout = timeout;
        }
        if let Some(n) = self.max_concurrent {
            cfg.max_concurrent = n;
        }
        if let Some(n) = self.batch_size {
            cfg.batch_size = n;
        }
        if let Some(n) = self.max_scans {
            cfg.max_scans = Some(n);
        }
        if !self.ranges.is_empty() {
            cfg.ip_ranges = self.ranges.clone();
        }
        if let Some(out) = &self.out {
            cfg.output_file = out.clone();
        }
        if let Some(level) = &self.log_level {
            cfg.log_level = level.clone();
        }
    }
}

fn init_tracing(level: &str) {
    let directive = match level {
        "silent" => "off",
        other => other,
    };
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    let cli = Cli::parse();

    // Environment failures before the loop starts are not retryable.
    let dirs = match StateDirs::prepare(cli.state_dir.clone()) {
        Ok(dirs) => dirs,
        Err(e) => {
            eprintln!("fatal: {e:#}");
            std::process::exit(2);
        }
    };
    let config_path = cli.config.clone().unwrap_or_else(|| dirs.config_file());
    let mut cfg = match Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("fatal: {e:#}");
            std::process::exit(2);
        }
    };
    cli.apply(&mut cfg);
    init_tracing(&cfg.log_level);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(2);
        }
    };
    if let Err(e) = rt.block_on(run(cfg, dirs)) {
        error!("scanner exited with error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config, dirs: StateDirs) -> Result<()> {
    let (handle, control_rx) = ControlHandle::channel();
    control::spawn_ctrl_c(handle.clone());
    control::spawn_key_listener(handle);

    let mut dispatcher = Dispatcher::new(cfg, dirs, control_rx)?;
    dispatcher.run().await
}
