//! The main scan loop: draws candidate batches, admits them under the
//! concurrency and rate-limit budgets, and routes probe completions to the
//! catalog and statistics.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use addr_gen::AddrGen;
use catalog::{Append, Catalog};
use mcscan_core::ratelimiter::{Admission, Gate};
use mcscan_core::stats::ScanStats;
use mcscan_core::ServerEntry;
use slp_probe::{Framing, Outcome};

use crate::config::{Config, StateDirs};
use crate::control::{self, Command};

const SUBNET_WINDOW: Duration = Duration::from_millis(1000);
const REAP_INTERVAL: Duration = Duration::from_secs(60);
const RATE_TABLE_MAX_AGE: Duration = Duration::from_secs(300);
const MAINTENANCE_EVERY_SCANS: u64 = 50_000;
const SEEN_MAX: usize = 1_000_000;
const SEEN_KEEP: usize = 500_000;
const RETRY_BACKOFF_MS: u64 = 500;
const IDLE_YIELD: Duration = Duration::from_millis(10);
const PAUSE_POLL: Duration = Duration::from_millis(1000);
const ERROR_COOLDOWN: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

struct ProbeDone {
    ip: Ipv4Addr,
    outcome: DoneOutcome,
}

enum DoneOutcome {
    Server(ServerEntry),
    Malformed,
    NoResponse,
}

/// Everything a probe task needs, detached from the dispatcher.
#[derive(Clone)]
struct ProbeCtx {
    port: u16,
    deadline: Duration,
    framing: Framing,
    max_retries: u32,
    geolocate: bool,
    gate: Arc<Mutex<Gate>>,
    stats: Arc<Mutex<ScanStats>>,
    done_tx: mpsc::UnboundedSender<ProbeDone>,
}

/// One candidate's probe chain: attempt, back off, retry, blacklist on
/// exhaustion. Holds its concurrency permit for the whole chain.
async fn run_probe(ctx: ProbeCtx, permit: OwnedSemaphorePermit, ip: Ipv4Addr) {
    let timeout_ms = ctx.deadline.as_millis() as u64;
    let mut attempts: u32 = 0;
    let mut done = DoneOutcome::NoResponse;
    loop {
        let result = slp_probe::probe(ip, ctx.port, ctx.deadline, ctx.framing).await;
        match result.outcome {
            Outcome::Server(status) => {
                ctx.stats.lock().unwrap().record_response_time(result.elapsed_ms);
                let hostname = if ctx.geolocate {
                    enrich::reverse_hostname(ip, ctx.deadline).await
                } else {
                    None
                };
                let entry =
                    enrich::enrich(ip, ctx.port, &status, result.elapsed_ms, hostname.as_deref());
                done = DoneOutcome::Server(entry);
                break;
            }
            Outcome::Malformed => {
                // Protocol garbage; a retry rarely helps.
                ctx.stats.lock().unwrap().errors += 1;
                done = DoneOutcome::Malformed;
                break;
            }
            Outcome::NoResponse => {
                attempts += 1;
                {
                    let mut stats = ctx.stats.lock().unwrap();
                    if result.elapsed_ms >= timeout_ms {
                        stats.timeouts += 1;
                    } else {
                        stats.connection_errors += 1;
                    }
                }
                if attempts >= ctx.max_retries {
                    ctx.gate.lock().unwrap().blacklist.insert(ip);
                    break;
                }
                sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempts as u64)).await;
            }
        }
    }
    ctx.stats.lock().unwrap().connection_closed();
    let _ = ctx.done_tx.send(ProbeDone { ip, outcome: done });
    drop(permit);
}

fn passes_filters(cfg: &Config, entry: &ServerEntry) -> bool {
    if let Some(filter) = &cfg.version_filter {
        if !filter.iter().any(|v| v == &entry.version) {
            return false;
        }
    }
    entry.players_online >= cfg.min_players && entry.players_online <= cfg.max_players
}

pub struct Dispatcher {
    cfg: Config,
    dirs: StateDirs,
    generator: AddrGen,
    gate: Arc<Mutex<Gate>>,
    stats: Arc<Mutex<ScanStats>>,
    catalog: Catalog,
    inflight: Arc<Semaphore>,
    control_rx: mpsc::UnboundedReceiver<Command>,
    done_tx: mpsc::UnboundedSender<ProbeDone>,
    done_rx: mpsc::UnboundedReceiver<ProbeDone>,
    paused: bool,
    should_stop: bool,
    exhausted: bool,
    /// Spawned-probe count for the `maxScans` cap; survives stats resets.
    spawned: u64,
    last_found: Option<Ipv4Addr>,
    scans_since_maintenance: u64,
    last_reap: Instant,
    last_save: Instant,
    last_status: Instant,
    last_gc: Instant,
}

impl Dispatcher {
    pub fn new(
        cfg: Config,
        dirs: StateDirs,
        control_rx: mpsc::UnboundedReceiver<Command>,
    ) -> Result<Self> {
        let generator = AddrGen::new(cfg.mode()?, cfg.excluded_nets()?, cfg.range_nets()?);
        let catalog = Catalog::open(
            &cfg.output_file,
            cfg.json_catalog_path(),
            cfg.csv_catalog_path(),
        )?;
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        Ok(Dispatcher {
            inflight: Arc::new(Semaphore::new(cfg.max_concurrent.max(1))),
            gate: Arc::new(Mutex::new(Gate::new(SUBNET_WINDOW))),
            stats: Arc::new(Mutex::new(ScanStats::new())),
            cfg,
            dirs,
            generator,
            catalog,
            control_rx,
            done_tx,
            done_rx,
            paused: false,
            should_stop: false,
            exhausted: false,
            spawned: 0,
            last_found: None,
            scans_since_maintenance: 0,
            last_reap: now,
            last_save: now,
            last_status: now,
            last_gc: now,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        info!(
            mode = %self.cfg.scan_mode,
            port = self.cfg.port,
            seen = self.catalog.seen().len(),
            "scan loop starting"
        );
        loop {
            self.drain_control();
            self.drain_completions();
            if self.should_stop || self.exhausted {
                break;
            }
            if let Some(max) = self.cfg.max_scans {
                if self.spawned >= max {
                    info!(max, "scan cap reached");
                    break;
                }
            }
            if self.paused {
                sleep(PAUSE_POLL).await;
                continue;
            }
            match self.cycle() {
                Ok(0) => sleep(IDLE_YIELD).await,
                Ok(_) => tokio::task::yield_now().await,
                Err(e) => {
                    self.stats.lock().unwrap().errors += 1;
                    warn!(error = %e, "dispatch cycle failed, cooling down");
                    sleep(ERROR_COOLDOWN).await;
                }
            }
            self.tick_timers();
        }
        self.shutdown().await
    }

    /// One dispatch cycle: draw a batch, admit, spawn. Returns the number
    /// of probes spawned.
    fn cycle(&mut self) -> Result<usize> {
        let mut admitted: Vec<Ipv4Addr> = Vec::new();
        {
            let mut gate = self.gate.lock().unwrap();
            for _ in 0..self.cfg.batch_size {
                let candidate = self.generator.next(self.last_found, |ip| {
                    self.catalog.contains(ip) || gate.blacklist.contains(ip)
                });
                let Some(ip) = candidate else {
                    info!("address generator exhausted");
                    self.exhausted = true;
                    break;
                };
                if self.catalog.contains(ip) {
                    continue;
                }
                if gate.admit(ip) == Admission::Allow {
                    admitted.push(ip);
                }
            }
        }

        let mut spawned_now = 0;
        for ip in admitted {
            let Ok(permit) = self.inflight.clone().try_acquire_owned() else {
                break;
            };
            {
                let mut stats = self.stats.lock().unwrap();
                stats.record_scan();
                stats.connection_opened();
            }
            self.spawned += 1;
            self.scans_since_maintenance += 1;
            tokio::spawn(run_probe(self.probe_ctx(), permit, ip));
            spawned_now += 1;
            if let Some(max) = self.cfg.max_scans {
                if self.spawned >= max {
                    break;
                }
            }
        }
        Ok(spawned_now)
    }

    fn probe_ctx(&self) -> ProbeCtx {
        ProbeCtx {
            port: self.cfg.port,
            deadline: Duration::from_millis(self.cfg.timeout),
            framing: self.cfg.framing(),
            max_retries: self.cfg.max_retries.max(1),
            geolocate: self.cfg.enable_geolocation,
            gate: self.gate.clone(),
            stats: self.stats.clone(),
            done_tx: self.done_tx.clone(),
        }
    }

    fn drain_control(&mut self) {
        while let Ok(cmd) = self.control_rx.try_recv() {
            match cmd {
                Command::Pause => {
                    self.paused = true;
                    info!("scanning paused");
                }
                Command::Resume => {
                    self.paused = false;
                    info!("scanning resumed");
                }
                Command::PauseToggle => {
                    self.paused = !self.paused;
                    info!(paused = self.paused, "pause toggled");
                }
                Command::Stop => self.should_stop = true,
                Command::ResetStats => {
                    self.stats.lock().unwrap().reset_volatile();
                    info!("statistics reset");
                }
                Command::SaveProgress => match self.save_progress() {
                    Ok(()) => info!("progress saved"),
                    Err(e) => warn!(error = %e, "save failed"),
                },
            }
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(done) = self.done_rx.try_recv() {
            self.handle_done(done);
        }
    }

    fn handle_done(&mut self, done: ProbeDone) {
        let DoneOutcome::Server(entry) = done.outcome else {
            return;
        };
        if !passes_filters(&self.cfg, &entry) {
            debug!(ip = %done.ip, players = entry.players_online, "discovery filtered out");
            return;
        }
        match self.catalog.append(&entry) {
            Ok(Append::Written) => {
                self.last_found = Some(done.ip);
                let mut stats = self.stats.lock().unwrap();
                stats.record_found(&entry);
                info!(
                    ip = %done.ip,
                    version = %entry.version,
                    players = entry.players_online,
                    quality = entry.quality_score,
                    "server discovered"
                );
            }
            Ok(Append::Duplicate) => {
                self.stats.lock().unwrap().duplicates_skipped += 1;
            }
            Err(e) => {
                // Address stays out of the seen-set so a later probe can
                // retry the write.
                self.stats.lock().unwrap().errors += 1;
                warn!(ip = %done.ip, error = %e, "catalog append failed");
            }
        }
    }

    fn tick_timers(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_reap) >= REAP_INTERVAL {
            let removed = self.gate.lock().unwrap().limiter.reap(RATE_TABLE_MAX_AGE);
            if removed > 0 {
                debug!(removed, "rate limiter table reaped");
            }
            self.last_reap = now;
        }
        if now.duration_since(self.last_status)
            >= Duration::from_millis(self.cfg.stats_interval.max(1))
        {
            self.log_status();
            self.last_status = now;
        }
        if now.duration_since(self.last_save) >= Duration::from_millis(self.cfg.save_interval.max(1))
        {
            if let Err(e) = self.save_progress() {
                warn!(error = %e, "autosave failed");
            }
            self.last_save = now;
        }
        if self.scans_since_maintenance >= MAINTENANCE_EVERY_SCANS
            || now.duration_since(self.last_gc) >= Duration::from_millis(self.cfg.gc_interval.max(1))
        {
            self.maintenance();
            self.last_gc = now;
            self.scans_since_maintenance = 0;
        }
    }

    fn log_status(&self) {
        let stats = self.stats.lock().unwrap();
        info!(
            scanned = stats.total_scanned,
            found = stats.total_found,
            active = stats.active_connections,
            blacklisted = self.gate.lock().unwrap().blacklist.len(),
            rate = stats.scan_rate(),
            avg_ms = stats.avg_response_ms,
            "scan progress"
        );
    }

    /// Reap the rate table, trim the seen-set, snapshot state.
    fn maintenance(&mut self) {
        let reaped = self.gate.lock().unwrap().limiter.reap(RATE_TABLE_MAX_AGE);
        let trimmed = self.catalog.trim_seen(SEEN_MAX, SEEN_KEEP);
        if let Err(e) = self.save_progress() {
            warn!(error = %e, "maintenance save failed");
        }
        self.stats.lock().unwrap().gc_invocations += 1;
        debug!(reaped, trimmed, "maintenance cycle");
    }

    fn save_progress(&self) -> Result<()> {
        let stats = self.stats.lock().unwrap();
        control::write_snapshot(&self.dirs.stats_file(), &stats)?;
        self.cfg.save(&self.dirs.config_file())?;
        Ok(())
    }

    /// Let in-flight probes finish, fold in their results, and write the
    /// final snapshot + summary.
    async fn shutdown(&mut self) -> Result<()> {
        info!("waiting for in-flight probes to drain");
        {
            let all = self.inflight.acquire_many(self.cfg.max_concurrent.max(1) as u32);
            if tokio::time::timeout(DRAIN_TIMEOUT, all).await.is_err() {
                warn!("drain timed out, writing summary with probes still in flight");
            }
        }
        self.drain_completions();
        self.save_progress()?;
        let stats = self.stats.lock().unwrap();
        let summary = control::write_summary(&self.dirs.exports, &stats)?;
        info!(
            scanned = stats.total_scanned,
            found = stats.total_found,
            summary = %summary.display(),
            "scan session complete"
        );
        Ok(())
    }
}
