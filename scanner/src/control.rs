//! Control surface: operator commands plus snapshot and summary writers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::info;

use mcscan_core::now_rfc3339;
use mcscan_core::stats::ScanStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Pause,
    Resume,
    PauseToggle,
    Stop,
    ResetStats,
    SaveProgress,
}

/// Cloneable sender half of the control channel; the dispatcher owns the
/// receiver and drains it at safe points.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ControlHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ControlHandle { tx }, rx)
    }

    pub fn send(&self, cmd: Command) {
        let _ = self.tx.send(cmd);
    }
}

/// Line-buffered stdin reader: `p` pause-toggle, `s` save, `r` reset stats,
/// `q` stop.
pub fn spawn_key_listener(handle: ControlHandle) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => match line.trim().to_lowercase().as_str() {
                    "p" => handle.send(Command::PauseToggle),
                    "s" => handle.send(Command::SaveProgress),
                    "r" => handle.send(Command::ResetStats),
                    "q" => {
                        handle.send(Command::Stop);
                        break;
                    }
                    _ => {}
                },
            }
        }
    });
}

pub fn spawn_ctrl_c(handle: ControlHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            handle.send(Command::Stop);
        }
    });
}

/// Write `session-stats.json` through a temp file.
pub fn write_snapshot(path: &Path, stats: &ScanStats) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(&stats.snapshot())?)
        .with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Timestamped end-of-session summary under `exports/`.
pub fn write_summary(exports_dir: &Path, stats: &ScanStats) -> Result<PathBuf> {
    let stamp = now_rfc3339().replace(':', "-");
    let path = exports_dir.join(format!("scan-summary-{stamp}.json"));
    let doc = serde_json::json!({
        "finished_at": now_rfc3339(),
        "top_versions": stats.top_versions(10),
        "top_countries": stats.top_countries(10),
        "best_server": &stats.best,
        "performance": {
            "total_scanned": stats.total_scanned,
            "total_found": stats.total_found,
            "duplicates_skipped": stats.duplicates_skipped,
            "errors": stats.errors,
            "timeouts": stats.timeouts,
            "connection_errors": stats.connection_errors,
            "avg_response_ms": stats.avg_response_ms,
            "peak_scan_rate": stats.peak_scan_rate,
            "uptime_secs": stats.uptime_secs(),
        },
    });
    std::fs::write(&path, serde_json::to_string_pretty(&doc)?)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("control-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn snapshot_serializes_maps_as_pairs() {
        let dir = scratch_dir("snapshot");
        let path = dir.join("session-stats.json");
        let stats = ScanStats::new();
        write_snapshot(&path, &stats).unwrap();
        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(doc["servers_by_version"].is_array());
        assert!(doc["servers_by_player_count"].is_array());
        assert_eq!(doc["total_scanned"], 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn summary_lands_in_exports() {
        let dir = scratch_dir("summary");
        let stats = ScanStats::new();
        let path = write_summary(&dir, &stats).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("scan-summary-"));
        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(doc["top_versions"].is_array());
        assert!(doc["performance"]["uptime_secs"].is_number());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn commands_arrive_in_order() {
        let (handle, mut rx) = ControlHandle::channel();
        handle.send(Command::Pause);
        handle.send(Command::Resume);
        handle.send(Command::Stop);
        assert_eq!(rx.recv().await, Some(Command::Pause));
        assert_eq!(rx.recv().await, Some(Command::Resume));
        assert_eq!(rx.recv().await, Some(Command::Stop));
    }
}
