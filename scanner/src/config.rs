use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use addr_gen::{parse_mode, ScanMode, DEFAULT_EXCLUDES};
use slp_probe::Framing;

/// Scanner configuration, persisted as `config.json` in the state
/// directory. Unknown keys are ignored; missing keys take defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub port: u16,
    /// Per-probe deadline in milliseconds.
    pub timeout: u64,
    /// Attempts before an unresponsive address is blacklisted.
    pub max_retries: u32,
    /// Candidates drawn per dispatch cycle.
    pub batch_size: usize,
    /// Upper bound on in-flight probes.
    pub max_concurrent: usize,
    /// Stop after this many spawned probes; absent means run forever.
    pub max_scans: Option<u64>,
    pub scan_mode: String,
    pub ip_ranges: Vec<String>,
    pub exclude_ranges: Vec<String>,
    pub output_file: PathBuf,
    pub export_formats: Vec<String>,
    pub log_level: String,
    pub version_filter: Option<Vec<String>>,
    pub min_players: i64,
    pub max_players: i64,
    pub enable_geolocation: bool,
    /// Milliseconds between autosaves.
    pub save_interval: u64,
    /// Milliseconds between status lines.
    pub stats_interval: u64,
    /// Milliseconds between maintenance cycles.
    pub gc_interval: u64,
    /// Prefix the handshake with its VarInt length, per the strict protocol.
    pub strict_framing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 25565,
            timeout: 2500,
            max_retries: 2,
            batch_size: 100,
            max_concurrent: 500,
            max_scans: None,
            scan_mode: "smart-random".to_string(),
            ip_ranges: Vec::new(),
            exclude_ranges: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            output_file: PathBuf::from("discovered-servers.txt"),
            export_formats: vec!["txt".to_string(), "json".to_string()],
            log_level: "info".to_string(),
            version_filter: None,
            min_players: 0,
            max_players: 1_000_000,
            enable_geolocation: true,
            save_interval: 60_000,
            stats_interval: 5_000,
            gc_interval: 300_000,
            strict_framing: false,
        }
    }
}

impl Config {
    /// Load from `path`; a missing file yields the defaults, a malformed
    /// one is a startup error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))
    }

    /// Persist atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
        Ok(())
    }

    pub fn mode(&self) -> Result<ScanMode> {
        parse_mode(&self.scan_mode)
    }

    pub fn framing(&self) -> Framing {
        if self.strict_framing {
            Framing::Framed
        } else {
            Framing::Legacy
        }
    }

    pub fn excluded_nets(&self) -> Result<Vec<Ipv4Net>> {
        parse_nets(&self.exclude_ranges).context("excludeRanges")
    }

    pub fn range_nets(&self) -> Result<Vec<Ipv4Net>> {
        parse_nets(&self.ip_ranges).context("ipRanges")
    }

    fn wants(&self, format: &str) -> bool {
        self.export_formats.iter().any(|f| f == format)
    }

    /// JSON catalog path, if that export is enabled: the text catalog with
    /// its extension swapped.
    pub fn json_catalog_path(&self) -> Option<PathBuf> {
        self.wants("json").then(|| self.output_file.with_extension("json"))
    }

    pub fn csv_catalog_path(&self) -> Option<PathBuf> {
        self.wants("csv").then(|| self.output_file.with_extension("csv"))
    }
}

fn parse_nets(specs: &[String]) -> Result<Vec<Ipv4Net>> {
    specs
        .iter()
        .map(|s| s.parse::<Ipv4Net>().with_context(|| format!("invalid CIDR: {}", s)))
        .collect()
}

/// On-disk scanner state: `<home>/.minecraft-scanner/` with `logs/`,
/// `exports/`, and `cache/` beneath it.
#[derive(Debug, Clone)]
pub struct StateDirs {
    pub root: PathBuf,
    pub logs: PathBuf,
    pub exports: PathBuf,
    pub cache: PathBuf,
}

impl StateDirs {
    /// Create the directory tree; failure here is fatal to startup.
    pub fn prepare(root: Option<PathBuf>) -> Result<Self> {
        let root = match root {
            Some(r) => r,
            None => {
                let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
                home.join(".minecraft-scanner")
            }
        };
        let dirs = StateDirs {
            logs: root.join("logs"),
            exports: root.join("exports"),
            cache: root.join("cache"),
            root,
        };
        for dir in [&dirs.root, &dirs.logs, &dirs.exports, &dirs.cache] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create state dir {}", dir.display()))?;
        }
        Ok(dirs)
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn stats_file(&self) -> PathBuf {
        self.root.join("session-stats.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 25565);
        assert_eq!(cfg.timeout, 2500);
        assert!(cfg.max_scans.is_none());
        assert_eq!(cfg.mode().unwrap(), ScanMode::SmartRandom);
        assert_eq!(cfg.framing(), Framing::Legacy);
        assert_eq!(cfg.excluded_nets().unwrap().len(), DEFAULT_EXCLUDES.len());
    }

    #[test]
    fn camel_case_keys_round_trip() {
        let cfg = Config {
            max_retries: 5,
            scan_mode: "range".to_string(),
            ip_ranges: vec!["198.51.100.0/24".to_string()],
            ..Config::default()
        };
        let text = serde_json::to_string(&cfg).unwrap();
        assert!(text.contains("\"maxRetries\":5"));
        assert!(text.contains("\"scanMode\":\"range\""));
        let back: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(back.max_retries, 5);
        assert_eq!(back.range_nets().unwrap().len(), 1);
    }

    #[test]
    fn partial_config_fills_defaults_and_ignores_unknowns() {
        let cfg: Config =
            serde_json::from_str(r#"{"port": 1337, "someFutureKnob": true}"#).unwrap();
        assert_eq!(cfg.port, 1337);
        assert_eq!(cfg.timeout, 2500);
    }

    #[test]
    fn export_paths_follow_the_output_file() {
        let mut cfg = Config::default();
        cfg.output_file = PathBuf::from("/tmp/found.txt");
        assert_eq!(cfg.json_catalog_path().unwrap(), PathBuf::from("/tmp/found.json"));
        assert!(cfg.csv_catalog_path().is_none());
        cfg.export_formats.push("csv".to_string());
        assert_eq!(cfg.csv_catalog_path().unwrap(), PathBuf::from("/tmp/found.csv"));
    }
}
