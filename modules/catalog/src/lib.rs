//! Deduplicating result sink: the in-memory seen-set and the append-only
//! catalog files.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mcscan_core::{now_rfc3339, ServerEntry};

/// Addresses already persisted, with their insertion sequence so trims can
/// keep the most recent entries.
#[derive(Debug, Default)]
pub struct SeenSet {
    map: HashMap<u32, u64>,
    next_seq: u64,
}

impl SeenSet {
    pub fn new() -> Self {
        SeenSet::default()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.map.contains_key(&u32::from(ip))
    }

    pub fn insert(&mut self, ip: Ipv4Addr) -> bool {
        let key = u32::from(ip);
        if self.map.contains_key(&key) {
            return false;
        }
        self.map.insert(key, self.next_seq);
        self.next_seq += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// If more than `max` entries are held, keep only the `keep` most
    /// recently inserted. Returns the number dropped.
    pub fn trim(&mut self, max: usize, keep: usize) -> usize {
        if self.map.len() <= max {
            return 0;
        }
        let cutoff = self.next_seq.saturating_sub(keep as u64);
        let before = self.map.len();
        self.map.retain(|_, seq| *seq >= cutoff);
        before - self.map.len()
    }
}

/// One catalog text line: seven pipe-delimited fields.
pub fn format_line(entry: &ServerEntry) -> String {
    let motd: String = entry
        .motd
        .replace(['\n', '\r'], " ")
        .chars()
        .take(50)
        .collect();
    format!(
        "{} | {} | {}/{} | {} | {} | {} | {}",
        entry.ip,
        entry.version,
        entry.players_online,
        entry.players_max,
        motd,
        entry.country,
        entry.quality_score,
        entry.timestamp
    )
}

/// The address on a catalog line is everything before the first pipe.
pub fn parse_line_addr(line: &str) -> Option<Ipv4Addr> {
    line.split('|').next()?.trim().parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Append {
    Written,
    Duplicate,
}

/// Append-only catalog writer. The text file is the durable record the
/// seen-set is rebuilt from; JSON and CSV are optional exports.
pub struct Catalog {
    text_file: File,
    json_path: Option<PathBuf>,
    csv_writer: Option<csv::Writer<File>>,
    servers: Vec<ServerEntry>,
    seen: SeenSet,
}

impl Catalog {
    /// Open the catalog files in append mode and rebuild the seen-set from
    /// the existing text catalog. The JSON array, if present, is loaded so
    /// it keeps accumulating across sessions.
    pub fn open(
        text_path: &Path,
        json_path: Option<PathBuf>,
        csv_path: Option<PathBuf>,
    ) -> Result<Self> {
        let mut seen = SeenSet::new();
        if let Ok(file) = File::open(text_path) {
            for line in BufReader::new(file).lines() {
                let line = line.unwrap_or_default();
                if let Some(ip) = parse_line_addr(&line) {
                    seen.insert(ip);
                }
            }
        }

        let text_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(text_path)
            .with_context(|| format!("open catalog {}", text_path.display()))?;

        let servers = match &json_path {
            Some(p) => load_servers(p),
            None => Vec::new(),
        };

        let csv_writer = match csv_path {
            Some(p) => Some(open_csv(&p)?),
            None => None,
        };

        Ok(Catalog { text_file, json_path, csv_writer, servers, seen })
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.seen.contains(ip)
    }

    pub fn trim_seen(&mut self, max: usize, keep: usize) -> usize {
        self.seen.trim(max, keep)
    }

    /// Persist one discovery. The seen-set is updated last so a failed
    /// write leaves the address eligible for a later retry.
    pub fn append(&mut self, entry: &ServerEntry) -> Result<Append> {
        if self.seen.contains(entry.ip) {
            return Ok(Append::Duplicate);
        }

        writeln!(self.text_file, "{}", format_line(entry)).context("append catalog line")?;
        self.text_file.flush()?;

        if let Some(json_path) = &self.json_path {
            self.servers.push(entry.clone());
            write_servers(json_path, &self.servers)?;
        }

        if let Some(w) = &mut self.csv_writer {
            w.write_record([
                entry.ip.to_string(),
                entry.port.to_string(),
                entry.version.clone(),
                entry.players_online.to_string(),
                entry.players_max.to_string(),
                entry.motd.clone(),
                entry.country.clone(),
                entry.quality_score.to_string(),
                entry.response_time_ms.to_string(),
                entry.timestamp.clone(),
            ])?;
            w.flush()?;
        }

        self.seen.insert(entry.ip);
        Ok(Append::Written)
    }
}

fn load_servers(path: &Path) -> Vec<ServerEntry> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v.get("servers").cloned())
        .and_then(|s| serde_json::from_value(s).ok())
        .unwrap_or_default()
}

/// Whole-file rewrite through a temp file so readers never see a torn
/// document.
fn write_servers(path: &Path, servers: &[ServerEntry]) -> Result<()> {
    let doc = serde_json::json!({
        "servers": servers,
        "lastUpdated": now_rfc3339(),
    });
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(&doc)?)
        .with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn open_csv(path: &Path) -> Result<csv::Writer<File>> {
    let new_file = !path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut w = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    if new_file {
        w.write_record([
            "ip",
            "port",
            "version",
            "players_online",
            "players_max",
            "motd",
            "country",
            "quality_score",
            "response_time_ms",
            "timestamp",
        ])?;
        w.flush()?;
    }
    Ok(w)
}
