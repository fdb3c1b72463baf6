//! Streaming statistics for a scan session.

use std::collections::HashMap;
use std::time::Instant;

use crate::{now_rfc3339, ServerEntry};

/// Smoothing factor for the response-time moving average.
const EMA_ALPHA: f64 = 0.1;

/// A MOTD tally stops incrementing at this count.
const MOTD_ENTRY_CAP: u64 = 10;

/// No new MOTD entries are inserted past this many distinct MOTDs.
const MOTD_MAP_CAP: usize = 256;

pub const PLAYER_BUCKETS: [&str; 6] = ["0", "1-5", "6-20", "21-50", "51-100", "100+"];

pub fn player_bucket(online: i64) -> &'static str {
    match online {
        i64::MIN..=0 => "0",
        1..=5 => "1-5",
        6..=20 => "6-20",
        21..=50 => "21-50",
        51..=100 => "51-100",
        _ => "100+",
    }
}

/// Counters and tallies exposed to the dashboard and persisted in
/// `session-stats.json`. All counters are monotonic within a session except
/// the `active_connections` gauge.
pub struct ScanStats {
    pub total_scanned: u64,
    pub total_found: u64,
    pub duplicates_skipped: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub connection_errors: u64,
    pub active_connections: u64,
    pub gc_invocations: u64,
    pub avg_response_ms: f64,
    pub peak_scan_rate: f64,
    started: Instant,
    started_at: String,
    by_version: HashMap<String, u64>,
    by_country: HashMap<String, u64>,
    by_player_bucket: HashMap<&'static str, u64>,
    popular_motds: HashMap<String, u64>,
    pub last_found: Option<ServerEntry>,
    pub best: Option<ServerEntry>,
}

impl Default for ScanStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanStats {
    pub fn new() -> Self {
        ScanStats {
            total_scanned: 0,
            total_found: 0,
            duplicates_skipped: 0,
            errors: 0,
            timeouts: 0,
            connection_errors: 0,
            active_connections: 0,
            gc_invocations: 0,
            avg_response_ms: 0.0,
            peak_scan_rate: 0.0,
            started: Instant::now(),
            started_at: now_rfc3339(),
            by_version: HashMap::new(),
            by_country: HashMap::new(),
            by_player_bucket: HashMap::new(),
            popular_motds: HashMap::new(),
            last_found: None,
            best: None,
        }
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Instantaneous average rate since session start, in scans per second.
    pub fn scan_rate(&self) -> f64 {
        let up = self.uptime_secs();
        if up <= 0.0 {
            return 0.0;
        }
        self.total_scanned as f64 / up
    }

    /// Count one spawned probe and refresh the peak rate.
    pub fn record_scan(&mut self) {
        self.total_scanned += 1;
        let rate = self.scan_rate();
        if rate > self.peak_scan_rate {
            self.peak_scan_rate = rate;
        }
    }

    pub fn connection_opened(&mut self) {
        self.active_connections += 1;
    }

    pub fn connection_closed(&mut self) {
        self.active_connections = self.active_connections.saturating_sub(1);
    }

    pub fn record_response_time(&mut self, ms: u64) {
        self.avg_response_ms = (1.0 - EMA_ALPHA) * self.avg_response_ms + EMA_ALPHA * ms as f64;
    }

    /// Tally a confirmed discovery.
    pub fn record_found(&mut self, entry: &ServerEntry) {
        self.total_found += 1;
        *self.by_version.entry(entry.version.clone()).or_insert(0) += 1;
        *self.by_country.entry(entry.country.clone()).or_insert(0) += 1;
        *self
            .by_player_bucket
            .entry(player_bucket(entry.players_online))
            .or_insert(0) += 1;
        self.record_motd(&entry.motd);
        if self
            .best
            .as_ref()
            .map(|b| entry.quality_score > b.quality_score)
            .unwrap_or(true)
        {
            self.best = Some(entry.clone());
        }
        self.last_found = Some(entry.clone());
    }

    fn record_motd(&mut self, motd: &str) {
        if let Some(count) = self.popular_motds.get_mut(motd) {
            if *count < MOTD_ENTRY_CAP {
                *count += 1;
            }
        } else if self.popular_motds.len() < MOTD_MAP_CAP {
            self.popular_motds.insert(motd.to_string(), 1);
        }
    }

    /// Zero volatile counters. Lifetime tallies (`total_found`,
    /// `by_version`, `by_country`) survive; the session clock restarts.
    pub fn reset_volatile(&mut self) {
        self.total_scanned = 0;
        self.duplicates_skipped = 0;
        self.errors = 0;
        self.timeouts = 0;
        self.connection_errors = 0;
        self.gc_invocations = 0;
        self.avg_response_ms = 0.0;
        self.peak_scan_rate = 0.0;
        self.by_player_bucket.clear();
        self.popular_motds.clear();
        self.last_found = None;
        self.best = None;
        self.started = Instant::now();
        self.started_at = now_rfc3339();
    }

    pub fn top_versions(&self, n: usize) -> Vec<(String, u64)> {
        top_n(&self.by_version, n)
    }

    pub fn top_countries(&self, n: usize) -> Vec<(String, u64)> {
        top_n(&self.by_country, n)
    }

    /// Snapshot for `session-stats.json`; maps serialize as `[key, value]`
    /// pairs ordered by descending count.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "total_scanned": self.total_scanned,
            "total_found": self.total_found,
            "duplicates_skipped": self.duplicates_skipped,
            "errors": self.errors,
            "timeouts": self.timeouts,
            "connection_errors": self.connection_errors,
            "active_connections": self.active_connections,
            "gc_invocations": self.gc_invocations,
            "avg_response_ms": self.avg_response_ms,
            "peak_scan_rate": self.peak_scan_rate,
            "started_at": self.started_at,
            "uptime_secs": self.uptime_secs(),
            "servers_by_version": pairs(&self.by_version),
            "servers_by_country": pairs(&self.by_country),
            "servers_by_player_count": bucket_pairs(&self.by_player_bucket),
            "popular_motds": pairs(&self.popular_motds),
            "last_found": &self.last_found,
            "best_server": &self.best,
        })
    }
}

fn sorted_desc(map: &HashMap<String, u64>) -> Vec<(String, u64)> {
    let mut v: Vec<(String, u64)> = map.iter().map(|(k, c)| (k.clone(), *c)).collect();
    v.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    v
}

fn top_n(map: &HashMap<String, u64>, n: usize) -> Vec<(String, u64)> {
    let mut v = sorted_desc(map);
    v.truncate(n);
    v
}

fn pairs(map: &HashMap<String, u64>) -> serde_json::Value {
    serde_json::json!(sorted_desc(map))
}

fn bucket_pairs(map: &HashMap<&'static str, u64>) -> serde_json::Value {
    // Fixed bucket order rather than by count.
    let v: Vec<(&str, u64)> = PLAYER_BUCKETS
        .iter()
        .map(|b| (*b, map.get(b).copied().unwrap_or(0)))
        .collect();
    serde_json::json!(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(version: &str, online: i64, motd: &str, quality: u8) -> ServerEntry {
        ServerEntry {
            ip: "203.0.113.1".parse().unwrap(),
            port: 25565,
            timestamp: now_rfc3339(),
            response_time_ms: 50,
            version: version.to_string(),
            protocol: Some(765),
            players_online: online,
            players_max: 100,
            player_sample: Vec::new(),
            description: serde_json::Value::Null,
            motd: motd.to_string(),
            has_favicon: false,
            modded: false,
            country: "Unknown".to_string(),
            quality_score: quality,
        }
    }

    #[test]
    fn found_never_exceeds_scanned() {
        let mut s = ScanStats::new();
        for _ in 0..100 {
            s.record_scan();
        }
        for _ in 0..7 {
            s.record_found(&entry("1.20.4", 3, "hi", 40));
        }
        assert!(s.total_found <= s.total_scanned);
    }

    #[test]
    fn ema_moves_toward_samples() {
        let mut s = ScanStats::new();
        for _ in 0..200 {
            s.record_response_time(100);
        }
        assert!((s.avg_response_ms - 100.0).abs() < 1.0);
    }

    #[test]
    fn player_buckets_cover_edges() {
        assert_eq!(player_bucket(0), "0");
        assert_eq!(player_bucket(1), "1-5");
        assert_eq!(player_bucket(5), "1-5");
        assert_eq!(player_bucket(6), "6-20");
        assert_eq!(player_bucket(20), "6-20");
        assert_eq!(player_bucket(21), "21-50");
        assert_eq!(player_bucket(51), "51-100");
        assert_eq!(player_bucket(100), "51-100");
        assert_eq!(player_bucket(101), "100+");
    }

    #[test]
    fn motd_tally_stops_at_entry_cap() {
        let mut s = ScanStats::new();
        for _ in 0..25 {
            s.record_motd("A Minecraft Server");
        }
        assert_eq!(s.popular_motds["A Minecraft Server"], MOTD_ENTRY_CAP);
    }

    #[test]
    fn motd_map_stops_growing_at_global_cap() {
        let mut s = ScanStats::new();
        for i in 0..(MOTD_MAP_CAP + 50) {
            s.record_motd(&format!("motd {i}"));
        }
        assert_eq!(s.popular_motds.len(), MOTD_MAP_CAP);
    }

    #[test]
    fn best_server_tracks_max_quality() {
        let mut s = ScanStats::new();
        s.record_found(&entry("1.20.4", 3, "a", 40));
        s.record_found(&entry("1.19.2", 0, "b", 75));
        s.record_found(&entry("1.8.9", 1, "c", 10));
        assert_eq!(s.best.as_ref().unwrap().quality_score, 75);
        assert_eq!(s.last_found.as_ref().unwrap().quality_score, 10);
    }

    #[test]
    fn reset_preserves_lifetime_tallies() {
        let mut s = ScanStats::new();
        s.record_scan();
        s.record_found(&entry("1.20.4", 3, "a", 40));
        s.errors = 5;
        s.reset_volatile();
        assert_eq!(s.total_scanned, 0);
        assert_eq!(s.errors, 0);
        assert_eq!(s.total_found, 1);
        assert_eq!(s.top_versions(10).len(), 1);
        assert!(s.best.is_none());
    }

    #[test]
    fn active_gauge_never_underflows() {
        let mut s = ScanStats::new();
        s.connection_opened();
        s.connection_closed();
        s.connection_closed();
        assert_eq!(s.active_connections, 0);
    }
}
