//! Turns a raw status response into a catalog record: MOTD normalization,
//! modded detection, quality scoring, and the hostname country hint.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use mcscan_core::{now_rfc3339, ServerEntry};
use slp_probe::RawStatus;

pub const UNKNOWN: &str = "Unknown";

const MODDED_MARKERS: [&str; 11] = [
    "forge", "fabric", "bukkit", "spigot", "paper", "sponge", "mod", "plugin", "cauldron",
    "mohist", "magma",
];

/// First match against the PTR hostname wins.
const COUNTRY_HINTS: [(&str, &str); 12] = [
    ("us", "United States"),
    ("uk", "United Kingdom"),
    ("de", "Germany"),
    ("fr", "France"),
    ("nl", "Netherlands"),
    ("au", "Australia"),
    ("ca", "Canada"),
    ("jp", "Japan"),
    ("kr", "South Korea"),
    ("br", "Brazil"),
    ("ru", "Russia"),
    ("cn", "China"),
];

/// Flatten a `description` value to plain text: a bare string, an object's
/// `.text`, plus the `.text` of each `extra` part.
pub fn description_text(desc: &serde_json::Value) -> String {
    match desc {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(obj) => {
            let mut out = String::new();
            if let Some(t) = obj.get("text").and_then(|t| t.as_str()) {
                out.push_str(t);
            }
            if let Some(extra) = obj.get("extra").and_then(|e| e.as_array()) {
                for part in extra {
                    if let Some(t) = part.as_str() {
                        out.push_str(t);
                    } else if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                        out.push_str(t);
                    }
                }
            }
            out
        }
        _ => String::new(),
    }
}

fn is_format_code(c: char) -> bool {
    matches!(c, '0'..='9' | 'a'..='f' | 'k'..='o' | 'r')
}

/// Remove `§x` color/format codes, leaving any lone `§` alone.
pub fn strip_formatting(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut it = s.chars().peekable();
    while let Some(c) = it.next() {
        if c == '§' && it.peek().copied().map(is_format_code).unwrap_or(false) {
            it.next();
            continue;
        }
        out.push(c);
    }
    out
}

/// Normalized MOTD; absent or blank descriptions become `No description`.
pub fn motd_of(desc: &serde_json::Value) -> String {
    let text = strip_formatting(&description_text(desc));
    if text.trim().is_empty() {
        "No description".to_string()
    } else {
        text
    }
}

pub fn detect_modded(raw: &str) -> bool {
    let lower = raw.to_lowercase();
    MODDED_MARKERS.iter().any(|m| lower.contains(m))
}

pub fn country_for_hostname(hostname: &str) -> &'static str {
    let lower = hostname.to_lowercase();
    for (needle, country) in COUNTRY_HINTS {
        if lower.contains(needle) {
            return country;
        }
    }
    UNKNOWN
}

pub fn quality_score(players_online: i64, motd: &str, version: &str, response_time_ms: u64) -> u8 {
    let mut score: u32 = 0;
    if players_online > 0 {
        score += 20;
    }
    if players_online > 10 {
        score += 20;
    }
    if players_online > 50 {
        score += 20;
    }
    if motd.len() > 10 {
        score += 15;
    }
    if ["1.21", "1.20", "1.19", "1.18"].iter().any(|v| version.contains(v)) {
        score += 15;
    }
    if response_time_ms < 100 {
        score += 10;
    }
    score.min(100) as u8
}

/// Reverse-resolve `ip` with a hard deadline. Failures and timeouts degrade
/// to `None`; the lookup thread is left to finish on its own.
pub async fn reverse_hostname(ip: Ipv4Addr, deadline: Duration) -> Option<String> {
    let task = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&IpAddr::V4(ip)).ok());
    match tokio::time::timeout(deadline, task).await {
        Ok(Ok(host)) => host,
        _ => None,
    }
}

/// Build the catalog record for a successful probe. Deterministic for a
/// given response and hostname, timestamp aside.
pub fn enrich(
    ip: Ipv4Addr,
    port: u16,
    status: &RawStatus,
    response_time_ms: u64,
    hostname: Option<&str>,
) -> ServerEntry {
    let version = status.version_name.clone().unwrap_or_else(|| UNKNOWN.to_string());
    let motd = motd_of(&status.description);
    let quality_score = quality_score(status.players_online, &motd, &version, response_time_ms);
    ServerEntry {
        ip,
        port,
        timestamp: now_rfc3339(),
        response_time_ms,
        version,
        protocol: status.protocol,
        players_online: status.players_online,
        players_max: status.players_max,
        player_sample: status.player_sample.clone(),
        description: status.description.clone(),
        motd,
        has_favicon: status.has_favicon,
        modded: detect_modded(&status.raw),
        country: hostname.map(country_for_hostname).unwrap_or(UNKNOWN).to_string(),
        quality_score,
    }
}
