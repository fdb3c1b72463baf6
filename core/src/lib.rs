//! Core types and shared state for the scanner engine.

pub mod ratelimiter;
pub mod stats;

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Current wall-clock time as an RFC 3339 string.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::new())
}

/// A discovered server after enrichment, as persisted to the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub timestamp: String,
    pub response_time_ms: u64,
    pub version: String,
    pub protocol: Option<i64>,
    pub players_online: i64,
    pub players_max: i64,
    pub player_sample: Vec<String>,
    /// The `description` field exactly as the server sent it.
    pub description: serde_json::Value,
    /// Description flattened to text with `§x` formatting codes removed.
    pub motd: String,
    pub has_favicon: bool,
    pub modded: bool,
    pub country: String,
    pub quality_score: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!version().is_empty());
    }

    #[test]
    fn rfc3339_has_date_separator() {
        assert!(now_rfc3339().contains('T'));
    }
}
