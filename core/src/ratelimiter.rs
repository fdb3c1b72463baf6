//! Per-/24 admission control and the session blacklist.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Defer,
}

/// The /24 an address belongs to, as its top three octets.
pub fn subnet_of(ip: Ipv4Addr) -> u32 {
    u32::from(ip) >> 8
}

/// Tracks the last admitted probe per /24 subnet; at most one probe is
/// admitted per subnet per window.
pub struct RateLimiter {
    window: Duration,
    last_admit: HashMap<u32, Instant>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        RateLimiter { window, last_admit: HashMap::new() }
    }

    /// Admit or defer `ip` as of `now`. Admission takes the subnet's slot
    /// for the next window.
    pub fn admit_at(&mut self, ip: Ipv4Addr, now: Instant) -> Admission {
        let key = subnet_of(ip);
        if let Some(&t) = self.last_admit.get(&key) {
            if now.duration_since(t) < self.window {
                return Admission::Defer;
            }
        }
        self.last_admit.insert(key, now);
        Admission::Allow
    }

    pub fn admit(&mut self, ip: Ipv4Addr) -> Admission {
        self.admit_at(ip, Instant::now())
    }

    /// Drop subnet entries last touched more than `max_age` ago. Returns the
    /// number removed.
    pub fn reap_at(&mut self, max_age: Duration, now: Instant) -> usize {
        let before = self.last_admit.len();
        self.last_admit.retain(|_, t| now.duration_since(*t) <= max_age);
        before - self.last_admit.len()
    }

    pub fn reap(&mut self, max_age: Duration) -> usize {
        self.reap_at(max_age, Instant::now())
    }

    pub fn len(&self) -> usize {
        self.last_admit.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_admit.is_empty()
    }
}

/// Addresses whose retry budget was exhausted. Grows monotonically within a
/// session.
#[derive(Debug, Default)]
pub struct Blacklist {
    set: HashSet<u32>,
}

impl Blacklist {
    pub fn new() -> Self {
        Blacklist::default()
    }

    pub fn insert(&mut self, ip: Ipv4Addr) -> bool {
        self.set.insert(u32::from(ip))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.set.contains(&u32::from(ip))
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Combined admission gate: blacklist membership first, then the per-subnet
/// window.
pub struct Gate {
    pub limiter: RateLimiter,
    pub blacklist: Blacklist,
}

impl Gate {
    pub fn new(window: Duration) -> Self {
        Gate { limiter: RateLimiter::new(window), blacklist: Blacklist::new() }
    }

    pub fn admit_at(&mut self, ip: Ipv4Addr, now: Instant) -> Admission {
        if self.blacklist.contains(ip) {
            return Admission::Defer;
        }
        self.limiter.admit_at(ip, now)
    }

    pub fn admit(&mut self, ip: Ipv4Addr) -> Admission {
        self.admit_at(ip, Instant::now())
    }
}
