//! Candidate IPv4 address generation with pluggable draw strategies.

use std::net::Ipv4Addr;

use anyhow::{anyhow, Result};
use ipnet::Ipv4Net;
use rand::{thread_rng, Rng};

/// Blocks never probed: private, loopback, link-local, multicast, reserved.
pub const DEFAULT_EXCLUDES: [&str; 7] = [
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "224.0.0.0/4",
    "240.0.0.0/4",
];

/// Hosting-provider prefixes that colocate many game servers. Cheap to try,
/// occasionally lucky.
const POPULAR_RANGES: [&str; 6] = [
    "5.9.0.0/16",
    "51.38.0.0/16",
    "104.131.0.0/16",
    "136.243.0.0/16",
    "167.114.0.0/16",
    "192.99.0.0/16",
];

/// Rejection sampling gives up on the seen/blacklist predicate after this
/// many draws and settles for any public address.
const SAMPLE_ATTEMPTS: usize = 32;

pub fn default_excludes() -> Vec<Ipv4Net> {
    DEFAULT_EXCLUDES.iter().map(|s| s.parse().expect("builtin CIDR")).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    SmartRandom,
    Random,
    Range,
    Targeted,
}

pub fn parse_mode(s: &str) -> Result<ScanMode> {
    match s {
        "smart-random" => Ok(ScanMode::SmartRandom),
        "random" => Ok(ScanMode::Random),
        "range" => Ok(ScanMode::Range),
        "targeted" => Ok(ScanMode::Targeted),
        other => Err(anyhow!("unknown scan mode: {}", other)),
    }
}

/// Number of addresses a CIDR spans.
fn block_size(net: &Ipv4Net) -> u64 {
    1u64 << (32 - net.prefix_len())
}

/// Usable host addresses of a CIDR: network and broadcast are skipped for
/// prefixes shorter than /31.
fn host_bounds(net: &Ipv4Net) -> (u32, u32) {
    let base = u32::from(net.network());
    let size = block_size(net) as u32;
    if net.prefix_len() >= 31 {
        (base, base + size - 1)
    } else {
        (base + 1, base + size - 2)
    }
}

fn random_host_in(net: &Ipv4Net) -> Ipv4Addr {
    let (lo, hi) = host_bounds(net);
    Ipv4Addr::from(thread_rng().gen_range(lo..=hi))
}

/// Lazy candidate stream for one scan session.
pub struct AddrGen {
    mode: ScanMode,
    excludes: Vec<Ipv4Net>,
    ranges: Vec<Ipv4Net>,
    popular: Vec<Ipv4Net>,
    // Cursor into `ranges` for targeted enumeration.
    target_net: usize,
    target_next: Option<u32>,
}

impl AddrGen {
    /// `ranges` feeds the `range` and `targeted` modes and is ignored by the
    /// random modes.
    pub fn new(mode: ScanMode, excludes: Vec<Ipv4Net>, ranges: Vec<Ipv4Net>) -> Self {
        AddrGen {
            mode,
            excludes,
            ranges,
            popular: POPULAR_RANGES.iter().map(|s| s.parse().expect("builtin CIDR")).collect(),
            target_net: 0,
            target_next: None,
        }
    }

    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// An address is public iff no excluded block contains it.
    pub fn is_public(&self, ip: Ipv4Addr) -> bool {
        !self.excludes.iter().any(|net| net.contains(&ip))
    }

    /// Draw the next candidate. `reject` reports addresses already seen or
    /// blacklisted. Returns `None` only once a bounded target list is
    /// exhausted.
    pub fn next(
        &mut self,
        last_found: Option<Ipv4Addr>,
        reject: impl Fn(Ipv4Addr) -> bool,
    ) -> Option<Ipv4Addr> {
        match self.mode {
            ScanMode::Random => Some(self.random_public(&reject)),
            ScanMode::SmartRandom => Some(self.smart(last_found, &reject)),
            ScanMode::Range => self.random_in_ranges(&reject),
            ScanMode::Targeted => self.next_target(&reject),
        }
    }

    /// Strategy (a): uniform draws rejection-sampled against the excludes
    /// and the reject predicate.
    fn random_public(&self, reject: &impl Fn(Ipv4Addr) -> bool) -> Ipv4Addr {
        let mut rng = thread_rng();
        for _ in 0..SAMPLE_ATTEMPTS {
            let ip = Ipv4Addr::from(rng.gen::<u32>());
            if self.is_public(ip) && !reject(ip) {
                return ip;
            }
        }
        // Settle for any public address.
        loop {
            let ip = Ipv4Addr::from(rng.gen::<u32>());
            if self.is_public(ip) {
                return ip;
            }
        }
    }

    fn smart(&self, last_found: Option<Ipv4Addr>, reject: &impl Fn(Ipv4Addr) -> bool) -> Ipv4Addr {
        match thread_rng().gen_range(0..3u8) {
            1 => {
                if let Some(ip) = self.cluster(last_found, reject) {
                    return ip;
                }
                self.random_public(reject)
            }
            2 => {
                if let Some(ip) = self.popular_range(reject) {
                    return ip;
                }
                self.random_public(reject)
            }
            _ => self.random_public(reject),
        }
    }

    /// Strategy (b): reuse the /24 of the last discovery.
    fn cluster(&self, last_found: Option<Ipv4Addr>, reject: &impl Fn(Ipv4Addr) -> bool) -> Option<Ipv4Addr> {
        let base = last_found?;
        let [a, b, c, _] = base.octets();
        let mut rng = thread_rng();
        for _ in 0..SAMPLE_ATTEMPTS {
            let ip = Ipv4Addr::new(a, b, c, rng.gen());
            if self.is_public(ip) && !reject(ip) {
                return Some(ip);
            }
        }
        None
    }

    /// Strategy (c): a random host inside a well-known hosting prefix.
    fn popular_range(&self, reject: &impl Fn(Ipv4Addr) -> bool) -> Option<Ipv4Addr> {
        let mut rng = thread_rng();
        for _ in 0..SAMPLE_ATTEMPTS {
            let net = self.popular[rng.gen_range(0..self.popular.len())];
            let ip = random_host_in(&net);
            if self.is_public(ip) && !reject(ip) {
                return Some(ip);
            }
        }
        None
    }

    /// Uniform draw over the union of the configured ranges, weighted by
    /// block size.
    fn random_in_ranges(&self, reject: &impl Fn(Ipv4Addr) -> bool) -> Option<Ipv4Addr> {
        if self.ranges.is_empty() {
            return None;
        }
        let total: u64 = self.ranges.iter().map(block_size).sum();
        let mut rng = thread_rng();
        let pick = |rng: &mut rand::rngs::ThreadRng| {
            let mut offset = rng.gen_range(0..total);
            for net in &self.ranges {
                let size = block_size(net);
                if offset < size {
                    let (lo, hi) = host_bounds(net);
                    let ip = u32::from(net.network()) + offset as u32;
                    return Ipv4Addr::from(ip.clamp(lo, hi));
                }
                offset -= size;
            }
            random_host_in(&self.ranges[self.ranges.len() - 1])
        };
        for _ in 0..SAMPLE_ATTEMPTS {
            let ip = pick(&mut rng);
            if self.is_public(ip) && !reject(ip) {
                return Some(ip);
            }
        }
        // Relax to the excludes predicate alone, then give up.
        for _ in 0..SAMPLE_ATTEMPTS * 8 {
            let ip = pick(&mut rng);
            if self.is_public(ip) {
                return Some(ip);
            }
        }
        None
    }

    /// Enumerate operator-supplied blocks in order; the only bounded mode.
    fn next_target(&mut self, reject: &impl Fn(Ipv4Addr) -> bool) -> Option<Ipv4Addr> {
        loop {
            let net = self.ranges.get(self.target_net)?;
            let (lo, hi) = host_bounds(net);
            let cur = self.target_next.unwrap_or(lo);
            if cur >= hi {
                self.target_net += 1;
                self.target_next = None;
            } else {
                self.target_next = Some(cur + 1);
            }
            let ip = Ipv4Addr::from(cur);
            if cur <= hi && self.is_public(ip) && !reject(ip) {
                return Some(ip);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nets(specs: &[&str]) -> Vec<Ipv4Net> {
        specs.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn random_mode_never_draws_excluded_ranges() {
        let mut gen = AddrGen::new(ScanMode::Random, default_excludes(), Vec::new());
        for _ in 0..10_000 {
            let ip = gen.next(None, |_| false).unwrap();
            assert_ne!(ip.octets()[0], 10, "drew {ip} inside 10.0.0.0/8");
            assert_ne!(ip.octets()[0], 127);
            assert!(ip.octets()[0] < 224);
        }
    }

    #[test]
    fn cluster_keeps_the_top_three_octets() {
        let gen = AddrGen::new(ScanMode::SmartRandom, default_excludes(), Vec::new());
        let last = "203.0.113.7".parse().unwrap();
        let ip = gen.cluster(Some(last), &|_| false).unwrap();
        assert_eq!(ip.octets()[..3], [203, 0, 113]);
    }

    #[test]
    fn cluster_falls_through_on_excluded_base() {
        let gen = AddrGen::new(ScanMode::SmartRandom, default_excludes(), Vec::new());
        let last = "10.1.2.3".parse().unwrap();
        assert!(gen.cluster(Some(last), &|_| false).is_none());
    }

    #[test]
    fn range_mode_stays_inside_the_union() {
        let ranges = nets(&["198.51.100.0/24", "203.0.113.0/24"]);
        let mut gen = AddrGen::new(ScanMode::Range, default_excludes(), ranges.clone());
        for _ in 0..1_000 {
            let ip = gen.next(None, |_| false).unwrap();
            assert!(ranges.iter().any(|n| n.contains(&ip)), "drew {ip} outside ranges");
        }
    }

    #[test]
    fn targeted_mode_enumerates_then_exhausts() {
        let mut gen = AddrGen::new(ScanMode::Targeted, default_excludes(), nets(&["192.0.2.0/30"]));
        let a = gen.next(None, |_| false).unwrap();
        let b = gen.next(None, |_| false).unwrap();
        assert_eq!(a, "192.0.2.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(b, "192.0.2.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(gen.next(None, |_| false), None);
    }

    #[test]
    fn targeted_mode_honors_the_reject_predicate() {
        let mut gen = AddrGen::new(ScanMode::Targeted, default_excludes(), nets(&["192.0.2.0/30"]));
        let skip: Ipv4Addr = "192.0.2.1".parse().unwrap();
        let got = gen.next(None, |ip| ip == skip).unwrap();
        assert_eq!(got, "192.0.2.2".parse::<Ipv4Addr>().unwrap());
    }
}
