// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Security policy - IP blocklist, geo-fence and rate-limit state.
//!
//! [`SecurityPolicy`] is the parsed form of the `security:` config section.
//! Parsing is best-effort: each blocklist entry is tried as a CIDR first,
//! then as a bare address; entries that are neither are dropped. The policy
//! lives behind a mutex on the gateway and is swapped wholesale on reload;
//! readers hold the lock just long enough to copy out what they need.
//!
//! Geo resolution is pluggable through [`GeoResolver`]. The bundled
//! [`StaticGeoResolver`] is a deterministic stand-in - loopback maps to
//! "Local", a known public resolver address to "US", everything else to a
//! stable tag - and can be replaced by an MMDB-backed implementation
//! without touching the middleware.

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use ipnet::IpNet;

use crate::config::{RateLimitConfig, SecurityConfig};

/// The per-IP bucket map is discarded wholesale once it reaches this many
/// entries, bounding memory at the cost of a fresh burst for recent clients.
pub const RATE_LIMITER_MAP_MAX_SIZE: usize = 100_000;

/// Parsed security configuration.
#[derive(Debug, Clone, Default)]
pub struct SecurityPolicy {
    exact_ips: HashSet<IpAddr>,
    cidrs: Vec<IpNet>,
    allowed_countries: HashSet<String>,
    pub rate_limit: RateLimitConfig,
}

impl SecurityPolicy {
    /// Parse the raw config section. Malformed blocklist entries are
    /// dropped; security config is best-effort by design.
    pub fn from_config(cfg: &SecurityConfig) -> Self {
        let mut exact_ips = HashSet::new();
        let mut cidrs = Vec::new();

        for entry in &cfg.ip_blacklist {
            if let Ok(net) = entry.parse::<IpNet>() {
                cidrs.push(net);
            } else if let Ok(ip) = entry.parse::<IpAddr>() {
                exact_ips.insert(ip);
            } else {
                log::debug!("ignoring malformed ip_blacklist entry: {entry:?}");
            }
        }

        Self {
            exact_ips,
            cidrs,
            allowed_countries: cfg.allowed_countries.iter().cloned().collect(),
            rate_limit: cfg.rate_limit.clone(),
        }
    }

    /// True when the address is blocklisted, exactly or by CIDR containment.
    pub fn is_ip_blocked(&self, ip: IpAddr) -> bool {
        self.exact_ips.contains(&ip) || self.cidrs.iter().any(|net| net.contains(&ip))
    }

    /// An empty allowed-country set admits everyone.
    pub fn is_country_allowed(&self, country: &str) -> bool {
        self.allowed_countries.is_empty() || self.allowed_countries.contains(country)
    }

    pub fn has_blocklist(&self) -> bool {
        !self.exact_ips.is_empty() || !self.cidrs.is_empty()
    }

    /// Export back to config form, for operator commands that inspect or
    /// edit the live policy.
    pub fn to_config(&self) -> SecurityConfig {
        let mut ip_blacklist: Vec<String> =
            self.exact_ips.iter().map(|ip| ip.to_string()).collect();
        ip_blacklist.extend(self.cidrs.iter().map(|net| net.to_string()));
        SecurityConfig {
            ip_blacklist,
            allowed_countries: self.allowed_countries.iter().cloned().collect(),
            rate_limit: self.rate_limit.clone(),
        }
    }
}

/// Resolves a client address to a country tag. Implementations must be
/// deterministic per address within a process lifetime.
pub trait GeoResolver: fmt::Debug + Send + Sync {
    fn resolve(&self, ip: IpAddr) -> String;
}

/// Deterministic placeholder resolver.
#[derive(Debug, Default)]
pub struct StaticGeoResolver;

impl GeoResolver for StaticGeoResolver {
    fn resolve(&self, ip: IpAddr) -> String {
        if ip.is_loopback() {
            return "Local".to_string();
        }
        let text = ip.to_string();
        if text == "8.8.8.8" {
            return "US".to_string();
        }
        // Stable pseudo-mapping so repeated requests from one address agree.
        if text.len() % 2 == 0 {
            "BR".to_string()
        } else {
            "DE".to_string()
        }
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token-bucket limiter keyed by client IP.
///
/// Each address gets its own GCRA bucket with the configured sustained rate
/// and burst. The map is guarded by a mutex held only for the lookup; the
/// bucket check itself runs lock-free outside it.
#[derive(Debug)]
pub struct IpRateLimiter {
    buckets: Mutex<HashMap<IpAddr, Arc<DirectLimiter>>>,
    quota: Quota,
}

impl IpRateLimiter {
    /// Build from sustained `rps` (fractional rates are honored: 0.1 means
    /// one request every ten seconds) and `burst` capacity. Non-positive
    /// values are clamped to the slowest expressible quota.
    pub fn new(rps: f64, burst: u32) -> Self {
        let period = if rps > 0.0 {
            Duration::from_secs_f64(1.0 / rps)
        } else {
            Duration::from_secs(3600)
        };
        let burst = NonZeroU32::new(burst.max(1)).unwrap();
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::new(1).unwrap()))
            .allow_burst(burst);
        Self {
            buckets: Mutex::new(HashMap::new()),
            quota,
        }
    }

    /// True when the request is admitted; false when the bucket is empty.
    pub fn check(&self, ip: IpAddr) -> bool {
        let limiter = {
            let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
            if buckets.len() >= RATE_LIMITER_MAP_MAX_SIZE {
                buckets.clear();
            }
            buckets
                .entry(ip)
                .or_insert_with(|| Arc::new(RateLimiter::direct(self.quota)))
                .clone()
        };
        limiter.check().is_ok()
    }

    pub fn tracked_ips(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
