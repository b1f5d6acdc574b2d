// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::IpAddr;

use super::*;
use crate::config::{RateLimitConfig, SecurityConfig};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[test]
fn test_policy_parses_cidrs_and_bare_ips() {
    let policy = SecurityPolicy::from_config(&SecurityConfig {
        ip_blacklist: vec![
            "192.168.1.0/24".into(),
            "10.0.0.7".into(),
            "2001:db8::/32".into(),
            "not-an-ip".into(),
            "300.1.2.3".into(),
        ],
        ..Default::default()
    });

    assert!(policy.is_ip_blocked(ip("192.168.1.5")));
    assert!(policy.is_ip_blocked(ip("192.168.1.255")));
    assert!(!policy.is_ip_blocked(ip("192.168.2.5")));
    assert!(policy.is_ip_blocked(ip("10.0.0.7")));
    assert!(!policy.is_ip_blocked(ip("10.0.0.8")));
    assert!(policy.is_ip_blocked(ip("2001:db8:1::1")));

    // Malformed entries vanish instead of poisoning the policy.
    let exported = policy.to_config();
    assert_eq!(exported.ip_blacklist.len(), 3);
}

#[test]
fn test_empty_country_set_admits_everyone() {
    let policy = SecurityPolicy::from_config(&SecurityConfig::default());
    assert!(policy.is_country_allowed("US"));
    assert!(policy.is_country_allowed("ZZ"));

    let fenced = SecurityPolicy::from_config(&SecurityConfig {
        allowed_countries: vec!["US".into(), "BR".into(), "DE".into()],
        ..Default::default()
    });
    assert!(fenced.is_country_allowed("US"));
    assert!(!fenced.is_country_allowed("Local"));
    assert!(!fenced.is_country_allowed("CN"));
}

#[test]
fn test_rate_limit_config_passes_through() {
    let policy = SecurityPolicy::from_config(&SecurityConfig {
        rate_limit: RateLimitConfig {
            enabled: true,
            rps: 0.5,
            burst: 3,
        },
        ..Default::default()
    });
    assert!(policy.rate_limit.enabled);
    assert_eq!(policy.rate_limit.rps, 0.5);
    assert_eq!(policy.rate_limit.burst, 3);
}

#[test]
fn test_static_geo_resolver_mapping() {
    let geo = StaticGeoResolver;
    assert_eq!(geo.resolve(ip("127.0.0.1")), "Local");
    assert_eq!(geo.resolve(ip("::1")), "Local");
    assert_eq!(geo.resolve(ip("8.8.8.8")), "US");

    // Deterministic for any given address.
    let a = geo.resolve(ip("1.2.3.4"));
    assert_eq!(geo.resolve(ip("1.2.3.4")), a);
    assert!(a == "BR" || a == "DE");
}

#[test]
fn test_rate_limiter_enforces_burst_then_denies() {
    let limiter = IpRateLimiter::new(0.1, 1);
    let client = ip("10.1.1.1");

    assert!(limiter.check(client));
    assert!(!limiter.check(client));

    // A different address has its own bucket.
    assert!(limiter.check(ip("10.1.1.2")));
}

#[test]
fn test_rate_limiter_burst_capacity() {
    let limiter = IpRateLimiter::new(1.0, 5);
    let client = ip("10.2.2.2");
    for _ in 0..5 {
        assert!(limiter.check(client));
    }
    assert!(!limiter.check(client));
}

#[test]
fn test_rate_limiter_tracks_distinct_ips() {
    let limiter = IpRateLimiter::new(10.0, 10);
    for octet in 1..=20u8 {
        limiter.check(ip(&format!("172.16.0.{octet}")));
    }
    assert_eq!(limiter.tracked_ips(), 20);
}
