// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use hyper::http::Method;
use prometheus::Registry;

use super::resolver::host_matches;
use super::*;
use crate::config::{
    ApiConfig, Config, KeyConfig, ProductConfig, RateLimitConfig, SecurityConfig,
    SubscriptionConfig,
};
use crate::hub::TrafficAction;
use crate::store::hash_key;

fn test_request(method: Method, host: &str, path: &str, remote: &str) -> GatewayRequest {
    GatewayRequest {
        method,
        host: host.to_string(),
        path: path.to_string(),
        query: None,
        headers: HeaderMap::new(),
        remote_addr: remote.parse().unwrap(),
        body: reqwest::Body::from(""),
        started_at: Instant::now(),
    }
}

fn keyed_request(host: &str, path: &str, remote: &str, api_key: &str) -> GatewayRequest {
    let mut req = test_request(Method::GET, host, path, remote);
    req.headers.insert(
        hyper::http::HeaderName::from_static(API_KEY_HEADER),
        HeaderValue::from_str(api_key).unwrap(),
    );
    req
}

struct Harness {
    gateway: Gateway,
    store: Arc<CatalogStore>,
    traffic_rx: tokio::sync::mpsc::Receiver<TrafficEvent>,
}

fn harness(cfg: Config) -> Harness {
    let cfg = Arc::new(cfg);
    let store = Arc::new(CatalogStore::new());
    store.populate_from_config(&cfg);
    let registry = Registry::new();
    let meter = Arc::new(Meter::new(store.clone(), &registry).unwrap());
    let hub = Arc::new(Broadcaster::new());
    let traffic_rx = hub.take_traffic_receiver().unwrap();
    let gateway = Gateway::new(cfg, store.clone(), meter, hub).unwrap();
    Harness {
        gateway,
        store,
        traffic_rx,
    }
}

fn routed_config(backend_url: &str) -> Config {
    let mut cfg = Config::empty();
    cfg.products = vec![ProductConfig {
        name: "P1".into(),
        slug: "p1".into(),
        description: String::new(),
        apis: vec![ApiConfig {
            name: "a1".into(),
            path_prefix: "/api1".into(),
            backend_url: backend_url.into(),
            ..Default::default()
        }],
    }];
    cfg
}

#[test]
fn test_host_matching() {
    assert!(host_matches("example.com", "example.com"));
    assert!(host_matches("example.com:8080", "example.com"));
    assert!(host_matches("[::1]:8080", "::1"));

    assert!(host_matches("x.example.com", "*.example.com"));
    assert!(host_matches("a.b.example.com", "*.example.com"));
    assert!(!host_matches("example.com", "*.example.com"));
    assert!(!host_matches("xexample.com", "*.example.com"));

    assert!(!host_matches("other.com", "example.com"));
}

#[test]
fn test_resolver_host_beats_path_only() {
    let mut cfg = Config::empty();
    cfg.products = vec![ProductConfig {
        name: "P".into(),
        slug: "p".into(),
        description: String::new(),
        apis: vec![
            ApiConfig {
                name: "any-host".into(),
                path_prefix: "/api".into(),
                backend_url: "http://fallback".into(),
                ..Default::default()
            },
            ApiConfig {
                name: "host-bound".into(),
                host: "api.example.com".into(),
                path_prefix: "/api".into(),
                backend_url: "http://host-bound".into(),
                ..Default::default()
            },
        ],
    }];
    let store = Arc::new(CatalogStore::new());
    let resolver = RouteResolver::new(Arc::new(cfg), store);

    // The host-qualified API wins even though it is listed second.
    let route = resolver
        .resolve("api.example.com:443", "/api/x", "")
        .unwrap();
    assert_eq!(route.backend_name, "host-bound");

    // Another host falls back to the host-less API.
    let route = resolver.resolve("other.com", "/api/x", "").unwrap();
    assert_eq!(route.backend_name, "any-host");

    // No prefix match at all.
    assert!(resolver.resolve("other.com", "/nope", "").is_none());
}

fn subscribed_config() -> Config {
    let mut cfg = routed_config("http://config-level");
    cfg.subscriptions = vec![SubscriptionConfig {
        developer_id: "dev-1".into(),
        product_slug: "p1".into(),
        tenant_id: "acme".into(),
        plan: "gold".into(),
        keys: vec![KeyConfig {
            name: "primary".into(),
            value: "key_abcdef0123456789".into(),
        }],
    }];
    cfg
}

#[test]
fn test_resolver_key_binding_supersedes_config_api() {
    let cfg = Arc::new(subscribed_config());
    let store = Arc::new(CatalogStore::new());
    store.populate_from_config(&cfg);
    let resolver = RouteResolver::new(cfg, store.clone());

    let route = resolver
        .resolve("localhost", "/api1/x", "key_abcdef0123456789")
        .unwrap();
    assert!(route.key_bound);
    let sub = route.subscription.as_ref().unwrap();
    assert_eq!(sub.tenant_id, "acme");
    // The store definition carries the authoritative backend.
    assert!(route.api_definition_id > 0);
    assert_eq!(route.backend_name, "a1");
    // Metering still uses the config-level prefix.
    assert_eq!(route.metering_prefix, "/api1");

    // Last-used was stamped on the key.
    let key = store
        .get_key_by_hash(&hash_key("key_abcdef0123456789"))
        .unwrap();
    assert!(key.last_used_at >= Utc::now() - ChronoDuration::seconds(5));
}

#[test]
fn test_resolver_prefix_lookup_fallback() {
    let cfg = Arc::new(subscribed_config());
    let store = Arc::new(CatalogStore::new());
    store.populate_from_config(&cfg);
    let resolver = RouteResolver::new(cfg, store);

    // A truncated key that still matches the stored 8-char prefix binds
    // via the fallback index.
    let route = resolver.resolve("localhost", "/api1/x", "key_abcd").unwrap();
    assert!(route.key_bound);
}

#[test]
fn test_resolver_unknown_or_inactive_key_is_anonymous() {
    let cfg = Arc::new(subscribed_config());
    let store = Arc::new(CatalogStore::new());
    store.populate_from_config(&cfg);
    let resolver = RouteResolver::new(cfg.clone(), store.clone());

    let route = resolver
        .resolve("localhost", "/api1/x", "totally-wrong-key")
        .unwrap();
    assert!(!route.key_bound);
    assert!(route.subscription.is_none());
    assert_eq!(route.api_definition_id, 0);

    // Deactivate the key: same fall-through.
    let key = store
        .get_key_by_hash(&hash_key("key_abcdef0123456789"))
        .unwrap();
    store.set_key_active(key.id, false);
    let route = resolver
        .resolve("localhost", "/api1/x", "key_abcdef0123456789")
        .unwrap();
    assert!(!route.key_bound);
}

#[tokio::test]
async fn test_no_route_is_metered_and_published() {
    let mut h = harness(Config::empty());
    let resp = h
        .gateway
        .handle(test_request(Method::GET, "localhost", "/anything", "9.9.9.9:1000"))
        .await;
    assert_eq!(resp.status, 404);

    let usage = h.store.usage_since(Utc::now() - ChronoDuration::seconds(5));
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].status_code, 404);
    assert_eq!(usage[0].path, "");

    let ev = h.traffic_rx.try_recv().unwrap();
    assert_eq!(ev.action, TrafficAction::Allowed);
    assert_eq!(ev.status, 404);
    assert_eq!(ev.backend, "");
}

#[tokio::test]
async fn test_blocked_ip_short_circuits() {
    let mut cfg = routed_config("http://127.0.0.1:1");
    cfg.security = SecurityConfig {
        ip_blacklist: vec!["192.168.1.0/24".into()],
        ..Default::default()
    };
    let mut h = harness(cfg);

    let resp = h
        .gateway
        .handle(test_request(Method::GET, "localhost", "/api1/x", "192.168.1.5:1000"))
        .await;
    assert_eq!(resp.status, 403);
    assert_eq!(h.gateway.stats().0, 1);

    let ev = h.traffic_rx.try_recv().unwrap();
    assert_eq!(ev.action, TrafficAction::Blocked);
    assert_eq!(ev.status, 403);
    assert_eq!(ev.ip, "192.168.1.5");

    // The forwarder never ran: no usage row, no further event.
    assert!(h
        .store
        .usage_since(Utc::now() - ChronoDuration::seconds(5))
        .is_empty());
    assert!(h.traffic_rx.try_recv().is_err());

    // A clean address flows through to the forwarder.
    let resp = h
        .gateway
        .handle(test_request(Method::GET, "localhost", "/api1/x", "192.168.2.5:1000"))
        .await;
    assert_ne!(resp.status, 403);
}

#[tokio::test]
async fn test_rate_limit_denies_second_request() {
    let mut cfg = Config::empty();
    cfg.security = SecurityConfig {
        rate_limit: RateLimitConfig {
            enabled: true,
            rps: 0.1,
            burst: 1,
        },
        ..Default::default()
    };
    let mut h = harness(cfg);

    let first = h
        .gateway
        .handle(test_request(Method::GET, "localhost", "/x", "10.0.0.9:1000"))
        .await;
    assert_eq!(first.status, 404); // admitted, then no route

    let second = h
        .gateway
        .handle(test_request(Method::GET, "localhost", "/x", "10.0.0.9:1001"))
        .await;
    assert_eq!(second.status, 429);
    assert_eq!(h.gateway.stats().1, 1);

    // Another client is unaffected.
    let other = h
        .gateway
        .handle(test_request(Method::GET, "localhost", "/x", "10.0.0.10:1000"))
        .await;
    assert_eq!(other.status, 404);

    let allowed_404 = h.traffic_rx.try_recv().unwrap();
    assert_eq!(allowed_404.action, TrafficAction::Allowed);
    let limited = h.traffic_rx.try_recv().unwrap();
    assert_eq!(limited.action, TrafficAction::RateLimit);
    assert_eq!(limited.status, 429);
}

#[tokio::test]
async fn test_geo_fence_blocks_and_tags() {
    let mut cfg = Config::empty();
    cfg.security = SecurityConfig {
        allowed_countries: vec!["US".into(), "BR".into(), "DE".into()],
        ..Default::default()
    };
    let mut h = harness(cfg);

    // 8.8.8.8 resolves to US: admitted (then 404 for lack of routes), and
    // the forwarded request carried the country tag into the event.
    let resp = h
        .gateway
        .handle(test_request(Method::GET, "localhost", "/x", "8.8.8.8:1000"))
        .await;
    assert_eq!(resp.status, 404);
    let ev = h.traffic_rx.try_recv().unwrap();
    assert_eq!(ev.country, "US");

    // Loopback resolves to "Local", which the fence rejects.
    let resp = h
        .gateway
        .handle(test_request(Method::GET, "localhost", "/x", "127.0.0.1:1000"))
        .await;
    assert_eq!(resp.status, 403);
    let ev = h.traffic_rx.try_recv().unwrap();
    assert_eq!(ev.action, TrafficAction::Blocked);
    assert_eq!(ev.country, "Local");
}

#[tokio::test]
async fn test_update_config_applies_to_subsequent_requests() {
    let mut h = harness(Config::empty());

    let resp = h
        .gateway
        .handle(test_request(Method::GET, "localhost", "/x", "192.168.1.5:1000"))
        .await;
    assert_eq!(resp.status, 404);

    let mut cfg = Config::empty();
    cfg.security = SecurityConfig {
        ip_blacklist: vec!["192.168.1.0/24".into()],
        ..Default::default()
    };
    h.gateway.update_config(cfg);

    let resp = h
        .gateway
        .handle(test_request(Method::GET, "localhost", "/x", "192.168.1.5:1000"))
        .await;
    assert_eq!(resp.status, 403);
}

#[tokio::test]
async fn test_update_security_takes_effect_without_rebuild() {
    let h = harness(Config::empty());

    let resp = h
        .gateway
        .handle(test_request(Method::GET, "localhost", "/x", "127.0.0.1:1000"))
        .await;
    assert_eq!(resp.status, 404);

    h.gateway.update_security(&SecurityConfig {
        allowed_countries: vec!["US".into()],
        ..Default::default()
    });

    let resp = h
        .gateway
        .handle(test_request(Method::GET, "localhost", "/x", "127.0.0.1:1000"))
        .await;
    assert_eq!(resp.status, 403);

    let exported = h.gateway.get_security();
    assert_eq!(exported.allowed_countries, vec!["US"]);
}

#[tokio::test]
async fn test_bad_backend_url_is_config_error() {
    let mut h = harness(routed_config("not a url"));

    let resp = h
        .gateway
        .handle(test_request(Method::GET, "localhost", "/api1/x", "9.9.9.9:1000"))
        .await;
    assert_eq!(resp.status, 500);

    // Metered as a 502 without any upstream attempt.
    let usage = h.store.usage_since(Utc::now() - ChronoDuration::seconds(5));
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].status_code, 502);
    assert_eq!(usage[0].backend_time_ms, 0);

    let ev = h.traffic_rx.try_recv().unwrap();
    assert_eq!(ev.status, 502);
}

#[tokio::test]
async fn test_upstream_connection_failure_is_502() {
    // Port 1 refuses connections.
    let mut h = harness(routed_config("http://127.0.0.1:1"));

    let resp = h
        .gateway
        .handle(test_request(Method::GET, "localhost", "/api1/x", "9.9.9.9:1000"))
        .await;
    assert_eq!(resp.status, 502);

    let usage = h.store.usage_since(Utc::now() - ChronoDuration::seconds(5));
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].status_code, 502);

    // It passed the security layer, so the event is still ALLOWED.
    let ev = h.traffic_rx.try_recv().unwrap();
    assert_eq!(ev.action, TrafficAction::Allowed);
    assert_eq!(ev.status, 502);
}

#[tokio::test]
async fn test_reject_unknown_keys_switch() {
    let mut cfg = subscribed_config();
    cfg.gateway.reject_unknown_keys = true;
    // Unroutable backend so the anonymous path fails fast with 502.
    cfg.products[0].apis[0].backend_url = "http://127.0.0.1:1".into();
    let h = harness(cfg);

    // Unknown key: rejected outright.
    let resp = h
        .gateway
        .handle(keyed_request("localhost", "/api1/x", "9.9.9.9:1000", "wrong"))
        .await;
    assert_eq!(resp.status, 401);

    // No key at all still forwards anonymously (502: dead upstream).
    let resp = h
        .gateway
        .handle(test_request(Method::GET, "localhost", "/api1/x", "9.9.9.9:1000"))
        .await;
    assert_eq!(resp.status, 502);
}
