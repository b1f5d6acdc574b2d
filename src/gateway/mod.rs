// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Gateway orchestrator - owns the live configuration and the composed
//! request pipeline.
//!
//! The pipeline is an immutable chain of [`RequestHandler`]s built once per
//! configuration: IP blocklist → rate limiter → geo fence → proxy
//! forwarder. [`Gateway::update_config`] re-parses the security policy and
//! publishes a freshly built chain under a write lock; [`Gateway::handle`]
//! takes the read lock only long enough to clone the handler pointer, so a
//! reload never stalls in-flight traffic and every request started after
//! `update_config` returns sees the new configuration.

pub mod middleware;
mod proxy;
mod resolver;

#[cfg(test)]
mod tests;

pub use middleware::{GeoFence, IpBlocklist, RateLimit};
pub use proxy::ProxyForwarder;
pub use resolver::{ResolvedRoute, RouteResolver};

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use hyper::http::{HeaderMap, HeaderValue, Method};
use std::net::SocketAddr;
use thiserror::Error;

use crate::config::{Config, SecurityConfig};
use crate::hub::{Broadcaster, TrafficAction, TrafficEvent};
use crate::meter::Meter;
use crate::security::{GeoResolver, IpRateLimiter, SecurityPolicy, StaticGeoResolver};
use crate::store::CatalogStore;

/// Carries the subscriber credential.
pub const API_KEY_HEADER: &str = "x-api-key";
/// Set on forwarded requests when the bound subscription has a tenant.
pub const TENANT_ID_HEADER: &str = "x-tenant-id";
/// Set on forwarded requests by the geo middleware.
pub const GEO_COUNTRY_HEADER: &str = "x-geo-country";

/// Errors raised while assembling the gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The outbound HTTP client could not be constructed.
    #[error("HTTP client error: {0}")]
    ClientError(#[from] reqwest::Error),
}

/// An inbound request as it moves through the pipeline.
#[derive(Debug)]
pub struct GatewayRequest {
    pub method: Method,
    /// Host header / authority, including any port.
    pub host: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub remote_addr: SocketAddr,
    pub body: reqwest::Body,
    pub started_at: Instant,
}

/// What the pipeline hands back to the listener.
#[derive(Debug)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: reqwest::Body,
}

impl GatewayResponse {
    /// A plain-text terminal response, used by short-circuiting middleware
    /// and error paths.
    pub fn text(status: u16, msg: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self {
            status,
            headers,
            body: reqwest::Body::from(msg.to_string()),
        }
    }
}

/// A stage of the request pipeline. Middleware wraps the next stage and
/// either short-circuits with a terminal response or delegates.
#[async_trait]
pub trait RequestHandler: fmt::Debug + Send + Sync {
    async fn handle(&self, req: GatewayRequest) -> GatewayResponse;
}

/// Shared atomic counters bumped by the security middleware.
#[derive(Debug, Default)]
pub struct GatewayCounters {
    pub blocked: AtomicI64,
    pub rate_limited: AtomicI64,
}

/// Build a traffic event from the request's current state. Country comes
/// from the geo header when the geo middleware has already run, otherwise
/// it is empty.
pub(crate) fn event_from_request(
    req: &GatewayRequest,
    action: TrafficAction,
    status: u16,
    total_ms: i64,
    backend_ms: i64,
    backend: &str,
    tenant_id: &str,
) -> TrafficEvent {
    TrafficEvent {
        timestamp: Utc::now(),
        method: req.method.to_string(),
        path: req.path.clone(),
        backend: backend.to_string(),
        status,
        latency_ms: total_ms,
        backend_latency_ms: backend_ms,
        tenant_id: tenant_id.to_string(),
        country: req
            .headers
            .get(GEO_COUNTRY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string(),
        ip: req.remote_addr.ip().to_string(),
        action,
    }
}

#[derive(Debug)]
struct GatewayState {
    config: Arc<Config>,
    handler: Arc<dyn RequestHandler>,
}

/// The gateway: current configuration, compiled security policy and the
/// composed handler chain.
#[derive(Debug)]
pub struct Gateway {
    state: RwLock<GatewayState>,
    store: Arc<CatalogStore>,
    meter: Arc<Meter>,
    hub: Arc<Broadcaster>,
    policy: Arc<Mutex<SecurityPolicy>>,
    counters: Arc<GatewayCounters>,
    geo: Arc<dyn GeoResolver>,
    client: reqwest::Client,
}

impl Gateway {
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<CatalogStore>,
        meter: Arc<Meter>,
        hub: Arc<Broadcaster>,
    ) -> Result<Self, GatewayError> {
        Self::with_geo_resolver(cfg, store, meter, hub, Arc::new(StaticGeoResolver))
    }

    /// Like [`Gateway::new`] but with a caller-supplied geo resolver (an
    /// MMDB-backed one, or a fixture in tests).
    pub fn with_geo_resolver(
        cfg: Arc<Config>,
        store: Arc<CatalogStore>,
        meter: Arc<Meter>,
        hub: Arc<Broadcaster>,
        geo: Arc<dyn GeoResolver>,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder().build()?;
        let policy = Arc::new(Mutex::new(SecurityPolicy::from_config(&cfg.security)));
        let counters = Arc::new(GatewayCounters::default());
        let handler = build_handler(
            &cfg, &store, &meter, &hub, &policy, &counters, &geo, &client,
        );
        Ok(Self {
            state: RwLock::new(GatewayState {
                config: cfg,
                handler,
            }),
            store,
            meter,
            hub,
            policy,
            counters,
            geo,
            client,
        })
    }

    /// Dispatch one request. The read lock is held only to load the handler
    /// pointer; the chain itself is immutable once published.
    pub async fn handle(&self, req: GatewayRequest) -> GatewayResponse {
        let handler = self.state.read().unwrap_or_else(|e| e.into_inner()).handler.clone();
        handler.handle(req).await
    }

    /// Swap in a new configuration: re-parse the security policy, rebuild
    /// the handler chain and publish both atomically.
    pub fn update_config(&self, cfg: Config) {
        let cfg = Arc::new(cfg);
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *self.policy.lock().unwrap_or_else(|e| e.into_inner()) =
            SecurityPolicy::from_config(&cfg.security);
        state.handler = build_handler(
            &cfg,
            &self.store,
            &self.meter,
            &self.hub,
            &self.policy,
            &self.counters,
            &self.geo,
            &self.client,
        );
        state.config = cfg;
    }

    /// Replace only the security policy, leaving routes and the chain
    /// untouched. Used by operator commands (e.g. a live blocklist purge).
    pub fn update_security(&self, cfg: &SecurityConfig) {
        *self.policy.lock().unwrap_or_else(|e| e.into_inner()) = SecurityPolicy::from_config(cfg);
    }

    /// Export the live policy in config form.
    pub fn get_security(&self) -> SecurityConfig {
        self.policy.lock().unwrap_or_else(|e| e.into_inner()).to_config()
    }

    /// Snapshot of (blocked, rate-limited) counters.
    pub fn stats(&self) -> (i64, i64) {
        (
            self.counters.blocked.load(Ordering::Relaxed),
            self.counters.rate_limited.load(Ordering::Relaxed),
        )
    }

    pub fn config(&self) -> Arc<Config> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).config.clone()
    }
}

/// Compose the pipeline for `cfg`. Middleware wraps inside-out so the first
/// listed below is the first to run on a request.
#[allow(clippy::too_many_arguments)]
fn build_handler(
    cfg: &Arc<Config>,
    store: &Arc<CatalogStore>,
    meter: &Arc<Meter>,
    hub: &Arc<Broadcaster>,
    policy: &Arc<Mutex<SecurityPolicy>>,
    counters: &Arc<GatewayCounters>,
    geo: &Arc<dyn GeoResolver>,
    client: &reqwest::Client,
) -> Arc<dyn RequestHandler> {
    let resolver = RouteResolver::new(cfg.clone(), store.clone());
    let mut handler: Arc<dyn RequestHandler> = Arc::new(ProxyForwarder::new(
        resolver,
        client.clone(),
        Duration::from_secs(cfg.gateway.backend_timeout_seconds),
        meter.clone(),
        hub.clone(),
        cfg.gateway.reject_unknown_keys,
    ));

    // Geo resolution always runs; it doubles as the fence when countries
    // are configured.
    handler = Arc::new(GeoFence::new(
        handler,
        policy.clone(),
        geo.clone(),
        hub.clone(),
    ));

    if cfg.security.rate_limit.enabled {
        handler = Arc::new(RateLimit::new(
            handler,
            IpRateLimiter::new(cfg.security.rate_limit.rps, cfg.security.rate_limit.burst),
            counters.clone(),
            meter.clone(),
            hub.clone(),
        ));
    }

    if !cfg.security.ip_blacklist.is_empty() {
        handler = Arc::new(IpBlocklist::new(
            handler,
            policy.clone(),
            counters.clone(),
            hub.clone(),
        ));
    }

    handler
}
