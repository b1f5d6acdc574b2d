// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Security middleware - the stages that run ahead of the proxy forwarder.
//!
//! Each stage owns its own terminal behavior: on short-circuit it writes
//! the response, bumps its counter and publishes the traffic event itself;
//! downstream stages never run. The policy mutex is held only long enough
//! to evaluate the check, never across an await.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hyper::http::{HeaderName, HeaderValue};

use super::{
    event_from_request, GatewayCounters, GatewayRequest, GatewayResponse, RequestHandler,
    GEO_COUNTRY_HEADER,
};
use crate::hub::{Broadcaster, TrafficAction};
use crate::meter::Meter;
use crate::security::{GeoResolver, IpRateLimiter, SecurityPolicy};

/// Rejects requests whose client address is blocklisted, exactly or by
/// CIDR containment.
#[derive(Debug)]
pub struct IpBlocklist {
    next: Arc<dyn RequestHandler>,
    policy: Arc<Mutex<SecurityPolicy>>,
    counters: Arc<GatewayCounters>,
    hub: Arc<Broadcaster>,
}

impl IpBlocklist {
    pub fn new(
        next: Arc<dyn RequestHandler>,
        policy: Arc<Mutex<SecurityPolicy>>,
        counters: Arc<GatewayCounters>,
        hub: Arc<Broadcaster>,
    ) -> Self {
        Self {
            next,
            policy,
            counters,
            hub,
        }
    }
}

#[async_trait]
impl RequestHandler for IpBlocklist {
    async fn handle(&self, req: GatewayRequest) -> GatewayResponse {
        let ip = req.remote_addr.ip();
        let blocked = self
            .policy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_ip_blocked(ip);
        if blocked {
            self.counters.blocked.fetch_add(1, Ordering::Relaxed);
            self.hub.publish_traffic(event_from_request(
                &req,
                TrafficAction::Blocked,
                403,
                0,
                0,
                "",
                "",
            ));
            return GatewayResponse::text(403, "Forbidden: IP Blacklisted");
        }
        self.next.handle(req).await
    }
}

/// Per-IP token-bucket rate limiting. The bucket map belongs to this
/// middleware instance, so a chain rebuild starts every client fresh.
#[derive(Debug)]
pub struct RateLimit {
    next: Arc<dyn RequestHandler>,
    limiter: IpRateLimiter,
    counters: Arc<GatewayCounters>,
    meter: Arc<Meter>,
    hub: Arc<Broadcaster>,
}

impl RateLimit {
    pub fn new(
        next: Arc<dyn RequestHandler>,
        limiter: IpRateLimiter,
        counters: Arc<GatewayCounters>,
        meter: Arc<Meter>,
        hub: Arc<Broadcaster>,
    ) -> Self {
        Self {
            next,
            limiter,
            counters,
            meter,
            hub,
        }
    }
}

#[async_trait]
impl RequestHandler for RateLimit {
    async fn handle(&self, req: GatewayRequest) -> GatewayResponse {
        if !self.limiter.check(req.remote_addr.ip()) {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            self.meter.increment_rate_limited();
            self.hub.publish_traffic(event_from_request(
                &req,
                TrafficAction::RateLimit,
                429,
                0,
                0,
                "",
                "",
            ));
            return GatewayResponse::text(429, "Too Many Requests");
        }
        self.next.handle(req).await
    }
}

/// Resolves the client address to a country tag, stamps it onto the
/// forwarded request and enforces the allowed-country set when one is
/// configured.
#[derive(Debug)]
pub struct GeoFence {
    next: Arc<dyn RequestHandler>,
    policy: Arc<Mutex<SecurityPolicy>>,
    geo: Arc<dyn GeoResolver>,
    hub: Arc<Broadcaster>,
}

impl GeoFence {
    pub fn new(
        next: Arc<dyn RequestHandler>,
        policy: Arc<Mutex<SecurityPolicy>>,
        geo: Arc<dyn GeoResolver>,
        hub: Arc<Broadcaster>,
    ) -> Self {
        Self {
            next,
            policy,
            geo,
            hub,
        }
    }
}

#[async_trait]
impl RequestHandler for GeoFence {
    async fn handle(&self, mut req: GatewayRequest) -> GatewayResponse {
        let country = self.geo.resolve(req.remote_addr.ip());
        if let Ok(value) = HeaderValue::from_str(&country) {
            req.headers
                .insert(HeaderName::from_static(GEO_COUNTRY_HEADER), value);
        }

        let allowed = self
            .policy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_country_allowed(&country);
        if !allowed {
            self.hub.publish_traffic(event_from_request(
                &req,
                TrafficAction::Blocked,
                403,
                0,
                0,
                "",
                "",
            ));
            return GatewayResponse::text(403, "Forbidden: Geo-fenced");
        }
        self.next.handle(req).await
    }
}
