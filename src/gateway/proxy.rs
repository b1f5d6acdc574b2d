// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Proxy forwarder - the terminal stage of the pipeline.
//!
//! Rewrites the destination to the resolved backend (optionally stripping
//! the matched prefix), stamps tenant and per-API headers, streams the
//! upstream response back, and attributes latency: total time is measured
//! here, backend time around the upstream call alone. Every outcome -
//! forwarded, no-route, bad config, upstream failure - is metered exactly
//! once and publishes exactly one traffic event.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::http::{header, HeaderName, HeaderValue};

use super::{
    event_from_request, GatewayRequest, GatewayResponse, RequestHandler, ResolvedRoute,
    RouteResolver, API_KEY_HEADER, TENANT_ID_HEADER,
};
use crate::hub::{Broadcaster, TrafficAction};
use crate::meter::Meter;

#[derive(Debug)]
pub struct ProxyForwarder {
    resolver: RouteResolver,
    client: reqwest::Client,
    backend_timeout: Duration,
    meter: Arc<Meter>,
    hub: Arc<Broadcaster>,
    reject_unknown_keys: bool,
}

impl ProxyForwarder {
    pub fn new(
        resolver: RouteResolver,
        client: reqwest::Client,
        backend_timeout: Duration,
        meter: Arc<Meter>,
        hub: Arc<Broadcaster>,
        reject_unknown_keys: bool,
    ) -> Self {
        Self {
            resolver,
            client,
            backend_timeout,
            meter,
            hub,
            reject_unknown_keys,
        }
    }

    fn record(
        &self,
        req: &GatewayRequest,
        route: Option<&ResolvedRoute>,
        action: TrafficAction,
        status: u16,
        total_ms: i64,
        backend_ms: i64,
    ) {
        let (backend, prefix) = route
            .map(|r| (r.backend_name.as_str(), r.metering_prefix.as_str()))
            .unwrap_or(("", ""));
        let (sub_id, tenant_id) = route
            .and_then(|r| r.subscription.as_ref())
            .map(|s| (s.id, s.tenant_id.as_str()))
            .unwrap_or((0, ""));
        let api_def_id = route.map(|r| r.api_definition_id).unwrap_or(0);

        self.meter.record(
            backend,
            prefix,
            req.method.as_str(),
            status,
            total_ms,
            backend_ms,
            sub_id,
            api_def_id,
            tenant_id,
        );
        self.hub.publish_traffic(event_from_request(
            req,
            action,
            status,
            total_ms,
            backend_ms,
            backend,
            tenant_id,
        ));
    }
}

#[async_trait]
impl RequestHandler for ProxyForwarder {
    async fn handle(&self, mut req: GatewayRequest) -> GatewayResponse {
        let start = req.started_at;
        let api_key = req
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let Some(route) = self.resolver.resolve(&req.host, &req.path, &api_key) else {
            let elapsed = start.elapsed().as_millis() as i64;
            self.record(&req, None, TrafficAction::Allowed, 404, elapsed, 0);
            return GatewayResponse::text(404, "no route for path");
        };

        if self.reject_unknown_keys && !api_key.is_empty() && !route.key_bound {
            let elapsed = start.elapsed().as_millis() as i64;
            self.record(&req, Some(&route), TrafficAction::Blocked, 401, elapsed, 0);
            return GatewayResponse::text(401, "invalid api key");
        }

        let target = match reqwest::Url::parse(&route.backend_url) {
            Ok(url) => url,
            Err(e) => {
                log::error!(
                    "unparseable backend url {:?} for {}: {e}",
                    route.backend_url,
                    route.backend_name
                );
                let elapsed = start.elapsed().as_millis() as i64;
                self.record(&req, Some(&route), TrafficAction::Allowed, 502, elapsed, 0);
                return GatewayResponse::text(500, "bad gateway config");
            }
        };

        // Destination rewrite: backend scheme/host, request path with the
        // matched prefix optionally stripped, original query preserved.
        let mut url = target;
        let mut out_path = req.path.clone();
        if route.strip_path_prefix && !route.strip_prefix.is_empty() {
            if let Some(rest) = out_path.strip_prefix(route.strip_prefix.as_str()) {
                out_path = rest.to_string();
            }
            if out_path.is_empty() {
                out_path = "/".to_string();
            }
        }
        url.set_path(&out_path);
        url.set_query(req.query.as_deref());

        let mut headers = req.headers.clone();
        // The client sets Host from the rewritten URL.
        headers.remove(header::HOST);
        if let Some(sub) = &route.subscription {
            if !sub.tenant_id.is_empty() {
                if let Ok(value) = HeaderValue::from_str(&sub.tenant_id) {
                    headers.insert(HeaderName::from_static(TENANT_ID_HEADER), value);
                }
            }
        }
        for (name, value) in &route.add_headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }

        let body = mem::replace(&mut req.body, reqwest::Body::from(""));
        let send = self
            .client
            .request(req.method.clone(), url)
            .headers(headers)
            .body(body)
            .send();

        let upstream_start = std::time::Instant::now();
        let outcome = tokio::time::timeout(self.backend_timeout, send).await;
        let backend_ms = upstream_start.elapsed().as_millis() as i64;
        let elapsed = start.elapsed().as_millis() as i64;

        match outcome {
            Ok(Ok(resp)) => {
                let status = resp.status().as_u16();
                let resp_headers = resp.headers().clone();
                let body = reqwest::Body::wrap_stream(resp.bytes_stream());

                self.record(
                    &req,
                    Some(&route),
                    TrafficAction::Allowed,
                    status,
                    elapsed,
                    backend_ms,
                );
                log::info!(
                    "{} {} -> {} {} {}ms",
                    req.method,
                    req.path,
                    route.backend_name,
                    status,
                    elapsed
                );

                GatewayResponse {
                    status,
                    headers: resp_headers,
                    body,
                }
            }
            Ok(Err(e)) => {
                log::warn!("upstream error for {}: {e}", route.backend_name);
                self.record(
                    &req,
                    Some(&route),
                    TrafficAction::Allowed,
                    502,
                    elapsed,
                    backend_ms,
                );
                GatewayResponse::text(502, "Bad Gateway")
            }
            Err(_) => {
                log::warn!(
                    "upstream timeout after {:?} for {}",
                    self.backend_timeout,
                    route.backend_name
                );
                self.record(
                    &req,
                    Some(&route),
                    TrafficAction::Allowed,
                    502,
                    elapsed,
                    backend_ms,
                );
                GatewayResponse::text(502, "Bad Gateway")
            }
        }
    }
}
