// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request metering - prometheus series plus the store's usage trail.
//!
//! Every terminal request outcome passes through [`Meter::record`] exactly
//! once: it bumps the labeled request counter, observes the latency
//! histogram and appends a [`RequestUsage`] row so the analytics in
//! [`crate::store`] see the same traffic the scrape endpoint does.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};

use crate::store::{CatalogStore, RequestUsage};

/// Collapse a status code into the label bucket used by the counter.
fn status_bucket(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

pub struct Meter {
    store: Arc<CatalogStore>,
    request_count: IntCounterVec,
    request_latency: HistogramVec,
    usage_records: IntCounter,
    rate_limited: IntCounter,
}

impl fmt::Debug for Meter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meter").finish_non_exhaustive()
    }
}

impl Meter {
    pub fn new(store: Arc<CatalogStore>, registry: &Registry) -> Result<Self, prometheus::Error> {
        let request_count = IntCounterVec::new(
            Opts::new(
                "gateway_requests_total",
                "Total API requests through the gateway",
            ),
            &["backend", "method", "path_prefix", "status"],
        )?;
        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "Request latency in seconds",
            ),
            &["backend", "path_prefix"],
        )?;
        let usage_records = IntCounter::new(
            "gateway_usage_records_total",
            "Total usage records stored",
        )?;
        let rate_limited = IntCounter::new(
            "gateway_rate_limited_total",
            "Requests rejected by the rate limiter",
        )?;

        registry.register(Box::new(request_count.clone()))?;
        registry.register(Box::new(request_latency.clone()))?;
        registry.register(Box::new(usage_records.clone()))?;
        registry.register(Box::new(rate_limited.clone()))?;

        Ok(Self {
            store,
            request_count,
            request_latency,
            usage_records,
            rate_limited,
        })
    }

    /// Record one request outcome.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        backend: &str,
        path_prefix: &str,
        method: &str,
        status: u16,
        total_ms: i64,
        backend_ms: i64,
        subscription_id: i64,
        api_definition_id: i64,
        tenant_id: &str,
    ) {
        self.request_count
            .with_label_values(&[backend, method, path_prefix, status_bucket(status)])
            .inc();
        self.request_latency
            .with_label_values(&[backend, path_prefix])
            .observe(total_ms as f64 / 1000.0);
        self.store.record_usage(RequestUsage {
            subscription_id,
            api_definition_id,
            tenant_id: tenant_id.to_string(),
            method: method.to_string(),
            path: path_prefix.to_string(),
            status_code: status,
            response_time_ms: total_ms,
            backend_time_ms: backend_ms,
            ..Default::default()
        });
        self.usage_records.inc();
    }

    /// Bumped by the rate-limit middleware on each 429.
    pub fn increment_rate_limited(&self) {
        self.rate_limited.inc();
    }

    /// Request totals in the window: overall, by backend name, by prefix.
    pub fn stats_since(
        &self,
        since: DateTime<Utc>,
    ) -> (i64, HashMap<String, i64>, HashMap<String, i64>) {
        let usage = self.store.usage_since(since);
        let total = usage.len() as i64;
        let mut by_backend: HashMap<String, i64> = HashMap::new();
        let mut by_path: HashMap<String, i64> = HashMap::new();
        for u in &usage {
            if let Some(def) = self.store.get_definition(u.api_definition_id) {
                *by_backend.entry(def.name).or_default() += 1;
                *by_path.entry(def.path_prefix).or_default() += 1;
            }
        }
        (total, by_backend, by_path)
    }

    /// Mean total latency in milliseconds over the window.
    pub fn avg_latency_since(&self, since: DateTime<Utc>) -> f64 {
        self.store.avg_response_time_ms_since(since).0
    }
}
