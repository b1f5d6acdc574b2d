// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Catalog store - products, API definitions, subscriptions, keys and the
//! request-usage ring buffer.
//!
//! The store is the single in-memory source of truth for everything the
//! resolver and the management plane look up at request time. One
//! reader-writer lock guards all maps and the usage buffer; reads are the
//! common case. Every value handed out is a clone of the stored record, so
//! callers never observe later mutations through a returned value, and
//! every value stored is a clone of the caller's, so callers cannot reach
//! in afterwards either.
//!
//! [`CatalogStore::populate_from_config`] atomically resets the catalog and
//! rebuilds it from a parsed [`Config`]; the usage buffer survives reloads.


use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::Config;

/// Raw keys longer than this are identified by their first 8 characters.
pub const KEY_PREFIX_LEN: usize = 8;

/// Usage rows kept before the ring evicts; on overflow the newest
/// `USAGE_RING_RETAIN` rows survive.
pub const USAGE_RING_MAX: usize = 100_000;
pub const USAGE_RING_RETAIN: usize = 50_000;

/// A published bundle of APIs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApiProduct {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub tenant_id: String,
    pub published: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single routable backend within a product.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApiDefinition {
    pub id: i64,
    pub product_id: i64,
    pub name: String,
    pub host: String,
    pub path_prefix: String,
    pub backend_url: String,
    pub openapi_spec_url: String,
    pub version: String,
    pub add_headers: HashMap<String, String>,
    pub strip_path_prefix: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A developer's grant against a product.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Subscription {
    pub id: i64,
    pub product_id: i64,
    pub developer_id: String,
    pub tenant_id: String,
    pub plan: String,
    pub rate_limit_per_min: Option<u32>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored credential. The raw key never appears here - only its SHA-256
/// hex digest and an 8-character prefix kept for operator-facing listings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApiKey {
    pub id: i64,
    pub subscription_id: i64,
    pub key_hash: String,
    pub key_prefix: String,
    pub name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// One request observation, the raw material for analytics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestUsage {
    pub id: i64,
    /// 0 when the request was anonymous.
    pub subscription_id: i64,
    /// 0 when no store-level definition was resolved.
    pub api_definition_id: i64,
    pub tenant_id: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub response_time_ms: i64,
    pub backend_time_ms: i64,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Catalog {
    products: HashMap<i64, ApiProduct>,
    definitions: HashMap<i64, ApiDefinition>,
    subscriptions: HashMap<i64, Subscription>,
    keys_by_hash: HashMap<String, ApiKey>,
    keys_by_prefix: HashMap<String, ApiKey>,
    usage: Vec<RequestUsage>,
    next_product: i64,
    next_def: i64,
    next_sub: i64,
    next_key: i64,
    next_usage: i64,
}

impl Catalog {
    fn new() -> Self {
        Self {
            usage: Vec::with_capacity(10_000),
            next_product: 1,
            next_def: 1,
            next_sub: 1,
            next_key: 1,
            next_usage: 1,
            ..Default::default()
        }
    }
}

/// SHA-256 hex digest of a raw API key.
pub fn hash_key(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// The lookup prefix stored alongside a key's hash.
pub fn key_prefix(raw: &str) -> String {
    raw.chars().take(KEY_PREFIX_LEN).collect()
}

/// In-memory catalog and usage store.
#[derive(Debug)]
pub struct CatalogStore {
    inner: RwLock<Catalog>,
}

impl Default for CatalogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Catalog::new()),
        }
    }

    /// Drop the catalog (products, definitions, subscriptions, keys) and
    /// restart id assignment. Usage rows are retained.
    pub fn reset(&self) {
        let mut c = self.inner.write().unwrap_or_else(|e| e.into_inner());
        c.products.clear();
        c.definitions.clear();
        c.subscriptions.clear();
        c.keys_by_hash.clear();
        c.keys_by_prefix.clear();
        c.next_product = 1;
        c.next_def = 1;
        c.next_sub = 1;
        c.next_key = 1;
    }

    /// Atomic reset-then-rebuild from a parsed configuration.
    ///
    /// Product slugs become the foreign key between config sections:
    /// subscriptions referencing a slug that no product declares are
    /// silently skipped. Keys are normalized on the way in - only the
    /// SHA-256 digest and the prefix are stored.
    pub fn populate_from_config(&self, cfg: &Config) {
        self.reset();

        let mut slug_to_id: HashMap<&str, i64> = HashMap::new();

        for pc in &cfg.products {
            let id = self.create_product(ApiProduct {
                name: pc.name.clone(),
                slug: pc.slug.clone(),
                description: pc.description.clone(),
                published: true,
                ..Default::default()
            });
            slug_to_id.insert(pc.slug.as_str(), id);

            for ac in &pc.apis {
                self.create_definition(ApiDefinition {
                    product_id: id,
                    name: ac.name.clone(),
                    host: ac.host.clone(),
                    path_prefix: ac.path_prefix.clone(),
                    backend_url: ac.backend_url.clone(),
                    openapi_spec_url: ac.openapi_spec_url.clone(),
                    version: ac.version.clone(),
                    add_headers: ac.add_headers.clone(),
                    strip_path_prefix: ac.strip_path_prefix,
                    ..Default::default()
                });
            }
        }

        for sc in &cfg.subscriptions {
            let Some(&product_id) = slug_to_id.get(sc.product_slug.as_str()) else {
                continue;
            };
            let sub_id = self.create_subscription(Subscription {
                product_id,
                developer_id: sc.developer_id.clone(),
                tenant_id: sc.tenant_id.clone(),
                plan: sc.plan.clone(),
                active: true,
                ..Default::default()
            });

            for kc in &sc.keys {
                self.create_api_key(ApiKey {
                    subscription_id: sub_id,
                    key_hash: hash_key(&kc.value),
                    key_prefix: key_prefix(&kc.value),
                    name: kc.name.clone(),
                    active: true,
                    ..Default::default()
                });
            }
        }
    }

    pub fn create_product(&self, mut p: ApiProduct) -> i64 {
        let mut c = self.inner.write().unwrap_or_else(|e| e.into_inner());
        p.id = c.next_product;
        c.next_product += 1;
        p.created_at = Utc::now();
        p.updated_at = p.created_at;
        let id = p.id;
        c.products.insert(id, p);
        id
    }

    pub fn get_product(&self, id: i64) -> Option<ApiProduct> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).products.get(&id).cloned()
    }

    pub fn list_products(&self) -> Vec<ApiProduct> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).products.values().cloned().collect()
    }

    pub fn create_definition(&self, mut d: ApiDefinition) -> i64 {
        let mut c = self.inner.write().unwrap_or_else(|e| e.into_inner());
        d.id = c.next_def;
        c.next_def += 1;
        d.created_at = Utc::now();
        d.updated_at = d.created_at;
        let id = d.id;
        c.definitions.insert(id, d);
        id
    }

    pub fn get_definition(&self, id: i64) -> Option<ApiDefinition> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).definitions.get(&id).cloned()
    }

    pub fn list_definitions(&self) -> Vec<ApiDefinition> {
        self.inner
            .read()
            .unwrap()
            .definitions
            .values()
            .cloned()
            .collect()
    }

    pub fn list_definitions_by_product(&self, product_id: i64) -> Vec<ApiDefinition> {
        self.inner
            .read()
            .unwrap()
            .definitions
            .values()
            .filter(|d| d.product_id == product_id)
            .cloned()
            .collect()
    }

    pub fn create_subscription(&self, mut sub: Subscription) -> i64 {
        let mut c = self.inner.write().unwrap_or_else(|e| e.into_inner());
        sub.id = c.next_sub;
        c.next_sub += 1;
        sub.created_at = Utc::now();
        sub.updated_at = sub.created_at;
        let id = sub.id;
        c.subscriptions.insert(id, sub);
        id
    }

    pub fn get_subscription(&self, id: i64) -> Option<Subscription> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).subscriptions.get(&id).cloned()
    }

    pub fn list_subscriptions(&self) -> Vec<Subscription> {
        self.inner
            .read()
            .unwrap()
            .subscriptions
            .values()
            .cloned()
            .collect()
    }

    pub fn list_subscriptions_by_product(&self, product_id: i64) -> Vec<Subscription> {
        self.inner
            .read()
            .unwrap()
            .subscriptions
            .values()
            .filter(|s| s.product_id == product_id)
            .cloned()
            .collect()
    }

    pub fn create_api_key(&self, mut k: ApiKey) -> i64 {
        let mut c = self.inner.write().unwrap_or_else(|e| e.into_inner());
        k.id = c.next_key;
        c.next_key += 1;
        k.created_at = Utc::now();
        k.last_used_at = k.created_at;
        let id = k.id;
        c.keys_by_prefix.insert(k.key_prefix.clone(), k.clone());
        c.keys_by_hash.insert(k.key_hash.clone(), k);
        id
    }

    /// O(1); the authoritative lookup.
    pub fn get_key_by_hash(&self, hash: &str) -> Option<ApiKey> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).keys_by_hash.get(hash).cloned()
    }

    /// O(1); convenience fallback for operator tooling and degraded clients.
    pub fn get_key_by_prefix(&self, prefix: &str) -> Option<ApiKey> {
        self.inner
            .read()
            .unwrap()
            .keys_by_prefix
            .get(prefix)
            .cloned()
    }

    /// O(n) scan; keys are few.
    pub fn get_key_by_id(&self, id: i64) -> Option<ApiKey> {
        self.inner
            .read()
            .unwrap()
            .keys_by_hash
            .values()
            .find(|k| k.id == id)
            .cloned()
    }

    pub fn list_keys_by_subscription(&self, subscription_id: i64) -> Vec<ApiKey> {
        self.inner
            .read()
            .unwrap()
            .keys_by_hash
            .values()
            .filter(|k| k.subscription_id == subscription_id)
            .cloned()
            .collect()
    }

    pub fn update_key_last_used(&self, id: i64, t: DateTime<Utc>) {
        let mut c = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for k in c.keys_by_hash.values_mut() {
            if k.id == id {
                k.last_used_at = t;
            }
        }
        for k in c.keys_by_prefix.values_mut() {
            if k.id == id {
                k.last_used_at = t;
            }
        }
    }

    /// Deactivate a key in both indexes. Returns false if the id is unknown.
    pub fn set_key_active(&self, id: i64, active: bool) -> bool {
        let mut c = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut found = false;
        for k in c.keys_by_hash.values_mut() {
            if k.id == id {
                k.active = active;
                found = true;
            }
        }
        for k in c.keys_by_prefix.values_mut() {
            if k.id == id {
                k.active = active;
            }
        }
        found
    }

    /// Append one observation. `requested_at` is stamped here; callers never
    /// supply it. When the buffer exceeds [`USAGE_RING_MAX`] rows the oldest
    /// half is dropped.
    pub fn record_usage(&self, mut u: RequestUsage) {
        let mut c = self.inner.write().unwrap_or_else(|e| e.into_inner());
        u.id = c.next_usage;
        c.next_usage += 1;
        u.requested_at = Utc::now();
        c.usage.push(u);
        if c.usage.len() > USAGE_RING_MAX {
            let excess = c.usage.len() - USAGE_RING_RETAIN;
            c.usage.drain(..excess);
        }
    }

    pub fn usage_since(&self, since: DateTime<Utc>) -> Vec<RequestUsage> {
        self.inner
            .read()
            .unwrap()
            .usage
            .iter()
            .filter(|u| u.requested_at >= since)
            .cloned()
            .collect()
    }

    pub fn usage_by_subscription(
        &self,
        subscription_id: i64,
        since: DateTime<Utc>,
    ) -> Vec<RequestUsage> {
        self.inner
            .read()
            .unwrap()
            .usage
            .iter()
            .filter(|u| u.subscription_id == subscription_id && u.requested_at >= since)
            .cloned()
            .collect()
    }

    pub fn usage_by_api(&self, api_id: i64, since: DateTime<Utc>) -> Vec<RequestUsage> {
        self.inner
            .read()
            .unwrap()
            .usage
            .iter()
            .filter(|u| u.api_definition_id == api_id && u.requested_at >= since)
            .cloned()
            .collect()
    }

    pub fn usage_by_tenant(&self, tenant_id: &str, since: DateTime<Utc>) -> Vec<RequestUsage> {
        self.inner
            .read()
            .unwrap()
            .usage
            .iter()
            .filter(|u| u.tenant_id == tenant_id && u.requested_at >= since)
            .cloned()
            .collect()
    }

    /// Tenant ids present across subscriptions, deduplicated.
    pub fn unique_tenant_ids(&self) -> Vec<String> {
        let c = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let seen: HashSet<&str> = c
            .subscriptions
            .values()
            .filter(|s| !s.tenant_id.is_empty())
            .map(|s| s.tenant_id.as_str())
            .collect();
        seen.into_iter().map(String::from).collect()
    }

    /// Mean response time over the window, with the sample count.
    pub fn avg_response_time_ms_since(&self, since: DateTime<Utc>) -> (f64, usize) {
        let c = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut sum: i64 = 0;
        let mut count = 0usize;
        for u in c.usage.iter().filter(|u| u.requested_at >= since) {
            sum += u.response_time_ms;
            count += 1;
        }
        if count == 0 {
            return (0.0, 0);
        }
        (sum as f64 / count as f64, count)
    }

    /// Latency at `percentile` (0.0..=1.0) over the window, by sort-and-index:
    /// the element at `min(floor(n * p), n - 1)` of the ascending samples.
    pub fn percentile_response_time_ms_since(
        &self,
        since: DateTime<Utc>,
        percentile: f64,
    ) -> (f64, usize) {
        let mut samples: Vec<i64> = {
            let c = self.inner.read().unwrap_or_else(|e| e.into_inner());
            c.usage
                .iter()
                .filter(|u| u.requested_at >= since)
                .map(|u| u.response_time_ms)
                .collect()
        };
        if samples.is_empty() {
            return (0.0, 0);
        }
        samples.sort_unstable();
        let mut idx = (samples.len() as f64 * percentile) as usize;
        if idx >= samples.len() {
            idx = samples.len() - 1;
        }
        (samples[idx] as f64, samples.len())
    }

    /// 4xx+5xx share of requests in the window: (rate, total, errors).
    pub fn error_rate_since(&self, since: DateTime<Utc>) -> (f64, usize, usize) {
        let c = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut total = 0usize;
        let mut errors = 0usize;
        for u in c.usage.iter().filter(|u| u.requested_at >= since) {
            total += 1;
            if u.status_code >= 400 {
                errors += 1;
            }
        }
        if total == 0 {
            return (0.0, 0, 0);
        }
        (errors as f64 / total as f64, total, errors)
    }

    /// Requests per second per matched path prefix, over the elapsed window
    /// (floor-clamped to one second).
    pub fn rps_by_route_since(&self, since: DateTime<Utc>) -> HashMap<String, f64> {
        let c = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for u in c.usage.iter().filter(|u| u.requested_at >= since) {
            *counts.entry(u.path.as_str()).or_default() += 1;
        }
        let mut secs = (Utc::now() - since).num_milliseconds() as f64 / 1000.0;
        if secs < 1.0 {
            secs = 1.0;
        }
        counts
            .into_iter()
            .map(|(route, n)| (route.to_string(), n as f64 / secs))
            .collect()
    }

    /// Request counts keyed by the version of the definition that served
    /// them; rows whose definition is gone (or unversioned) count under
    /// "unknown".
    pub fn usage_by_version_since(&self, since: DateTime<Utc>) -> HashMap<String, i64> {
        let c = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut out: HashMap<String, i64> = HashMap::new();
        for u in c.usage.iter().filter(|u| u.requested_at >= since) {
            let ver = match c.definitions.get(&u.api_definition_id) {
                Some(d) if !d.version.is_empty() => d.version.clone(),
                _ => "unknown".to_string(),
            };
            *out.entry(ver).or_default() += 1;
        }
        out
    }

    /// Mean backend vs gateway-overhead milliseconds over rows that carry a
    /// backend measurement; gateway time is clamped at zero.
    pub fn avg_backend_vs_gateway_since(&self, since: DateTime<Utc>) -> (f64, f64, usize) {
        let c = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut sum_backend: i64 = 0;
        let mut sum_gateway: i64 = 0;
        let mut count = 0usize;
        for u in c
            .usage
            .iter()
            .filter(|u| u.requested_at >= since && u.backend_time_ms > 0)
        {
            count += 1;
            sum_backend += u.backend_time_ms;
            sum_gateway += (u.response_time_ms - u.backend_time_ms).max(0);
        }
        if count == 0 {
            return (0.0, 0.0, 0);
        }
        (
            sum_backend as f64 / count as f64,
            sum_gateway as f64 / count as f64,
            count,
        )
    }
}
