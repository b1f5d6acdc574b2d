// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Route resolution - (host, path, key) → backend.
//!
//! Matching is two-phase over the catalog in config order: APIs with a host
//! pattern are tried first (exact after port-strip, or `*.domain` suffix),
//! then host-less APIs by path prefix alone. First match wins; there is no
//! longest-prefix preference.
//!
//! When the request carries an API key that binds to an active subscription,
//! the subscription's own definitions in the store are re-matched and, when
//! one fits, supersede the config-level API - that definition carries the
//! authoritative backend URL, header additions and strip policy for the
//! subscriber.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::config::{ApiConfig, Config};
use crate::store::{hash_key, key_prefix, CatalogStore, Subscription};

/// Outcome of route resolution for one request.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub backend_url: String,
    pub backend_name: String,
    /// The config-level prefix that matched; used for metering labels even
    /// when a store definition supersedes the route.
    pub metering_prefix: String,
    pub strip_path_prefix: bool,
    /// The prefix to strip when `strip_path_prefix` is set.
    pub strip_prefix: String,
    pub add_headers: HashMap<String, String>,
    /// 0 unless a store-level definition was bound.
    pub api_definition_id: i64,
    pub subscription: Option<Subscription>,
    /// True when the presented key resolved to an active key on an active
    /// subscription.
    pub key_bound: bool,
}

#[derive(Debug)]
pub struct RouteResolver {
    config: Arc<Config>,
    store: Arc<CatalogStore>,
}

impl RouteResolver {
    pub fn new(config: Arc<Config>, store: Arc<CatalogStore>) -> Self {
        Self { config, store }
    }

    /// Resolve a request. `api_key` is the raw header value, empty when
    /// absent. Returns `None` when nothing in the catalog matches.
    pub fn resolve(&self, host: &str, path: &str, api_key: &str) -> Option<ResolvedRoute> {
        let api = self.find_config_api(host, path)?;
        let mut route = ResolvedRoute {
            backend_url: api.backend_url.clone(),
            backend_name: api.name.clone(),
            metering_prefix: api.path_prefix.clone(),
            strip_path_prefix: api.strip_path_prefix,
            strip_prefix: api.path_prefix.clone(),
            add_headers: api.add_headers.clone(),
            api_definition_id: 0,
            subscription: None,
            key_bound: false,
        };

        if !api_key.is_empty() {
            self.bind_key(host, path, api_key, &mut route);
        }

        Some(route)
    }

    /// Host-qualified APIs first, then path-only, in config order.
    fn find_config_api(&self, host: &str, path: &str) -> Option<&ApiConfig> {
        self.config
            .products
            .iter()
            .flat_map(|p| &p.apis)
            .find(|a| {
                !a.host.is_empty()
                    && host_matches(host, &a.host)
                    && path.starts_with(&a.path_prefix)
            })
            .or_else(|| {
                self.config
                    .products
                    .iter()
                    .flat_map(|p| &p.apis)
                    .find(|a| a.host.is_empty() && path.starts_with(&a.path_prefix))
            })
    }

    /// Look the key up by hash, then by prefix. Only an active key on an
    /// active subscription binds; anything else leaves the route anonymous.
    fn bind_key(&self, host: &str, path: &str, api_key: &str, route: &mut ResolvedRoute) {
        let key = self
            .store
            .get_key_by_hash(&hash_key(api_key))
            .or_else(|| self.store.get_key_by_prefix(&key_prefix(api_key)));
        let Some(key) = key.filter(|k| k.active) else {
            return;
        };
        let Some(sub) = self
            .store
            .get_subscription(key.subscription_id)
            .filter(|s| s.active)
        else {
            return;
        };

        self.store.update_key_last_used(key.id, Utc::now());

        let defs = self.store.list_definitions_by_product(sub.product_id);
        let def = defs
            .iter()
            .find(|d| {
                !d.host.is_empty()
                    && host_matches(host, &d.host)
                    && path.starts_with(&d.path_prefix)
            })
            .or_else(|| {
                defs.iter()
                    .find(|d| d.host.is_empty() && path.starts_with(&d.path_prefix))
            });

        if let Some(def) = def {
            route.backend_url = def.backend_url.clone();
            route.backend_name = def.name.clone();
            route.api_definition_id = def.id;
            route.strip_path_prefix = def.strip_path_prefix;
            route.strip_prefix = def.path_prefix.clone();
            route.add_headers = def.add_headers.clone();
        }
        route.subscription = Some(sub);
        route.key_bound = true;
    }
}

/// Exact match after port-strip, or `*.domain` suffix match. The wildcard
/// requires at least one label before the suffix: `*.example.com` matches
/// `x.example.com` and `a.b.example.com` but not `example.com` itself, and
/// not `xexample.com`.
pub fn host_matches(actual: &str, target: &str) -> bool {
    let actual = strip_port(actual);
    if actual == target {
        return true;
    }
    if target.starts_with("*.") {
        // The suffix keeps the dot, so plain-suffix lookalikes miss.
        return actual.ends_with(&target[1..]);
    }
    false
}

/// Drop a trailing `:port` from a host string, handling bracketed IPv6.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        if let Some(end) = host.find(']') {
            return &host[1..end];
        }
    }
    match host.rsplit_once(':') {
        Some((h, port))
            if !h.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            h
        }
        _ => host,
    }
}
