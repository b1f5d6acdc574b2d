// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Admin JSON API - operator CRUD over the catalog plus usage and metrics
//! queries, mounted under `/api/admin/` on the management listener.
//!
//! Key issuance is the one write with a secret involved: the raw key is
//! returned exactly once in the creation response and only its hash and
//! prefix are stored.


use std::collections::HashMap;

use chrono::{Duration, Utc};
use hyper::http::Method;
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;

use crate::gateway::Gateway;
use crate::server::ApiResponse;
use crate::store::{
    hash_key, key_prefix, ApiDefinition, ApiKey, ApiProduct, CatalogStore, Subscription,
};

pub const PREFIX: &str = "/api/admin";

const DEFAULT_USAGE_HOURS: i64 = 24;
const DEFAULT_METRICS_HOURS: i64 = 1;

pub(crate) fn handle(
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: &[u8],
    store: &CatalogStore,
    gateway: &Gateway,
) -> ApiResponse {
    let rest = path.trim_start_matches(PREFIX);
    match rest {
        "/products" => products(method, body, store),
        "/definitions" => definitions(method, query, body, store),
        "/subscriptions" => subscriptions(method, query, body, store),
        "/keys" => keys(method, query, body, store),
        "/usage" => usage(method, query, store),
        "/metrics-summary" => metrics_summary(method, query, store, gateway),
        _ => {
            if let Some(id) = id_from_path(rest, "/products/") {
                return entity_by_id(method, store.get_product(id));
            }
            if let Some(id) = id_from_path(rest, "/definitions/") {
                return entity_by_id(method, store.get_definition(id));
            }
            if let Some(id) = id_from_path(rest, "/subscriptions/") {
                return entity_by_id(method, store.get_subscription(id));
            }
            if let Some(id) = id_from_path(rest, "/keys/") {
                return key_by_id(method, id, store);
            }
            ApiResponse::not_found()
        }
    }
}

#[derive(Deserialize)]
struct ProductRequest {
    name: String,
    slug: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tenant_id: String,
    #[serde(default = "default_true")]
    published: bool,
}

fn default_true() -> bool {
    true
}

fn products(method: &Method, body: &[u8], store: &CatalogStore) -> ApiResponse {
    match *method {
        Method::GET => ApiResponse::json(200, &store.list_products()),
        Method::POST => {
            let req: ProductRequest = match serde_json::from_slice(body) {
                Ok(req) => req,
                Err(e) => return ApiResponse::text(400, &e.to_string()),
            };
            let id = store.create_product(ApiProduct {
                name: req.name,
                slug: req.slug,
                description: req.description,
                tenant_id: req.tenant_id,
                published: req.published,
                ..Default::default()
            });
            match store.get_product(id) {
                Some(p) => ApiResponse::json(201, &p),
                None => ApiResponse::text(500, "create failed"),
            }
        }
        _ => ApiResponse::method_not_allowed(),
    }
}

#[derive(Deserialize)]
struct DefinitionRequest {
    product_id: i64,
    name: String,
    #[serde(default)]
    host: String,
    path_prefix: String,
    #[serde(rename = "target_url")]
    backend_url: String,
    #[serde(default)]
    openapi_spec_url: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    add_headers: HashMap<String, String>,
    #[serde(default)]
    strip_path_prefix: bool,
}

fn definitions(
    method: &Method,
    query: Option<&str>,
    body: &[u8],
    store: &CatalogStore,
) -> ApiResponse {
    match *method {
        Method::GET => match query_param(query, "product_id").and_then(|v| v.parse::<i64>().ok())
        {
            Some(product_id) => {
                ApiResponse::json(200, &store.list_definitions_by_product(product_id))
            }
            None => ApiResponse::json(200, &store.list_definitions()),
        },
        Method::POST => {
            let req: DefinitionRequest = match serde_json::from_slice(body) {
                Ok(req) => req,
                Err(e) => return ApiResponse::text(400, &e.to_string()),
            };
            if req.path_prefix.is_empty() {
                return ApiResponse::text(400, "path_prefix must not be empty");
            }
            if store.get_product(req.product_id).is_none() {
                return ApiResponse::text(400, "unknown product");
            }
            let id = store.create_definition(ApiDefinition {
                product_id: req.product_id,
                name: req.name,
                host: req.host,
                path_prefix: req.path_prefix,
                backend_url: req.backend_url,
                openapi_spec_url: req.openapi_spec_url,
                version: req.version,
                add_headers: req.add_headers,
                strip_path_prefix: req.strip_path_prefix,
                ..Default::default()
            });
            match store.get_definition(id) {
                Some(d) => ApiResponse::json(201, &d),
                None => ApiResponse::text(500, "create failed"),
            }
        }
        _ => ApiResponse::method_not_allowed(),
    }
}

#[derive(Deserialize)]
struct SubscriptionRequest {
    product_id: i64,
    #[serde(default)]
    developer_id: String,
    #[serde(default)]
    tenant_id: String,
    #[serde(default)]
    plan: String,
    #[serde(default)]
    rate_limit_per_min: Option<u32>,
}

fn subscriptions(
    method: &Method,
    query: Option<&str>,
    body: &[u8],
    store: &CatalogStore,
) -> ApiResponse {
    match *method {
        Method::GET => match query_param(query, "product_id").and_then(|v| v.parse::<i64>().ok())
        {
            Some(product_id) => {
                ApiResponse::json(200, &store.list_subscriptions_by_product(product_id))
            }
            None => ApiResponse::json(200, &store.list_subscriptions()),
        },
        Method::POST => {
            let req: SubscriptionRequest = match serde_json::from_slice(body) {
                Ok(req) => req,
                Err(e) => return ApiResponse::text(400, &e.to_string()),
            };
            if store.get_product(req.product_id).is_none() {
                return ApiResponse::text(400, "unknown product");
            }
            let id = store.create_subscription(Subscription {
                product_id: req.product_id,
                developer_id: req.developer_id,
                tenant_id: req.tenant_id,
                plan: req.plan,
                rate_limit_per_min: req.rate_limit_per_min,
                active: true,
                ..Default::default()
            });
            match store.get_subscription(id) {
                Some(s) => ApiResponse::json(201, &s),
                None => ApiResponse::text(500, "create failed"),
            }
        }
        _ => ApiResponse::method_not_allowed(),
    }
}

#[derive(Deserialize)]
struct KeyRequest {
    subscription_id: i64,
    #[serde(default)]
    name: String,
}

fn keys(method: &Method, query: Option<&str>, body: &[u8], store: &CatalogStore) -> ApiResponse {
    match *method {
        Method::GET => {
            let Some(subscription_id) =
                query_param(query, "subscription_id").and_then(|v| v.parse::<i64>().ok())
            else {
                return ApiResponse::text(400, "subscription_id required");
            };
            // Hashes stay server-side; listings expose prefixes only.
            let keys: Vec<serde_json::Value> = store
                .list_keys_by_subscription(subscription_id)
                .into_iter()
                .map(|k| key_view(&k))
                .collect();
            ApiResponse::json(200, &keys)
        }
        Method::POST => {
            let req: KeyRequest = match serde_json::from_slice(body) {
                Ok(req) => req,
                Err(e) => return ApiResponse::text(400, &e.to_string()),
            };
            if store.get_subscription(req.subscription_id).is_none() {
                return ApiResponse::text(400, "unknown subscription");
            }
            let raw = generate_api_key();
            let id = store.create_api_key(ApiKey {
                subscription_id: req.subscription_id,
                key_hash: hash_key(&raw),
                key_prefix: key_prefix(&raw),
                name: req.name.clone(),
                active: true,
                ..Default::default()
            });
            let created = store.get_key_by_id(id);
            ApiResponse::json(
                201,
                &json!({
                    "id": id,
                    "key": raw,
                    "prefix": key_prefix(&raw),
                    "name": req.name,
                    "created_at": created.map(|k| k.created_at),
                }),
            )
        }
        _ => ApiResponse::method_not_allowed(),
    }
}

fn key_by_id(method: &Method, id: i64, store: &CatalogStore) -> ApiResponse {
    match *method {
        Method::GET => match store.get_key_by_id(id) {
            Some(k) => ApiResponse::json(200, &key_view(&k)),
            None => ApiResponse::not_found(),
        },
        Method::DELETE => {
            if store.set_key_active(id, false) {
                ApiResponse::json(200, &json!({"id": id, "active": false}))
            } else {
                ApiResponse::not_found()
            }
        }
        _ => ApiResponse::method_not_allowed(),
    }
}

fn key_view(k: &ApiKey) -> serde_json::Value {
    json!({
        "id": k.id,
        "subscription_id": k.subscription_id,
        "key_prefix": k.key_prefix,
        "name": k.name,
        "active": k.active,
        "created_at": k.created_at,
        "last_used_at": k.last_used_at,
    })
}

fn usage(method: &Method, query: Option<&str>, store: &CatalogStore) -> ApiResponse {
    if *method != Method::GET {
        return ApiResponse::method_not_allowed();
    }
    let since = Utc::now() - Duration::hours(hours_param(query, DEFAULT_USAGE_HOURS));

    if let Some(id) = query_param(query, "subscription_id").and_then(|v| v.parse::<i64>().ok()) {
        let rows = store.usage_by_subscription(id, since);
        return ApiResponse::json(200, &json!({"total": rows.len(), "requests": rows}));
    }
    if let Some(id) = query_param(query, "api_id").and_then(|v| v.parse::<i64>().ok()) {
        let rows = store.usage_by_api(id, since);
        return ApiResponse::json(200, &json!({"total": rows.len(), "requests": rows}));
    }
    if let Some(tenant) = query_param(query, "tenant_id") {
        let rows = store.usage_by_tenant(tenant, since);
        return ApiResponse::json(200, &json!({"total": rows.len(), "requests": rows}));
    }
    let rows = store.usage_since(since);
    ApiResponse::json(200, &json!({"total": rows.len(), "requests": rows}))
}

fn metrics_summary(
    method: &Method,
    query: Option<&str>,
    store: &CatalogStore,
    gateway: &Gateway,
) -> ApiResponse {
    if *method != Method::GET {
        return ApiResponse::method_not_allowed();
    }
    let hours = hours_param(query, DEFAULT_METRICS_HOURS);
    let since = Utc::now() - Duration::hours(hours);

    let (p95_ms, _) = store.percentile_response_time_ms_since(since, 0.95);
    let (p99_ms, _) = store.percentile_response_time_ms_since(since, 0.99);
    let (error_rate, total, errors) = store.error_rate_since(since);
    let rps_by_route = store.rps_by_route_since(since);
    let usage_by_version = store.usage_by_version_since(since);
    let (avg_backend_ms, avg_gateway_ms, backend_count) =
        store.avg_backend_vs_gateway_since(since);

    let mut usage_by_tenant: HashMap<String, usize> = HashMap::new();
    for tenant in store.unique_tenant_ids() {
        let count = store.usage_by_tenant(&tenant, since).len();
        usage_by_tenant.insert(tenant, count);
    }

    let (_, rate_limit_hits) = gateway.stats();

    ApiResponse::json(
        200,
        &json!({
            "window_hours": hours,
            "since": since,
            "latency_p95_ms": p95_ms,
            "latency_p99_ms": p99_ms,
            "error_rate": error_rate,
            "total_requests": total,
            "error_requests": errors,
            "rps_by_route": rps_by_route,
            "rate_limit_hits": rate_limit_hits,
            "usage_by_tenant": usage_by_tenant,
            "usage_by_version": usage_by_version,
            "backend_vs_gateway": {
                "avg_backend_ms": avg_backend_ms,
                "avg_gateway_ms": avg_gateway_ms,
                "requests_with_backend_latency": backend_count,
            },
        }),
    )
}

fn generate_api_key() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("apim_{}", hex::encode(bytes))
}

fn id_from_path(rest: &str, segment: &str) -> Option<i64> {
    let tail = rest.strip_prefix(segment)?;
    let id_part = tail.split('/').next().unwrap_or("");
    id_part.parse::<i64>().ok().filter(|id| *id > 0)
}

fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name && !v.is_empty()).then_some(v)
    })
}

fn hours_param(query: Option<&str>, default: i64) -> i64 {
    query_param(query, "hours")
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|h| *h > 0)
        .unwrap_or(default)
}

fn entity_by_id<T: serde::Serialize>(method: &Method, entity: Option<T>) -> ApiResponse {
    if *method != Method::GET {
        return ApiResponse::method_not_allowed();
    }
    match entity {
        Some(e) => ApiResponse::json(200, &e),
        None => ApiResponse::not_found(),
    }
}
