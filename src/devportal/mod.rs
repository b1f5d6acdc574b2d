// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Developer portal - read-only JSON API plus the embedded single-page
//! frontend, mounted at the configured portal path (default `/devportal`).
//!
//! The portal only ever sees published products and never sees key hashes;
//! it is the outward-facing sibling of the admin API.


use std::collections::HashMap;

use chrono::{Duration, Utc};
use hyper::http::Method;
use serde_json::json;

use crate::server::ApiResponse;
use crate::store::CatalogStore;

const USAGE_WINDOW_HOURS: i64 = 24;

static INDEX_HTML: &str = include_str!("../../assets/devportal/index.html");
static APP_JS: &str = include_str!("../../assets/devportal/app.js");

pub(crate) fn handle(
    method: &Method,
    path: &str,
    query: Option<&str>,
    prefix: &str,
    store: &CatalogStore,
) -> ApiResponse {
    if *method != Method::GET {
        return ApiResponse::method_not_allowed();
    }
    let rest = path.trim_start_matches(prefix);
    match rest {
        "/api/products" => list_products(store),
        "/api/apis" => list_apis(query, store),
        "/api/usage" => usage_summary(store),
        _ => {
            if let Some(tail) = rest.strip_prefix("/api/usage/subscription/") {
                return usage_by_subscription(tail, store);
            }
            ApiResponse::not_found()
        }
    }
}

fn list_products(store: &CatalogStore) -> ApiResponse {
    let published: Vec<_> = store
        .list_products()
        .into_iter()
        .filter(|p| p.published)
        .collect();
    ApiResponse::json(200, &published)
}

fn list_apis(query: Option<&str>, store: &CatalogStore) -> ApiResponse {
    let product_id = query
        .and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("product_id="))
        })
        .and_then(|v| v.parse::<i64>().ok());

    let defs = match product_id {
        Some(id) => store.list_definitions_by_product(id),
        None => store
            .list_products()
            .into_iter()
            .filter(|p| p.published)
            .flat_map(|p| store.list_definitions_by_product(p.id))
            .collect(),
    };
    ApiResponse::json(200, &defs)
}

fn usage_summary(store: &CatalogStore) -> ApiResponse {
    let since = Utc::now() - Duration::hours(USAGE_WINDOW_HOURS);
    let usage = store.usage_since(since);

    let mut by_path: HashMap<String, usize> = HashMap::new();
    let mut by_api: HashMap<String, usize> = HashMap::new();
    for u in &usage {
        *by_path.entry(u.path.clone()).or_default() += 1;
        let name = store
            .get_definition(u.api_definition_id)
            .map(|d| d.name)
            .unwrap_or_else(|| "unknown".to_string());
        *by_api.entry(name).or_default() += 1;
    }

    ApiResponse::json(
        200,
        &json!({
            "total": usage.len(),
            "by_path": by_path,
            "by_api": by_api,
        }),
    )
}

fn usage_by_subscription(tail: &str, store: &CatalogStore) -> ApiResponse {
    let id_part = tail.trim_end_matches('/').split('/').next().unwrap_or("");
    let Ok(subscription_id) = id_part.parse::<i64>() else {
        return ApiResponse::text(400, "invalid subscription id");
    };
    let since = Utc::now() - Duration::hours(USAGE_WINDOW_HOURS);
    let rows = store.usage_by_subscription(subscription_id, since);
    ApiResponse::json(200, &json!({"total": rows.len(), "requests": rows}))
}

/// Serve the embedded frontend.
pub(crate) fn static_asset(path: &str, prefix: &str) -> ApiResponse {
    let rest = path.trim_start_matches(prefix);
    match rest {
        "" | "/" | "/index.html" => ApiResponse {
            status: 200,
            content_type: "text/html; charset=utf-8",
            body: bytes::Bytes::from_static(INDEX_HTML.as_bytes()),
        },
        "/app.js" => ApiResponse {
            status: 200,
            content_type: "application/javascript",
            body: bytes::Bytes::from_static(APP_JS.as_bytes()),
        },
        _ => ApiResponse::not_found(),
    }
}
