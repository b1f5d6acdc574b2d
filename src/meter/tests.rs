// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{Duration, Utc};
use prometheus::Registry;

use super::*;
use crate::store::ApiDefinition;

fn meter_with_store() -> (Meter, Arc<CatalogStore>, Registry) {
    let store = Arc::new(CatalogStore::new());
    let registry = Registry::new();
    let meter = Meter::new(store.clone(), &registry).unwrap();
    (meter, store, registry)
}

#[test]
fn test_status_bucket() {
    assert_eq!(status_bucket(200), "2xx");
    assert_eq!(status_bucket(204), "2xx");
    assert_eq!(status_bucket(301), "other");
    assert_eq!(status_bucket(404), "4xx");
    assert_eq!(status_bucket(502), "5xx");
    assert_eq!(status_bucket(100), "other");
}

#[test]
fn test_record_appends_usage_and_counts() {
    let (meter, store, registry) = meter_with_store();

    meter.record("orders", "/orders", "GET", 200, 42, 30, 7, 3, "acme");

    let usage = store.usage_since(Utc::now() - Duration::seconds(5));
    assert_eq!(usage.len(), 1);
    let u = &usage[0];
    assert_eq!(u.subscription_id, 7);
    assert_eq!(u.api_definition_id, 3);
    assert_eq!(u.tenant_id, "acme");
    assert_eq!(u.method, "GET");
    assert_eq!(u.path, "/orders");
    assert_eq!(u.status_code, 200);
    assert_eq!(u.response_time_ms, 42);
    assert_eq!(u.backend_time_ms, 30);

    let families = registry.gather();
    let requests = families
        .iter()
        .find(|f| f.get_name() == "gateway_requests_total")
        .expect("requests counter registered");
    let metric = &requests.get_metric()[0];
    assert_eq!(metric.get_counter().get_value(), 1.0);
    let labels: HashMap<&str, &str> = metric
        .get_label()
        .iter()
        .map(|l| (l.get_name(), l.get_value()))
        .collect();
    assert_eq!(labels["backend"], "orders");
    assert_eq!(labels["status"], "2xx");

    let usage_total = families
        .iter()
        .find(|f| f.get_name() == "gateway_usage_records_total")
        .unwrap();
    assert_eq!(usage_total.get_metric()[0].get_counter().get_value(), 1.0);
}

#[test]
fn test_rate_limited_counter_is_independent() {
    let (meter, _store, registry) = meter_with_store();
    meter.increment_rate_limited();
    meter.increment_rate_limited();

    let families = registry.gather();
    let limited = families
        .iter()
        .find(|f| f.get_name() == "gateway_rate_limited_total")
        .unwrap();
    assert_eq!(limited.get_metric()[0].get_counter().get_value(), 2.0);
}

#[test]
fn test_stats_since_aggregates_by_definition() {
    let (meter, store, _registry) = meter_with_store();
    let def_id = store.create_definition(ApiDefinition {
        name: "orders".into(),
        path_prefix: "/orders".into(),
        ..Default::default()
    });

    meter.record("orders", "/orders", "GET", 200, 10, 5, 0, def_id, "");
    meter.record("orders", "/orders", "GET", 200, 20, 5, 0, def_id, "");
    meter.record("", "", "GET", 404, 1, 0, 0, 0, "");

    let since = Utc::now() - Duration::seconds(5);
    let (total, by_backend, by_path) = meter.stats_since(since);
    assert_eq!(total, 3);
    assert_eq!(by_backend.get("orders"), Some(&2));
    assert_eq!(by_path.get("/orders"), Some(&2));

    let avg = meter.avg_latency_since(since);
    assert!((avg - 31.0 / 3.0).abs() < 1e-9);
}
