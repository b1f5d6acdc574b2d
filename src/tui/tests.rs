// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use chrono::Utc;

use super::*;
use crate::hub::TrafficAction;

#[test]
fn test_traffic_line_shape() {
    let line = traffic_line(&TrafficEvent {
        timestamp: Utc::now(),
        method: "GET".into(),
        path: "/api1/hello".into(),
        backend: "orders".into(),
        status: 200,
        latency_ms: 12,
        backend_latency_ms: 8,
        tenant_id: "acme".into(),
        country: "US".into(),
        ip: "8.8.8.8".into(),
        action: TrafficAction::Allowed,
    });
    assert!(line.contains("ALLOWED"));
    assert!(line.contains("GET /api1/hello -> orders 200 12ms"));
    assert!(line.contains("[US 8.8.8.8]"));
}

#[test]
fn test_empty_fields_render_as_dashes() {
    let line = traffic_line(&TrafficEvent {
        timestamp: Utc::now(),
        method: "GET".into(),
        path: "/x".into(),
        backend: String::new(),
        status: 403,
        latency_ms: 0,
        backend_latency_ms: 0,
        tenant_id: String::new(),
        country: String::new(),
        ip: "10.0.0.1".into(),
        action: TrafficAction::Blocked,
    });
    assert!(line.contains("-> - 403"));
    assert!(line.contains("[- 10.0.0.1]"));
}

#[test]
fn test_stats_line_shape() {
    let line = stats_line(&SystemStats {
        total_requests: 42,
        avg_latency_ms: 3.25,
        rate_limited: 2,
        blocked: 1,
        uptime: Duration::from_secs(90),
        cpu_usage: 0.5,
        memory_used_mb: 1024,
        memory_total_mb: 8192,
    });
    assert!(line.contains("42 reqs"));
    assert!(line.contains("avg 3.2ms"));
    assert!(line.contains("cpu 50%"));
    assert!(line.contains("up 90s"));
}
