// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::Utc;

use super::*;
use crate::hub::{TrafficAction, TrafficEvent};

fn event(action: TrafficAction, status: u16) -> TrafficEvent {
    TrafficEvent {
        timestamp: Utc::now(),
        method: "GET".into(),
        path: "/api/x".into(),
        backend: "orders".into(),
        status,
        latency_ms: 12,
        backend_latency_ms: 8,
        tenant_id: "acme".into(),
        country: "US".into(),
        ip: "192.168.1.5".into(),
        action,
    }
}

#[test]
fn test_event_line_shape() {
    let line = event_line(&event(TrafficAction::Blocked, 403));
    let v: serde_json::Value = serde_json::from_str(&line).unwrap();

    assert_eq!(v["action"], "BLOCKED");
    assert_eq!(v["ip"], "192.168.1.5");
    assert_eq!(v["country"], "US");
    assert_eq!(v["method"], "GET");
    assert_eq!(v["path"], "/api/x");
    assert_eq!(v["status"], 403);
    assert_eq!(v["tenant_id"], "acme");
    assert_eq!(v["latency_ms"], 12);
    assert_eq!(v["backend"], "orders");
    // RFC3339 with a trailing Z.
    assert!(v["time"].as_str().unwrap().ends_with('Z'));
}

#[test]
fn test_event_line_omits_empty_optionals() {
    let mut ev = event(TrafficAction::RateLimit, 429);
    ev.tenant_id.clear();
    ev.backend.clear();
    ev.latency_ms = 0;

    let v: serde_json::Value = serde_json::from_str(&event_line(&ev)).unwrap();
    assert!(v.get("tenant_id").is_none());
    assert!(v.get("backend").is_none());
    assert!(v.get("latency_ms").is_none());
}

#[tokio::test]
async fn test_security_file_sink_filters_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("security.jsonl");
    let sink = FileSink::open(&path, true).await.unwrap();

    sink.append(&event(TrafficAction::Allowed, 200));
    sink.append(&event(TrafficAction::Blocked, 403));
    sink.append(&event(TrafficAction::RateLimit, 429));
    sink.close().await;

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("\"BLOCKED\""));
    assert!(lines[1].contains("\"RATE_LIMIT\""));
}

#[tokio::test]
async fn test_all_traffic_sink_keeps_everything_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("all.jsonl");
    let sink = FileSink::open(&path, false).await.unwrap();

    for status in [200u16, 403, 429, 502] {
        let action = match status {
            403 => TrafficAction::Blocked,
            429 => TrafficAction::RateLimit,
            _ => TrafficAction::Allowed,
        };
        sink.append(&event(action, status));
    }
    sink.close().await;

    let content = std::fs::read_to_string(&path).unwrap();
    let statuses: Vec<u64> = content
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["status"]
            .as_u64()
            .unwrap())
        .collect();
    assert_eq!(statuses, vec![200, 403, 429, 502]);
}

#[tokio::test]
async fn test_append_after_close_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("closed.jsonl");
    let sink = FileSink::open(&path, false).await.unwrap();
    sink.close().await;
    sink.append(&event(TrafficAction::Blocked, 403));

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
}

#[tokio::test]
async fn test_sqlite_sink_persists_security_rows() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("events.db");
    let sink = SqliteSink::open(db_path.to_string_lossy().into_owned())
        .await
        .unwrap();

    sink.append(&event(TrafficAction::Blocked, 403));
    sink.append(&event(TrafficAction::Allowed, 200)); // filtered out
    sink.close().await;

    let conn = Connection::open(&db_path).unwrap();
    let (count, action, ip, status): (i64, String, String, i64) = conn
        .query_row(
            "SELECT COUNT(*), action, ip, status FROM security_events",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(action, "BLOCKED");
    assert_eq!(ip, "192.168.1.5");
    assert_eq!(status, 403);
}

#[tokio::test]
async fn test_dsn_prefix_selects_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("dsn.db");
    let dsn = format!("sqlite:{}", db_path.display());

    let sink = open_security_sink(&dsn).await.unwrap();
    sink.append(&event(TrafficAction::RateLimit, 429));
    sink.close().await;

    let conn = Connection::open(&db_path).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM security_events", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 1);
}
