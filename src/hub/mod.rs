// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Telemetry hub - non-blocking fan-out from the data plane to observers.
//!
//! The [`Broadcaster`] owns two bounded channels: traffic events (capacity
//! 100) and system-stats snapshots (capacity 10). Publishing never blocks;
//! when a channel is full the event is dropped so a stalled observer cannot
//! add latency to the proxy path.
//!
//! [`spawn_traffic_fanout`] is the single consumer of the traffic channel:
//! it feeds each event to the persistence sinks and coalesces events into
//! batches of up to [`TRAFFIC_BATCH_SIZE`] (or every
//! [`TRAFFIC_BATCH_INTERVAL`], whichever comes first) for the terminal
//! observer. [`Collector`] samples process vitals on a fixed cadence and
//! publishes [`SystemStats`].


use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::System;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::gateway::Gateway;
use crate::meter::Meter;
use crate::persist::EventSink;

pub const TRAFFIC_CHANNEL_CAPACITY: usize = 100;
pub const STATS_CHANNEL_CAPACITY: usize = 10;
pub const TRAFFIC_BATCH_SIZE: usize = 50;
pub const TRAFFIC_BATCH_INTERVAL: Duration = Duration::from_millis(40);
pub const COLLECTOR_INTERVAL: Duration = Duration::from_secs(2);

/// Terminal outcome of a request as seen by the security layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrafficAction {
    Allowed,
    Blocked,
    RateLimit,
}

impl TrafficAction {
    /// Blocked and rate-limited outcomes feed the security event log.
    pub fn is_security_event(self) -> bool {
        matches!(self, TrafficAction::Blocked | TrafficAction::RateLimit)
    }
}

impl fmt::Display for TrafficAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficAction::Allowed => write!(f, "ALLOWED"),
            TrafficAction::Blocked => write!(f, "BLOCKED"),
            TrafficAction::RateLimit => write!(f, "RATE_LIMIT"),
        }
    }
}

/// One record of a request outcome on the telemetry bus.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficEvent {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub backend: String,
    pub status: u16,
    pub latency_ms: i64,
    pub backend_latency_ms: i64,
    pub tenant_id: String,
    pub country: String,
    pub ip: String,
    pub action: TrafficAction,
}

/// Periodic snapshot of process-wide vitals and aggregate counters.
#[derive(Debug, Clone, Default)]
pub struct SystemStats {
    pub total_requests: i64,
    pub avg_latency_ms: f64,
    pub rate_limited: i64,
    pub blocked: i64,
    pub uptime: Duration,
    /// 0.0..=1.0
    pub cpu_usage: f64,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
}

/// Owns the telemetry channels. Publishing is always non-blocking.
#[derive(Debug)]
pub struct Broadcaster {
    traffic_tx: mpsc::Sender<TrafficEvent>,
    stats_tx: mpsc::Sender<SystemStats>,
    traffic_rx: Mutex<Option<mpsc::Receiver<TrafficEvent>>>,
    stats_rx: Mutex<Option<mpsc::Receiver<SystemStats>>>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let (traffic_tx, traffic_rx) = mpsc::channel(TRAFFIC_CHANNEL_CAPACITY);
        let (stats_tx, stats_rx) = mpsc::channel(STATS_CHANNEL_CAPACITY);
        Self {
            traffic_tx,
            stats_tx,
            traffic_rx: Mutex::new(Some(traffic_rx)),
            stats_rx: Mutex::new(Some(stats_rx)),
        }
    }

    /// Publish a traffic event; dropped silently when the channel is full.
    pub fn publish_traffic(&self, ev: TrafficEvent) {
        let _ = self.traffic_tx.try_send(ev);
    }

    /// Publish a stats snapshot; dropped silently when the channel is full.
    pub fn publish_stats(&self, stats: SystemStats) {
        let _ = self.stats_tx.try_send(stats);
    }

    /// Take the traffic receiver. There is exactly one consumer; subsequent
    /// calls return `None`.
    pub fn take_traffic_receiver(&self) -> Option<mpsc::Receiver<TrafficEvent>> {
        self.traffic_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn take_stats_receiver(&self) -> Option<mpsc::Receiver<SystemStats>> {
        self.stats_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Consume the traffic channel: append every event to each sink, and
/// coalesce events into batches for `batch_tx` (when an observer is
/// attached). Exits when the broadcaster is dropped, flushing the final
/// partial batch.
pub fn spawn_traffic_fanout(
    mut rx: mpsc::Receiver<TrafficEvent>,
    sinks: Vec<Arc<dyn EventSink>>,
    batch_tx: Option<mpsc::Sender<Vec<TrafficEvent>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut batch: Vec<TrafficEvent> = Vec::new();
        let mut ticker = tokio::time::interval(TRAFFIC_BATCH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let flush = |batch: &mut Vec<TrafficEvent>, tx: &Option<mpsc::Sender<Vec<TrafficEvent>>>| {
            if batch.is_empty() {
                return;
            }
            match tx.as_ref() {
                Some(tx) => {
                    let _ = tx.try_send(std::mem::take(batch));
                }
                None => batch.clear(),
            }
        };

        loop {
            tokio::select! {
                ev = rx.recv() => {
                    match ev {
                        Some(ev) => {
                            for sink in &sinks {
                                sink.append(&ev);
                            }
                            if batch_tx.is_some() {
                                batch.push(ev);
                                if batch.len() >= TRAFFIC_BATCH_SIZE {
                                    flush(&mut batch, &batch_tx);
                                }
                            }
                        }
                        None => {
                            flush(&mut batch, &batch_tx);
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    flush(&mut batch, &batch_tx);
                }
            }
        }
    })
}

/// Samples process vitals and aggregate gateway counters every
/// [`COLLECTOR_INTERVAL`] and publishes them as [`SystemStats`].
#[derive(Debug)]
pub struct Collector {
    hub: Arc<Broadcaster>,
    gateway: Arc<Gateway>,
    meter: Arc<Meter>,
    started_at: Instant,
}

impl Collector {
    pub fn new(
        hub: Arc<Broadcaster>,
        gateway: Arc<Gateway>,
        meter: Arc<Meter>,
        started_at: Instant,
    ) -> Self {
        Self {
            hub,
            gateway,
            meter,
            started_at,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sys = System::new();
            let mut ticker = tokio::time::interval(COLLECTOR_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                sys.refresh_cpu_usage();
                sys.refresh_memory();

                let since = Utc::now() - chrono::Duration::hours(1);
                let (total_requests, _, _) = self.meter.stats_since(since);
                let avg_latency_ms = self.meter.avg_latency_since(since);
                let (blocked, rate_limited) = self.gateway.stats();

                self.hub.publish_stats(SystemStats {
                    total_requests,
                    avg_latency_ms,
                    rate_limited,
                    blocked,
                    uptime: self.started_at.elapsed(),
                    cpu_usage: f64::from(sys.global_cpu_usage()) / 100.0,
                    memory_used_mb: sys.used_memory() / (1024 * 1024),
                    memory_total_mb: sys.total_memory() / (1024 * 1024),
                });
            }
        })
    }
}
