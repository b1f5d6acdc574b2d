// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Terminal traffic observer.
//!
//! Consumes the hub's batched traffic stream and the periodic stats
//! snapshots and renders them as log lines on stdout - a minimal live
//! monitor exercising the same consumer contract a full dashboard would.

#[cfg(test)]
mod tests;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::hub::{SystemStats, TrafficEvent};

/// Spawn the observer loop. It exits when both channels close.
pub fn spawn_observer(
    mut batch_rx: mpsc::Receiver<Vec<TrafficEvent>>,
    mut stats_rx: mpsc::Receiver<SystemStats>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut batches_open = true;
        let mut stats_open = true;
        while batches_open || stats_open {
            tokio::select! {
                batch = batch_rx.recv(), if batches_open => {
                    match batch {
                        Some(batch) => {
                            for ev in batch {
                                println!("{}", traffic_line(&ev));
                            }
                        }
                        None => batches_open = false,
                    }
                }
                stats = stats_rx.recv(), if stats_open => {
                    match stats {
                        Some(stats) => println!("{}", stats_line(&stats)),
                        None => stats_open = false,
                    }
                }
            }
        }
    })
}

fn traffic_line(ev: &TrafficEvent) -> String {
    let backend = if ev.backend.is_empty() { "-" } else { &ev.backend };
    let country = if ev.country.is_empty() { "-" } else { &ev.country };
    format!(
        "{} {:>10} {} {} -> {} {} {}ms [{} {}]",
        ev.timestamp.format("%H:%M:%S"),
        ev.action,
        ev.method,
        ev.path,
        backend,
        ev.status,
        ev.latency_ms,
        country,
        ev.ip,
    )
}

fn stats_line(s: &SystemStats) -> String {
    format!(
        "-- stats: {} reqs, avg {:.1}ms, blocked {}, rate-limited {}, cpu {:.0}%, mem {}/{} MB, up {}s",
        s.total_requests,
        s.avg_latency_ms,
        s.blocked,
        s.rate_limited,
        s.cpu_usage * 100.0,
        s.memory_used_mb,
        s.memory_total_mb,
        s.uptime.as_secs(),
    )
}
