// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Durable event sinks - best-effort, always off the request path.
//!
//! Each sink owns a bounded channel (capacity [`SINK_BUFFER`]) and a
//! dedicated worker. [`EventSink::append`] is non-blocking with
//! drop-on-full semantics; write failures are logged by the worker and the
//! stream continues. [`EventSink::close`] stops intake, lets the worker
//! drain whatever is buffered, then releases the underlying resource.
//!
//! Two shapes ship:
//!
//! - **JSONL file** - one JSON object per line, either security-only
//!   (BLOCKED / RATE_LIMIT) or all traffic.
//! - **SQLite table** - `security_events`, one prepared insert per row, on
//!   a blocking worker thread (selected by a `sqlite:` DSN prefix).

#[cfg(test)]
mod tests;

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::SecondsFormat;
use rusqlite::{params, Connection};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::hub::TrafficEvent;

pub const SINK_BUFFER: usize = 2_000;

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS security_events (
    time TEXT,
    action TEXT,
    ip TEXT,
    country TEXT,
    method TEXT,
    path TEXT,
    status INTEGER,
    tenant_id TEXT
)";

const INSERT_SQL: &str = "INSERT INTO security_events \
    (time, action, ip, country, method, path, status, tenant_id) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

/// Errors opening a persistence sink. Runtime write failures never surface
/// here - they are logged by the worker.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
}

/// A durable destination for traffic events.
#[async_trait]
pub trait EventSink: fmt::Debug + Send + Sync {
    /// Enqueue an event. Never blocks; drops when the buffer is full or the
    /// event is out of scope for this sink.
    fn append(&self, ev: &TrafficEvent);

    /// Stop intake, drain buffered events, release the resource.
    async fn close(&self);
}

/// Open the security-event sink: a `sqlite:` DSN selects the relational
/// form, anything else is treated as a JSONL file path.
pub async fn open_security_sink(target: &str) -> Result<Arc<dyn EventSink>, PersistError> {
    if let Some(db_path) = target.strip_prefix("sqlite:") {
        Ok(Arc::new(SqliteSink::open(db_path.to_string()).await?))
    } else {
        Ok(Arc::new(FileSink::open(target, true).await?))
    }
}

/// Open the all-traffic JSONL sink.
pub async fn open_all_traffic_sink(path: &str) -> Result<Arc<dyn EventSink>, PersistError> {
    Ok(Arc::new(FileSink::open(path, false).await?))
}

#[derive(Serialize)]
struct EventRow<'a> {
    time: String,
    action: String,
    ip: &'a str,
    country: &'a str,
    method: &'a str,
    path: &'a str,
    status: u16,
    #[serde(skip_serializing_if = "str::is_empty")]
    tenant_id: &'a str,
    #[serde(skip_serializing_if = "is_zero")]
    latency_ms: i64,
    #[serde(skip_serializing_if = "str::is_empty")]
    backend: &'a str,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn event_line(ev: &TrafficEvent) -> String {
    let row = EventRow {
        time: ev.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        action: ev.action.to_string(),
        ip: &ev.ip,
        country: &ev.country,
        method: &ev.method,
        path: &ev.path,
        status: ev.status,
        tenant_id: &ev.tenant_id,
        latency_ms: ev.latency_ms,
        backend: &ev.backend,
    };
    // Serialization of a flat string/number row cannot fail.
    serde_json::to_string(&row).unwrap_or_default()
}

/// JSONL sink. `security_only` restricts intake to BLOCKED / RATE_LIMIT.
pub struct FileSink {
    tx: Mutex<Option<mpsc::Sender<TrafficEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    security_only: bool,
}

impl fmt::Debug for FileSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSink")
            .field("security_only", &self.security_only)
            .finish()
    }
}

impl FileSink {
    pub async fn open<P: AsRef<Path>>(path: P, security_only: bool) -> Result<Self, PersistError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await?;

        let (tx, mut rx) = mpsc::channel::<TrafficEvent>(SINK_BUFFER);
        let worker = tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                let mut line = event_line(&ev);
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    log::error!("event log write failed: {e}");
                }
            }
            if let Err(e) = file.flush().await {
                log::error!("event log flush failed: {e}");
            }
        });

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            security_only,
        })
    }
}

#[async_trait]
impl EventSink for FileSink {
    fn append(&self, ev: &TrafficEvent) {
        if self.security_only && !ev.action.is_security_event() {
            return;
        }
        if let Some(tx) = self.tx.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            let _ = tx.try_send(ev.clone());
        }
    }

    async fn close(&self) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(tx);
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

/// Relational sink for security events. The rusqlite connection is owned by
/// a blocking worker thread; the async side only enqueues.
pub struct SqliteSink {
    tx: Mutex<Option<mpsc::Sender<TrafficEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SqliteSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteSink").finish()
    }
}

impl SqliteSink {
    pub async fn open(db_path: String) -> Result<Self, PersistError> {
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, PersistError> {
            let conn = Connection::open(db_path)?;
            conn.execute_batch(CREATE_TABLE_SQL)?;
            Ok(conn)
        })
        .await
        .expect("sqlite open task panicked")?;

        let (tx, mut rx) = mpsc::channel::<TrafficEvent>(SINK_BUFFER);
        let worker = tokio::task::spawn_blocking(move || {
            let mut insert = match conn.prepare(INSERT_SQL) {
                Ok(stmt) => stmt,
                Err(e) => {
                    log::error!("security db prepare failed: {e}");
                    return;
                }
            };
            while let Some(ev) = rx.blocking_recv() {
                let result = insert.execute(params![
                    ev.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
                    ev.action.to_string(),
                    ev.ip,
                    ev.country,
                    ev.method,
                    ev.path,
                    ev.status,
                    ev.tenant_id,
                ]);
                if let Err(e) = result {
                    log::error!("security db insert failed: {e}");
                }
            }
        });

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }
}

#[async_trait]
impl EventSink for SqliteSink {
    fn append(&self, ev: &TrafficEvent) {
        if !ev.action.is_security_event() {
            return;
        }
        if let Some(tx) = self.tx.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            let _ = tx.try_send(ev.clone());
        }
    }

    async fn close(&self) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(tx);
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}
