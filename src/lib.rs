// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Apimgate - a configuration-driven API gateway and management plane.
//!
//! The gateway reverse-proxies HTTP traffic to backends declared in a YAML
//! catalog of products and APIs, authenticates callers by API key, enforces
//! per-client security policy (IP blocklists, geo-fencing, token-bucket rate
//! limiting) and publishes real-time telemetry to observers without ever
//! blocking the data plane.
//!
//! # Architecture
//!
//! Three subsystems carry the design:
//!
//! - **Request pipeline** ([`gateway`]): middleware chain (blocklist →
//!   rate-limit → geo) → route resolution → proxy forwarding with
//!   backend-latency attribution → metering → telemetry publish.
//! - **Catalog store** ([`store`]): an in-memory, concurrently readable
//!   registry of products, API definitions, subscriptions and keys with
//!   atomic repopulate-on-reload semantics, plus the usage ring buffer that
//!   powers analytics.
//! - **Telemetry hub** ([`hub`] and [`persist`]): bounded fan-out channels
//!   with drop-on-full semantics so slow observers (dashboards, event logs)
//!   can never backpressure the proxy.
//!
//! Everything else - the management JSON APIs ([`admin`], [`devportal`]),
//! the listeners ([`server`]) and the terminal observer ([`tui`]) - is glue
//! around those three.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use apimgate::config::Config;
//! use apimgate::gateway::Gateway;
//! use apimgate::hub::Broadcaster;
//! use apimgate::meter::Meter;
//! use apimgate::store::CatalogStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = Arc::new(Config::load("config.yaml")?);
//!     let store = Arc::new(CatalogStore::new());
//!     store.populate_from_config(&cfg);
//!
//!     let registry = prometheus::Registry::new();
//!     let meter = Arc::new(Meter::new(store.clone(), &registry)?);
//!     let hub = Arc::new(Broadcaster::new());
//!     let gateway = Arc::new(Gateway::new(cfg.clone(), store, meter, hub)?);
//!
//!     apimgate::server::run_gateway_listener(&cfg.gateway.listen, gateway).await?;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod config;
pub mod devportal;
pub mod gateway;
pub mod hub;
pub mod meter;
pub mod persist;
pub mod security;
pub mod server;
pub mod store;
pub mod tui;

pub use config::{Config, ConfigError};
pub use gateway::{Gateway, GatewayError};
pub use hub::{Broadcaster, SystemStats, TrafficAction, TrafficEvent};
pub use meter::Meter;
pub use persist::EventSink;
pub use security::{GeoResolver, SecurityPolicy, StaticGeoResolver};
pub use store::CatalogStore;
