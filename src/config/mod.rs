// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Apimgate configuration subsystem.
//!
//! The whole deployment is described by one YAML document: listener
//! addresses, the product/API catalog, subscriptions with their keys, the
//! developer portal and the security policy. [`Config::load`] parses the
//! file, fills in defaults and applies environment overrides; a missing
//! file is not an error at this layer - callers decide whether to fall back
//! to [`Config::empty`] (the gateway then runs with no routes).
//!
//! | key | default | description |
//! |-----|---------|-------------|
//! | `gateway.listen`                  | `":8080"` | data-plane socket address |
//! | `gateway.backend_timeout_seconds` | `30`      | upstream call deadline    |
//! | `gateway.reject_unknown_keys`     | `false`   | 401 instead of anonymous fall-through |
//! | `server.listen`                   | `":8081"` | management socket address |
//! | `devportal.path`                  | `"/devportal"` | portal mount point   |
//!
//! `APIM_GATEWAY_LISTEN` and `APIM_SERVER_LISTEN` override the listen
//! addresses regardless of what the file says.

pub mod error;
mod watcher;


pub use error::ConfigError;
pub use watcher::spawn_hot_reload;

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const DEFAULT_GATEWAY_LISTEN: &str = ":8080";
pub const DEFAULT_SERVER_LISTEN: &str = ":8081";
pub const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_DEVPORTAL_PATH: &str = "/devportal";

pub const GATEWAY_LISTEN_ENV: &str = "APIM_GATEWAY_LISTEN";
pub const SERVER_LISTEN_ENV: &str = "APIM_SERVER_LISTEN";

/// Root of the YAML configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub products: Vec<ProductConfig>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
    #[serde(default)]
    pub devportal: DevPortalConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub listen: String,
    #[serde(default)]
    pub backend_timeout_seconds: u64,
    /// When set, a request carrying an unknown or inactive API key is
    /// rejected with 401 instead of falling through to anonymous forwarding.
    #[serde(default)]
    pub reject_unknown_keys: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub listen: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductConfig {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub apis: Vec<ApiConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    pub name: String,
    /// Exact host to match, or a `*.domain` wildcard. Empty means any host.
    #[serde(default)]
    pub host: String,
    pub path_prefix: String,
    #[serde(rename = "target_url")]
    pub backend_url: String,
    #[serde(default)]
    pub openapi_spec_url: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub add_headers: HashMap<String, String>,
    #[serde(default)]
    pub strip_path_prefix: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    #[serde(default)]
    pub developer_id: String,
    pub product_slug: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyConfig {
    #[serde(default)]
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevPortalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub ip_blacklist: Vec<String>,
    #[serde(default)]
    pub allowed_countries: Vec<String>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "requests_per_second")]
    pub rps: f64,
    #[serde(default)]
    pub burst: u32,
}

impl Config {
    /// Parse the YAML file at `path`, apply defaults and env overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        let mut cfg: Config =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        cfg.apply_defaults();
        Ok(cfg)
    }

    /// An empty catalog with defaults applied: the gateway starts, but every
    /// request is a 404 until a real configuration arrives.
    pub fn empty() -> Self {
        let mut cfg = Config::default();
        cfg.apply_defaults();
        cfg
    }

    fn apply_defaults(&mut self) {
        if self.gateway.listen.is_empty() {
            self.gateway.listen = DEFAULT_GATEWAY_LISTEN.to_string();
        }
        if self.gateway.backend_timeout_seconds == 0 {
            self.gateway.backend_timeout_seconds = DEFAULT_BACKEND_TIMEOUT_SECS;
        }
        if self.server.listen.is_empty() {
            self.server.listen = DEFAULT_SERVER_LISTEN.to_string();
        }
        if self.devportal.path.is_empty() {
            self.devportal.path = DEFAULT_DEVPORTAL_PATH.to_string();
        }
        if let Ok(v) = env::var(GATEWAY_LISTEN_ENV) {
            if !v.is_empty() {
                self.gateway.listen = v;
            }
        }
        if let Ok(v) = env::var(SERVER_LISTEN_ENV) {
            if !v.is_empty() {
                self.server.listen = v;
            }
        }
    }
}
