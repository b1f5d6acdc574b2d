// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Apimgate - stand-alone gateway binary.
//!
//! Wires the catalog store, meter, telemetry hub and gateway together,
//! starts the two listeners and the optional background workers (hot
//! reload, persistence sinks, stats collector, terminal observer), then
//! waits for Ctrl-C. Exits nonzero on fatal config load failure or an
//! unrecoverable listener error.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use log::{error, info, warn};

use apimgate::config::{spawn_hot_reload, Config};
use apimgate::gateway::Gateway;
use apimgate::hub::{spawn_traffic_fanout, Broadcaster, Collector};
use apimgate::meter::Meter;
use apimgate::persist::{open_all_traffic_sink, open_security_sink, EventSink};
use apimgate::server::{run_gateway_listener, run_management_server, ManagementContext};
use apimgate::store::CatalogStore;
use apimgate::tui::spawn_observer;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_DB_PATH: &str = "data/apimgate.db";

const CONFIG_ENV: &str = "APIM_CONFIG";
const FILE_LOG_ENV: &str = "APIM_FILE_LOG";
const NODE_ID_ENV: &str = "APIM_NODE_ID";
const CLUSTER_NODES_ENV: &str = "APIM_CLUSTER_NODES";

/// API gateway with config-driven products, subscriptions, and security.
#[derive(Parser, Debug)]
#[command(name = "apimgate", version, about)]
struct Cli {
    /// Config file path. Default: config.yaml, or APIM_CONFIG env.
    #[arg(short = 'f', long = "config", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Start the terminal traffic monitor (traffic stream + system stats).
    #[arg(long)]
    tui: bool,

    /// Watch the config file and reload on change.
    #[arg(long = "hot-reload")]
    hot_reload: bool,

    /// Persist BLOCKED/RATE_LIMIT events to SQLite at ./data/apimgate.db
    /// (creates the directory if needed).
    #[arg(long = "use-db")]
    use_db: bool,

    /// Persist only BLOCKED/RATE_LIMIT events to JSONL at PATH. Ignored if
    /// --use-db is set.
    #[arg(long = "use-file-log", value_name = "PATH")]
    use_file_log: Option<String>,

    /// Persist ALL traffic (every request) to JSONL at PATH. Use for
    /// debugging or perf tests.
    #[arg(long = "file-log-all", value_name = "PATH")]
    file_log_all: Option<String>,
}

fn load_config(path: &PathBuf) -> Config {
    if !path.exists() {
        warn!(
            "config file not found: {} (using defaults; gateway will run with no products)",
            path.display()
        );
        return Config::empty();
    }
    match Config::load(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("load config: {e}");
            std::process::exit(1);
        }
    }
}

async fn setup_security_sink(
    use_db: bool,
    use_file_log: Option<String>,
) -> Option<Arc<dyn EventSink>> {
    if use_db {
        if let Some(parent) = std::path::Path::new(DEFAULT_DB_PATH).parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("could not create data dir for --use-db: {e}");
                return None;
            }
        }
        let dsn = format!("sqlite:{DEFAULT_DB_PATH}");
        return match open_security_sink(&dsn).await {
            Ok(sink) => {
                info!("security events logged to {dsn}");
                Some(sink)
            }
            Err(e) => {
                warn!("security log: {e} (events will not be persisted)");
                None
            }
        };
    }

    let path = use_file_log.or_else(|| env::var(FILE_LOG_ENV).ok().filter(|v| !v.is_empty()))?;
    match open_security_sink(&path).await {
        Ok(sink) => {
            info!("security events logged to {path}");
            Some(sink)
        }
        Err(e) => {
            warn!("security log: {e} (events will not be persisted)");
            None
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let started_at = Instant::now();
    let config_path = cli
        .config
        .or_else(|| env::var(CONFIG_ENV).ok().filter(|v| !v.is_empty()).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let cfg = Arc::new(load_config(&config_path));

    let store = Arc::new(CatalogStore::new());
    store.populate_from_config(&cfg);

    let registry = prometheus::Registry::new();
    let meter = match Meter::new(store.clone(), &registry) {
        Ok(meter) => Arc::new(meter),
        Err(e) => {
            error!("metrics init: {e}");
            std::process::exit(1);
        }
    };
    let hub = Arc::new(Broadcaster::new());
    let gateway = match Gateway::new(cfg.clone(), store.clone(), meter.clone(), hub.clone()) {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            error!("gateway init: {e}");
            std::process::exit(1);
        }
    };

    // Persistence sinks, each optional.
    let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
    if let Some(sink) = setup_security_sink(cli.use_db, cli.use_file_log.clone()).await {
        sinks.push(sink);
    }
    if let Some(path) = &cli.file_log_all {
        match open_all_traffic_sink(path).await {
            Ok(sink) => {
                info!("all traffic logged to {path}");
                sinks.push(sink);
            }
            Err(e) => warn!("file-log-all: {e}"),
        }
    }
    let close_sinks = sinks.clone();

    // Single consumer of the traffic channel: sinks plus observer batches.
    let batch_tx = if cli.tui {
        let (tx, rx) = tokio::sync::mpsc::channel(apimgate::hub::TRAFFIC_CHANNEL_CAPACITY);
        let stats_rx = hub
            .take_stats_receiver()
            .expect("stats receiver taken once");
        spawn_observer(rx, stats_rx);
        Collector::new(hub.clone(), gateway.clone(), meter.clone(), started_at).spawn();

        let node_id = env::var(NODE_ID_ENV).unwrap_or_else(|_| "local".to_string());
        let cluster_nodes = env::var(CLUSTER_NODES_ENV).unwrap_or_else(|_| "1".to_string());
        info!("traffic monitor on (node {node_id}, cluster of {cluster_nodes})");
        Some(tx)
    } else {
        None
    };
    let traffic_rx = hub
        .take_traffic_receiver()
        .expect("traffic receiver taken once");
    spawn_traffic_fanout(traffic_rx, sinks, batch_tx);

    if cli.hot_reload {
        let store = store.clone();
        let gateway = gateway.clone();
        spawn_hot_reload(config_path, move |new_cfg| {
            store.populate_from_config(&new_cfg);
            gateway.update_config(new_cfg);
        });
    }

    let gateway_listen = cfg.gateway.listen.clone();
    let gateway_for_listener = gateway.clone();
    let gateway_task = tokio::spawn(async move {
        run_gateway_listener(&gateway_listen, gateway_for_listener).await
    });

    let ctx = Arc::new(ManagementContext {
        store,
        gateway,
        registry,
        devportal: cfg.devportal.clone(),
    });
    let server_listen = cfg.server.listen.clone();
    let management_task =
        tokio::spawn(async move { run_management_server(&server_listen, ctx).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
        res = gateway_task => {
            match res {
                Ok(Err(e)) => error!("gateway: {e}"),
                Err(e) => error!("gateway task failed: {e}"),
                Ok(Ok(())) => {}
            }
            std::process::exit(1);
        }
        res = management_task => {
            match res {
                Ok(Err(e)) => error!("server: {e}"),
                Err(e) => error!("server task failed: {e}"),
                Ok(Ok(())) => {}
            }
            std::process::exit(1);
        }
    }

    for sink in &close_sinks {
        sink.close().await;
    }
}
