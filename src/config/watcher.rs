// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hot-reload poller for the configuration file.

use std::path::PathBuf;
use std::time::SystemTime;

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use super::Config;

pub const HOT_RELOAD_INTERVAL: Duration = Duration::from_secs(5);

/// Spawn a background task that polls the config file's mtime every five
/// seconds and invokes `on_reload` with the freshly parsed configuration
/// whenever the file changes.
///
/// A parse failure is logged and the previous configuration stays in effect;
/// a transient stat failure skips the tick. The task runs for the lifetime
/// of the process.
pub fn spawn_hot_reload<F>(path: PathBuf, on_reload: F) -> JoinHandle<()>
where
    F: Fn(Config) + Send + 'static,
{
    tokio::spawn(async move {
        let mut last_mod = SystemTime::now();
        let mut ticker = interval(HOT_RELOAD_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let modified = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if modified <= last_mod {
                continue;
            }
            log::info!("config file changed, reloading...");
            match Config::load(&path) {
                Ok(cfg) => {
                    on_reload(cfg);
                    last_mod = modified;
                }
                Err(e) => {
                    log::error!("failed to reload config: {e}");
                }
            }
        }
    })
}
