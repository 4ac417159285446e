//! Connectivity signal shared by the loaders and the queue synchronizer.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::watch;

use casework_core::sync::ConnectivityProbe;

const PROBE_TIMEOUT_SECS: u64 = 5;

/// Holds the online/offline flag behind a watch channel so state transitions
/// reach every subscriber (the reconnect drain included) exactly once.
pub struct ConnectivityMonitor {
    online: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        Self {
            online: watch::Sender::new(initially_online),
        }
    }

    /// Update the flag. Returns true when this call changed the state.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.online.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if changed {
            if online {
                info!("[CaseSync] Connectivity: online");
            } else {
                warn!("[CaseSync] Connectivity: offline");
            }
        }
        changed
    }
}

impl ConnectivityProbe for ConnectivityMonitor {
    fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}

/// Poll a lightweight endpoint and feed the monitor. Any response, even an
/// error status below 500, proves the network path works.
pub fn spawn_http_probe(
    monitor: Arc<ConnectivityMonitor>,
    url: String,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!("[CaseSync] Connectivity probe disabled: {}", e);
                return;
            }
        };
        loop {
            let online = match client.head(&url).send().await {
                Ok(response) => response.status().as_u16() < 500,
                Err(_) => false,
            };
            monitor.set_online(online);
            tokio::time::sleep(interval).await;
        }
    })
}
