use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::transport::UploadTransport;

/// Shared online/offline flag with change notification.
#[derive(Debug, Clone)]
pub struct Connectivity {
    state: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Publishes a reading. Subscribers only wake when the value changes.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "connectivity changed");
        }
    }

    pub async fn wait_online(&self) {
        let mut receiver = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot observe a close.
        let _ = receiver.wait_for(|online| *online).await;
    }

    /// Starts a subscription that yields the current value, then every
    /// change, until it is stopped or dropped.
    pub fn subscribe(&self) -> ConnectivitySubscription {
        ConnectivitySubscription {
            changes: WatchStream::new(self.state.subscribe()),
            stop: CancellationToken::new(),
        }
    }
}

pub struct ConnectivitySubscription {
    changes: WatchStream<bool>,
    stop: CancellationToken,
}

impl ConnectivitySubscription {
    /// Next reading, or `None` once stopped.
    pub async fn next(&mut self) -> Option<bool> {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => None,
            value = self.changes.next() => value,
        }
    }

    /// Token that ends this subscription when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for ConnectivitySubscription {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Polls the server's liveness route and publishes the result until `stop`
/// is cancelled. Probe failures read as offline.
pub async fn run_probe(
    connectivity: Connectivity,
    transport: Arc<dyn UploadTransport>,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let online = match transport.probe().await {
                    Ok(()) => true,
                    Err(err) => {
                        debug!(error = %err, "connectivity probe failed");
                        false
                    }
                };
                connectivity.set_online(online);
            }
        }
    }
}
