//! Location provider contract and the tasks that feed an engine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pawtrack_core::UserPosition;
use pawtrack_gateway::ReportGateway;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::SearchEngine;

const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    NotDetermined,
    Authorized,
    Denied,
    Restricted,
}

impl AuthorizationStatus {
    /// Denied and restricted access put the engine in no-position mode.
    pub fn blocks_updates(self) -> bool {
        matches!(self, Self::Denied | Self::Restricted)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocationEvent {
    Position(UserPosition),
    Authorization(AuthorizationStatus),
}

pub trait LocationProvider: Send + Sync {
    /// Starts a fresh update stream. Call again after permission is re-granted.
    fn subscribe(&self) -> mpsc::Receiver<LocationEvent>;
}

/// Fan-out provider fed by hand; backs the CLI and tests.
#[derive(Debug, Default)]
pub struct ChannelLocationProvider {
    subscribers: Mutex<Vec<mpsc::Sender<LocationEvent>>>,
}

impl ChannelLocationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `event` to every live subscriber. Returns how many received it.
    pub async fn emit(&self, event: LocationEvent) -> usize {
        let senders = {
            let mut subscribers = self
                .subscribers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subscribers.retain(|tx| !tx.is_closed());
            subscribers.clone()
        };
        let mut delivered = 0;
        for tx in senders {
            if tx.send(event.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

impl LocationProvider for ChannelLocationProvider {
    fn subscribe(&self) -> mpsc::Receiver<LocationEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }
}

/// Feeds location events into `engine` until the stream closes.
///
/// Events that queued up while the engine was busy are drained together and
/// only the newest position is applied, so a burst costs one recompute (or one
/// refresh when the user left the area of the last fetch).
pub fn spawn_location_listener<G>(
    engine: Arc<SearchEngine<G>>,
    mut rx: mpsc::Receiver<LocationEvent>,
) -> JoinHandle<()>
where
    G: ReportGateway + 'static,
{
    tokio::spawn(async move {
        let mut blocked = false;
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while let Ok(next) = rx.try_recv() {
                batch.push(next);
            }

            let mut latest = None;
            let mut revoked = false;
            for event in batch {
                match event {
                    LocationEvent::Authorization(status) => {
                        engine.notify_authorization(status);
                        blocked = status.blocks_updates();
                        if blocked {
                            latest = None;
                            revoked = true;
                        }
                    }
                    LocationEvent::Position(_) if blocked => {
                        debug!("ignoring position while location access is blocked");
                    }
                    LocationEvent::Position(position) => match position.coordinate.validate() {
                        Ok(()) => latest = Some(position),
                        Err(err) => warn!(%err, "skipping invalid position from provider"),
                    },
                }
            }

            if let Some(position) = latest {
                apply_position(&engine, position).await;
            } else if revoked && engine.position().is_some() {
                let _ = engine.set_position(None);
            }
        }
        debug!("location stream closed");
    })
}

async fn apply_position<G: ReportGateway>(engine: &SearchEngine<G>, position: UserPosition) {
    if engine.needs_refetch(&position) {
        if let Err(err) = engine.store_position(Some(position)) {
            warn!(%err, "rejected position");
            return;
        }
        // Failures are already broadcast to observers by `refresh`.
        let _ = engine.refresh().await;
    } else if let Err(err) = engine.set_position(Some(position)) {
        warn!(%err, "rejected position");
    }
}

/// Refreshes `engine` every `every` until the task is aborted.
pub fn spawn_periodic_refresh<G>(engine: Arc<SearchEngine<G>>, every: Duration) -> JoinHandle<()>
where
    G: ReportGateway + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; callers refresh on startup themselves.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let _ = engine.refresh().await;
        }
    })
}
