// =============================================================================
// Notifications — best-effort event fan-out
// =============================================================================
//
// Core loops report state changes through `NotificationSink`. Delivery can
// fail (nobody listening, receiver lagging) and that must never reach the
// loops: callers go through `notify_best_effort`, which only logs.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backfill::CycleReport;
use crate::error::NotifyError;
use crate::ports::NotificationSink;

/// Capacity of the broadcast ring. Slow receivers skip the oldest events.
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemEvent {
    FeedConnected,
    FeedDisconnected { reason: String },
    FeedRetryExhausted { attempts: u32 },
    WatchlistChanged { added: Vec<String>, removed: Vec<String> },
    BackfillCycleCompleted { report: CycleReport },
    BackfillCycleFailed { error: String },
    MaintenanceCompleted { succeeded: usize, failed: usize },
}

/// Send an event and swallow any delivery failure.
pub fn notify_best_effort(sink: &dyn NotificationSink, event: SystemEvent) {
    if let Err(e) = sink.broadcast(event) {
        debug!(error = %e, "notification dropped");
    }
}

// ---------------------------------------------------------------------------
// Broadcast sink
// ---------------------------------------------------------------------------

/// Fans events out to any number of subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<SystemEvent>,
}

impl BroadcastSink {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationSink for BroadcastSink {
    fn broadcast(&self, event: SystemEvent) -> Result<(), NotifyError> {
        self.tx
            .send(event)
            .map(|_| ())
            .map_err(|_| NotifyError::NoSubscribers)
    }
}

/// Log every event published on `sink` until the sink is dropped.
pub fn spawn_event_logger(sink: &Arc<BroadcastSink>) -> JoinHandle<()> {
    let mut rx = sink.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event logger lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &SystemEvent) {
    match event {
        SystemEvent::FeedRetryExhausted { attempts } => {
            error!(attempts, "stream feed gave up reconnecting — restart required");
        }
        SystemEvent::BackfillCycleFailed { error } => {
            warn!(error = %error, "backfill cycle failed");
        }
        other => match serde_json::to_string(other) {
            Ok(json) => info!(event = %json, "system event"),
            Err(e) => warn!(error = %e, "failed to encode system event"),
        },
    }
}
