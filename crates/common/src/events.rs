//! Change notifications for test runs and builds

use crate::types::{Build, TestRun};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

/// A state change observers may want to react to
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Event {
    TestRunCreated(TestRun),
    TestRunUpdated(TestRun),
    TestRunDeleted { id: Uuid, build_id: Uuid },
    BuildCreated(Build),
    BuildUpdated(Build),
    BuildDeleted { id: Uuid, project_id: Uuid },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TestRunCreated(_) => "testRun_created",
            Self::TestRunUpdated(_) => "testRun_updated",
            Self::TestRunDeleted { .. } => "testRun_deleted",
            Self::BuildCreated(_) => "build_created",
            Self::BuildUpdated(_) => "build_updated",
            Self::BuildDeleted { .. } => "build_deleted",
        }
    }

    /// Id of the entity the event is about
    pub fn subject_id(&self) -> Uuid {
        match self {
            Self::TestRunCreated(run) | Self::TestRunUpdated(run) => run.id,
            Self::TestRunDeleted { id, .. } => *id,
            Self::BuildCreated(build) | Self::BuildUpdated(build) => build.id,
            Self::BuildDeleted { id, .. } => *id,
        }
    }
}

/// Fire-and-forget event sink
pub trait Notifier: Send + Sync {
    fn publish(&self, event: Event);
}

/// Fans events out to any number of subscribers
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Event>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, event: Event) {
        let name = event.name();
        let id = event.subject_id();
        // No subscribers is fine
        match self.tx.send(event) {
            Ok(receivers) => debug!("Published {} for {} to {} receivers", name, id, receivers),
            Err(_) => debug!("Dropped {} for {}: no receivers", name, id),
        }
    }
}

/// Writes events to the log only
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn publish(&self, event: Event) {
        info!(event = event.name(), id = %event.subject_id(), "event");
    }
}
