//! Live progress events and the per-run publish/subscribe channel.
//!
//! One logical channel exists per run, addressed as
//! `<namespace>:run-progress:<run_id>`. Publishing is fire-and-forget with
//! at-most-once delivery: there is no backlog, so a late subscriber misses
//! earlier events. Events for one run reach each subscriber in publish order;
//! nothing is guaranteed across runs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::engine::RunStatus;

/// Default channel-name namespace.
pub const DEFAULT_NAMESPACE: &str = "replay";

/// Broadcast buffer per channel; slow subscribers drop oldest events rather
/// than stall the publisher.
const CHANNEL_CAPACITY: usize = 256;

/// Channel name a run's progress stream is addressed by.
pub fn channel_name(namespace: &str, run_id: &str) -> String {
    format!("{namespace}:run-progress:{run_id}")
}

/// Run/action lifecycle message, JSON-serialized on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProgressEvent {
    #[serde(rename = "run:started")]
    RunStarted {
        #[serde(flatten)]
        meta: EventMeta,
        #[serde(rename = "testName")]
        test_name: String,
        #[serde(rename = "actionsTotal")]
        actions_total: usize,
    },
    #[serde(rename = "action:started")]
    ActionStarted {
        #[serde(flatten)]
        meta: EventMeta,
        #[serde(flatten)]
        action: ActionRef,
    },
    #[serde(rename = "action:success")]
    ActionSuccess {
        #[serde(flatten)]
        meta: EventMeta,
        #[serde(flatten)]
        action: ActionRef,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
        /// Description of the selector that located the target, when one did
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
    },
    #[serde(rename = "action:failed")]
    ActionFailed {
        #[serde(flatten)]
        meta: EventMeta,
        #[serde(flatten)]
        action: ActionRef,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
        error: String,
    },
    #[serde(rename = "action:skipped")]
    ActionSkipped {
        #[serde(flatten)]
        meta: EventMeta,
        #[serde(flatten)]
        action: ActionRef,
        reason: String,
    },
    #[serde(rename = "run:completed")]
    RunCompleted {
        #[serde(flatten)]
        meta: EventMeta,
        status: RunStatus,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
        #[serde(rename = "actionsExecuted")]
        actions_executed: usize,
        #[serde(rename = "actionsFailed")]
        actions_failed: usize,
        #[serde(rename = "actionsSkipped")]
        actions_skipped: usize,
    },
    #[serde(rename = "run:error")]
    RunError {
        #[serde(flatten)]
        meta: EventMeta,
        error: String,
    },
}

/// Fields every event carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    #[serde(rename = "runId")]
    pub run_id: String,
    /// ISO 8601 publish time
    pub timestamp: String,
}

impl EventMeta {
    pub fn now(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Position of an action within the run, repeated on every `action:*` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRef {
    #[serde(rename = "actionId")]
    pub action_id: String,
    #[serde(rename = "actionType")]
    pub action_type: String,
    pub index: usize,
    pub total: usize,
}

impl ProgressEvent {
    pub fn run_id(&self) -> &str {
        &self.meta().run_id
    }

    pub fn meta(&self) -> &EventMeta {
        match self {
            ProgressEvent::RunStarted { meta, .. }
            | ProgressEvent::ActionStarted { meta, .. }
            | ProgressEvent::ActionSuccess { meta, .. }
            | ProgressEvent::ActionFailed { meta, .. }
            | ProgressEvent::ActionSkipped { meta, .. }
            | ProgressEvent::RunCompleted { meta, .. }
            | ProgressEvent::RunError { meta, .. } => meta,
        }
    }

    /// Whether this event ends its run's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::RunCompleted { .. } | ProgressEvent::RunError { .. }
        )
    }

    /// Wire payload.
    pub fn to_payload(&self) -> Result<String, ProgressError> {
        serde_json::to_string(self).map_err(|e| ProgressError::Serialize(e.to_string()))
    }
}

/// Faults surfaced by publishing. In-memory delivery cannot fail; these come
/// from payload serialization or an external transport bridge.
#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("failed to serialize progress event: {0}")]
    Serialize(String),
    #[error("progress transport failure: {0}")]
    Transport(String),
}

/// Swappable bridge to an external pub/sub service. The in-memory bus always
/// delivers locally; a transport additionally receives every serialized
/// payload, keyed by channel name.
pub trait ProgressTransport: Send + Sync {
    fn publish(&self, channel: &str, payload: &str) -> Result<(), ProgressError>;
}

/// In-process progress hub: one broadcast channel per run.
pub struct ProgressBus {
    namespace: String,
    transport: Option<Arc<dyn ProgressTransport>>,
    channels: Mutex<HashMap<String, broadcast::Sender<ProgressEvent>>>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::with_namespace(DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            transport: None,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Attach an external transport bridge.
    pub fn with_transport(mut self, transport: Arc<dyn ProgressTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Publisher handle for a run's channel.
    pub fn publisher(self: &Arc<Self>, run_id: &str) -> ProgressPublisher {
        ProgressPublisher {
            bus: Arc::clone(self),
            run_id: run_id.to_string(),
        }
    }

    /// Subscribe to a run's live events. Events published before this call
    /// are not replayed.
    pub fn subscribe(&self, run_id: &str) -> ProgressSubscription {
        ProgressSubscription {
            rx: self.sender(run_id).subscribe(),
        }
    }

    /// Subscribe with callbacks, draining events on a background task.
    /// Dropping the returned guard (or calling `unsubscribe`) stops delivery.
    pub fn subscribe_with<E, C>(&self, run_id: &str, on_event: E, on_close: C) -> Unsubscribe
    where
        E: Fn(ProgressEvent) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let mut subscription = self.subscribe(run_id);
        let handle = tokio::spawn(async move {
            while let Some(event) = subscription.next_event().await {
                on_event(event);
            }
            on_close();
        });
        Unsubscribe { handle }
    }

    fn publish(&self, run_id: &str, event: ProgressEvent) -> Result<(), ProgressError> {
        if let Some(transport) = &self.transport {
            let channel = channel_name(&self.namespace, run_id);
            transport.publish(&channel, &event.to_payload()?)?;
        }

        let terminal = event.is_terminal();
        let sender = self.sender(run_id);
        // Fire-and-forget: a send error only means nobody is listening.
        let delivered = sender.send(event).unwrap_or(0);
        tracing::trace!(run_id, delivered, "progress event published");

        if terminal {
            self.close(run_id);
        }
        Ok(())
    }

    /// Drop a run's channel; subscribers observe end-of-stream.
    fn close(&self, run_id: &str) {
        let mut channels = self.channels.lock().expect("progress registry poisoned");
        channels.remove(run_id);
    }

    fn sender(&self, run_id: &str) -> broadcast::Sender<ProgressEvent> {
        let mut channels = self.channels.lock().expect("progress registry poisoned");
        channels
            .entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

/// Engine-side handle publishing into one run's channel.
pub struct ProgressPublisher {
    bus: Arc<ProgressBus>,
    run_id: String,
}

impl ProgressPublisher {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Fire-and-forget publish. Errors only surface transport faults.
    pub fn publish(&self, event: ProgressEvent) -> Result<(), ProgressError> {
        self.bus.publish(&self.run_id, event)
    }
}

/// Receiver side of one run's channel.
pub struct ProgressSubscription {
    rx: broadcast::Receiver<ProgressEvent>,
}

impl ProgressSubscription {
    /// Next event, or `None` once the channel closed after its terminal
    /// event. A slow subscriber that lagged simply misses the dropped events.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "subscriber lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Guard for a callback subscription.
pub struct Unsubscribe {
    handle: JoinHandle<()>,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        self.handle.abort();
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
