//! Fan-out of structured progress events to every observer.
//!
//! Backed by a tokio broadcast ring: publishers never block, and a subscriber that
//! falls more than `capacity` events behind loses the oldest ones. The subscription
//! counts what it missed and keeps going.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Event kinds understood by hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Status,
    Output,
    Error,
    Progress,
    Success,
    Failure,
    Cancelled,
    AnalysisComplete,
    CableInstructions,
    ButtonInstructions,
}

impl EventType {
    /// Terminal events are always the last ones published for an operation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::Success | EventType::Failure | EventType::Cancelled
        )
    }
}

/// One progress event. Serializes to `{type, operationId, message?, progress?, timestamp, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub operation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    pub timestamp: DateTime<Utc>,
    /// Event-specific payload (cable steps, button lists, brick status)
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl ProgressEvent {
    pub fn new(event_type: EventType, operation_id: impl Into<String>) -> Self {
        ProgressEvent {
            event_type,
            operation_id: operation_id.into(),
            message: None,
            progress: None,
            timestamp: Utc::now(),
            details: Map::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    /// Attach a detail field. Values that fail to serialize are skipped.
    pub fn with_detail<T: Serialize>(mut self, key: &str, value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.details.insert(key.to_string(), v);
            }
            Err(e) => log::warn!("[Broadcast] Dropping detail '{}': {}", key, e),
        }
        self
    }

    pub fn status(operation_id: &str, message: impl Into<String>) -> Self {
        ProgressEvent::new(EventType::Status, operation_id).with_message(message)
    }

    pub fn output(operation_id: &str, line: impl Into<String>) -> Self {
        ProgressEvent::new(EventType::Output, operation_id).with_message(line)
    }

    pub fn error(operation_id: &str, message: impl Into<String>) -> Self {
        ProgressEvent::new(EventType::Error, operation_id).with_message(message)
    }

    pub fn progress(operation_id: &str, progress: u8, message: impl Into<String>) -> Self {
        ProgressEvent::new(EventType::Progress, operation_id)
            .with_progress(progress)
            .with_message(message)
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}

/// Cloneable publisher handle.
#[derive(Clone, Debug)]
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        ProgressBroadcaster { tx }
    }

    /// Publish to all current subscribers. Returns how many received it.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        log::trace!(
            "[Broadcast] {:?} {} {}",
            event.event_type,
            event.operation_id,
            event.message.as_deref().unwrap_or("")
        );
        // No subscribers is normal; the event is simply not observed
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        ProgressSubscription {
            rx: self.tx.subscribe(),
            filter: None,
            missed: 0,
        }
    }

    /// Subscribe to the events of one operation only.
    pub fn subscribe_operation(&self, operation_id: impl Into<String>) -> ProgressSubscription {
        ProgressSubscription {
            rx: self.tx.subscribe(),
            filter: Some(operation_id.into()),
            missed: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving side of the broadcaster.
pub struct ProgressSubscription {
    rx: broadcast::Receiver<ProgressEvent>,
    filter: Option<String>,
    missed: u64,
}

impl ProgressSubscription {
    /// Next event, or `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if let Some(ref id) = self.filter {
                        if &event.operation_id != id {
                            continue;
                        }
                    }
                    return Some(event);
                }
                Err(RecvError::Lagged(n)) => {
                    self.missed += n;
                    log::warn!("[Broadcast] Subscriber lagged, {} events dropped", n);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Collect events until the terminal one (inclusive) for `operation_id`.
    pub async fn until_terminal(&mut self, operation_id: &str) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            if event.operation_id != operation_id {
                continue;
            }
            let done = event.is_terminal();
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    /// Total events this subscriber lost to ring overflow.
    pub fn missed_events(&self) -> u64 {
        self.missed
    }
}
