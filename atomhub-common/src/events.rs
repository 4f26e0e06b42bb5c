//! Event types for the atomhub observability side-channel
//!
//! Duplicate skips, retry exhaustion and proxy-check outcomes are facts
//! worth reporting but are not errors; they are broadcast here instead of
//! being raised through the processor result path.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Reason an inbound media event produced no new work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A FINISHED job already covered this item and source key
    AlreadyCompleted,
    /// Another attempt for this item is still in flight
    AlreadyProcessing,
}

/// Hub events, serializable for downstream monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HubEvent {
    /// An import job was started against the storage system
    ImportStarted {
        item_id: String,
        job_id: String,
        atom_id: String,
        retry_number: u32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// An inbound media event was recognized as a duplicate and skipped
    ImportSkipped {
        item_id: String,
        atom_id: String,
        reason: SkipReason,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A job-completion notification closed out a ledger entry
    JobCompleted {
        job_id: String,
        status: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A completion notification arrived for a job we never started
    UnknownJob {
        job_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A failed job was queued for another attempt
    RetryRequested {
        atom_id: String,
        retry_number: u32,
        /// Seconds until the resend fires (0 for the immediate strategy)
        delay_secs: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A failed job exceeded the retry ceiling and was closed FAILED_TOTAL
    RetryExhausted {
        atom_id: String,
        retry_number: u32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The post-completion proxy integrity check could not be carried out
    ProxyCheckFailed {
        item_id: String,
        detail: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A deferred auxiliary payload was attached to its item
    DeferredAttached {
        atom_id: String,
        item_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

/// Broadcast bus carrying [`HubEvent`]s to any number of subscribers
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HubEvent>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; with no subscribers the event is simply dropped
    pub fn emit(&self, event: HubEvent) {
        let _ = self.tx.send(event);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(HubEvent::UnknownJob {
            job_id: "VX-123".to_string(),
            timestamp: chrono::Utc::now(),
        });

        match rx.recv().await.unwrap() {
            HubEvent::UnknownJob { job_id, .. } => assert_eq!(job_id, "VX-123"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(16);
        bus.emit(HubEvent::RetryExhausted {
            atom_id: "abc".to_string(),
            retry_number: 11,
            timestamp: chrono::Utc::now(),
        });
    }
}
