//! Dispatch router
//!
//! Binds (source, routing-key pattern) pairs to message processors and
//! turns processing results into acknowledgement decisions. Messages
//! that can never succeed are rejected with their payload logged;
//! transient failures either go back on the queue or are republished,
//! with a dead-letter ceiling so a poison message cannot circulate
//! forever.

use crate::error::ProcessError;
use crate::services::publisher::NotificationSink;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// One message as handed over by a delivery source
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Name of the source stream the message arrived on
    pub source: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    /// How many times this delivery has failed before, per the transport
    pub retry_count: u32,
}

/// What the transport should do with the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    /// Drop without requeueing
    Reject,
    /// Put back for redelivery
    Requeue,
}

/// How transient failures are handled for a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Hand the message back to the transport for redelivery, always
    Requeue,
    /// Redeliver with the retry counter advanced, dead-lettering once
    /// the ceiling is passed so a poison message cannot circulate
    RetryRepublish,
}

/// A processor for one category of message
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, delivery: &Delivery, payload: &Value) -> Result<(), ProcessError>;
}

struct Route {
    source: String,
    pattern: String,
    policy: FailurePolicy,
    processor: Arc<dyn MessageProcessor>,
}

/// Dot-separated pattern match where `*` stands for exactly one segment
fn pattern_matches(pattern: &str, routing_key: &str) -> bool {
    let mut expected = pattern.split('.');
    let mut actual = routing_key.split('.');
    loop {
        match (expected.next(), actual.next()) {
            (None, None) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(a)) if p == a => {}
            _ => return false,
        }
    }
}

pub struct DispatchRouter {
    routes: Vec<Route>,
    sink: Arc<dyn NotificationSink>,
    delivery_retry_limit: u32,
    dead_letter_destination: String,
}

impl DispatchRouter {
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        delivery_retry_limit: u32,
        dead_letter_destination: &str,
    ) -> Self {
        Self {
            routes: Vec::new(),
            sink,
            delivery_retry_limit,
            dead_letter_destination: dead_letter_destination.to_string(),
        }
    }

    /// Bind a routing-key pattern on a source to a processor. Routes are
    /// tried in registration order; the first match wins.
    pub fn route(
        mut self,
        source: &str,
        pattern: &str,
        policy: FailurePolicy,
        processor: Arc<dyn MessageProcessor>,
    ) -> Self {
        self.routes.push(Route {
            source: source.to_string(),
            pattern: pattern.to_string(),
            policy,
            processor,
        });
        self
    }

    pub async fn dispatch(&self, delivery: &Delivery) -> AckDecision {
        let Some(route) = self
            .routes
            .iter()
            .find(|r| r.source == delivery.source && pattern_matches(&r.pattern, &delivery.routing_key))
        else {
            warn!(
                "No route for {} message with key {}, rejecting",
                delivery.source, delivery.routing_key
            );
            return AckDecision::Reject;
        };

        let payload: Value = match serde_json::from_slice(&delivery.body) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    "Undecodable {} message ({}): {}",
                    delivery.source,
                    e,
                    String::from_utf8_lossy(&delivery.body)
                );
                return AckDecision::Reject;
            }
        };

        debug!(
            "Dispatching {} key {} (attempt {})",
            delivery.source, delivery.routing_key, delivery.retry_count
        );

        match route.processor.process(delivery, &payload).await {
            Ok(()) => AckDecision::Ack,
            Err(e @ (ProcessError::Schema(_) | ProcessError::Business(_))) => {
                error!(
                    "Rejecting {} message with key {}: {}. Payload: {}",
                    delivery.source, delivery.routing_key, e, payload
                );
                AckDecision::Reject
            }
            Err(ProcessError::Transient(detail)) => {
                warn!(
                    "Transient failure for {} key {}: {}",
                    delivery.source, delivery.routing_key, detail
                );
                match route.policy {
                    FailurePolicy::Requeue => AckDecision::Requeue,
                    FailurePolicy::RetryRepublish => {
                        if delivery.retry_count >= self.delivery_retry_limit {
                            self.dead_letter(delivery, &payload).await
                        } else {
                            // the transport republishes with the retry
                            // counter advanced
                            AckDecision::Requeue
                        }
                    }
                }
            }
        }
    }

    /// Park a poison message: publish it unchanged to the dead-letter
    /// destination and acknowledge the original delivery.
    async fn dead_letter(&self, delivery: &Delivery, payload: &Value) -> AckDecision {
        error!(
            "Message with key {} failed {} deliveries, dead-lettering",
            delivery.routing_key, delivery.retry_count
        );
        match self
            .sink
            .publish(&self.dead_letter_destination, payload)
            .await
        {
            Ok(()) => AckDecision::Ack,
            Err(e) => {
                // cannot park it: let the transport keep the message
                error!(
                    "Could not dead-letter to {}: {}",
                    self.dead_letter_destination, e
                );
                AckDecision::Requeue
            }
        }
    }
}
