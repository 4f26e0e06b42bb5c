//! Error taxonomy for message processing
//!
//! Processors classify every failure so the dispatch router can turn it
//! into the right transport decision: structurally bad input is rejected
//! outright, business-rule violations that cannot heal are rejected, and
//! transient infrastructure failures are redelivered.

use thiserror::Error;

/// Structural validation failure; the message is permanently bad
#[derive(Debug, Clone, Error)]
pub enum SchemaError {
    #[error("Unrecognised message type: {0}")]
    UnrecognizedKind(String),

    #[error("Message is not valid JSON: {0}")]
    Malformed(String),

    #[error("Message failed validation: {0}")]
    Invalid(String),
}

/// Processor-level failure, classified for the router's ack decision
#[derive(Debug, Clone, Error)]
pub enum ProcessError {
    /// Never retried; message rejected without redelivery
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Business rule that redelivery cannot fix (e.g. missing title)
    #[error("Business rule violation: {0}")]
    Business(String),

    /// Infrastructure failure; redelivery is expected to succeed later
    #[error("Transient failure: {0}")]
    Transient(String),
}

impl ProcessError {
    pub fn business(msg: impl Into<String>) -> Self {
        Self::Business(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Whether redelivering the message can change the outcome
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<sqlx::Error> for ProcessError {
    fn from(e: sqlx::Error) -> Self {
        Self::Transient(format!("database error: {}", e))
    }
}

// db-layer calls surface the shared error type; a snapshot conflict or
// busy database heals on redelivery
impl From<atomhub_common::Error> for ProcessError {
    fn from(e: atomhub_common::Error) -> Self {
        Self::Transient(e.to_string())
    }
}
