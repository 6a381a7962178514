//! Send pipeline data model.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Destination identity; batches never cross it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub platform: String,
    pub channel: String,
    pub job: String,
}

/// A single outbound message, owned by the pipeline from enqueue to
/// terminal dispatch. Immutable after creation.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub platform: String,
    pub channel: String,
    pub job: String,
    pub payload: String,
    /// Unique per request; propagated through every log and metric event.
    pub correlation_id: String,
    pub enqueued_at: DateTime<Utc>,
    /// Larger is more urgent.
    pub priority: u8,
}

impl SendRequest {
    pub fn new(
        platform: impl Into<String>,
        channel: impl Into<String>,
        job: impl Into<String>,
        payload: impl Into<String>,
        priority: u8,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            platform: platform.into(),
            channel: channel.into(),
            job: job.into(),
            payload: payload.into(),
            correlation_id: Uuid::new_v4().to_string(),
            enqueued_at,
            priority,
        }
    }

    pub fn key(&self) -> BatchKey {
        BatchKey {
            platform: self.platform.clone(),
            channel: self.channel.clone(),
            job: self.job.clone(),
        }
    }
}

/// Messages for one destination merged within a coalesce window.
#[derive(Debug, Clone)]
pub struct Batch {
    pub key: BatchKey,
    /// Requests in insertion order; the processor preserves it.
    pub requests: Vec<SendRequest>,
    pub opened_at: DateTime<Utc>,
    pub priority: u8,
    /// Instant at which the batch closes regardless of size.
    pub deadline: DateTime<Utc>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
