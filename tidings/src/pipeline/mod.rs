//! The send-control pipeline.
//!
//! Messages flow: scheduler push → [`queue::CoalesceQueue`] →
//! [`processor::Processor`] (cooldown ∧ dedupe ∧ permit) → sender with
//! [`retry`] → metrics + structured log. Each stateful gate owns its
//! data; nothing is shared across gates except through the processor's
//! call sequence.

pub mod cooldown;
pub mod dedupe;
pub mod permit;
pub mod processor;
pub mod queue;
pub mod request;
pub mod retry;

pub use cooldown::CooldownGate;
pub use dedupe::DedupeFilter;
pub use permit::{PermitDecision, PermitGate, PermitReason};
pub use processor::Processor;
pub use queue::CoalesceQueue;
pub use request::{Batch, BatchKey, SendRequest};
pub use retry::{send_with_retry, RetryOutcome, RetryPolicy};
