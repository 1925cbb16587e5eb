//! Coordinator and worker traits for the blockcast one-to-many transfer
//! pipeline.
//!
//! This crate has no opinion on where bytes come from or go to — that's
//! `blockcast-io`'s job. It owns the producer/consumer concurrency model, the
//! reorder-and-broadcast guarantee, two-pass hash verification, and the
//! error-escalation and cancellation semantics a transfer runs under.

mod consumer;
mod coordinator;
mod error;
mod producer;
mod state_machine;
mod worker;

pub use coordinator::TransferCoordinator;
pub use error::{CompletionOutcome, CoordinatorError};
pub use worker::{ConsumerWorker, ContextSlot, ProducerWorker, VerificationHandles, WorkerContext};
