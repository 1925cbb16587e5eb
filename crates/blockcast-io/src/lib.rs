//! File-backed producer and consumer workers for the blockcast transfer
//! engine.
//!
//! `blockcast-core` and `blockcast-pipeline` have no opinion on where bytes
//! come from or go to; this crate supplies one concrete collaborator pair —
//! ordinary files, read and written via positioned I/O so concurrent
//! `fill`/`drain` calls never contend on a shared cursor.

mod error;
mod file_consumer;
mod file_producer;

pub use error::IoWorkerError;
pub use file_consumer::FileConsumerWorker;
pub use file_producer::FileProducerWorker;
