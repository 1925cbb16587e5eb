//! Sector-aligned buffer pool and hash adapters shared by the blockcast
//! transfer engine.
//!
//! This crate owns the arena: preallocated, sector-aligned memory handed out
//! as reference-counted [`Buffer`] handles, plus the pluggable [`Hasher`]
//! abstraction used for end-to-end verification. It has no opinion on what
//! fills or drains a buffer — that's `blockcast-pipeline`'s job.

mod buffer;
mod error;
mod hasher;
pub(crate) mod invariants;
mod pool;

pub use buffer::{Buffer, SECTOR_SIZE};
pub use error::CoreError;
pub use hasher::{
    Digest, HashAlgorithm, Hasher, HasherFactory, Sha256Hasher, Sha512Hasher, XxHash64Hasher,
};
pub use pool::{BufferPool, BufferPoolConfig};
