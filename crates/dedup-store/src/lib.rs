//! Deduplicating block store.
//!
//! Input streams are split into fixed-size blocks. Each distinct block is
//! written once to an append-only segment file and indexed by its digest;
//! each stream's ordered digest list is kept in a manifest named after the
//! stream. Reading a stream replays its manifest through the index.
//!
//! # Layout
//!
//! ```text
//! <root>/
//!   hashes/
//!     .sha256_16.last        current segment name
//!     sha256_16_000000       [len][payload][len][payload]...
//!   files_sha256_16/
//!     <stream name>          32-byte digests, one per block
//!   index.journal            durable index store
//! ```
//!
//! # Design Rules
//!
//! 1. Segment records are only ever appended; an offset never changes.
//! 2. A manifest holds one digest per block, duplicates included.
//! 3. Open files go through the bounded [`DescriptorPool`].
//! 4. Writes fail hard. Reads degrade to filler bytes and keep going.

pub mod config;
pub mod context;
pub mod error;
pub mod manifest;
pub mod pool;
pub mod reader;
pub mod segment;
pub mod writer;

pub use config::StoreConfig;
pub use context::Context;
pub use error::{PoolError, StoreError, StoreResult};
pub use manifest::{ManifestReader, ManifestWriter};
pub use pool::{derive_limit, AccessMode, DescriptorPool, Handle, PoolEntry};
pub use reader::{FillOutcome, ReadReport, Reconstructor, StreamReader};
pub use segment::{SegmentManager, SegmentNaming};
pub use writer::{ChunkReport, StreamWriter};
