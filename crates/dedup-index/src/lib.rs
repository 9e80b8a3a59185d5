//! Index store for the dedup block store.
//!
//! The index maps each block digest to the segment and offset where its
//! record was written, and maps names (segment paths) to stable ids. The
//! block store consumes it only through the [`IndexStore`] trait.
//!
//! # Backends
//!
//! - [`InMemoryIndexStore`] -- `HashMap`-based store for tests and embedding
//! - [`JournalIndexStore`] -- durable store replayed from an append-only,
//!   CRC-framed journal file
//!
//! # Design Rules
//!
//! 1. A digest's location is written once and never changes.
//! 2. Batches are atomic.
//! 3. All I/O errors are propagated, never silently ignored.

pub mod entry;
pub mod error;
pub mod journal;
pub mod memory;
pub mod traits;

pub use entry::{IndexEntry, Location, PendingEntry, SegmentId, StreamId};
pub use error::{IndexError, IndexResult};
pub use journal::{JournalIndexStore, SyncMode};
pub use memory::InMemoryIndexStore;
pub use traits::IndexStore;
