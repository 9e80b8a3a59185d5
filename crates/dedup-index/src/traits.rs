use std::collections::HashSet;
use std::path::PathBuf;

use dedup_types::Digest;

use crate::entry::{Location, PendingEntry, SegmentId, StreamId};
use crate::error::IndexResult;

/// Durable mapping from digests to block locations and from names to ids.
///
/// All implementations must satisfy these invariants:
/// - A digest is inserted at most once; its location never changes.
/// - `batch_insert` is atomic: either every entry of the batch is recorded
///   or none is.
/// - Name registration is idempotent.
/// - All I/O errors are propagated, never silently ignored.
pub trait IndexStore {
    /// Return the id registered for `name`, registering it first if needed.
    fn resolve_or_create_stream_id(&mut self, name: &str) -> IndexResult<StreamId>;

    /// Which of `digests` already have entries.
    fn batch_exists(&self, digests: &[Digest]) -> IndexResult<HashSet<Digest>>;

    /// Record new digests, each with an occurrence count of one.
    ///
    /// Fails as a whole if any digest is already present or repeated within
    /// the batch.
    fn batch_insert(&mut self, entries: &[PendingEntry]) -> IndexResult<()>;

    /// Resolve a digest to its record location.
    ///
    /// Returns `Ok(None)` if the digest is unknown.
    fn lookup_location(&self, digest: &Digest) -> IndexResult<Option<Location>>;

    /// Every registered name as `(id, path)`, used to build the segment
    /// path table at startup.
    fn list_known_segments(&self) -> IndexResult<Vec<(SegmentId, PathBuf)>>;

    /// Flush and release the backing connection.
    fn close(&mut self) -> IndexResult<()> {
        Ok(())
    }
}
