use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use dedup_types::Digest;

use crate::entry::{IndexEntry, Location, PendingEntry, SegmentId, StreamId};
use crate::error::{IndexError, IndexResult};
use crate::traits::IndexStore;

/// In-memory, HashMap-based index store.
///
/// Intended for tests and embedding. Also the state that
/// [`JournalIndexStore`](crate::JournalIndexStore) replays its journal into.
#[derive(Default)]
pub struct InMemoryIndexStore {
    names: HashMap<String, StreamId>,
    paths: BTreeMap<StreamId, String>,
    entries: HashMap<Digest, IndexEntry>,
    next_id: u64,
    unavailable: bool,
}

impl InMemoryIndexStore {
    /// Create a new empty in-memory index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of digest entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no digest is indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The full entry for a digest, including its occurrence count.
    pub fn entry(&self, digest: &Digest) -> Option<IndexEntry> {
        self.entries.get(digest).copied()
    }

    /// Drop a digest's entry. Returns `true` if it existed.
    ///
    /// Removing a referenced digest makes reads of that block degrade to
    /// filler bytes.
    pub fn remove(&mut self, digest: &Digest) -> bool {
        self.entries.remove(digest).is_some()
    }

    /// Id registered for `name`, without registering it.
    pub fn stream_id(&self, name: &str) -> Option<StreamId> {
        self.names.get(name).copied()
    }

    /// Make every subsequent call fail with [`IndexError::Unavailable`]
    /// (or succeed again when `false`).
    pub fn set_unavailable(&mut self, unavailable: bool) {
        self.unavailable = unavailable;
    }

    pub(crate) fn register(&mut self, id: StreamId, name: &str) {
        self.names.insert(name.to_string(), id);
        self.paths.insert(id, name.to_string());
        self.next_id = self.next_id.max(id.0);
    }

    pub(crate) fn allocate_id(&self) -> StreamId {
        StreamId(self.next_id + 1)
    }

    /// Check a batch without applying it.
    pub(crate) fn validate_batch(&self, entries: &[PendingEntry]) -> IndexResult<()> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in entries {
            if self.entries.contains_key(&entry.digest) || !seen.insert(entry.digest) {
                return Err(IndexError::DuplicateDigest(entry.digest));
            }
        }
        Ok(())
    }

    pub(crate) fn apply_batch(&mut self, entries: &[PendingEntry]) {
        for entry in entries {
            self.entries
                .insert(entry.digest, IndexEntry::new(entry.location()));
        }
    }

    fn check_available(&self) -> IndexResult<()> {
        if self.unavailable {
            return Err(IndexError::Unavailable("in-memory store marked unavailable".into()));
        }
        Ok(())
    }
}

impl IndexStore for InMemoryIndexStore {
    fn resolve_or_create_stream_id(&mut self, name: &str) -> IndexResult<StreamId> {
        self.check_available()?;
        if let Some(id) = self.stream_id(name) {
            return Ok(id);
        }
        let id = self.allocate_id();
        self.register(id, name);
        Ok(id)
    }

    fn batch_exists(&self, digests: &[Digest]) -> IndexResult<HashSet<Digest>> {
        self.check_available()?;
        Ok(digests
            .iter()
            .filter(|d| self.entries.contains_key(*d))
            .copied()
            .collect())
    }

    fn batch_insert(&mut self, entries: &[PendingEntry]) -> IndexResult<()> {
        self.check_available()?;
        self.validate_batch(entries)?;
        self.apply_batch(entries);
        Ok(())
    }

    fn lookup_location(&self, digest: &Digest) -> IndexResult<Option<Location>> {
        self.check_available()?;
        Ok(self.entries.get(digest).map(|e| e.location))
    }

    fn list_known_segments(&self) -> IndexResult<Vec<(SegmentId, PathBuf)>> {
        self.check_available()?;
        Ok(self
            .paths
            .iter()
            .map(|(id, path)| (*id, PathBuf::from(path)))
            .collect())
    }
}

impl std::fmt::Debug for InMemoryIndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryIndexStore")
            .field("entries", &self.entries.len())
            .field("names", &self.names.len())
            .finish()
    }
}
