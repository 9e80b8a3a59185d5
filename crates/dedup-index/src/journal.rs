use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use dedup_types::Digest;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::entry::{Location, PendingEntry, SegmentId, StreamId};
use crate::error::{IndexError, IndexResult};
use crate::memory::InMemoryIndexStore;
use crate::traits::IndexStore;

/// One durable change to the index.
///
/// On-disk framing:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (bincode-serialized JournalRecord)]
/// ```
/// A whole `batch_insert` is one record, so a torn write loses the batch as a
/// unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum JournalRecord {
    Register { id: StreamId, name: String },
    Insert(Vec<PendingEntry>),
}

/// Flush/sync strategy for the journal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// `fsync` after every record.
    EveryWrite,
    /// Flush to the OS; rely on the page cache.
    #[default]
    OsDefault,
}

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// Durable index store backed by an append-only journal file.
///
/// The journal is replayed into memory on open; queries are served from
/// memory and every mutation is appended before it is applied. A torn tail
/// left by a crash is detected on open and cut off.
pub struct JournalIndexStore {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    state: InMemoryIndexStore,
    sync: SyncMode,
}

impl JournalIndexStore {
    /// Open (or create) a journal at `path`.
    pub fn open(path: &Path) -> IndexResult<Self> {
        Self::open_with(path, SyncMode::default())
    }

    /// Open (or create) a journal with an explicit sync strategy.
    pub fn open_with(path: &Path, sync: SyncMode) -> IndexResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let mut state = InMemoryIndexStore::new();
        let valid_len = replay(&file, &mut state)?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            warn!(
                path = %path.display(),
                valid_len,
                file_len,
                "cutting torn tail from index journal"
            );
            file.set_len(valid_len)?;
        }

        debug!(path = %path.display(), entries = state.len(), "index journal opened");
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            state,
            sync,
        })
    }

    /// Path to the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of indexed digests.
    pub fn len(&self) -> usize {
        self.state.len()
    }

    /// Returns `true` if no digest is indexed.
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    fn append(&mut self, record: &JournalRecord) -> IndexResult<()> {
        let writer = self.writer.as_mut().ok_or(IndexError::Closed)?;
        let payload =
            bincode::serialize(record).map_err(|e| IndexError::Serialization(e.to_string()))?;
        let length = u32::try_from(payload.len())
            .map_err(|_| IndexError::Serialization("journal record too large".into()))?;
        let crc = crc32fast::hash(&payload);

        writer.write_all(&length.to_le_bytes())?;
        writer.write_all(&crc.to_le_bytes())?;
        writer.write_all(&payload)?;
        writer.flush()?;
        if self.sync == SyncMode::EveryWrite {
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    fn ensure_open(&self) -> IndexResult<()> {
        if self.writer.is_none() {
            return Err(IndexError::Closed);
        }
        Ok(())
    }
}

/// Replay every intact record into `state`. Returns the length of the valid
/// prefix of the file.
fn replay(file: &File, state: &mut InMemoryIndexStore) -> IndexResult<u64> {
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut offset: u64 = 0;

    while offset + HEADER_SIZE as u64 <= file_len {
        let mut header = [0u8; HEADER_SIZE];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let end = offset + HEADER_SIZE as u64 + u64::from(length);
        if length == 0 || end > file_len {
            warn!(offset, length, file_len, "truncated index journal record");
            break;
        }

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload)?;

        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != expected_crc {
            warn!(
                offset,
                expected = expected_crc,
                actual = actual_crc,
                "index journal CRC mismatch; ignoring the rest"
            );
            break;
        }

        let record: JournalRecord =
            bincode::deserialize(&payload).map_err(|e| IndexError::Corrupt {
                offset,
                reason: e.to_string(),
            })?;
        match record {
            JournalRecord::Register { id, name } => state.register(id, &name),
            JournalRecord::Insert(entries) => state.apply_batch(&entries),
        }
        offset = end;
    }

    Ok(offset)
}

impl IndexStore for JournalIndexStore {
    fn resolve_or_create_stream_id(&mut self, name: &str) -> IndexResult<StreamId> {
        self.ensure_open()?;
        if let Some(id) = self.state.stream_id(name) {
            return Ok(id);
        }
        let id = self.state.allocate_id();
        self.append(&JournalRecord::Register {
            id,
            name: name.to_string(),
        })?;
        self.state.register(id, name);
        debug!(%id, name, "registered name");
        Ok(id)
    }

    fn batch_exists(&self, digests: &[Digest]) -> IndexResult<HashSet<Digest>> {
        self.ensure_open()?;
        self.state.batch_exists(digests)
    }

    fn batch_insert(&mut self, entries: &[PendingEntry]) -> IndexResult<()> {
        self.ensure_open()?;
        if entries.is_empty() {
            return Ok(());
        }
        self.state.validate_batch(entries)?;
        self.append(&JournalRecord::Insert(entries.to_vec()))?;
        self.state.apply_batch(entries);
        Ok(())
    }

    fn lookup_location(&self, digest: &Digest) -> IndexResult<Option<Location>> {
        self.ensure_open()?;
        self.state.lookup_location(digest)
    }

    fn list_known_segments(&self) -> IndexResult<Vec<(SegmentId, PathBuf)>> {
        self.ensure_open()?;
        self.state.list_known_segments()
    }

    fn close(&mut self) -> IndexResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
            debug!(path = %self.path.display(), "index journal closed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for JournalIndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalIndexStore")
            .field("path", &self.path)
            .field("entries", &self.state.len())
            .field("open", &self.writer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(content: &[u8], segment: u64, offset: u64) -> PendingEntry {
        PendingEntry::new(Digest::of(content), StreamId(segment), offset)
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.journal");

        {
            let mut store = JournalIndexStore::open(&path).unwrap();
            let seg = store.resolve_or_create_stream_id("/h/sha256_16_000000").unwrap();
            store
                .batch_insert(&[pending(b"a", seg.0, 0), pending(b"b", seg.0, 2)])
                .unwrap();
            store.close().unwrap();
        }

        let store = JournalIndexStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        let loc = store.lookup_location(&Digest::of(b"b")).unwrap().unwrap();
        assert_eq!(loc, Location { segment: StreamId(1), offset: 2 });
        assert_eq!(
            store.list_known_segments().unwrap(),
            vec![(StreamId(1), PathBuf::from("/h/sha256_16_000000"))]
        );
    }

    #[test]
    fn ids_continue_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.journal");
        {
            let mut store = JournalIndexStore::open(&path).unwrap();
            store.resolve_or_create_stream_id("one").unwrap();
            store.resolve_or_create_stream_id("two").unwrap();
        }
        let mut store = JournalIndexStore::open(&path).unwrap();
        assert_eq!(store.resolve_or_create_stream_id("two").unwrap(), StreamId(2));
        assert_eq!(store.resolve_or_create_stream_id("three").unwrap(), StreamId(3));
    }

    #[test]
    fn rejected_batch_is_not_journaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.journal");
        {
            let mut store = JournalIndexStore::open(&path).unwrap();
            store.batch_insert(&[pending(b"a", 1, 0)]).unwrap();
            let err = store
                .batch_insert(&[pending(b"b", 1, 2), pending(b"a", 1, 4)])
                .unwrap_err();
            assert!(matches!(err, IndexError::DuplicateDigest(_)));
        }
        let store = JournalIndexStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.lookup_location(&Digest::of(b"b")).unwrap().is_none());
    }

    #[test]
    fn torn_tail_is_cut_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.journal");
        {
            let mut store = JournalIndexStore::open(&path).unwrap();
            store.batch_insert(&[pending(b"a", 1, 0)]).unwrap();
        }
        let intact_len = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[40, 0, 0, 0, 1, 2, 3, 4, 9, 9]).unwrap();
        }

        let mut store = JournalIndexStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);

        store.batch_insert(&[pending(b"b", 1, 2)]).unwrap();
        drop(store);
        let store = JournalIndexStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn corrupted_record_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.journal");
        {
            let mut store = JournalIndexStore::open(&path).unwrap();
            store.batch_insert(&[pending(b"a", 1, 0)]).unwrap();
            store.batch_insert(&[pending(b"b", 1, 2)]).unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let store = JournalIndexStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn closed_store_rejects_calls() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JournalIndexStore::open(&dir.path().join("j")).unwrap();
        store.close().unwrap();
        assert!(matches!(
            store.lookup_location(&Digest::of(b"a")),
            Err(IndexError::Closed)
        ));
        assert!(store.close().is_ok());
    }

    #[test]
    fn sync_every_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j");
        let mut store = JournalIndexStore::open_with(&path, SyncMode::EveryWrite).unwrap();
        store.batch_insert(&[pending(b"z", 1, 0)]).unwrap();
        assert!(store.batch_exists(&[Digest::of(b"z")]).unwrap().contains(&Digest::of(b"z")));
    }
}
