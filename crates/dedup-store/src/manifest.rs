//! Stream manifests: the ordered digest list of one stored stream.
//!
//! A manifest is the raw concatenation of 32-byte digests, one per block, in
//! stream order. It carries no header and no lengths; the final block's
//! length lives in its segment record.

use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use dedup_types::{Digest, DIGEST_LEN};
use tracing::warn;

use crate::error::{PoolError, StoreResult};
use crate::pool::{AccessMode, DescriptorPool, Handle};

/// Appends digests to a new manifest.
#[derive(Debug)]
pub struct ManifestWriter {
    path: PathBuf,
    handle: Option<Handle>,
    written: u64,
}

impl ManifestWriter {
    /// Create the manifest at `path`. Fails if it already exists.
    pub fn create(pool: &mut DescriptorPool, path: &Path) -> StoreResult<Self> {
        let handle = pool.acquire(path, AccessMode::CreateNew)?;
        Ok(Self {
            path: path.to_path_buf(),
            handle: Some(handle),
            written: 0,
        })
    }

    /// Append `digests` with a single write.
    pub fn append(&mut self, pool: &mut DescriptorPool, digests: &[Digest]) -> StoreResult<()> {
        if digests.is_empty() {
            return Ok(());
        }
        let handle = self.handle.ok_or(PoolError::StaleHandle)?;
        let mut buf = Vec::with_capacity(digests.len() * DIGEST_LEN);
        for digest in digests {
            buf.extend_from_slice(digest.as_bytes());
        }
        pool.entry_mut(handle)?.file_mut().write_all(&buf)?;
        self.written += digests.len() as u64;
        Ok(())
    }

    /// Digests written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush to disk and release the handle.
    pub fn close(&mut self, pool: &mut DescriptorPool) -> StoreResult<()> {
        if let Some(handle) = self.handle.take() {
            let result = (|| -> StoreResult<()> {
                let entry = pool.entry_mut(handle)?;
                entry.file_mut().flush()?;
                entry.file().sync_data()?;
                Ok(())
            })();
            pool.release(handle);
            return result;
        }
        Ok(())
    }
}

/// Reads digests back from an existing manifest in whole records.
#[derive(Debug)]
pub struct ManifestReader {
    path: PathBuf,
    handle: Option<Handle>,
}

impl ManifestReader {
    pub fn open(pool: &mut DescriptorPool, path: &Path) -> StoreResult<Self> {
        let handle = pool.acquire(path, AccessMode::Read)?;
        Ok(Self {
            path: path.to_path_buf(),
            handle: Some(handle),
        })
    }

    /// Up to `max` next digests; empty at end of manifest.
    ///
    /// Reads until `max` records are buffered or the file ends. A partial
    /// record at the end of the file is reported and dropped.
    pub fn next_batch(&mut self, pool: &mut DescriptorPool, max: usize) -> StoreResult<Vec<Digest>> {
        let Some(handle) = self.handle else {
            return Ok(Vec::new());
        };
        let mut buf = vec![0u8; max.max(1) * DIGEST_LEN];
        let file = pool.entry_mut(handle)?.file_mut();
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        // The buffer holds whole records, so a remainder only occurs at EOF.
        let whole = filled / DIGEST_LEN * DIGEST_LEN;
        if whole < filled {
            warn!(
                path = %self.path.display(),
                bytes = filled - whole,
                "manifest ends in a partial digest; ignoring it"
            );
        }

        Ok(buf[..whole]
            .chunks_exact(DIGEST_LEN)
            .filter_map(|record| Digest::from_slice(record).ok())
            .collect())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(&mut self, pool: &mut DescriptorPool) {
        if let Some(handle) = self.handle.take() {
            pool.release(handle);
        }
    }
}
