//! Read path: replay a manifest and re-emit each block from its segment.
//!
//! Reconstruction is best effort. A block whose metadata or record is
//! missing or damaged is replaced by filler bytes and a warning; only index
//! store failures, output errors, and a pool that stays exhausted stop it.

use std::collections::HashMap;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use dedup_index::{IndexStore, SegmentId};
use dedup_types::block::decode_length;
use dedup_types::{Digest, BLOCK_SIZE, FILLER_BYTE, LENGTH_PREFIX_WIDTH};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{PoolError, StoreResult};
use crate::manifest::ManifestReader;
use crate::pool::{AccessMode, DescriptorPool, Handle};

/// Result of one [`Reconstructor::fill`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FillOutcome {
    /// Bytes written to the output buffer.
    pub bytes: usize,
    /// Digests handled, in order from the start of the input slice.
    pub consumed: usize,
    /// The pool ran out of handles before every digest was handled.
    pub deferred: bool,
}

/// Resolves digests to block bytes.
#[derive(Debug)]
pub struct Reconstructor {
    paths: HashMap<SegmentId, PathBuf>,
    open: HashMap<SegmentId, Handle>,
    filler_blocks: u64,
}

impl Reconstructor {
    /// Load the segment path table from the index store.
    pub fn new<I: IndexStore>(ctx: &mut Context<I>) -> StoreResult<Self> {
        let paths: HashMap<_, _> = ctx.index.list_known_segments()?.into_iter().collect();
        debug!(segments = paths.len(), "segment path table loaded");
        Ok(Self {
            paths,
            open: HashMap::new(),
            filler_blocks: 0,
        })
    }

    /// Write the blocks for `digests` into `out`, stopping when the next
    /// block might not fit or the pool is exhausted.
    pub fn fill<I: IndexStore>(
        &mut self,
        ctx: &mut Context<I>,
        digests: &[Digest],
        out: &mut [u8],
    ) -> StoreResult<FillOutcome> {
        let mut outcome = FillOutcome::default();
        for digest in digests {
            if outcome.bytes + BLOCK_SIZE > out.len() {
                break;
            }
            let dest = &mut out[outcome.bytes..outcome.bytes + BLOCK_SIZE];

            let Some(location) = ctx.index.lookup_location(digest)? else {
                warn!(digest = %digest.short_hex(), "block missing from index; emitting filler");
                outcome.bytes += self.filler(dest);
                outcome.consumed += 1;
                continue;
            };
            let Some(path) = self.paths.get(&location.segment) else {
                warn!(
                    digest = %digest.short_hex(),
                    segment = %location.segment,
                    "unknown segment; emitting filler"
                );
                outcome.bytes += self.filler(dest);
                outcome.consumed += 1;
                continue;
            };

            let handle = match self.open.get(&location.segment) {
                Some(&handle) if ctx.pool.get(handle).is_some() => handle,
                _ => match ctx.pool.acquire(path, AccessMode::Read) {
                    Ok(handle) => {
                        self.open.insert(location.segment, handle);
                        handle
                    }
                    Err(PoolError::Exhausted { limit }) => {
                        debug!(limit, consumed = outcome.consumed, "descriptor pool exhausted; deferring");
                        outcome.deferred = true;
                        break;
                    }
                    Err(e) => {
                        let cause = std::error::Error::source(&e).map(ToString::to_string);
                        warn!(
                            digest = %digest.short_hex(),
                            error = %e,
                            cause = cause.as_deref().unwrap_or("-"),
                            "segment unreadable; emitting filler"
                        );
                        self.open.remove(&location.segment);
                        outcome.bytes += self.filler(dest);
                        outcome.consumed += 1;
                        continue;
                    }
                },
            };

            let file = ctx.pool.entry_mut(handle)?.file_mut();
            outcome.bytes += match read_record(file, location.offset, dest) {
                Ok(len) => len,
                Err(Damage::Unreadable(reason)) => {
                    warn!(
                        digest = %digest.short_hex(),
                        offset = location.offset,
                        reason,
                        "block record unreadable; emitting filler"
                    );
                    self.filler(dest)
                }
                Err(Damage::Short { declared, got }) => {
                    warn!(
                        digest = %digest.short_hex(),
                        offset = location.offset,
                        declared,
                        got,
                        "block record truncated; padding with filler"
                    );
                    self.filler_blocks += 1;
                    dest[got..declared].fill(FILLER_BYTE);
                    declared
                }
            };
            outcome.consumed += 1;
        }
        Ok(outcome)
    }

    /// Release every cached segment handle.
    pub fn release_segments(&mut self, pool: &mut DescriptorPool) -> usize {
        self.open
            .drain()
            .filter(|(_, handle)| pool.release(*handle))
            .count()
    }

    /// Blocks replaced or padded with filler so far.
    pub fn filler_blocks(&self) -> u64 {
        self.filler_blocks
    }

    fn filler(&mut self, dest: &mut [u8]) -> usize {
        self.filler_blocks += 1;
        dest[..BLOCK_SIZE].fill(FILLER_BYTE);
        BLOCK_SIZE
    }
}

enum Damage {
    Unreadable(&'static str),
    Short { declared: usize, got: usize },
}

/// Read the record at `offset` into `dest`, returning the payload length.
fn read_record(file: &mut File, offset: u64, dest: &mut [u8]) -> Result<usize, Damage> {
    file.seek(SeekFrom::Start(offset))
        .map_err(|_| Damage::Unreadable("seek failed"))?;
    let mut prefix = [0u8; LENGTH_PREFIX_WIDTH];
    file.read_exact(&mut prefix)
        .map_err(|_| Damage::Unreadable("length prefix unreadable"))?;
    let declared = decode_length(&prefix);
    if declared > BLOCK_SIZE {
        return Err(Damage::Unreadable("declared length exceeds block size"));
    }
    let mut got = 0;
    while got < declared {
        match file.read(&mut dest[got..declared]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    if got < declared {
        return Err(Damage::Short { declared, got });
    }
    Ok(declared)
}

/// Statistics for one reconstructed stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadReport {
    pub bytes: u64,
    pub blocks: u64,
    /// Blocks replaced or padded with filler.
    pub filler_blocks: u64,
    /// Times the pool ran out of handles mid-buffer.
    pub deferrals: u64,
}

/// Reconstructs one stored stream.
#[derive(Debug)]
pub struct StreamReader {
    name: String,
    manifest: ManifestReader,
    reconstructor: Reconstructor,
}

impl StreamReader {
    pub fn open<I: IndexStore>(ctx: &mut Context<I>, name: &str) -> StoreResult<Self> {
        let path = ctx.config.manifest_path(name)?;
        let mut manifest = ManifestReader::open(&mut ctx.pool, &path)?;
        let reconstructor = match Reconstructor::new(ctx) {
            Ok(r) => r,
            Err(e) => {
                manifest.close(&mut ctx.pool);
                return Err(e);
            }
        };
        info!(stream = name, manifest = %path.display(), "reading stream");
        Ok(Self {
            name: name.to_string(),
            manifest,
            reconstructor,
        })
    }

    /// Write the whole stream to `out`.
    ///
    /// When the pool runs dry, output produced so far is flushed, the cached
    /// segment handles are released, and the fill is retried. Two deferrals
    /// in a row without progress fail with [`PoolError::Exhausted`].
    pub fn copy_to<I: IndexStore, W: Write>(
        &mut self,
        ctx: &mut Context<I>,
        out: &mut W,
    ) -> StoreResult<ReadReport> {
        let buffer_size = ctx.config.read_buffer_size;
        let mut buf = vec![0u8; buffer_size];
        let mut report = ReadReport::default();
        let mut stalled = false;

        loop {
            let digests = self
                .manifest
                .next_batch(&mut ctx.pool, buffer_size / BLOCK_SIZE)?;
            if digests.is_empty() {
                break;
            }
            let mut pos = 0;
            while pos < digests.len() {
                let outcome = self.reconstructor.fill(ctx, &digests[pos..], &mut buf)?;
                out.write_all(&buf[..outcome.bytes])?;
                pos += outcome.consumed;
                report.bytes += outcome.bytes as u64;
                report.blocks += outcome.consumed as u64;

                if outcome.deferred {
                    report.deferrals += 1;
                    out.flush()?;
                    let released = self.reconstructor.release_segments(&mut ctx.pool);
                    debug!(released, "released segment handles after deferral");
                    if outcome.consumed == 0 {
                        if stalled {
                            return Err(PoolError::Exhausted {
                                limit: ctx.pool.limit(),
                            }
                            .into());
                        }
                        stalled = true;
                    } else {
                        stalled = false;
                    }
                } else {
                    stalled = false;
                }
            }
        }
        out.flush()?;
        report.filler_blocks = self.reconstructor.filler_blocks();
        Ok(report)
    }

    /// Release the manifest and every cached segment handle.
    pub fn close(mut self, pool: &mut DescriptorPool) {
        self.reconstructor.release_segments(pool);
        self.manifest.close(pool);
        debug!(stream = %self.name, "stream reader closed");
    }
}
