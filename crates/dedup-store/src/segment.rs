//! Segment selection, rotation, and record appends.
//!
//! Segment files are named `<prefix><digits>` with at least
//! `min_suffix_width` zero-padded decimal digits. The pointer file next to
//! them names the segment that accepts new records, so a restarted writer
//! resumes appending where the last one stopped.
//!
//! The pointer is rewritten by truncating it to empty and then writing the
//! new name. A crash between the two leaves it empty or stale; an unreadable
//! pointer is treated as absent and a fresh segment is searched for.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use dedup_index::{IndexStore, Location, SegmentId};
use dedup_types::block::encode_length;
use dedup_types::LENGTH_PREFIX_WIDTH;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::context::Context;
use crate::error::{StoreError, StoreResult};
use crate::pool::{AccessMode, DescriptorPool, Handle};

/// The pointer file must be shorter than this to be trusted.
pub const POINTER_MAX_LEN: u64 = 256;

/// Segment file naming convention.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentNaming {
    prefix: String,
    min_width: usize,
}

impl SegmentNaming {
    pub fn new(prefix: impl Into<String>, min_width: usize) -> Self {
        Self {
            prefix: prefix.into(),
            min_width,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.segment_prefix.clone(), config.min_suffix_width)
    }

    /// `true` if `name` is the prefix followed by at least `min_width`
    /// decimal digits and nothing else.
    pub fn is_valid(&self, name: &str) -> bool {
        match name.strip_prefix(&self.prefix) {
            Some(suffix) => {
                suffix.len() >= self.min_width && suffix.bytes().all(|b| b.is_ascii_digit())
            }
            None => false,
        }
    }

    /// Name for suffix `value` zero-padded to `width` digits.
    pub fn format(&self, value: u64, width: usize) -> String {
        format!("{}{:0width$}", self.prefix, value, width = width)
    }

    /// Suffix value and width of a valid name.
    pub fn suffix(&self, name: &str) -> Option<(u64, usize)> {
        if !self.is_valid(name) {
            return None;
        }
        let digits = &name[self.prefix.len()..];
        digits.parse().ok().map(|value| (value, digits.len()))
    }

    /// First name at or after `start` (in suffix order) with no file in
    /// `dir`.
    ///
    /// Without a valid `start` the search begins at zero with the minimum
    /// width. When every value of a width is taken the width grows by one
    /// digit and the search restarts at zero.
    pub fn find_unused(&self, dir: &Path, start: Option<&str>) -> String {
        let (mut value, mut width) = start
            .and_then(|name| self.suffix(name))
            .unwrap_or((0, self.min_width));
        loop {
            let end = u32::try_from(width)
                .ok()
                .and_then(|w| 10u64.checked_pow(w))
                .unwrap_or(u64::MAX);
            while value < end {
                let name = self.format(value, width);
                if !dir.join(&name).exists() {
                    return name;
                }
                value += 1;
            }
            debug!(width, "segment names of this width exhausted; widening");
            width += 1;
            value = 0;
        }
    }
}

/// The segment currently accepting records.
#[derive(Debug)]
struct ActiveSegment {
    name: String,
    id: SegmentId,
    handle: Handle,
    size: u64,
}

/// Selects the current segment, appends records to it, and rotates to a new
/// segment before one would outgrow the size limit.
#[derive(Debug)]
pub struct SegmentManager {
    naming: SegmentNaming,
    dir: PathBuf,
    pointer_path: PathBuf,
    max_size: u64,
    active: Option<ActiveSegment>,
}

impl SegmentManager {
    /// Resume the segment named by the pointer file, or pick a fresh one.
    pub fn open<I: IndexStore>(ctx: &mut Context<I>) -> StoreResult<Self> {
        let mut manager = Self {
            naming: SegmentNaming::from_config(&ctx.config),
            dir: ctx.config.segments_path(),
            pointer_path: ctx.config.pointer_path(),
            max_size: ctx.config.max_segment_size,
            active: None,
        };

        let pointer = manager.read_pointer(&mut ctx.pool)?;
        let mut resumed = None;
        if let Some(name) = pointer.as_deref() {
            let path = manager.dir.join(name);
            if path.exists() {
                let handle = ctx.pool.acquire(&path, AccessMode::Append)?;
                let size = ctx.pool.entry_mut(handle)?.file().metadata()?.len();
                if size < manager.max_size {
                    info!(segment = name, size, "resuming segment from pointer");
                    resumed = Some((name.to_string(), handle, size));
                } else {
                    info!(segment = name, size, "pointed segment is full");
                    ctx.pool.release(handle);
                }
            }
        }

        let (name, handle, size) = match resumed {
            Some(found) => found,
            None => {
                let name = manager.naming.find_unused(&manager.dir, pointer.as_deref());
                if pointer.as_deref() != Some(name.as_str()) {
                    manager.write_pointer(&mut ctx.pool, &name)?;
                }
                let handle = ctx.pool.acquire(&manager.dir.join(&name), AccessMode::Append)?;
                info!(segment = %name, "selected new segment");
                (name, handle, 0)
            }
        };

        let id = manager.register(ctx, &name)?;
        manager.active = Some(ActiveSegment {
            name,
            id,
            handle,
            size,
        });
        Ok(manager)
    }

    /// Append `[length-prefix][payload]` and return where it starts.
    ///
    /// Rotates first if the record would push a non-empty segment past the
    /// size limit.
    pub fn append<I: IndexStore>(
        &mut self,
        ctx: &mut Context<I>,
        payload: &[u8],
    ) -> StoreResult<Location> {
        let prefix = encode_length(payload.len())?;
        let record_len = (LENGTH_PREFIX_WIDTH + payload.len()) as u64;

        let needs_rotation = match &self.active {
            Some(active) => active.size > 0 && active.size + record_len > self.max_size,
            None => true,
        };
        if needs_rotation {
            self.rotate(ctx)?;
        }
        let active = self.active.as_mut().ok_or_else(|| {
            StoreError::InvalidConfig("no active segment after rotation".into())
        })?;

        let file = ctx.pool.entry_mut(active.handle)?.file_mut();
        let offset = file.seek(SeekFrom::End(0))?;
        let mut record = Vec::with_capacity(record_len as usize);
        record.extend_from_slice(&prefix);
        record.extend_from_slice(payload);
        file.write_all(&record)?;

        active.size = offset + record_len;
        Ok(Location {
            segment: active.id,
            offset,
        })
    }

    /// Switch to a fresh segment, searching onward from the current name.
    pub fn rotate<I: IndexStore>(&mut self, ctx: &mut Context<I>) -> StoreResult<()> {
        let previous = self.active.take();
        if let Some(prev) = &previous {
            ctx.pool.entry_mut(prev.handle)?.file().sync_data()?;
            ctx.pool.release(prev.handle);
        }
        let start = previous.as_ref().map(|prev| prev.name.as_str());
        let name = self.naming.find_unused(&self.dir, start);
        self.write_pointer(&mut ctx.pool, &name)?;
        let handle = ctx.pool.acquire(&self.dir.join(&name), AccessMode::Append)?;
        let id = self.register(ctx, &name)?;
        info!(
            from = previous.as_ref().map(|p| p.name.as_str()).unwrap_or("-"),
            to = %name,
            "rotated segment"
        );
        self.active = Some(ActiveSegment {
            name,
            id,
            handle,
            size: 0,
        });
        Ok(())
    }

    /// Flush and release the active segment's handle.
    pub fn close(&mut self, pool: &mut DescriptorPool) -> StoreResult<()> {
        if let Some(active) = self.active.take() {
            if let Some(entry) = pool.get_mut(active.handle) {
                entry.file_mut().flush()?;
                entry.file().sync_data()?;
            }
            pool.release(active.handle);
        }
        Ok(())
    }

    pub fn current_name(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.name.as_str())
    }

    pub fn current_id(&self) -> Option<SegmentId> {
        self.active.as_ref().map(|a| a.id)
    }

    pub fn current_size(&self) -> u64 {
        self.active.as_ref().map_or(0, |a| a.size)
    }

    /// Name recorded in the pointer file, if it is present, short enough,
    /// and follows the naming convention.
    fn read_pointer(&self, pool: &mut DescriptorPool) -> StoreResult<Option<String>> {
        if !self.pointer_path.exists() {
            return Ok(None);
        }
        let handle = pool.acquire(&self.pointer_path, AccessMode::Read)?;
        let result = (|| -> StoreResult<Option<String>> {
            let file = pool.entry_mut(handle)?.file_mut();
            let len = file.metadata()?.len();
            if len >= POINTER_MAX_LEN {
                warn!(path = %self.pointer_path.display(), len, "segment pointer too long; ignoring");
                return Ok(None);
            }
            let mut raw = Vec::with_capacity(len as usize);
            file.read_to_end(&mut raw)?;
            let text = String::from_utf8_lossy(&raw);
            let name = text.trim_end_matches(['\0', '\n', '\r']);
            if !self.naming.is_valid(name) {
                warn!(path = %self.pointer_path.display(), pointer = %name, "invalid segment pointer; ignoring");
                return Ok(None);
            }
            Ok(Some(name.to_string()))
        })();
        pool.release(handle);
        result
    }

    /// Truncate the pointer to empty, then write `name`.
    fn write_pointer(&self, pool: &mut DescriptorPool, name: &str) -> StoreResult<()> {
        let handle = pool.acquire(&self.pointer_path, AccessMode::ReadWrite)?;
        let result = (|| -> StoreResult<()> {
            let file = pool.entry_mut(handle)?.file_mut();
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(name.as_bytes())?;
            file.sync_data()?;
            Ok(())
        })();
        pool.release(handle);
        debug!(pointer = name, "segment pointer updated");
        result
    }

    fn register<I: IndexStore>(&self, ctx: &mut Context<I>, name: &str) -> StoreResult<SegmentId> {
        let path = self.dir.join(name);
        let key = path.to_str().ok_or_else(|| {
            StoreError::InvalidConfig(format!("segment path {path:?} is not valid UTF-8"))
        })?;
        Ok(ctx.index.resolve_or_create_stream_id(key)?)
    }
}
