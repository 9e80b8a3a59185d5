//! Bounded pool of open file handles.
//!
//! Entries live in an arena of slots addressed by [`Handle`]s. A handle is a
//! slot index plus the slot's generation at acquisition time; releasing a
//! slot bumps its generation, so every outstanding copy of the old handle
//! stops resolving instead of aliasing whatever reuses the slot. Acquiring or
//! releasing one entry never moves another.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::StoreConfig;
use crate::error::PoolError;

/// How a pooled file is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// Read only. The file must exist.
    Read,
    /// Append-only writes, creating the file if missing.
    Append,
    /// Read and write without truncation, creating the file if missing.
    ReadWrite,
    /// Read and write a file that must not exist yet.
    CreateNew,
}

impl AccessMode {
    fn options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        match self {
            Self::Read => opts.read(true),
            Self::Append => opts.read(true).append(true).create(true),
            Self::ReadWrite => opts.read(true).write(true).create(true).truncate(false),
            Self::CreateNew => opts.read(true).write(true).create_new(true),
        };
        opts
    }
}

/// Stable reference to a pooled file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

/// An open file owned by the pool.
#[derive(Debug)]
pub struct PoolEntry {
    file: File,
    path: PathBuf,
    mode: AccessMode,
}

impl PoolEntry {
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<PoolEntry>,
}

/// Arena of open files with a hard upper bound.
///
/// Exceeding the bound is an error; nothing is evicted.
#[derive(Debug)]
pub struct DescriptorPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    open: usize,
    limit: usize,
}

impl DescriptorPool {
    /// Create a pool that holds at most `limit` open files.
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            open: 0,
            limit,
        }
    }

    /// Create a pool bounded by half the process's file handle limit.
    pub fn from_os(min_limit: u64) -> Result<Self, PoolError> {
        let (soft, hard) = os_handle_limit().map_err(PoolError::LimitQuery)?;
        let limit = derive_limit(soft, hard, min_limit)?;
        debug!(soft, hard, limit, "descriptor pool bound derived from RLIMIT_NOFILE");
        Ok(Self::new(limit))
    }

    /// Pool sized by `config`: its fixed `handle_limit` if set, otherwise
    /// derived from the OS limit with `min_handle_limit` as the floor.
    pub fn for_config(config: &StoreConfig) -> Result<Self, PoolError> {
        match config.handle_limit {
            Some(limit) => Ok(Self::new(limit)),
            None => Self::from_os(config.min_handle_limit),
        }
    }

    /// Open `path` and return a handle to it.
    pub fn acquire(&mut self, path: &Path, mode: AccessMode) -> Result<Handle, PoolError> {
        if self.open >= self.limit {
            return Err(PoolError::Exhausted { limit: self.limit });
        }
        let file = mode.options().open(path).map_err(|source| PoolError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let entry = PoolEntry {
            file,
            path: path.to_path_buf(),
            mode,
        };

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(entry);
        self.open += 1;
        Ok(Handle {
            index,
            generation: slot.generation,
        })
    }

    /// Close the file behind `handle`. Returns `false` if the handle was
    /// already stale.
    pub fn release(&mut self, handle: Handle) -> bool {
        let Some(slot) = self.live_slot_mut(handle) else {
            return false;
        };
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.open -= 1;
        true
    }

    /// Close every pooled file. Returns how many were open.
    pub fn release_all(&mut self) -> usize {
        let closed = self.open;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.entry.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.open = 0;
        closed
    }

    pub fn get(&self, handle: Handle) -> Option<&PoolEntry> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut PoolEntry> {
        self.live_slot_mut(handle).and_then(|slot| slot.entry.as_mut())
    }

    /// Like [`get_mut`](Self::get_mut), but a stale handle is an error.
    pub fn entry_mut(&mut self, handle: Handle) -> Result<&mut PoolEntry, PoolError> {
        self.get_mut(handle).ok_or(PoolError::StaleHandle)
    }

    /// Number of open files.
    pub fn len(&self) -> usize {
        self.open
    }

    pub fn is_empty(&self) -> bool {
        self.open == 0
    }

    /// Maximum number of simultaneously open files.
    pub fn limit(&self) -> usize {
        self.limit
    }

    fn live_slot_mut(&mut self, handle: Handle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.entry.is_some())
    }
}

/// Pool bound for the given `RLIMIT_NOFILE` values: half the soft limit
/// when it exceeds 100, otherwise half the hard limit.
pub fn derive_limit(soft: u64, hard: u64, min_limit: u64) -> Result<usize, PoolError> {
    let available = if soft > 100 { soft / 2 } else { hard / 2 };
    if available < min_limit {
        return Err(PoolError::LimitTooLow {
            available,
            required: min_limit,
        });
    }
    Ok(usize::try_from(available).unwrap_or(usize::MAX))
}

#[cfg(unix)]
fn os_handle_limit() -> std::io::Result<(u64, u64)> {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `lim` is a valid, writable rlimit for the duration of the call.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok((lim.rlim_cur as u64, lim.rlim_max as u64))
}

#[cfg(not(unix))]
fn os_handle_limit() -> std::io::Result<(u64, u64)> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "RLIMIT_NOFILE is only available on unix",
    ))
}
