//! Named shared-memory regions with primary/secondary process roles.
//!
//! Cooperating processes share driver state (checksum oracle, write token,
//! command log, config word) through file-backed mappings. The *primary*
//! process is the only one allowed to reserve or free a region; *secondary*
//! processes discover existing regions by name. Backing files live under
//! `/dev/shm` (or the temp dir where that does not exist) and are named
//! `<region>.<shm_id>` so that independent driver instances stay disjoint.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::{Arc, Mutex};

use memmap2::MmapMut;
use tracing::debug;

use crate::error::{DriverError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
}

/// A mapped shared region: `(name, base, size)` plus the backing file.
///
/// The mapping is shared by construction; typed views hand out atomics so
/// cross-process slot updates stay tear-free. Raw byte access is reserved
/// for the command log, whose entries are single-writer plain data.
pub struct ShmRegion {
    name: String,
    base: *mut u8,
    len: usize,
    _map: MmapMut,
}

// The region is shared memory: all access goes through atomics or through
// volatile reads/writes of single-writer slots.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    fn new(name: &str, mut map: MmapMut, len: usize) -> Self {
        let base = map.as_mut_ptr();
        ShmRegion {
            name: name.to_string(),
            base,
            len,
            _map: map,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole region as 32-bit atomic slots.
    pub fn as_atomic_u32(&self) -> &[AtomicU32] {
        debug_assert_eq!(self.len % 4, 0);
        unsafe { std::slice::from_raw_parts(self.base as *const AtomicU32, self.len / 4) }
    }

    /// The `index`-th 64-bit word of the region.
    pub fn atomic_u64(&self, index: usize) -> &AtomicU64 {
        assert!((index + 1) * 8 <= self.len);
        unsafe { &*(self.base.add(index * 8) as *const AtomicU64) }
    }

    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.base
    }
}

/// Reserves, looks up and frees named regions on behalf of one process.
pub struct ShmManager {
    role: Role,
    shm_id: u32,
    base_dir: PathBuf,
    owned: Mutex<Vec<String>>,
}

impl ShmManager {
    pub fn new(role: Role, shm_id: u32) -> Self {
        let base_dir = if Path::new("/dev/shm").is_dir() {
            PathBuf::from("/dev/shm")
        } else {
            std::env::temp_dir()
        };
        ShmManager {
            role,
            shm_id,
            base_dir,
            owned: Mutex::new(Vec::new()),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    fn backing_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.{}", self.shm_id))
    }

    /// Create a zero-filled region. Primary only.
    pub fn reserve(&self, name: &str, size: usize) -> Result<Arc<ShmRegion>> {
        if self.role != Role::Primary {
            return Err(DriverError::NotPrimary);
        }
        let path = self.backing_path(name);
        let map_err = |source| DriverError::RegionIo {
            name: name.to_string(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(map_err)?;
        file.set_len(size as u64).map_err(map_err)?;
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(map_err)?;
        self.owned.lock().unwrap().push(name.to_string());
        debug!(name, size, "reserved shared region");
        Ok(Arc::new(ShmRegion::new(name, map, size)))
    }

    /// Attach to an existing region, `None` when it does not exist.
    pub fn lookup(&self, name: &str) -> Option<Arc<ShmRegion>> {
        let path = self.backing_path(name);
        let file = OpenOptions::new().read(true).write(true).open(&path).ok()?;
        let len = file.metadata().ok()?.len() as usize;
        if len == 0 {
            return None;
        }
        let map = unsafe { MmapMut::map_mut(&file) }.ok()?;
        debug!(name, len, "looked up shared region");
        Some(Arc::new(ShmRegion::new(name, map, len)))
    }

    /// Unlink a region's backing file. Primary only. Existing mappings stay
    /// valid until dropped.
    pub fn free(&self, name: &str) -> Result<()> {
        if self.role != Role::Primary {
            return Err(DriverError::NotPrimary);
        }
        let path = self.backing_path(name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(DriverError::RegionIo {
                    name: name.to_string(),
                    source,
                })
            }
        }
        self.owned.lock().unwrap().retain(|n| n != name);
        debug!(name, "freed shared region");
        Ok(())
    }
}

impl Drop for ShmManager {
    fn drop(&mut self) {
        if self.role != Role::Primary {
            return;
        }
        let owned = std::mem::take(&mut *self.owned.lock().unwrap());
        for name in owned {
            let _ = fs::remove_file(self.backing_path(&name));
        }
    }
}
