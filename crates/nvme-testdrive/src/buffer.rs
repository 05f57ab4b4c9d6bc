//! Page-aligned I/O buffers shared between the driver core and the transport.
//!
//! A buffer is handed to the transport at submission and read back by the
//! verification path at completion, so the handle is cheaply cloneable and
//! the storage lives until the last holder drops it. Alignment mirrors what
//! a DMA allocator would hand out; the backing here is plain host memory.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use tracing::debug;

pub const PAGE_SIZE: usize = 4096;

struct Inner {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
}

#[derive(Clone)]
pub struct DmaBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl DmaBuffer {
    /// Allocate a zero-filled buffer of `len` bytes, aligned to a page.
    pub fn zeroed(len: usize) -> Self {
        let storage = vec![0u8; len + PAGE_SIZE];
        let offset = storage.as_ptr().align_offset(PAGE_SIZE);
        debug!(len, "buffer: alloc");
        DmaBuffer {
            inner: Arc::new(Mutex::new(Inner {
                storage,
                offset,
                len,
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `data` into the buffer at `offset`. Panics when out of bounds,
    /// like slice indexing.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        self.with_mut(|bytes| bytes[offset..offset + data.len()].copy_from_slice(data));
    }

    /// Copy bytes out of the buffer at `offset`.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) {
        self.with(|bytes| out.copy_from_slice(&bytes[offset..offset + out.len()]));
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.with(|bytes| bytes.to_vec())
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.inner.lock().unwrap();
        let (offset, len) = (inner.offset, inner.len);
        f(&inner.storage[offset..offset + len])
    }

    pub(crate) fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        let (offset, len) = (inner.offset, inner.len);
        f(&mut inner.storage[offset..offset + len])
    }
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer").field("len", &self.len()).finish()
    }
}

/// Render bytes as a hex + ASCII dump, 16 bytes per line.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}: ", line * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
        }
        out.push('|');
        for b in chunk {
            out.push(if b.is_ascii_graphic() || *b == b' ' {
                *b as char
            } else {
                '.'
            });
        }
        out.push('|');
        out.push('\n');
    }
    out
}
