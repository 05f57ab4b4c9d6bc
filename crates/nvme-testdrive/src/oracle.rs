//! Host-side data-integrity oracle.
//!
//! One 32-bit slot per logical block holds the CRC32C of the last payload the
//! host handed to the device for that block, with two reserved values:
//! `0` (never written / trimmed, reads are not checked) and `0xffff_ffff`
//! (explicitly marked uncorrectable, any read must fail verification). A
//! shared monotonically increasing token makes every write of every block
//! produce distinct bytes, so stale data can never masquerade as fresh.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::buffer::DmaBuffer;
use crate::driver::{CRC_TABLE_REGION, IO_TOKEN_REGION};
use crate::error::{DriverError, Result};
use crate::shmem::{ShmManager, ShmRegion};

/// Slot value for a block that was never written or has been trimmed.
pub const UNMAPPED: u32 = 0;
/// Slot value for a block explicitly marked bad.
pub const UNCORRECTABLE: u32 = 0xffff_ffff;

/// CRC32C of one sector, biased away from the two sentinel values.
fn sector_checksum(data: &[u8]) -> u32 {
    match crc32c::crc32c(data) {
        UNMAPPED => 1,
        UNCORRECTABLE => 0xffff_fffe,
        crc => crc,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyFailure {
    /// The oracle marks the block uncorrectable; the device's answer is
    /// irrelevant.
    Uncorrectable { lba: u64 },
    /// The first eight bytes of the payload do not name the block they were
    /// read from.
    LbaStampMismatch { lba: u64, found: u64 },
    CrcMismatch { lba: u64, expected: u32, computed: u32 },
}

impl VerifyFailure {
    pub fn lba(&self) -> u64 {
        match *self {
            VerifyFailure::Uncorrectable { lba } => lba,
            VerifyFailure::LbaStampMismatch { lba, .. } => lba,
            VerifyFailure::CrcMismatch { lba, .. } => lba,
        }
    }
}

/// The CRC table plus the write token.
///
/// When the CRC region cannot be reserved (not enough memory to cover the
/// drive) the oracle runs in disabled mode: writes still get stamped with
/// LBA and token, but checksums are neither recorded nor checked.
pub struct DataOracle {
    crc: Option<Arc<ShmRegion>>,
    token: Arc<ShmRegion>,
    sectors: u64,
}

impl DataOracle {
    /// Size and reserve (primary) or look up (secondary) the shared regions
    /// for a namespace of `total_sectors` blocks.
    pub fn init(shm: &ShmManager, total_sectors: u64) -> Result<Self> {
        let crc_size = (total_sectors as usize) * 4;
        let (crc, token) = if shm.is_primary() {
            let crc = match shm.reserve(CRC_TABLE_REGION, crc_size) {
                Ok(region) => Some(region),
                Err(err) => {
                    warn!(
                        %err,
                        "memory is not large enough to keep CRC32 of the whole \
                         drive data, data verification is disabled"
                    );
                    None
                }
            };
            let token = shm.reserve(IO_TOKEN_REGION, 8)?;
            (crc, token)
        } else {
            let crc = shm.lookup(CRC_TABLE_REGION);
            if crc.is_none() {
                warn!("CRC32 table not found, data verification is disabled");
            }
            let token = shm.lookup(IO_TOKEN_REGION).ok_or(DriverError::RegionNotFound {
                name: IO_TOKEN_REGION.to_string(),
            })?;
            (crc, token)
        };
        Ok(DataOracle {
            crc,
            token,
            sectors: total_sectors,
        })
    }

    pub fn verification_enabled(&self) -> bool {
        self.crc.is_some()
    }

    pub fn num_sectors(&self) -> u64 {
        self.sectors
    }

    fn slots(&self) -> Option<&[AtomicU32]> {
        self.crc.as_deref().map(ShmRegion::as_atomic_u32)
    }

    fn token_word(&self) -> &AtomicU64 {
        self.token.atomic_u64(0)
    }

    pub fn current_token(&self) -> u64 {
        self.token_word().load(Ordering::SeqCst)
    }

    /// The recorded checksum for one block, `None` in disabled mode.
    pub fn checksum(&self, lba: u64) -> Option<u32> {
        self.slots()
            .and_then(|slots| slots.get(lba as usize))
            .map(|slot| slot.load(Ordering::Relaxed))
    }

    /// Stamp a write buffer in place and record per-block checksums.
    ///
    /// Block `i` gets its LBA in bytes 0..8 and `token + i` in its last eight
    /// bytes; the token counter advances by `lba_count` in one seq-cst
    /// fetch-add, so concurrent writers never reuse a stamp. The oracle is
    /// updated *before* the device sees the command: the device is assumed to
    /// land the data as given. After a failed write there is no telling which
    /// blocks were updated, so the table is deliberately left ahead of the
    /// media and a later read of those blocks will report a mismatch.
    pub fn record_write(&self, lba: u64, lba_count: u32, buf: &DmaBuffer, lba_size: u32) {
        let lba_size = lba_size as usize;
        let token = self
            .token_word()
            .fetch_add(lba_count as u64, Ordering::SeqCst);
        buf.with_mut(|bytes| {
            for i in 0..lba_count as usize {
                let sector = &mut bytes[i * lba_size..(i + 1) * lba_size];
                let cur = lba + i as u64;
                sector[..8].copy_from_slice(&cur.to_le_bytes());
                sector[lba_size - 8..].copy_from_slice(&(token + i as u64).to_le_bytes());
                if let Some(slot) = self.slots().and_then(|s| s.get(cur as usize)) {
                    slot.store(sector_checksum(sector), Ordering::Relaxed);
                }
            }
        });
    }

    /// Check read data against the table. Unmapped blocks are skipped; in
    /// disabled mode everything passes.
    pub fn verify(
        &self,
        lba: u64,
        lba_count: u32,
        buf: &DmaBuffer,
        lba_size: u32,
    ) -> std::result::Result<(), VerifyFailure> {
        let Some(slots) = self.slots() else {
            // disabled mode: reads are never flagged
            return Ok(());
        };
        let lba_size = lba_size as usize;
        buf.with(|bytes| {
            for i in 0..lba_count as usize {
                let cur = lba + i as u64;
                let Some(slot) = slots.get(cur as usize) else {
                    continue;
                };
                let expected = slot.load(Ordering::Relaxed);
                if expected == UNMAPPED {
                    continue;
                }
                let sector = &bytes[i * lba_size..(i + 1) * lba_size];
                let computed = sector_checksum(sector);
                if expected == UNCORRECTABLE {
                    warn!(lba = cur, "lba uncorrectable");
                    return Err(VerifyFailure::Uncorrectable { lba: cur });
                }
                let found = u64::from_le_bytes(sector[..8].try_into().unwrap());
                if found != cur {
                    warn!(lba = cur, found, "lba mismatch");
                    return Err(VerifyFailure::LbaStampMismatch { lba: cur, found });
                }
                if computed != expected {
                    warn!(lba = cur, expected, computed, "crc mismatch");
                    return Err(VerifyFailure::CrcMismatch {
                        lba: cur,
                        expected,
                        computed,
                    });
                }
            }
            Ok(())
        })
    }

    /// Return blocks to the unmapped state (trim, deallocate, format).
    pub fn invalidate(&self, lba: u64, lba_count: u64) {
        self.fill(lba, lba_count, UNMAPPED);
    }

    /// Mark blocks bad: every subsequent read over them must fail
    /// verification no matter what the device returns.
    pub fn mark_uncorrectable(&self, lba: u64, lba_count: u64) {
        self.fill(lba, lba_count, UNCORRECTABLE);
    }

    /// Clear the whole table (sanitize / format).
    pub fn invalidate_all(&self) {
        assert!(self.sectors != 0, "namespace not attached");
        self.fill(0, self.sectors, UNMAPPED);
    }

    fn fill(&self, lba: u64, lba_count: u64, value: u32) {
        if let Some(slots) = self.slots() {
            let start = (lba as usize).min(slots.len());
            let end = (lba.saturating_add(lba_count) as usize).min(slots.len());
            for slot in &slots[start..end] {
                slot.store(value, Ordering::Relaxed);
            }
        }
    }
}
