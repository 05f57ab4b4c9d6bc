//! Per-qpair command log: a fixed-depth ring of command/completion pairs.
//!
//! Every qpair owns a ring of [`CMD_LOG_DEPTH`] entries in the shared
//! `driver_cmdlog_table` region, written round-robin by the single thread
//! that owns the qpair. The slot the 2048th entry would occupy holds the
//! tail index instead; a tail equal to [`CMD_LOG_DEPTH`] marks the qpair as
//! cleared / not in use. Readers in other processes observe the tail with
//! acquire ordering and walk backward; slots still in flight may be torn,
//! which is acceptable because readers only render recently *completed*
//! entries for debug.
//!
//! Only plain data lives in the shared ring. The I/O buffer handle and the
//! user callback of an in-flight command are per-process and are kept in a
//! side table of the same depth next to the qpair state.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytemuck::{Pod, Zeroable};
use serde::Serialize;
use tracing::info;

use crate::error::{DriverError, Result};
use crate::nvme::{NvmeCommand, NvmeCompletion};
use crate::opcodes::{admin_opcode_name, io_opcode_name};
use crate::shmem::ShmRegion;

/// Ring depth per qpair. One slot of the 2048-entry block is reserved for
/// the tail word, and the depth must stay above the deepest queue the
/// transport will allocate so outstanding commands are never overwritten.
pub const CMD_LOG_DEPTH: usize = 2048 - 1;

/// Hard cap on qpairs per controller; the shared region is sized for it.
pub const CMD_LOG_MAX_Q: usize = 16;

const TAIL_CLEARED: u32 = CMD_LOG_DEPTH as u32;

/// One ring slot: the submitted command, its completion, and both
/// wall-clock stamps (microseconds since the UNIX epoch).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdLogEntry {
    pub time_cmd_us: u64,
    pub time_cpl_us: u64,
    pub cmd: NvmeCommand,
    pub cpl: NvmeCompletion,
    pub lba: u64,
    pub lba_count: u32,
    pub lba_size: u32,
    reserved: [u8; 80],
}

// cacheline multiple; the region layout depends on it
const _: () = assert!(core::mem::size_of::<CmdLogEntry>() == 192);

const ENTRY_SIZE: usize = core::mem::size_of::<CmdLogEntry>();
const QPAIR_BLOCK_SIZE: usize = ENTRY_SIZE * (CMD_LOG_DEPTH + 1);

/// Required size of the `driver_cmdlog_table` region.
pub(crate) const TABLE_REGION_SIZE: usize = QPAIR_BLOCK_SIZE * CMD_LOG_MAX_Q;

pub(crate) fn wallclock_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

impl CmdLogEntry {
    pub(crate) fn for_command(
        cmd: NvmeCommand,
        lba: u64,
        lba_count: u32,
        lba_size: u32,
    ) -> Self {
        CmdLogEntry {
            time_cmd_us: wallclock_us(),
            time_cpl_us: 0,
            cmd,
            cpl: NvmeCompletion::zeroed(),
            lba,
            lba_count,
            lba_size,
            reserved: [0; 80],
        }
    }

    pub fn latency_us(&self) -> u32 {
        self.time_cpl_us.saturating_sub(self.time_cmd_us) as u32
    }
}

impl fmt::Display for CmdLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "cmd @{}.{:06}: opc {:#04x} cid {} nsid {} cdw10 {:#x} cdw11 {:#x} cdw12 {:#x}",
            self.time_cmd_us / 1_000_000,
            self.time_cmd_us % 1_000_000,
            self.cmd.opc,
            self.cmd.cid,
            self.cmd.nsid,
            self.cmd.cdw10,
            self.cmd.cdw11,
            self.cmd.cdw12,
        )?;
        write!(
            f,
            "cpl @{}.{:06}: cid {} sct {:#x} sc {:#x} latency {}us",
            self.time_cpl_us / 1_000_000,
            self.time_cpl_us % 1_000_000,
            self.cpl.cid,
            self.cpl.sct(),
            self.cpl.sc(),
            self.cpl.latency_us(),
        )
    }
}

/// A dump of one qpair's ring, oldest slot first.
#[derive(Debug, Clone)]
pub struct CmdLogDump {
    pub qid: u16,
    pub tail: u32,
    pub entries: Vec<CmdLogEntry>,
}

impl fmt::Display for CmdLogDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "qpair {}, latest tail in cmdlog: {}",
            self.qid, self.tail
        )?;
        for (index, entry) in self.entries.iter().enumerate() {
            let name = if self.qid == 0 {
                admin_opcode_name(entry.cmd.opc)
            } else {
                io_opcode_name(entry.cmd.opc)
            };
            writeln!(f, "index {index}: {name}")?;
            writeln!(f, "{entry}")?;
        }
        Ok(())
    }
}

/// Liveness digest of one active qpair: the tail plus the opcodes of the
/// last four commands, most recent first. This is the payload an external
/// JSON-RPC server exports per controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QpairDigest {
    pub qid: u16,
    pub tail: u32,
    pub last_opcodes: [u8; 4],
}

/// View over the shared command log region.
pub struct CmdLog {
    region: Arc<ShmRegion>,
}

impl CmdLog {
    pub(crate) fn new(region: Arc<ShmRegion>) -> Result<Self> {
        if region.len() < TABLE_REGION_SIZE {
            return Err(DriverError::RegionTooSmall {
                name: region.name().to_string(),
                expected: TABLE_REGION_SIZE,
                actual: region.len(),
            });
        }
        Ok(CmdLog { region })
    }

    fn entry_ptr(&self, qid: u16, index: usize) -> *mut CmdLogEntry {
        debug_assert!((qid as usize) < CMD_LOG_MAX_Q);
        debug_assert!(index < CMD_LOG_DEPTH);
        let offset = qid as usize * QPAIR_BLOCK_SIZE + index * ENTRY_SIZE;
        unsafe { self.region.base_ptr().add(offset) as *mut CmdLogEntry }
    }

    fn tail_word(&self, qid: u16) -> &AtomicU32 {
        assert!((qid as usize) < CMD_LOG_MAX_Q);
        let offset = qid as usize * QPAIR_BLOCK_SIZE + CMD_LOG_DEPTH * ENTRY_SIZE;
        unsafe { &*(self.region.base_ptr().add(offset) as *const AtomicU32) }
    }

    /// Mark a qpair's ring live, tail at zero.
    pub fn init_qpair(&self, qid: u16) {
        self.tail_word(qid).store(0, Ordering::Release);
    }

    /// Mark a qpair's ring cleared / not in use. The entries stay behind.
    pub fn clear_qpair(&self, qid: u16) {
        self.tail_word(qid).store(TAIL_CLEARED, Ordering::Release);
    }

    pub fn is_active(&self, qid: u16) -> bool {
        self.tail_word(qid).load(Ordering::Acquire) < TAIL_CLEARED
    }

    pub fn tail_index(&self, qid: u16) -> u32 {
        self.tail_word(qid).load(Ordering::Acquire)
    }

    /// Write `entry` into the tail slot and advance the tail. Returns the
    /// slot index; the caller hands it to the transport as the completion
    /// context so the trampoline can find the slot in O(1).
    pub(crate) fn append(&self, qid: u16, entry: &CmdLogEntry) -> u32 {
        let tail = self.tail_word(qid);
        let index = tail.load(Ordering::Relaxed) as usize;
        debug_assert!(index < CMD_LOG_DEPTH, "append on a cleared qpair");
        unsafe { ptr::write_volatile(self.entry_ptr(qid, index), *entry) };
        let next = if index + 1 == CMD_LOG_DEPTH {
            0
        } else {
            index as u32 + 1
        };
        tail.store(next, Ordering::Release);
        index as u32
    }

    pub(crate) fn entry(&self, qid: u16, index: u32) -> CmdLogEntry {
        unsafe { ptr::read_volatile(self.entry_ptr(qid, index as usize)) }
    }

    pub(crate) fn store_entry(&self, qid: u16, index: u32, entry: &CmdLogEntry) {
        unsafe { ptr::write_volatile(self.entry_ptr(qid, index as usize), *entry) };
    }

    /// Snapshot up to `count` slots from the start of the ring (`0` or
    /// anything above the depth means the whole ring), plus the current
    /// tail.
    pub fn dump(&self, qid: u16, count: usize) -> CmdLogDump {
        let tail = self.tail_index(qid);
        let count = if count == 0 || count > CMD_LOG_DEPTH {
            CMD_LOG_DEPTH
        } else {
            count
        };
        info!(qid, tail, count, "dumping cmd log");
        let entries = (0..count).map(|i| self.entry(qid, i as u32)).collect();
        CmdLogDump { qid, tail, entries }
    }

    /// Digest of every active qpair.
    pub fn digest(&self) -> Vec<QpairDigest> {
        (0..CMD_LOG_MAX_Q as u16)
            .filter(|&qid| self.is_active(qid))
            .map(|qid| {
                let tail = self.tail_index(qid);
                let mut last_opcodes = [0u8; 4];
                for (j, opc) in last_opcodes.iter_mut().enumerate() {
                    let index = (tail as usize + CMD_LOG_DEPTH - 1 - j) % CMD_LOG_DEPTH;
                    *opc = self.entry(qid, index as u32).cmd.opc;
                }
                QpairDigest {
                    qid,
                    tail,
                    last_opcodes,
                }
            })
            .collect()
    }
}
