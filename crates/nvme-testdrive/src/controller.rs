//! Controller, qpair and namespace handles plus the I/O submission path.
//!
//! One I/O flows: caller → [`Controller::read_write`] → (stamp the write
//! buffer, update the oracle, append a log entry) → transport submit →
//! device → [`Controller::process_completions`] → completion trampoline
//! (stamp latency into completion dword 2, verify read data, forge media
//! error on mismatch) → user callback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::buffer::DmaBuffer;
use crate::cmdlog::{wallclock_us, CmdLogDump, CmdLogEntry, CMD_LOG_DEPTH, CMD_LOG_MAX_Q};
use crate::driver::Driver;
use crate::error::{DriverError, Result};
use crate::nvme::{opc, DsmRange, NvmeCommand, NvmeCompletion, SECTOR_SIZE};
use crate::transport::{CompletionEvent, IoToken, NvmeTransport, TransportAddress};

/// Invoked from the completion trampoline with the final completion (after
/// the dword-2 latency rewrite and any forged verify status).
pub type IoCallback = Box<dyn FnMut(&NvmeCompletion)>;

/// Lightweight qpair handle; the admin queue is qpair 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qpair {
    qid: u16,
}

impl Qpair {
    pub fn id(&self) -> u16 {
        self.qid
    }
}

/// Geometry of the (single) attached namespace.
#[derive(Debug, Clone, Copy)]
pub struct Namespace {
    nsid: u32,
    sectors: u64,
    sector_size: u32,
}

impl Namespace {
    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    pub fn num_sectors(&self) -> u64 {
        self.sectors
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }
}

/// Per-process, per-command context: the borrowed buffer (for read verify)
/// and the user callback. Lives in a side table parallel to the shared ring.
struct PendingIo {
    buf: Option<DmaBuffer>,
    cb: Option<IoCallback>,
}

struct QpairState {
    slots: Vec<Option<PendingIo>>,
}

impl QpairState {
    fn new() -> Self {
        let mut slots = Vec::new();
        slots.resize_with(CMD_LOG_DEPTH, || None);
        QpairState { slots }
    }
}

fn encode_token(qid: u16, slot: u32) -> IoToken {
    (qid as u64) << 32 | slot as u64
}

fn decode_token(token: IoToken) -> (u16, u32) {
    ((token >> 32) as u16, token as u32)
}

/// An attached NVMe controller.
pub struct Controller {
    driver: Arc<Driver>,
    transport: Box<dyn NvmeTransport>,
    address: TransportAddress,
    qpairs: HashMap<u16, QpairState>,
}

impl Controller {
    /// Attach to the controller at `traddr` through the given transport.
    pub fn attach(
        driver: Arc<Driver>,
        traddr: &str,
        transport: Box<dyn NvmeTransport>,
    ) -> Result<Self> {
        let address = TransportAddress::parse(traddr);
        info!(%address, "attached controller");
        let mut qpairs = HashMap::new();
        qpairs.insert(0, QpairState::new());
        Ok(Controller {
            driver,
            transport,
            address,
            qpairs,
        })
    }

    pub fn address(&self) -> &TransportAddress {
        &self.address
    }

    pub(crate) fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    pub fn max_transfer_bytes(&self) -> usize {
        self.transport.max_transfer_bytes()
    }

    /// Forward the per-command timeout to the transport.
    pub fn register_timeout(&mut self, timeout: Duration) {
        self.transport.register_timeout(timeout);
    }

    /// Attach the namespace and size the data-integrity oracle for it.
    pub fn namespace(&mut self, nsid: u32) -> Result<Namespace> {
        if nsid != 1 {
            return Err(DriverError::UnsupportedNamespace(nsid));
        }
        let sectors = self.transport.num_sectors(nsid);
        let sector_size = self.transport.sector_size(nsid);
        self.driver.attach_namespace(sectors)?;
        Ok(Namespace {
            nsid,
            sectors,
            sector_size,
        })
    }

    /// Allocate an I/O qpair and open its command log.
    pub fn create_qpair(&mut self, depth: u32) -> Result<Qpair> {
        let qid = self.transport.create_io_qpair(depth)?;
        if qid as usize >= CMD_LOG_MAX_Q {
            self.transport.free_io_qpair(qid)?;
            return Err(DriverError::QpairIdOutOfRange {
                qid,
                max: CMD_LOG_MAX_Q as u16 - 1,
            });
        }
        self.driver.cmdlog().init_qpair(qid);
        self.qpairs.insert(qid, QpairState::new());
        debug!(qid, "created qpair");
        Ok(Qpair { qid })
    }

    /// Free a qpair. Its log is cleared (tail to the sentinel); the entries
    /// stay behind for post-mortem dumps.
    pub fn free_qpair(&mut self, qpair: Qpair) -> Result<()> {
        debug!(qid = qpair.qid, "freeing qpair");
        self.driver.cmdlog().clear_qpair(qpair.qid);
        self.qpairs.remove(&qpair.qid);
        self.transport.free_io_qpair(qpair.qid)
    }

    /// Detach from the controller. I/O qpairs must have been freed first.
    pub fn detach(self) -> Result<()> {
        if self.driver.is_primary() && self.qpairs.len() > 1 {
            return Err(DriverError::QpairsStillActive);
        }
        info!(address = %self.address, "detached controller");
        Ok(())
    }

    /// Submit a Read or Write on `qpair`.
    ///
    /// Writes are stamped (LBA + token) and recorded in the oracle before
    /// the transport sees the command. `io_flags` goes into the upper half
    /// of cdw12 and must leave the low 16 bits clear.
    #[allow(clippy::too_many_arguments)]
    pub fn read_write(
        &mut self,
        ns: &Namespace,
        qpair: Qpair,
        is_read: bool,
        buf: &DmaBuffer,
        len: usize,
        lba: u64,
        lba_count: u16,
        io_flags: u32,
        cb: Option<IoCallback>,
    ) -> Result<()> {
        let lba_size = ns.sector_size();
        if lba_size as usize != SECTOR_SIZE {
            return Err(DriverError::UnsupportedSectorSize(lba_size));
        }
        if lba_count == 0 {
            return Err(DriverError::ZeroLbaCount);
        }
        let needed = lba_count as usize * lba_size as usize;
        if len < needed {
            return Err(DriverError::BufferTooSmall {
                needed,
                available: len,
            });
        }
        if io_flags & 0xffff != 0 {
            return Err(DriverError::InvalidIoFlags(io_flags));
        }

        let mut cmd = NvmeCommand::new(if is_read { opc::READ } else { opc::WRITE });
        cmd.nsid = ns.nsid();
        cmd.cdw10 = lba as u32;
        cmd.cdw11 = (lba >> 32) as u32;
        cmd.cdw12 = io_flags | (lba_count - 1) as u32;

        if !is_read {
            self.driver.record_write(lba, lba_count as u32, buf, lba_size);
        }

        self.submit_logged(qpair.qid, cmd, Some(buf), len, lba, lba_count as u32, lba_size, cb)
    }

    /// Submit an arbitrary command. Without a qpair it goes to the admin
    /// queue. A Dataset Management command on an I/O qpair gets its range
    /// list walked and each range invalidated in the oracle; other
    /// write-like opcodes update the oracle in [`Controller::read_write`].
    #[allow(clippy::too_many_arguments)]
    pub fn send_raw(
        &mut self,
        qpair: Option<Qpair>,
        opcode: u8,
        nsid: u32,
        buf: Option<&DmaBuffer>,
        len: usize,
        cdw10: u32,
        cdw11: u32,
        cdw12: u32,
        cdw13: u32,
        cdw14: u32,
        cdw15: u32,
        cb: Option<IoCallback>,
    ) -> Result<()> {
        let mut cmd = NvmeCommand::new(opcode);
        cmd.nsid = nsid;
        cmd.cdw10 = cdw10;
        cmd.cdw11 = cdw11;
        cmd.cdw12 = cdw12;
        cmd.cdw13 = cdw13;
        cmd.cdw14 = cdw14;
        cmd.cdw15 = cdw15;

        let qid = qpair.map_or(0, |q| q.qid);
        if qid != 0 && opcode == opc::DATASET_MANAGEMENT {
            if let Some(buf) = buf {
                self.deallocate_ranges(buf, cdw10 + 1);
            }
        }

        self.submit_logged(qid, cmd, buf, len, 0, 0, 0, cb)
    }

    fn deallocate_ranges(&self, buf: &DmaBuffer, count: u32) {
        buf.with(|bytes| {
            for i in 0..count as usize {
                let Some(raw) = bytes.get(i * 16..(i + 1) * 16) else {
                    break;
                };
                let range: DsmRange = bytemuck::pod_read_unaligned(raw);
                debug!(
                    lba = range.starting_lba,
                    count = range.length,
                    "deallocate"
                );
                self.driver
                    .invalidate(range.starting_lba, range.length as u64);
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn submit_logged(
        &mut self,
        qid: u16,
        mut cmd: NvmeCommand,
        buf: Option<&DmaBuffer>,
        len: usize,
        lba: u64,
        lba_count: u32,
        lba_size: u32,
        cb: Option<IoCallback>,
    ) -> Result<()> {
        let state = self
            .qpairs
            .get_mut(&qid)
            .ok_or(DriverError::QpairNotActive { qid })?;
        let log = self.driver.cmdlog();

        // the slot index doubles as the command id for easy correlation
        cmd.cid = log.tail_index(qid) as u16;
        let entry = CmdLogEntry::for_command(cmd, lba, lba_count, lba_size);
        let slot = log.append(qid, &entry);
        state.slots[slot as usize] = Some(PendingIo {
            buf: buf.cloned(),
            cb,
        });

        self.transport
            .submit(qid, &cmd, buf, len, encode_token(qid, slot))
    }

    /// Poll the admin queue.
    pub fn process_admin_completions(&mut self) -> Result<u32> {
        self.poll_qid(0, 0)
    }

    /// Poll an I/O qpair, running the completion trampoline and user
    /// callbacks for everything the transport hands back. `max` of 0 means
    /// no limit.
    pub fn process_completions(&mut self, qpair: Qpair, max: u32) -> Result<u32> {
        self.poll_qid(qpair.qid, max)
    }

    fn poll_qid(&mut self, qid: u16, max: u32) -> Result<u32> {
        let events = self.transport.poll(qid, max);
        let count = events.len() as u32;
        for event in events {
            self.complete_one(event);
        }
        Ok(count)
    }

    fn complete_one(&mut self, event: CompletionEvent) {
        let (qid, slot) = decode_token(event.token);
        let pending = self
            .qpairs
            .get_mut(&qid)
            .and_then(|state| state.slots.get_mut(slot as usize))
            .and_then(Option::take);
        let Some(mut pending) = pending else {
            // completion for a qpair freed with commands in flight
            warn!(qid, slot, "completion with no pending context");
            return;
        };

        let log = self.driver.cmdlog();
        let mut entry = log.entry(qid, slot);
        entry.time_cpl_us = wallclock_us();
        entry.cpl = event.cpl;
        // completion dword 2 is repurposed: host-measured latency in us
        entry.cpl.cdw2 = entry.latency_us();

        if entry.cmd.opc == opc::READ && self.driver.verify_reads_enabled() {
            if let (Some(buf), Some(oracle)) = (&pending.buf, self.driver.oracle()) {
                if let Err(failure) =
                    oracle.verify(entry.lba, entry.lba_count, buf, entry.lba_size)
                {
                    warn!(lba = failure.lba(), ?failure, "read verification failed");
                    // unrecovered read error: surfaced exactly like a media
                    // failure reported by the device
                    entry.cpl.set_status(0x02, 0x81);
                }
            }
        }

        log.store_entry(qid, slot, &entry);

        if let Some(cb) = pending.cb.as_mut() {
            cb(&entry.cpl);
        }
    }

    /// Snapshot a qpair's command log.
    pub fn dump_log(&self, qpair: Qpair, count: usize) -> CmdLogDump {
        self.driver.cmdlog().dump(qpair.qid, count)
    }

    /// Snapshot the admin queue's command log.
    pub fn dump_admin_log(&self, count: usize) -> CmdLogDump {
        self.driver.cmdlog().dump(0, count)
    }
}
