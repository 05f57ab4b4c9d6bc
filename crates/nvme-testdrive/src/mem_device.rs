//! An in-memory NVMe device used to exercise the driver without hardware.
//!
//! Sectors are stored sparsely; unwritten blocks read back as zeros.
//! Commands execute at submission time and their completions queue up in
//! FIFO order until polled, which is enough to drive every closed-loop path
//! in the crate (priming, ring wraps, throttling, error latching).
//!
//! The handle is cloneable and clones share state, so a test can keep one
//! handle while the controller owns the other and inject failures mid-run
//! with [`MemDevice::force_status`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::buffer::DmaBuffer;
use crate::error::{DriverError, Result};
use crate::nvme::{opc, NvmeCommand, NvmeCompletion, SECTOR_SIZE};
use crate::transport::{CompletionEvent, IoToken, NvmeTransport};

struct DeviceState {
    sectors: HashMap<u64, [u8; SECTOR_SIZE]>,
    num_sectors: u64,
    max_transfer: usize,
    next_qid: u16,
    queues: HashMap<u16, VecDeque<CompletionEvent>>,
    forced_status: VecDeque<(u8, u8)>,
    timeout: Option<Duration>,
}

#[derive(Clone)]
pub struct MemDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MemDevice {
    pub fn new(num_sectors: u64) -> Self {
        let mut queues = HashMap::new();
        queues.insert(0, VecDeque::new());
        MemDevice {
            state: Arc::new(Mutex::new(DeviceState {
                sectors: HashMap::new(),
                num_sectors,
                max_transfer: 128 * 1024,
                next_qid: 1,
                queues,
                forced_status: VecDeque::new(),
                timeout: None,
            })),
        }
    }

    pub fn with_max_transfer(self, bytes: usize) -> Self {
        self.state.lock().unwrap().max_transfer = bytes;
        self
    }

    /// Force `(sct, sc)` onto the next completion (FIFO per call).
    pub fn force_status(&self, sct: u8, sc: u8) {
        self.state.lock().unwrap().forced_status.push_back((sct, sc));
    }

    pub fn registered_timeout(&self) -> Option<Duration> {
        self.state.lock().unwrap().timeout
    }

    fn lba_range(cmd: &NvmeCommand) -> (u64, u64) {
        let lba = (cmd.cdw11 as u64) << 32 | cmd.cdw10 as u64;
        let count = (cmd.cdw12 & 0xffff) as u64 + 1;
        (lba, count)
    }
}

impl DeviceState {
    fn execute(&mut self, qid: u16, cmd: &NvmeCommand, buf: Option<&DmaBuffer>) -> (u8, u8) {
        if qid == 0 {
            // admin commands are accepted without interpretation
            return (0, 0);
        }
        match cmd.opc {
            opc::READ => {
                let (lba, count) = MemDevice::lba_range(cmd);
                if lba.saturating_add(count) > self.num_sectors {
                    return (0x0, 0x80); // LBA out of range
                }
                if let Some(buf) = buf {
                    if buf.len() < count as usize * SECTOR_SIZE {
                        return (0x0, 0x02); // Invalid Field in Command
                    }
                    buf.with_mut(|bytes| {
                        for i in 0..count {
                            let dst = &mut bytes[i as usize * SECTOR_SIZE..][..SECTOR_SIZE];
                            match self.sectors.get(&(lba + i)) {
                                Some(sector) => dst.copy_from_slice(sector),
                                None => dst.fill(0),
                            }
                        }
                    });
                }
                (0, 0)
            }
            opc::WRITE => {
                let (lba, count) = MemDevice::lba_range(cmd);
                if lba.saturating_add(count) > self.num_sectors {
                    return (0x0, 0x80);
                }
                if let Some(buf) = buf {
                    if buf.len() < count as usize * SECTOR_SIZE {
                        return (0x0, 0x02);
                    }
                    buf.with(|bytes| {
                        for i in 0..count {
                            let src = &bytes[i as usize * SECTOR_SIZE..][..SECTOR_SIZE];
                            let mut sector = [0u8; SECTOR_SIZE];
                            sector.copy_from_slice(src);
                            self.sectors.insert(lba + i, sector);
                        }
                    });
                }
                (0, 0)
            }
            // deallocated blocks keep their stale content; readers must not
            // depend on what comes back
            opc::FLUSH | opc::DATASET_MANAGEMENT => (0, 0),
            _ => (0, 0),
        }
    }
}

impl NvmeTransport for MemDevice {
    fn submit(
        &mut self,
        qid: u16,
        cmd: &NvmeCommand,
        buf: Option<&DmaBuffer>,
        _len: usize,
        token: IoToken,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.queues.contains_key(&qid) {
            return Err(DriverError::Transport(format!("qpair {qid} not active")));
        }
        let (mut sct, mut sc) = state.execute(qid, cmd, buf);
        if let Some((forced_sct, forced_sc)) = state.forced_status.pop_front() {
            sct = forced_sct;
            sc = forced_sc;
        }
        let mut cpl = NvmeCompletion {
            cdw0: 0,
            cdw1: 0,
            cdw2: (qid as u32) << 16, // sqid | sqhd, as a device would report
            cid: cmd.cid,
            status: 1, // phase
        };
        cpl.set_status(sct, sc);
        if let Some(queue) = state.queues.get_mut(&qid) {
            queue.push_back(CompletionEvent { token, cpl });
        }
        Ok(())
    }

    fn poll(&mut self, qid: u16, max: u32) -> Vec<CompletionEvent> {
        let mut state = self.state.lock().unwrap();
        let Some(queue) = state.queues.get_mut(&qid) else {
            return Vec::new();
        };
        let take = if max == 0 {
            queue.len()
        } else {
            queue.len().min(max as usize)
        };
        queue.drain(..take).collect()
    }

    fn create_io_qpair(&mut self, _depth: u32) -> Result<u16> {
        let mut state = self.state.lock().unwrap();
        let qid = state.next_qid;
        state.next_qid += 1;
        state.queues.insert(qid, VecDeque::new());
        Ok(qid)
    }

    fn free_io_qpair(&mut self, qid: u16) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .queues
            .remove(&qid)
            .map(|_| ())
            .ok_or(DriverError::QpairNotActive { qid })
    }

    fn num_sectors(&self, _nsid: u32) -> u64 {
        self.state.lock().unwrap().num_sectors
    }

    fn sector_size(&self, _nsid: u32) -> u32 {
        SECTOR_SIZE as u32
    }

    fn max_transfer_bytes(&self) -> usize {
        self.state.lock().unwrap().max_transfer
    }

    fn register_timeout(&mut self, timeout: Duration) {
        self.state.lock().unwrap().timeout = Some(timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw_command(opcode: u8, lba: u64, count: u16) -> NvmeCommand {
        let mut cmd = NvmeCommand::new(opcode);
        cmd.nsid = 1;
        cmd.cdw10 = lba as u32;
        cmd.cdw11 = (lba >> 32) as u32;
        cmd.cdw12 = (count - 1) as u32;
        cmd
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut dev = MemDevice::new(128);
        let qid = dev.create_io_qpair(16).unwrap();

        let wbuf = DmaBuffer::zeroed(SECTOR_SIZE);
        wbuf.write_at(0, b"payload");
        dev.submit(qid, &rw_command(opc::WRITE, 5, 1), Some(&wbuf), SECTOR_SIZE, 1)
            .unwrap();

        let rbuf = DmaBuffer::zeroed(SECTOR_SIZE);
        dev.submit(qid, &rw_command(opc::READ, 5, 1), Some(&rbuf), SECTOR_SIZE, 2)
            .unwrap();

        let events = dev.poll(qid, 0);
        assert_eq!(events.len(), 2);
        assert!(!events[0].cpl.is_error());
        assert_eq!(events[1].token, 2);
        assert_eq!(&rbuf.to_vec()[..7], b"payload");
    }

    #[test]
    fn unwritten_sectors_read_zero() {
        let mut dev = MemDevice::new(128);
        let qid = dev.create_io_qpair(16).unwrap();
        let buf = DmaBuffer::zeroed(SECTOR_SIZE);
        buf.write_at(0, &[0xff; 16]);
        dev.submit(qid, &rw_command(opc::READ, 7, 1), Some(&buf), SECTOR_SIZE, 1)
            .unwrap();
        dev.poll(qid, 0);
        assert!(buf.to_vec().iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_range_io_fails() {
        let mut dev = MemDevice::new(8);
        let qid = dev.create_io_qpair(16).unwrap();
        let buf = DmaBuffer::zeroed(2 * SECTOR_SIZE);
        dev.submit(qid, &rw_command(opc::READ, 7, 2), Some(&buf), 2 * SECTOR_SIZE, 1)
            .unwrap();
        let events = dev.poll(qid, 0);
        assert!(events[0].cpl.is_error());
    }

    #[test]
    fn poll_respects_max() {
        let mut dev = MemDevice::new(128);
        let qid = dev.create_io_qpair(16).unwrap();
        for token in 0..5 {
            let buf = DmaBuffer::zeroed(SECTOR_SIZE);
            dev.submit(qid, &rw_command(opc::READ, 0, 1), Some(&buf), SECTOR_SIZE, token)
                .unwrap();
        }
        assert_eq!(dev.poll(qid, 2).len(), 2);
        assert_eq!(dev.poll(qid, 0).len(), 3);
    }

    #[test]
    fn forced_status_applies_once() {
        let mut dev = MemDevice::new(128);
        let handle = dev.clone();
        let qid = dev.create_io_qpair(16).unwrap();
        handle.force_status(0x2, 0x81);
        let buf = DmaBuffer::zeroed(SECTOR_SIZE);
        dev.submit(qid, &rw_command(opc::READ, 0, 1), Some(&buf), SECTOR_SIZE, 1)
            .unwrap();
        dev.submit(qid, &rw_command(opc::READ, 0, 1), Some(&buf), SECTOR_SIZE, 2)
            .unwrap();
        let events = dev.poll(qid, 0);
        assert!(events[0].cpl.is_error());
        assert_eq!(events[0].cpl.sct(), 0x2);
        assert_eq!(events[0].cpl.sc(), 0x81);
        assert!(!events[1].cpl.is_error());
    }

    #[test]
    fn submit_to_freed_qpair_is_rejected() {
        let mut dev = MemDevice::new(128);
        let qid = dev.create_io_qpair(16).unwrap();
        dev.free_io_qpair(qid).unwrap();
        let buf = DmaBuffer::zeroed(SECTOR_SIZE);
        let err = dev.submit(qid, &rw_command(opc::READ, 0, 1), Some(&buf), SECTOR_SIZE, 1);
        assert!(matches!(err, Err(DriverError::Transport(_))));
    }
}
