//! End-to-end read/write flows against the in-memory device: stamping,
//! oracle bookkeeping, read verification and status forging.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use nvme_testdrive::{
    DmaBuffer, DsmRange, IoCallback, NvmeCompletion, MemDevice, CFG_VERIFY_READ, SECTOR_SIZE,
    UNMAPPED,
};

/// Capture the (single) completion a callback delivers.
fn capture() -> (Rc<RefCell<Option<NvmeCompletion>>>, IoCallback) {
    let slot: Rc<RefCell<Option<NvmeCompletion>>> = Rc::new(RefCell::new(None));
    let writer = Rc::clone(&slot);
    let cb: IoCallback = Box::new(move |cpl| {
        *writer.borrow_mut() = Some(*cpl);
    });
    (slot, cb)
}

#[test]
fn write_read_verify_round_trip() {
    let driver = common::primary_driver();
    driver.configure(CFG_VERIFY_READ);
    let mut ctrl = common::attach(&driver, MemDevice::new(4096));
    let ns = ctrl.namespace(1).unwrap();
    let qpair = ctrl.create_qpair(64).unwrap();

    let wbuf = DmaBuffer::zeroed(SECTOR_SIZE);
    wbuf.write_at(8, b"known payload bytes");
    ctrl.read_write(&ns, qpair, false, &wbuf, SECTOR_SIZE, 0, 1, 0, None)
        .unwrap();
    ctrl.process_completions(qpair, 0).unwrap();

    // a visible gap so the host-measured latency cannot round to zero
    std::thread::sleep(Duration::from_millis(2));

    let rbuf = DmaBuffer::zeroed(SECTOR_SIZE);
    let (seen, cb) = capture();
    ctrl.read_write(&ns, qpair, true, &rbuf, SECTOR_SIZE, 0, 1, 0, Some(cb))
        .unwrap();
    std::thread::sleep(Duration::from_millis(2));
    ctrl.process_completions(qpair, 0).unwrap();

    let cpl = seen.borrow().expect("read completion delivered");
    assert!(!cpl.is_error());
    assert!(cpl.latency_us() > 0);
    // the payload comes back exactly as stamped at write submission
    assert_eq!(rbuf.to_vec(), wbuf.to_vec());
    assert_eq!(&rbuf.to_vec()[8..27], b"known payload bytes");
}

#[test]
fn trim_invalidates_oracle_and_reads_pass() {
    let driver = common::primary_driver();
    driver.configure(CFG_VERIFY_READ);
    let mut ctrl = common::attach(&driver, MemDevice::new(4096));
    let ns = ctrl.namespace(1).unwrap();
    let qpair = ctrl.create_qpair(64).unwrap();

    // write LBAs 100..164
    let wbuf = DmaBuffer::zeroed(64 * SECTOR_SIZE);
    ctrl.read_write(&ns, qpair, false, &wbuf, 64 * SECTOR_SIZE, 100, 64, 0, None)
        .unwrap();
    ctrl.process_completions(qpair, 0).unwrap();

    // deallocate 120..150
    let range = DsmRange {
        cattr: 0,
        length: 30,
        starting_lba: 120,
    };
    let dsm = DmaBuffer::zeroed(16);
    dsm.write_at(0, bytemuck::bytes_of(&range));
    let (seen, cb) = capture();
    ctrl.send_raw(
        Some(qpair),
        0x09,
        1,
        Some(&dsm),
        16,
        0, // one range
        0x4, // deallocate attribute
        0,
        0,
        0,
        0,
        Some(cb),
    )
    .unwrap();
    ctrl.process_completions(qpair, 0).unwrap();
    assert!(!seen.borrow().unwrap().is_error());

    // oracle slots for the trimmed span are back to unmapped
    let oracle = driver.oracle().unwrap();
    for lba in 120..150 {
        assert_eq!(oracle.checksum(lba), Some(UNMAPPED), "lba {lba}");
    }
    assert_ne!(oracle.checksum(100), Some(UNMAPPED));
    assert_ne!(oracle.checksum(150), Some(UNMAPPED));

    // the whole range reads back clean: trimmed blocks are skipped, the
    // rest still verifies
    let rbuf = DmaBuffer::zeroed(64 * SECTOR_SIZE);
    let (seen, cb) = capture();
    ctrl.read_write(&ns, qpair, true, &rbuf, 64 * SECTOR_SIZE, 100, 64, 0, Some(cb))
        .unwrap();
    ctrl.process_completions(qpair, 0).unwrap();
    assert!(!seen.borrow().unwrap().is_error());
}

#[test]
fn corrupted_media_forges_unrecovered_read_error() {
    let driver = common::primary_driver();
    driver.configure(CFG_VERIFY_READ);
    let mut ctrl = common::attach(&driver, MemDevice::new(4096));
    let ns = ctrl.namespace(1).unwrap();
    let qpair = ctrl.create_qpair(64).unwrap();

    let wbuf = DmaBuffer::zeroed(SECTOR_SIZE);
    ctrl.read_write(&ns, qpair, false, &wbuf, SECTOR_SIZE, 5, 1, 0, None)
        .unwrap();
    ctrl.process_completions(qpair, 0).unwrap();

    // overwrite the block through the raw bypass: correct LBA stamp but a
    // bogus token, and no oracle update
    let corrupt = DmaBuffer::zeroed(SECTOR_SIZE);
    corrupt.write_at(0, &5u64.to_le_bytes());
    corrupt.write_at(SECTOR_SIZE - 8, &0xdead_beefu64.to_le_bytes());
    ctrl.send_raw(
        Some(qpair),
        0x01, // Write
        1,
        Some(&corrupt),
        SECTOR_SIZE,
        5, // cdw10: slba low
        0,
        0, // cdw12: one block
        0,
        0,
        0,
        None,
    )
    .unwrap();
    ctrl.process_completions(qpair, 0).unwrap();

    // the device reports success; the verifier overrules it
    let rbuf = DmaBuffer::zeroed(SECTOR_SIZE);
    let (seen, cb) = capture();
    ctrl.read_write(&ns, qpair, true, &rbuf, SECTOR_SIZE, 5, 1, 0, Some(cb))
        .unwrap();
    ctrl.process_completions(qpair, 0).unwrap();

    let cpl = seen.borrow().expect("read completion delivered");
    assert!(cpl.is_error());
    assert_eq!(cpl.sct(), 0x02);
    assert_eq!(cpl.sc(), 0x81);
}

#[test]
fn uncorrectable_marking_overrules_device_success() {
    let driver = common::primary_driver();
    driver.configure(CFG_VERIFY_READ);
    let mut ctrl = common::attach(&driver, MemDevice::new(4096));
    let ns = ctrl.namespace(1).unwrap();
    let qpair = ctrl.create_qpair(64).unwrap();

    let wbuf = DmaBuffer::zeroed(4 * SECTOR_SIZE);
    ctrl.read_write(&ns, qpair, false, &wbuf, 4 * SECTOR_SIZE, 8, 4, 0, None)
        .unwrap();
    ctrl.process_completions(qpair, 0).unwrap();

    driver.oracle().unwrap().mark_uncorrectable(9, 1);

    // any read intersecting the marked block fails
    let rbuf = DmaBuffer::zeroed(4 * SECTOR_SIZE);
    let (seen, cb) = capture();
    ctrl.read_write(&ns, qpair, true, &rbuf, 4 * SECTOR_SIZE, 8, 4, 0, Some(cb))
        .unwrap();
    ctrl.process_completions(qpair, 0).unwrap();
    let cpl = seen.borrow().unwrap();
    assert_eq!((cpl.sct(), cpl.sc()), (0x02, 0x81));

    // a read next to it still passes
    let rbuf = DmaBuffer::zeroed(SECTOR_SIZE);
    let (seen, cb) = capture();
    ctrl.read_write(&ns, qpair, true, &rbuf, SECTOR_SIZE, 8, 1, 0, Some(cb))
        .unwrap();
    ctrl.process_completions(qpair, 0).unwrap();
    assert!(!seen.borrow().unwrap().is_error());
}

#[test]
fn verification_requires_the_config_bit() {
    let driver = common::primary_driver();
    // bit 0 left clear: reads are never flagged
    let mut ctrl = common::attach(&driver, MemDevice::new(4096));
    let ns = ctrl.namespace(1).unwrap();
    let qpair = ctrl.create_qpair(64).unwrap();

    let wbuf = DmaBuffer::zeroed(SECTOR_SIZE);
    ctrl.read_write(&ns, qpair, false, &wbuf, SECTOR_SIZE, 3, 1, 0, None)
        .unwrap();
    ctrl.process_completions(qpair, 0).unwrap();
    driver.oracle().unwrap().mark_uncorrectable(3, 1);

    let rbuf = DmaBuffer::zeroed(SECTOR_SIZE);
    let (seen, cb) = capture();
    ctrl.read_write(&ns, qpair, true, &rbuf, SECTOR_SIZE, 3, 1, 0, Some(cb))
        .unwrap();
    ctrl.process_completions(qpair, 0).unwrap();
    assert!(!seen.borrow().unwrap().is_error());
}

#[test]
fn sanitize_clears_the_whole_table() {
    let driver = common::primary_driver();
    driver.configure(CFG_VERIFY_READ);
    let mut ctrl = common::attach(&driver, MemDevice::new(4096));
    let ns = ctrl.namespace(1).unwrap();
    let qpair = ctrl.create_qpair(64).unwrap();

    let wbuf = DmaBuffer::zeroed(SECTOR_SIZE);
    ctrl.read_write(&ns, qpair, false, &wbuf, SECTOR_SIZE, 40, 1, 0, None)
        .unwrap();
    ctrl.process_completions(qpair, 0).unwrap();

    let oracle = driver.oracle().unwrap();
    assert_ne!(oracle.checksum(40), Some(UNMAPPED));
    oracle.invalidate_all();
    assert_eq!(oracle.checksum(40), Some(UNMAPPED));
}
