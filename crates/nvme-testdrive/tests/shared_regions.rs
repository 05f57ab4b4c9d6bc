//! Cross-process sharing, modeled with two driver instances over the same
//! shm id: the primary reserves, secondaries look up, and the token keeps
//! concurrent writers disjoint.

mod common;

use std::sync::Arc;

use nvme_testdrive::{
    DmaBuffer, Driver, DriverOpts, DriverError, MemDevice, Role, CFG_VERIFY_READ, SECTOR_SIZE,
};

fn pair() -> (Arc<Driver>, Arc<Driver>) {
    let shm_id = common::unique_shm_id();
    let primary = Driver::init(DriverOpts {
        role: Role::Primary,
        shm_id,
    })
    .unwrap();
    let secondary = Driver::init(DriverOpts {
        role: Role::Secondary,
        shm_id,
    })
    .unwrap();
    (primary, secondary)
}

#[test]
fn secondary_init_without_primary_is_fatal() {
    let err = Driver::init(DriverOpts {
        role: Role::Secondary,
        shm_id: common::unique_shm_id(),
    });
    assert!(matches!(err, Err(DriverError::RegionNotFound { .. })));
}

#[test]
fn secondary_observes_primary_cmdlog_and_config() {
    let (primary, secondary) = pair();
    primary.configure(CFG_VERIFY_READ);
    assert_eq!(secondary.config_word(), CFG_VERIFY_READ);

    let mut ctrl = common::attach(&primary, MemDevice::new(4096));
    let ns = ctrl.namespace(1).unwrap();
    let qpair = ctrl.create_qpair(64).unwrap();
    let buf = DmaBuffer::zeroed(SECTOR_SIZE);
    for lba in 0..3 {
        ctrl.read_write(&ns, qpair, false, &buf, SECTOR_SIZE, lba, 1, 0, None)
            .unwrap();
    }
    ctrl.process_completions(qpair, 0).unwrap();

    // the secondary reads the same ring through its own mapping
    let digest = secondary.controllers_digest();
    let entry = digest
        .iter()
        .find(|d| d.qid == qpair.id())
        .expect("qpair visible across processes");
    assert_eq!(entry.tail, 3);
    assert_eq!(entry.last_opcodes[0], 0x01);
}

#[test]
fn secondary_shares_the_oracle_through_its_own_controller() {
    let (primary, secondary) = pair();
    let device = MemDevice::new(4096);

    let mut primary_ctrl = common::attach(&primary, device.clone());
    let primary_ns = primary_ctrl.namespace(1).unwrap();
    let qpair = primary_ctrl.create_qpair(64).unwrap();

    let buf = DmaBuffer::zeroed(SECTOR_SIZE);
    primary_ctrl
        .read_write(&primary_ns, qpair, false, &buf, SECTOR_SIZE, 33, 1, 0, None)
        .unwrap();
    primary_ctrl.process_completions(qpair, 0).unwrap();

    // the secondary attaches the same namespace and finds the table the
    // primary reserved
    let mut secondary_ctrl = common::attach(&secondary, device);
    let _secondary_ns = secondary_ctrl.namespace(1).unwrap();
    let oracle = secondary.oracle().expect("oracle attached");
    assert!(oracle.verification_enabled());
    assert_eq!(
        oracle.checksum(33),
        primary.oracle().unwrap().checksum(33)
    );
    assert_eq!(oracle.verify(33, 1, &buf, SECTOR_SIZE as u32), Ok(()));
}

#[test]
fn concurrent_writers_never_reuse_a_token() {
    let (primary, secondary) = pair();

    // size the oracle before spawning the writer threads
    let mut ctrl = common::attach(&primary, MemDevice::new(65536));
    let _ns = ctrl.namespace(1).unwrap();
    let mut ctrl2 = common::attach(&secondary, MemDevice::new(65536));
    let _ns2 = ctrl2.namespace(1).unwrap();

    const WRITES: usize = 1000;

    let worker = |driver: Arc<Driver>, lba_base: u64| {
        std::thread::spawn(move || {
            let oracle = driver.oracle().expect("oracle attached");
            let mut stamps = Vec::with_capacity(WRITES);
            let buf = DmaBuffer::zeroed(SECTOR_SIZE);
            for i in 0..WRITES {
                oracle.record_write(lba_base + i as u64 % 512, 1, &buf, SECTOR_SIZE as u32);
                let bytes = buf.to_vec();
                stamps.push(u64::from_le_bytes(
                    bytes[SECTOR_SIZE - 8..].try_into().unwrap(),
                ));
            }
            stamps
        })
    };

    let a = worker(Arc::clone(&primary), 0);
    let b = worker(Arc::clone(&secondary), 4096);
    let mut all: Vec<u64> = a.join().unwrap();
    all.extend(b.join().unwrap());

    let unique: std::collections::HashSet<u64> = all.iter().copied().collect();
    assert_eq!(unique.len(), 2 * WRITES, "token stamps must never collide");
    assert_eq!(primary.oracle().unwrap().current_token(), 2 * WRITES as u64);
}

#[test]
fn primary_teardown_unlinks_regions() {
    let shm_id = common::unique_shm_id();
    {
        let _primary = Driver::init(DriverOpts {
            role: Role::Primary,
            shm_id,
        })
        .unwrap();
        // secondary attach works while the primary is alive
        Driver::init(DriverOpts {
            role: Role::Secondary,
            shm_id,
        })
        .unwrap();
    }
    // after the primary dropped, the regions are gone
    let err = Driver::init(DriverOpts {
        role: Role::Secondary,
        shm_id,
    });
    assert!(matches!(err, Err(DriverError::RegionNotFound { .. })));
}
