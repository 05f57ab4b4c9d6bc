#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use nvme_testdrive::{Controller, Driver, DriverOpts, MemDevice, Role};

/// Shared-region ids must differ between concurrently running tests (and
/// test binaries), while cooperating drivers inside one test share theirs.
pub fn unique_shm_id() -> u32 {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    std::process::id()
        .wrapping_mul(8191)
        .wrapping_add(NEXT.fetch_add(1, Ordering::Relaxed))
}

pub fn primary_driver() -> Arc<Driver> {
    Driver::init(DriverOpts {
        role: Role::Primary,
        shm_id: unique_shm_id(),
    })
    .unwrap()
}

pub fn attach(driver: &Arc<Driver>, device: MemDevice) -> Controller {
    Controller::attach(Arc::clone(driver), "01:00.0", Box::new(device)).unwrap()
}
