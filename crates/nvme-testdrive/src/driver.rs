//! Driver-wide state: shared regions, config word, PRNG, introspection.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, OnceLock};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::buffer::DmaBuffer;
use crate::cmdlog::{CmdLog, QpairDigest, CMD_LOG_MAX_Q, TABLE_REGION_SIZE};
use crate::error::{DriverError, Result};
use crate::oracle::DataOracle;
use crate::shmem::{Role, ShmManager, ShmRegion};

/// Stable names of the shared regions cooperating processes agree on.
pub const IO_TOKEN_REGION: &str = "driver_io_token";
pub const CRC_TABLE_REGION: &str = "driver_crc32_table";
pub const GLOBAL_CONFIG_REGION: &str = "driver_global_config";
pub const CMDLOG_TABLE_REGION: &str = "driver_cmdlog_table";

/// Config word bit 0: verify read data against the oracle on completion.
/// All other bits are reserved zero.
pub const CFG_VERIFY_READ: u64 = 1 << 0;

#[derive(Debug, Clone)]
pub struct DriverOpts {
    pub role: Role,
    /// Namespaces the shared-region files; cooperating processes must use
    /// the same id, independent driver instances different ones.
    pub shm_id: u32,
}

impl Default for DriverOpts {
    fn default() -> Self {
        DriverOpts {
            role: Role::Primary,
            shm_id: 0,
        }
    }
}

/// Process-wide driver state, created once and shared by controllers.
pub struct Driver {
    shm: ShmManager,
    cmdlog: CmdLog,
    config: Arc<ShmRegion>,
    oracle: OnceLock<DataOracle>,
    rng: Arc<Mutex<StdRng>>,
}

impl Driver {
    pub fn init(opts: DriverOpts) -> Result<Arc<Driver>> {
        let shm = ShmManager::new(opts.role, opts.shm_id);

        let (cmdlog_region, config) = if shm.is_primary() {
            (
                shm.reserve(CMDLOG_TABLE_REGION, TABLE_REGION_SIZE)?,
                shm.reserve(GLOBAL_CONFIG_REGION, 8)?,
            )
        } else {
            let cmdlog = shm.lookup(CMDLOG_TABLE_REGION).ok_or_else(|| {
                DriverError::RegionNotFound {
                    name: CMDLOG_TABLE_REGION.to_string(),
                }
            })?;
            let config = shm.lookup(GLOBAL_CONFIG_REGION).ok_or_else(|| {
                DriverError::RegionNotFound {
                    name: GLOBAL_CONFIG_REGION.to_string(),
                }
            })?;
            (cmdlog, config)
        };

        let cmdlog = CmdLog::new(cmdlog_region)?;
        if shm.is_primary() {
            for qid in 0..CMD_LOG_MAX_Q as u16 {
                cmdlog.clear_qpair(qid);
            }
            config.atomic_u64(0).store(0, Ordering::Relaxed);
            // the admin queue exists from the start
            cmdlog.init_qpair(0);
        }

        info!(role = ?opts.role, shm_id = opts.shm_id, "driver initialized");
        Ok(Arc::new(Driver {
            shm,
            cmdlog,
            config,
            oracle: OnceLock::new(),
            // fixed seed: workload sequences must be reproducible
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(1))),
        }))
    }

    pub fn is_primary(&self) -> bool {
        self.shm.is_primary()
    }

    /// Store the global config word. Intended to be set once before a
    /// workload starts.
    pub fn configure(&self, word: u64) {
        self.config.atomic_u64(0).store(word, Ordering::Relaxed);
    }

    pub fn config_word(&self) -> u64 {
        self.config.atomic_u64(0).load(Ordering::Relaxed)
    }

    pub(crate) fn verify_reads_enabled(&self) -> bool {
        self.config_word() & CFG_VERIFY_READ != 0
    }

    pub fn cmdlog(&self) -> &CmdLog {
        &self.cmdlog
    }

    /// Size the oracle for a namespace of `sectors` blocks. The first attach
    /// wins; the driver tracks a single namespace.
    pub(crate) fn attach_namespace(&self, sectors: u64) -> Result<()> {
        if self.oracle.get().is_some() {
            return Ok(());
        }
        let oracle = DataOracle::init(&self.shm, sectors)?;
        let _ = self.oracle.set(oracle);
        Ok(())
    }

    pub fn oracle(&self) -> Option<&DataOracle> {
        self.oracle.get()
    }

    pub(crate) fn record_write(&self, lba: u64, lba_count: u32, buf: &DmaBuffer, lba_size: u32) {
        if let Some(oracle) = self.oracle.get() {
            oracle.record_write(lba, lba_count, buf, lba_size);
        }
    }

    pub(crate) fn invalidate(&self, lba: u64, lba_count: u64) {
        if let Some(oracle) = self.oracle.get() {
            oracle.invalidate(lba, lba_count);
        }
    }

    pub(crate) fn rng(&self) -> Arc<Mutex<StdRng>> {
        Arc::clone(&self.rng)
    }

    /// Per-qpair liveness digest, the payload of the external
    /// `get_nvme_controllers` RPC method.
    pub fn controllers_digest(&self) -> Vec<QpairDigest> {
        self.cmdlog.digest()
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if self.shm.is_primary() {
            self.cmdlog.clear_qpair(0);
            debug!("driver unloaded");
        }
        // ShmManager::drop unlinks the primary's backing files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_id() -> u32 {
        use std::sync::atomic::AtomicU32;
        static NEXT: AtomicU32 = AtomicU32::new(3000);
        std::process::id()
            .wrapping_mul(251)
            .wrapping_add(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[test]
    fn init_clears_io_logs_and_opens_admin() {
        let driver = Driver::init(DriverOpts {
            role: Role::Primary,
            shm_id: unique_id(),
        })
        .unwrap();
        assert!(driver.cmdlog().is_active(0));
        for qid in 1..CMD_LOG_MAX_Q as u16 {
            assert!(!driver.cmdlog().is_active(qid));
        }
    }

    #[test]
    fn config_word_round_trips() {
        let driver = Driver::init(DriverOpts {
            role: Role::Primary,
            shm_id: unique_id(),
        })
        .unwrap();
        assert_eq!(driver.config_word(), 0);
        driver.configure(CFG_VERIFY_READ);
        assert!(driver.verify_reads_enabled());
        driver.configure(0);
        assert!(!driver.verify_reads_enabled());
    }

    #[test]
    fn secondary_without_primary_fails() {
        let err = Driver::init(DriverOpts {
            role: Role::Secondary,
            shm_id: unique_id(),
        });
        assert!(matches!(err, Err(DriverError::RegionNotFound { .. })));
    }

    #[test]
    fn secondary_sees_primary_config() {
        let shm_id = unique_id();
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
        primary.configure(CFG_VERIFY_READ);
        assert_eq!(secondary.config_word(), CFG_VERIFY_READ);
    }
}
