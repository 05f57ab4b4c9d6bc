use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriverError>;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("shared region {name:?} not found")]
    RegionNotFound { name: String },

    #[error("shared region {name:?}: {source}")]
    RegionIo {
        name: String,
        source: std::io::Error,
    },

    #[error("shared region {name:?} is {actual} bytes (expected at least {expected})")]
    RegionTooSmall {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("operation requires the primary role")]
    NotPrimary,

    #[error("qpair id {qid} out of range (max {max})")]
    QpairIdOutOfRange { qid: u16, max: u16 },

    #[error("qpair {qid} is not active")]
    QpairNotActive { qid: u16 },

    #[error("namespace {0} is not supported (single-namespace driver)")]
    UnsupportedNamespace(u32),

    #[error("unsupported sector size {0} (only 512-byte sectors)")]
    UnsupportedSectorSize(u32),

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("lba_count must be nonzero")]
    ZeroLbaCount,

    #[error("io flags {0:#x} use reserved low bits")]
    InvalidIoFlags(u32),

    #[error("invalid ioworker arguments: {0}")]
    InvalidWorkerArgs(&'static str),

    #[error("controller still has live I/O qpairs")]
    QpairsStillActive,

    #[error("transport: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DriverError>();
    }

    #[test]
    fn messages_carry_context() {
        let err = DriverError::RegionTooSmall {
            name: "driver_cmdlog_table".to_string(),
            expected: 4096,
            actual: 512,
        };
        let msg = err.to_string();
        assert!(msg.contains("driver_cmdlog_table"));
        assert!(msg.contains("4096"));
        assert!(msg.contains("512"));
    }
}
