//! User-space NVMe test driver core.
//!
//! This crate is the host-side engine of an NVMe firmware validation rig: it
//! builds and submits admin and I/O commands, captures every command/completion
//! pair with wall-clock timestamps in a per-queue ring, verifies read data
//! against a host-maintained per-LBA checksum oracle, and runs closed-loop
//! synthetic workloads ("ioworkers") against the device.
//!
//! The crate intentionally stays small and self-contained: the only external
//! input is the NVMe transport (probe/attach, doorbells, completion polling),
//! modeled as the [`NvmeTransport`] trait. [`MemDevice`] is an in-memory
//! reference transport used by the test suite.
//!
//! Supported:
//! - Named shared-memory regions with primary/secondary process roles
//! - Per-LBA CRC32C oracle with unmapped/uncorrectable sentinel states
//! - Globally unique write tokens stamped into every written block
//! - Per-qpair command log (2047-entry ring) with host-measured latency
//! - Read verification with forged media-error status on mismatch
//! - Closed-loop ioworkers: read/write mix, sequential/random LBAs, IOPS
//!   throttle, time/count bounds, per-second and per-latency histograms

mod buffer;
mod cmdlog;
mod controller;
mod driver;
mod error;
pub mod ioworker;
mod mem_device;
mod nvme;
mod opcodes;
mod oracle;
mod shmem;
mod transport;

pub use buffer::{hex_dump, DmaBuffer, PAGE_SIZE};
pub use cmdlog::{
    CmdLog, CmdLogDump, CmdLogEntry, QpairDigest, CMD_LOG_DEPTH, CMD_LOG_MAX_Q,
};
pub use controller::{Controller, IoCallback, Namespace, Qpair};
pub use driver::{
    Driver, DriverOpts, CFG_VERIFY_READ, CMDLOG_TABLE_REGION, CRC_TABLE_REGION,
    GLOBAL_CONFIG_REGION, IO_TOKEN_REGION,
};
pub use error::{DriverError, Result};
pub use mem_device::MemDevice;
pub use nvme::{opc, DsmRange, NvmeCommand, NvmeCompletion, SECTOR_SIZE, US_PER_S};
pub use opcodes::{admin_opcode_name, io_opcode_name, opcode_name, CommandSet};
pub use oracle::{DataOracle, VerifyFailure, UNCORRECTABLE, UNMAPPED};
pub use shmem::{Role, ShmManager, ShmRegion};
pub use transport::{CompletionEvent, IoToken, NvmeTransport, TransportAddress};
