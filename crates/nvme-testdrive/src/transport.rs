//! The transport seam: everything below the submission wrapper.
//!
//! The real NVMe transport (probe/attach, doorbells, completion polling)
//! lives outside this crate. The driver core only needs the narrow contract
//! below: hand a built command (plus an optional data buffer and an opaque
//! context token) to a queue, and drain completions back with their tokens.

use std::fmt;
use std::time::Duration;

use crate::buffer::DmaBuffer;
use crate::error::Result;
use crate::nvme::{NvmeCommand, NvmeCompletion};

/// Opaque per-command context. The driver encodes the qpair id and the
/// command-log slot so a completion finds its slot in O(1).
pub type IoToken = u64;

#[derive(Debug, Clone, Copy)]
pub struct CompletionEvent {
    pub token: IoToken,
    pub cpl: NvmeCompletion,
}

/// One attached controller as seen by the driver core.
///
/// Queue pair 0 is the admin queue and always exists. A qpair is not
/// thread-safe: only the thread that owns it may submit to or poll it.
pub trait NvmeTransport {
    /// Queue `cmd` on `qid`. The buffer, when present, must stay alive until
    /// the matching completion has been polled.
    fn submit(
        &mut self,
        qid: u16,
        cmd: &NvmeCommand,
        buf: Option<&DmaBuffer>,
        len: usize,
        token: IoToken,
    ) -> Result<()>;

    /// Drain up to `max` completions for `qid` (`0` means no limit).
    fn poll(&mut self, qid: u16, max: u32) -> Vec<CompletionEvent>;

    /// Allocate an I/O qpair of the given depth, returning its id (>= 1).
    fn create_io_qpair(&mut self, depth: u32) -> Result<u16>;

    fn free_io_qpair(&mut self, qid: u16) -> Result<()>;

    fn num_sectors(&self, nsid: u32) -> u64;

    fn sector_size(&self, nsid: u32) -> u32;

    fn max_transfer_bytes(&self) -> usize;

    /// Arm the transport's per-command timeout. Transports without timers
    /// ignore this.
    fn register_timeout(&mut self, _timeout: Duration) {}
}

/// A controller address. Anything with a `:` is a PCIe address; everything
/// else is an NVMe-over-Fabrics TCP target on the fixed service port 4420.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAddress {
    Pcie { traddr: String },
    Tcp { traddr: String, trsvcid: u16 },
}

impl TransportAddress {
    pub fn parse(traddr: &str) -> Self {
        if traddr.contains(':') {
            TransportAddress::Pcie {
                traddr: traddr.to_string(),
            }
        } else {
            TransportAddress::Tcp {
                traddr: traddr.to_string(),
                trsvcid: 4420,
            }
        }
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddress::Pcie { traddr } => write!(f, "{traddr}"),
            TransportAddress::Tcp { traddr, trsvcid } => write!(f, "{traddr}:{trsvcid}"),
        }
    }
}
