//! Error taxonomy for the driver.
//!
//! Kinds are grouped the way spec section 7 groups them: construction
//! failures, command-completion failures, timeouts, host-side assertions,
//! I/O-worker internal errors, and asynchronous-event notifications.

use std::fmt;
use thiserror::Error;

/// A 16-bit NVMe completion status, split into status-code and
/// status-code-type, reported verbatim (spec section 6).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct NvmeStatus(pub u16);

impl NvmeStatus {
    pub const SUCCESS: NvmeStatus = NvmeStatus(0);
    /// Synthesized on a per-command timeout: cdw0 = 0xFFFF_FFFF, status = 0xFFFF.
    pub const TIMEOUT: NvmeStatus = NvmeStatus(0xFFFF);

    #[inline]
    pub fn status_code(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    #[inline]
    pub fn status_code_type(self) -> u8 {
        ((self.0 >> 8) & 0x07) as u8
    }

    #[inline]
    pub fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NvmeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}/{:02X}", self.status_code_type(), self.status_code())
    }
}

/// Construction-time failures (spec section 7, kind 1).
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("no NVMe device found at {0}")]
    DeviceNotFound(String),
    #[error("resource {0} is already in use")]
    ResourceBusy(String),
    #[error("queue id {0} is already allocated")]
    QueueIdInUse(u16),
    #[error("namespace {0} creation was rejected by the controller: {1}")]
    NamespaceRejected(u32, NvmeStatus),
    #[error("queue pair {0} creation failed: {1}")]
    QpairCreation(u16, String),
    #[error("queue pair {0} deletion failed: {1}")]
    QpairDeletion(u16, String),
    #[error("namespace {0} deletion failed: {1}")]
    NamespaceDeletion(u32, String),
    #[error("controller did not reach CSTS.RDY={expected} within {timeout_ms}ms")]
    ShutdownStatusTimeout { expected: bool, timeout_ms: u64 },
    #[error("NVMe enumeration failed: {0}")]
    Enumerate(String),
}

/// The top-level error type returned by fallible driver operations.
#[derive(Debug, Error)]
pub enum NvmeError {
    #[error(transparent)]
    Construction(#[from] ConstructionError),

    /// A command completed with a non-zero status. Surfaced to the caller's
    /// callback *and* raised here when the caller used the synchronous,
    /// single-command convenience path.
    #[error("ERROR status: {0}")]
    CommandFailed(NvmeStatus),

    /// The per-opcode deadline elapsed with no completion observed.
    #[error("drive timeout: cid={cid} opcode=0x{opcode:02x} after {timeout_ms}ms")]
    Timeout { cid: u16, opcode: u8, timeout_ms: u64 },

    /// The process-wide watchdog (default 30s) gave up waiting on `waitdone`.
    #[error("pynvme timeout in driver")]
    DriverWatchdogTimeout,

    /// A per-LBA integrity mismatch: the bytes read back do not hash to the
    /// token stored for that LBA (spec section 4.7, invariant ii).
    #[error("verification mismatch at lba {lba}: expected token {expected:#010x}, got {actual:#010x}")]
    VerificationMismatch {
        lba: u64,
        expected: u32,
        actual: u32,
    },

    /// Host-side invariant/parameter violation (spec section 7, kind 4).
    #[error("assertion failed: {0}")]
    Assertion(String),

    /// Negative I/O-worker internal error codes (spec section 7, kind 5).
    #[error("ioworker host ERROR {code}: {message}")]
    WorkerInternal { code: i32, message: String },

    /// An asynchronous event completed on the AER slot (spec section 7, kind 6).
    #[error("AER notification is triggered: {0:#06x}")]
    AsyncEvent(u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, NvmeError>;

/// I/O-worker internal error codes, matching the negative-integer convention
/// described in spec section 7 (kind 5) and section 5 (buffer-pool exhaustion).
pub mod worker_codes {
    /// Worker thread failed to initialize (qpair creation, thread spawn, ...).
    pub const INIT_FAILURE: i32 = -1;
    /// The worker's buffer pool could not be allocated.
    pub const BUFFER_POOL_ALLOC_FAILURE: i32 = -5;
}
