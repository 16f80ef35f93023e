//! NVMe opcode enumerations (spec section 6).

/// Admin-queue opcodes referenced by `Controller`'s public contract
/// (spec section 4.4).
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum AdminOpcode {
    DeleteIoSubmissionQueue = 0x00,
    CreateIoSubmissionQueue = 0x01,
    GetLogPage = 0x02,
    DeleteIoCompletionQueue = 0x04,
    CreateIoCompletionQueue = 0x05,
    Identify = 0x06,
    Abort = 0x08,
    SetFeatures = 0x09,
    GetFeatures = 0x0A,
    AsynchronousEventRequest = 0x0C,
    NamespaceManagement = 0x0D,
    FirmwareCommit = 0x10,
    FirmwareImageDownload = 0x11,
    DeviceSelfTest = 0x14,
    NamespaceAttachment = 0x15,
    KeepAlive = 0x18,
    DirectiveSend = 0x19,
    DirectiveReceive = 0x1A,
    VirtualizationManagement = 0x1C,
    MiSend = 0x1D,
    MiReceive = 0x1E,
    DoorbellBufferConfig = 0x7C,
    FormatNvm = 0x80,
    SecuritySend = 0x81,
    SecurityReceive = 0x82,
    Sanitize = 0x84,
    GetLbaStatus = 0x86,
}

/// NVM-command-set I/O opcodes (spec section 6).
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum NvmOpcode {
    Flush = 0x00,
    Write = 0x01,
    Read = 0x02,
    WriteUncorrectable = 0x04,
    Compare = 0x05,
    WriteZeroes = 0x08,
    DatasetManagement = 0x09,
    Verify = 0x0C,
    ReservationRegister = 0x0D,
    ReservationReport = 0x0E,
    ReservationAcquire = 0x11,
    ReservationRelease = 0x15,
    Copy = 0x19,
}

impl NvmOpcode {
    /// Whether this opcode transfers LBA-addressed data and therefore
    /// participates in CRC-table tracking (spec section 4.7).
    pub fn touches_lba_data(self) -> bool {
        matches!(
            self,
            NvmOpcode::Write
                | NvmOpcode::Read
                | NvmOpcode::Compare
                | NvmOpcode::WriteUncorrectable
                | NvmOpcode::WriteZeroes
                | NvmOpcode::Verify
        )
    }

    pub fn is_write_like(self) -> bool {
        matches!(
            self,
            NvmOpcode::Write | NvmOpcode::WriteUncorrectable | NvmOpcode::WriteZeroes
        )
    }
}
