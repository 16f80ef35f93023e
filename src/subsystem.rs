//! Subsystem-level power control and SMART/health log decode.
//! `Subsystem::power_cycle()`/`reset()` drive the device through sysfs
//! remove/rescan rather than any NVMe wire command, since a genuine power
//! cycle has to go through the PCIe link itself.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use static_assertions::assert_eq_size;
use zerocopy::FromBytes;

use crate::dma::Buffer;
use crate::error::{NvmeError, Result};
use crate::pcie::PcieAddress;

/// A PCIe device's subsystem, addressed the same way [`crate::pcie::Pcie`]
/// is, for operations that act on the slot rather than the function:
/// removing and re-enumerating the device to simulate a power cycle, or
/// issuing a PCIe hot/function-level reset.
pub struct Subsystem {
    address: PcieAddress,
}

impl Subsystem {
    pub fn new(address: PcieAddress) -> Self {
        Subsystem { address }
    }

    fn sysfs_dir(&self) -> PathBuf {
        PathBuf::from("/sys/bus/pci/devices").join(&self.address.0)
    }

    /// Simulate removing power from the slot for `down_time` and bringing
    /// it back: write `1` to the device's sysfs `remove` file, wait, then
    /// trigger a bus-wide rescan (spec section 3, "subsystem power cycle").
    /// A fresh `Controller`/`Pcie::open` is required afterward since the
    /// kernel tears down and re-creates the sysfs device node.
    pub fn power_cycle(&self, down_time: Duration) -> Result<()> {
        std::fs::write(self.sysfs_dir().join("remove"), b"1")?;
        thread::sleep(down_time);
        std::fs::write("/sys/bus/pci/rescan", b"1")?;
        Ok(())
    }

    /// Trigger a PCIe hot reset of the slot without removing the device
    /// node, by writing to the upstream bridge's `reset` sysfs attribute if
    /// present, falling back to a bus rescan otherwise.
    pub fn reset(&self) -> Result<()> {
        let reset_file = self.sysfs_dir().join("reset");
        if reset_file.exists() {
            std::fs::write(reset_file, b"1")?;
            Ok(())
        } else {
            std::fs::write("/sys/bus/pci/rescan", b"1")?;
            Ok(())
        }
    }
}

/// Typed decode of the SMART/Health Information log page (log page
/// identifier 0x02), the subset of NVMe base-spec fields a test driver
/// reasonably asserts on.
#[derive(Clone, Copy, Debug, Default)]
pub struct SmartLog {
    pub critical_warning: u8,
    pub composite_temperature_kelvin: u16,
    pub available_spare_pct: u8,
    pub available_spare_threshold_pct: u8,
    pub percentage_used: u8,
    pub data_units_read: u64,
    pub data_units_written: u64,
    pub host_read_commands: u64,
    pub host_write_commands: u64,
    pub power_cycles: u64,
    pub power_on_hours: u64,
    pub unsafe_shutdowns: u64,
    pub media_errors: u64,
    pub num_error_log_entries: u64,
}

impl SmartLog {
    /// Decode from a raw log-page-0x02 buffer (at least 512 bytes, as
    /// returned by [`crate::controller::Controller::get_log_page`]).
    pub fn decode(buf: &Buffer) -> Result<Self> {
        if buf.len() < 200 {
            return Err(NvmeError::Assertion(format!(
                "smart log buffer too short: {} bytes",
                buf.len()
            )));
        }
        Ok(SmartLog {
            critical_warning: buf.get_byte(0)?,
            composite_temperature_kelvin: buf.data(2, 1)? as u16,
            available_spare_pct: buf.get_byte(3)?,
            available_spare_threshold_pct: buf.get_byte(4)?,
            percentage_used: buf.get_byte(5)?,
            data_units_read: buf.data(39, 32)?,
            data_units_written: buf.data(55, 48)?,
            host_read_commands: buf.data(71, 64)?,
            host_write_commands: buf.data(87, 80)?,
            power_cycles: buf.data(119, 112)?,
            power_on_hours: buf.data(135, 128)?,
            unsafe_shutdowns: buf.data(151, 144)?,
            media_errors: buf.data(167, 160)?,
            num_error_log_entries: buf.data(183, 176)?,
        })
    }
}

/// One entry of the Error Information log page (log page identifier 0x01),
/// zero-copy decoded straight out of the raw command-completion buffer
/// rather than field-by-field, since it is a fixed 64-byte little-endian
/// layout the device writes directly (teacher's `nvme::logs` module derives
/// the same trait for this reason).
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromBytes)]
pub struct ErrorInformationEntry {
    pub error_count: u64,
    pub submission_queue_id: u16,
    pub command_id: u16,
    pub parameter_error_location: u16,
    pub lba: u64,
    pub namespace: u32,
    pub vendor_specific_info: u8,
    pub transport_type: u8,
    _reserved: [u8; 2],
    pub command_specific_info: u64,
    pub transport_specific_info: u16,
    _reserved2: [u8; 24],
}

assert_eq_size!(ErrorInformationEntry, [u8; 64]);

/// Decode the Error Information log page (log page 0x01) into its 64-byte
/// entries, stopping at the first all-zero `error_count` (an unused slot in
/// a log page sized larger than the controller's actual history, per the
/// base spec's "fewer errors than the maximum number of entries" case).
pub fn decode_error_log(buf: &Buffer) -> Result<Vec<ErrorInformationEntry>> {
    let data = buf.get_slice(None, None)?;
    let mut entries = Vec::with_capacity(data.len() / 64);
    for chunk in data.chunks_exact(64) {
        let entry = ErrorInformationEntry::read_from(chunk)
            .ok_or_else(|| NvmeError::Assertion("error log entry misaligned".into()))?;
        if entry.error_count == 0 {
            break;
        }
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::FillPattern;

    #[test]
    fn decode_rejects_short_buffer() {
        let buf = Buffer::allocate(64, "short-smart", FillPattern::AllZero, 64, None).unwrap();
        assert!(SmartLog::decode(&buf).is_err());
    }

    #[test]
    fn decode_reads_power_cycles_field() {
        let mut buf = Buffer::allocate(512, "smart", FillPattern::AllZero, 512, None).unwrap();
        buf.set_slice(Some(112), &42u64.to_le_bytes()).unwrap();
        let smart = SmartLog::decode(&buf).unwrap();
        assert_eq!(smart.power_cycles, 42);
    }

    #[test]
    fn error_log_stops_at_first_unused_entry() {
        let mut buf = Buffer::allocate(128, "errlog", FillPattern::AllZero, 128, None).unwrap();
        buf.set_slice(Some(0), &1u64.to_le_bytes()).unwrap();
        buf.set_slice(Some(14), &0x77u64.to_le_bytes()).unwrap();
        let entries = decode_error_log(&buf).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error_count, 1);
        assert_eq!(entries[0].lba, 0x77);
    }
}
