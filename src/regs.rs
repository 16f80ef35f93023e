//! Typed BAR0 register access (spec section 4.3, component C3).
//!
//! Wraps the raw [`crate::pcie::Pcie`] MMIO window with the NVMe
//! controller-register layout: CAP, VS, INTMS, INTMC, CC, CSTS, NSSR, AQA,
//! ASQ, ACQ, and the per-queue doorbells. Offsets mirror the constants the
//! teacher's `NVMeController::new` computes relative to `device.bars.0`.

use bit_field::BitField;

use crate::pcie::Pcie;

pub const REG_CAP: usize = 0x00;
pub const REG_VS: usize = 0x08;
pub const REG_INTMS: usize = 0x0C;
pub const REG_INTMC: usize = 0x10;
pub const REG_CC: usize = 0x14;
pub const REG_CSTS: usize = 0x1C;
pub const REG_NSSR: usize = 0x20;
pub const REG_AQA: usize = 0x24;
pub const REG_ASQ: usize = 0x28;
pub const REG_ACQ: usize = 0x30;
pub const DOORBELL_BASE: usize = 0x1000;

/// Decoded fields of the Controller Capabilities (CAP) register.
#[derive(Clone, Copy, Debug)]
pub struct Capabilities {
    pub mqes: u32,
    pub contiguous_queues_required: bool,
    pub timeout_500ms_units: u32,
    pub doorbell_stride: u16,
    pub nvm_subsystem_reset_supported: bool,
    pub nvm_command_set_supported: bool,
    pub memory_page_size_min: u32,
    pub memory_page_size_max: u32,
}

/// Typed access to the controller register set, plus the doorbell address
/// arithmetic from spec section 4.3: `SQ tail = BAR0 + 0x1000 + (2*qid)*stride`,
/// `CQ head = +4`.
pub struct RegisterWindow {
    pcie: Pcie,
}

impl RegisterWindow {
    pub fn new(pcie: Pcie) -> Self {
        RegisterWindow { pcie }
    }

    pub fn pcie_mut(&mut self) -> &mut Pcie {
        &mut self.pcie
    }

    pub fn read_cap(&self) -> Capabilities {
        let raw = self.pcie.read_bar_u64(REG_CAP);
        Capabilities {
            mqes: raw.get_bits(0..16) as u32 + 1,
            contiguous_queues_required: raw.get_bit(16),
            timeout_500ms_units: raw.get_bits(24..32) as u32,
            doorbell_stride: raw.get_bits(32..36) as u16,
            nvm_subsystem_reset_supported: raw.get_bit(36),
            nvm_command_set_supported: raw.get_bit(37),
            memory_page_size_min: 1 << (12 + raw.get_bits(48..52)),
            memory_page_size_max: 1 << (12 + raw.get_bits(52..56)),
        }
    }

    pub fn read_vs(&self) -> (u16, u8, u8) {
        let raw = self.pcie.read_bar_u32(REG_VS);
        ((raw >> 16) as u16, ((raw >> 8) & 0xFF) as u8, (raw & 0xFF) as u8)
    }

    pub fn read_cc(&self) -> u32 {
        self.pcie.read_bar_u32(REG_CC)
    }

    pub fn write_cc(&self, value: u32) {
        self.pcie.write_bar_u32(REG_CC, value);
    }

    pub fn read_csts(&self) -> u32 {
        self.pcie.read_bar_u32(REG_CSTS)
    }

    pub fn csts_ready(&self) -> bool {
        self.read_csts().get_bit(0)
    }

    pub fn csts_fatal(&self) -> bool {
        self.read_csts().get_bit(1)
    }

    pub fn write_intms(&self, mask: u32) {
        self.pcie.write_bar_u32(REG_INTMS, mask);
    }

    pub fn write_intmc(&self, mask: u32) {
        self.pcie.write_bar_u32(REG_INTMC, mask);
    }

    pub fn write_nssr(&self) {
        self.pcie.write_bar_u32(REG_NSSR, 0x4E564D65); // "NVMe"
    }

    pub fn write_aqa(&self, admin_sq_entries_minus1: u16, admin_cq_entries_minus1: u16) {
        let mut v: u32 = 0;
        v.set_bits(0..12, admin_sq_entries_minus1 as u32);
        v.set_bits(16..28, admin_cq_entries_minus1 as u32);
        self.pcie.write_bar_u32(REG_AQA, v);
    }

    pub fn write_asq(&self, phys: u64) {
        self.pcie.write_bar_u64(REG_ASQ, phys);
    }

    pub fn write_acq(&self, phys: u64) {
        self.pcie.write_bar_u64(REG_ACQ, phys);
    }

    /// SQ tail doorbell offset for queue `qid`, given the CAP.DSTRD stride.
    pub fn sq_tail_doorbell_offset(qid: u16, doorbell_stride: u16) -> usize {
        DOORBELL_BASE + (2 * qid as usize) * (4 << doorbell_stride)
    }

    /// CQ head doorbell offset for queue `qid`: one stride-unit past the SQ
    /// tail doorbell for the same queue.
    pub fn cq_head_doorbell_offset(qid: u16, doorbell_stride: u16) -> usize {
        Self::sq_tail_doorbell_offset(qid, doorbell_stride) + (4 << doorbell_stride)
    }

    pub fn ring_sq_tail(&self, qid: u16, doorbell_stride: u16, tail: u16) {
        self.pcie
            .write_bar_u32(Self::sq_tail_doorbell_offset(qid, doorbell_stride), tail as u32);
    }

    pub fn ring_cq_head(&self, qid: u16, doorbell_stride: u16, head: u16) {
        self.pcie
            .write_bar_u32(Self::cq_head_doorbell_offset(qid, doorbell_stride), head as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doorbell_offsets_scale_with_stride() {
        assert_eq!(RegisterWindow::sq_tail_doorbell_offset(0, 0), 0x1000);
        assert_eq!(RegisterWindow::cq_head_doorbell_offset(0, 0), 0x1004);
        assert_eq!(RegisterWindow::sq_tail_doorbell_offset(1, 0), 0x1008);
        assert_eq!(RegisterWindow::sq_tail_doorbell_offset(1, 2), 0x1020);
    }
}
