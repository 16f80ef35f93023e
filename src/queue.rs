//! Queue pair engine (spec section 4.5, component C5): submission slot
//! allocation, tail doorbell, completion reaping with phase-bit tracking,
//! head doorbell, and per-queue timeout sweep.
//!
//! The wire-format `SubmissionQueueEntry`/`CompletionQueueEntry` layouts and
//! the split submission/completion-queue bookkeeping keep the shape of the
//! teacher's `libk::nvme::queues` module; what changes is that the SQ/CQ
//! backing memory is a userspace [`Buffer`] written with plain/volatile
//! pointer access instead of `voladdress::DynamicVolBlock`, and doorbells go
//! through the userspace [`RegisterWindow`] instead of a bare physical
//! address.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bit_field::BitField;
use static_assertions::assert_eq_size;

use crate::dma::Buffer;
use crate::error::{NvmeError, NvmeStatus, Result};
use crate::opcodes::AdminOpcode;
use crate::regs::RegisterWindow;
use crate::timeout::TimeoutTable;

/// A 64-byte NVMe submission queue entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SubmissionQueueEntry {
    /// CDW0: opcode (bits 0-7), fused (8-9), PSDT (14-15), command id (16-31).
    pub cdw0: u32,
    pub nsid: u32,
    _rsvd: u64,
    /// Metadata pointer.
    pub mptr: u64,
    /// Data pointer: PRP1/PRP2, or the first SGL segment.
    pub prps: [u64; 2],
    /// Command dwords 10-15.
    pub operands: [u32; 6],
}
assert_eq_size!(SubmissionQueueEntry, [u8; 64]);

/// Fused-command marker, CDW0 bits 8-9 (spec section 6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fuse {
    None,
    First,
    Second,
}

/// PRP vs SGL selection, CDW0 bits 14-15 (PSDT).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferType {
    Prp,
    Sgl,
}

impl SubmissionQueueEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        opcode: u8,
        fuse: Fuse,
        transfer: TransferType,
        cid: u16,
        nsid: u32,
        mptr: u64,
        prps: [u64; 2],
        operands: [u32; 6],
    ) -> Self {
        let mut cdw0: u32 = 0;
        cdw0.set_bits(0..8, opcode as u32);
        cdw0.set_bits(
            8..10,
            match fuse {
                Fuse::None => 0,
                Fuse::First => 1,
                Fuse::Second => 2,
            },
        );
        cdw0.set_bits(
            14..16,
            match transfer {
                TransferType::Prp => 0,
                TransferType::Sgl => 1,
            },
        );
        cdw0.set_bits(16..32, cid as u32);
        SubmissionQueueEntry { cdw0, nsid, _rsvd: 0, mptr, prps, operands }
    }

    pub fn opcode(&self) -> u8 {
        self.cdw0.get_bits(0..8) as u8
    }

    pub fn cid(&self) -> u16 {
        self.cdw0.get_bits(16..32) as u16
    }

    fn set_cid(&mut self, cid: u16) {
        self.cdw0.set_bits(16..32, cid as u32);
    }

    /// Flatten to the 16 dwords written into an SQ slot.
    fn to_dwords(self) -> [u32; 16] {
        let mut cmd = [0u32; 16];
        cmd[0] = self.cdw0;
        cmd[1] = self.nsid;
        cmd[2] = 0;
        cmd[3] = 0;
        cmd[4] = self.mptr.get_bits(0..32) as u32;
        cmd[5] = self.mptr.get_bits(32..64) as u32;
        cmd[6] = self.prps[0].get_bits(0..32) as u32;
        cmd[7] = self.prps[0].get_bits(32..64) as u32;
        cmd[8] = self.prps[1].get_bits(0..32) as u32;
        cmd[9] = self.prps[1].get_bits(32..64) as u32;
        cmd[10..16].copy_from_slice(&self.operands);
        cmd
    }
}

/// A 16-byte NVMe completion queue entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CompletionQueueEntry {
    pub cmdret: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    pub phase: bool,
    pub status: u16,
}
assert_eq_size!(CompletionQueueEntry, [u8; 16]);

impl CompletionQueueEntry {
    fn from_dwords(words: [u32; 4]) -> Self {
        let dw3 = words[3];
        CompletionQueueEntry {
            cmdret: words[0],
            sqhd: words[2].get_bits(0..16) as u16,
            sqid: words[2].get_bits(16..32) as u16,
            cid: dw3.get_bits(0..16) as u16,
            phase: dw3.get_bit(16),
            status: dw3.get_bits(17..32) as u16,
        }
    }

    pub fn nvme_status(&self) -> NvmeStatus {
        NvmeStatus(self.status)
    }
}

/// A completion continuation: either the short `(cdw0, status)` arity or the
/// full `(cdw0, sqhd, sqid, status)` arity named in spec section 4.5/section
/// 9 ("the two-arity and four-arity variants ... unified under a single
/// CQE-consuming callback"). Callers get there through `From` impls below
/// rather than writing this enum directly.
pub enum Callback {
    Short(Box<dyn FnOnce(u32, NvmeStatus) + Send>),
    Full(Box<dyn FnOnce(u32, u16, u16, NvmeStatus) + Send>),
}

impl Callback {
    fn invoke(self, cqe: &CompletionQueueEntry) {
        match self {
            Callback::Short(f) => f(cqe.cmdret, cqe.nvme_status()),
            Callback::Full(f) => f(cqe.cmdret, cqe.sqhd, cqe.sqid, cqe.nvme_status()),
        }
    }
}

impl<F: FnOnce(u32, NvmeStatus) + Send + 'static> From<F> for Callback {
    fn from(f: F) -> Self {
        Callback::Short(Box::new(f))
    }
}

/// Explicit wrapper for callers who want the four-argument form; Rust can't
/// disambiguate two blanket `FnOnce` impls of different arities through a
/// single `From`, so the four-argument path goes through this newtype.
pub struct FullCallback<F>(pub F);

impl<F: FnOnce(u32, u16, u16, NvmeStatus) + Send + 'static> From<FullCallback<F>> for Callback {
    fn from(f: FullCallback<F>) -> Self {
        Callback::Full(Box::new(f.0))
    }
}

/// Per-slot bookkeeping (spec section 3, "Per-slot command record").
struct CommandRecord {
    opcode: u8,
    callback: Option<Callback>,
    submitted_at: Instant,
    /// Buffers the device may touch; kept alive until the completion is
    /// reaped so a dropped test handle can never cause a use-after-free.
    _buffers: Vec<Arc<Buffer>>,
}

/// Eager or deferred-until-waitdone doorbell ringing (spec section 3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DoorbellPolicy {
    Eager,
    DeferredUntilWaitdone,
}

/// One SQ+CQ pair: admin (qid 0) or I/O.
pub struct QueuePair {
    qid: u16,
    depth: u16,
    sq: Arc<Buffer>,
    cq: Arc<Buffer>,
    sq_tail: u16,
    sq_head: u16,
    cq_head: u16,
    cq_phase: bool,
    slots: Vec<Option<CommandRecord>>,
    free_cids: VecDeque<u16>,
    outstanding: usize,
    regs: Arc<RegisterWindow>,
    doorbell_stride: u16,
    doorbell_policy: DoorbellPolicy,
    interrupt_vector: Option<u16>,
    timeouts: Arc<TimeoutTable>,
    in_waitdone: AtomicBool,
    pending_doorbell: bool,
    /// The controller's admin queue, used by [`QueuePair::abort`] to post an
    /// Abort command targeting this SQ. `None` on the admin queue itself.
    admin: Option<Arc<Mutex<QueuePair>>>,
}

impl QueuePair {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        qid: u16,
        depth: u16,
        sq: Buffer,
        cq: Buffer,
        regs: Arc<RegisterWindow>,
        doorbell_stride: u16,
        doorbell_policy: DoorbellPolicy,
        interrupt_vector: Option<u16>,
        timeouts: Arc<TimeoutTable>,
        admin: Option<Arc<Mutex<QueuePair>>>,
    ) -> Self {
        QueuePair {
            qid,
            depth,
            sq: Arc::new(sq),
            cq: Arc::new(cq),
            sq_tail: 0,
            sq_head: 0,
            cq_head: 0,
            cq_phase: true,
            slots: (0..depth).map(|_| None).collect(),
            free_cids: (0..depth).collect(),
            outstanding: 0,
            regs,
            doorbell_stride,
            doorbell_policy,
            interrupt_vector,
            timeouts,
            in_waitdone: AtomicBool::new(false),
            pending_doorbell: false,
            admin,
        }
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Invariant P1: outstanding_count <= depth - 1 at all times.
    pub fn is_full(&self) -> bool {
        self.outstanding >= (self.depth as usize - 1)
    }

    /// Reserve a slot, assign a command id, copy the SQE into SQ[tail], and
    /// advance the tail. Rings the doorbell immediately unless the deferred
    /// policy is active.
    pub fn submit(
        &mut self,
        mut entry: SubmissionQueueEntry,
        buffers: Vec<Arc<Buffer>>,
        callback: impl Into<Callback>,
    ) -> Result<u16> {
        if self.is_full() {
            return Err(NvmeError::Assertion(format!(
                "queue {} is full (depth {})",
                self.qid, self.depth
            )));
        }
        let cid = self
            .free_cids
            .pop_front()
            .ok_or_else(|| NvmeError::Assertion("no free command ids".into()))?;
        entry.set_cid(cid);
        let opcode = entry.opcode();

        self.write_slot(self.sq_tail, entry);
        self.slots[cid as usize] = Some(CommandRecord {
            opcode,
            callback: Some(callback.into()),
            submitted_at: Instant::now(),
            _buffers: buffers,
        });
        self.sq_tail = (self.sq_tail + 1) % self.depth;
        self.outstanding += 1;

        match self.doorbell_policy {
            DoorbellPolicy::Eager => self.ring_sq_tail(),
            DoorbellPolicy::DeferredUntilWaitdone => self.pending_doorbell = true,
        }
        Ok(cid)
    }

    fn write_slot(&self, slot: u16, entry: SubmissionQueueEntry) {
        let dwords = entry.to_dwords();
        let base = (slot as usize) * 16;
        let ptr = self.sq.phys_to_virt_dwords();
        for (i, dw) in dwords.iter().enumerate() {
            unsafe { std::ptr::write_volatile(ptr.add(base + i), *dw) };
        }
    }

    fn ring_sq_tail(&self) {
        self.regs.ring_sq_tail(self.qid, self.doorbell_stride, self.sq_tail);
    }

    fn ring_cq_head(&self) {
        self.regs.ring_cq_head(self.qid, self.doorbell_stride, self.cq_head);
    }

    fn read_cqe(&self, slot: u16) -> CompletionQueueEntry {
        let ptr = self.cq.phys_to_virt_dwords();
        let base = (slot as usize) * 4;
        let words = [
            unsafe { std::ptr::read_volatile(ptr.add(base)) },
            unsafe { std::ptr::read_volatile(ptr.add(base + 1)) },
            unsafe { std::ptr::read_volatile(ptr.add(base + 2)) },
            unsafe { std::ptr::read_volatile(ptr.add(base + 3)) },
        ];
        CompletionQueueEntry::from_dwords(words)
    }

    /// Reap at least `expected` completions, running each stored callback on
    /// this thread, then sweep for timed-out commands. Re-entering
    /// `waitdone` from within a callback is an assertion error (spec
    /// section 4.5/5/9).
    pub fn waitdone(&mut self, expected: usize) -> Result<u32> {
        if self.in_waitdone.swap(true, Ordering::SeqCst) {
            return Err(NvmeError::Assertion(
                "re-entered waitdone from within a completion callback".into(),
            ));
        }
        let result = self.waitdone_inner(expected);
        self.in_waitdone.store(false, Ordering::SeqCst);
        result
    }

    fn waitdone_inner(&mut self, expected: usize) -> Result<u32> {
        if self.pending_doorbell {
            self.ring_sq_tail();
            self.pending_doorbell = false;
        }
        let mut reaped = 0usize;
        let mut last_cdw0 = 0u32;
        let watchdog_deadline = Instant::now() + Duration::from_millis(crate::timeout::DRIVER_WATCHDOG_MS);

        loop {
            while {
                let cqe = self.read_cqe(self.cq_head);
                cqe.phase == self.cq_phase
            } {
                let cqe = self.read_cqe(self.cq_head);
                last_cdw0 = self.dispatch_completion(cqe)?;
                reaped += 1;
                self.cq_head = (self.cq_head + 1) % self.depth;
                if self.cq_head == 0 {
                    self.cq_phase = !self.cq_phase;
                }
                self.ring_cq_head();
            }

            self.sweep_timeouts()?;

            if reaped >= expected {
                break;
            }
            if Instant::now() >= watchdog_deadline {
                return Err(NvmeError::DriverWatchdogTimeout);
            }
            std::thread::yield_now();
        }
        Ok(last_cdw0)
    }

    fn dispatch_completion(&mut self, cqe: CompletionQueueEntry) -> Result<u32> {
        let cid = cqe.cid as usize;
        let record = self.slots.get_mut(cid).and_then(|s| s.take()).ok_or_else(|| {
            NvmeError::Assertion(format!("completion for unknown/unused cid {cid}"))
        })?;
        self.sq_head = cqe.sqhd;
        self.outstanding = self.outstanding.saturating_sub(1);
        self.free_cids.push_back(cid as u16);
        let cdw0 = cqe.cmdret;
        if let Some(cb) = record.callback {
            cb.invoke(&cqe);
        }
        Ok(cdw0)
    }

    /// Synthesize a timeout completion (cdw0=0xFFFFFFFF, status=0xFFFF) for
    /// every slot whose submission timestamp plus its opcode's timeout has
    /// elapsed (spec section 4.5, "Timeouts are enforced by a per-queue
    /// sweep invoked on every waitdone tick").
    pub(crate) fn sweep_timeouts(&mut self) -> Result<()> {
        let now = Instant::now();
        let mut timed_out = Vec::new();
        for (cid, slot) in self.slots.iter().enumerate() {
            if let Some(rec) = slot {
                let deadline_ms = self.timeouts.timeout_for(rec.opcode);
                if now.duration_since(rec.submitted_at) >= Duration::from_millis(deadline_ms) {
                    timed_out.push((cid as u16, deadline_ms));
                }
            }
        }
        for (cid, deadline_ms) in timed_out {
            if let Some(record) = self.slots[cid as usize].take() {
                self.outstanding = self.outstanding.saturating_sub(1);
                self.free_cids.push_back(cid);
                if let Some(cb) = record.callback {
                    let synth = CompletionQueueEntry {
                        cmdret: 0xFFFF_FFFF,
                        sqhd: self.sq_head,
                        sqid: self.qid,
                        cid,
                        phase: self.cq_phase,
                        status: 0xFFFF,
                    };
                    cb.invoke(&synth);
                }
                log::warn!(
                    "drive timeout: qid={} cid={} after {}ms",
                    self.qid,
                    cid,
                    deadline_ms
                );
            }
        }
        Ok(())
    }

    /// Post an Abort admin command targeting `cid` on this SQ (spec section
    /// 4.5's Qpair convenience). Best-effort: does not itself free the
    /// aborted slot (spec section 5); only the eventual (normal or
    /// timed-out) completion does. Returns whether the controller reports
    /// the command as actually aborted (ABSC bit 0 clear).
    pub fn abort(&self, cid: u16) -> Result<bool> {
        let admin = self.admin.as_ref().ok_or_else(|| {
            NvmeError::Assertion("abort() has no admin queue bound to this qpair".into())
        })?;

        let mut operands = [0u32; 6];
        operands[0].set_bits(0..16, self.qid as u32);
        operands[0].set_bits(16..32, cid as u32);
        let sqe = SubmissionQueueEntry::new(
            AdminOpcode::Abort as u8,
            Fuse::None,
            TransferType::Prp,
            0,
            0,
            0,
            [0, 0],
            operands,
        );

        let slot: Arc<Mutex<Option<(u32, NvmeStatus)>>> = Arc::new(Mutex::new(None));
        let slot_cb = Arc::clone(&slot);
        let mut qp = admin
            .lock()
            .map_err(|_| NvmeError::Assertion("admin queue mutex poisoned".into()))?;
        qp.submit(sqe, Vec::new(), move |cdw0, status| {
            *slot_cb.lock().unwrap() = Some((cdw0, status));
        })?;
        qp.waitdone(1)?;
        drop(qp);

        let (cdw0, status) = slot
            .lock()
            .unwrap()
            .ok_or_else(|| NvmeError::Other("waitdone returned with no recorded status".into()))?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(cdw0 & 1 == 0)
    }

    pub fn msix_mask(&self) {
        if let Some(_v) = self.interrupt_vector {
            self.regs.write_intms(1 << self.qid);
        }
    }

    pub fn msix_unmask(&self) {
        if let Some(_v) = self.interrupt_vector {
            self.regs.write_intmc(1 << self.qid);
        }
    }

    pub fn msix_clear(&self) {
        // Edge-triggered MSI-X vectors self-clear on delivery; this is a
        // no-op placeholder kept for API symmetry with `msix_isset`.
    }

    pub fn msix_isset(&self) -> bool {
        self.interrupt_vector.is_some()
    }

    /// Cancel all outstanding commands (controller/subsystem reset):
    /// reset SQ/CQ head/tail and invoke every pending callback with a reset
    /// status (spec section 5).
    pub fn cancel_all(&mut self, reset_status: NvmeStatus) {
        for slot in self.slots.iter_mut() {
            if let Some(record) = slot.take() {
                if let Some(cb) = record.callback {
                    let synth = CompletionQueueEntry {
                        cmdret: 0,
                        sqhd: 0,
                        sqid: self.qid,
                        cid: 0,
                        phase: self.cq_phase,
                        status: reset_status.0,
                    };
                    cb.invoke(&synth);
                }
            }
        }
        self.sq_tail = 0;
        self.sq_head = 0;
        self.cq_head = 0;
        self.outstanding = 0;
        self.free_cids = (0..self.depth).collect();
    }

    pub fn sq_buffer(&self) -> Arc<Buffer> {
        Arc::clone(&self.sq)
    }

    pub fn cq_buffer(&self) -> Arc<Buffer> {
        Arc::clone(&self.cq)
    }
}

impl Buffer {
    /// View this DMA buffer as a dword array for direct SQ/CQ slot access.
    fn phys_to_virt_dwords(&self) -> *mut u32 {
        // Safety: queue-pair buffers are always allocated with `len()` a
        // multiple of 4 by their callers (admin/I/O queue construction).
        self.get_slice(Some(0), None).unwrap().as_ptr() as *mut u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::FillPattern;
    use crate::pcie::Pcie;

    fn fake_regs() -> Arc<RegisterWindow> {
        // RegisterWindow requires a live Pcie backing; queue-pair unit
        // tests below only exercise SQE/CQE layout and slot bookkeeping,
        // not doorbell rings, so doorbell calls are skipped via depth-1
        // queues that never actually submit.
        Arc::new(RegisterWindow::new(Pcie::fake_for_tests()))
    }

    #[test]
    fn sqe_cid_roundtrips_through_bitfield() {
        let mut sqe = SubmissionQueueEntry::new(
            0x02,
            Fuse::None,
            TransferType::Prp,
            0,
            1,
            0,
            [0x1000, 0],
            [0, 1, 0, 0, 0, 0],
        );
        sqe.set_cid(42);
        assert_eq!(sqe.cid(), 42);
        assert_eq!(sqe.opcode(), 0x02);
    }

    #[test]
    fn cqe_phase_bit_decodes() {
        let words = [0u32, 0, 0u32, 1u32 << 16];
        let cqe = CompletionQueueEntry::from_dwords(words);
        assert!(cqe.phase);
        assert_eq!(cqe.status, 0);
    }

    #[test]
    fn cqe_status_decodes_above_phase_bit() {
        let status: u32 = 0x0281;
        let dw3 = (status << 17) | (0 << 16);
        let cqe = CompletionQueueEntry::from_dwords([0, 0, 0, dw3]);
        assert_eq!(cqe.status, 0x0281);
        assert!(!cqe.phase);
    }

    #[test]
    fn is_full_respects_depth_minus_one() {
        let sq = Buffer::allocate(64 * 4, "sq", FillPattern::AllZero, 4096, Some(0x9000)).unwrap();
        let cq = Buffer::allocate(16 * 4, "cq", FillPattern::AllZero, 4096, Some(0xA000)).unwrap();
        let qp = QueuePair::new(
            1,
            4,
            sq,
            cq,
            fake_regs(),
            0,
            DoorbellPolicy::DeferredUntilWaitdone,
            None,
            Arc::new(TimeoutTable::new()),
            None,
        );
        assert!(!qp.is_full());
    }
}
