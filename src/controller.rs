//! Controller-level administration (spec section 4.4, component C4).
//!
//! Owns the admin queue pair, drives controller enable/reset, and exposes
//! one method per admin command (Identify, Abort, Get/Set Features, Create/
//! Delete I/O Submission/Completion Queue, Asynchronous Event Request, Get
//! Log Page, Format NVM, Keep Alive, Firmware Commit/Download, Namespace
//! Management/Attachment, Directive Send/Receive, Sanitize, Security Send/
//! Receive, Virtualization Management, MI Send/Receive, Doorbell Buffer
//! Config, Get LBA Status, Device Self-test).

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bit_field::BitField;

use crate::dma::{Buffer, FillPattern};
use crate::error::{ConstructionError, NvmeError, NvmeStatus, Result};
use crate::namespace::{Namespace, NamespaceGeometry};
use crate::opcodes::AdminOpcode;
use crate::prp::build_prp;
use crate::queue::{DoorbellPolicy, Fuse, QueuePair, SubmissionQueueEntry, TransferType};
use crate::regs::RegisterWindow;
use crate::supervisor::{QueueKey, Registry};
use crate::timeout::TimeoutTable;

/// Decoded Identify Controller fields the rest of the crate actually uses.
#[derive(Clone, Debug, Default)]
pub struct ControllerIdentity {
    pub vendor_id: u16,
    pub serial_number: String,
    pub model_number: String,
    pub firmware_revision: String,
    pub max_data_transfer_size_pages: u8,
    pub number_of_namespaces: u32,
}

/// Custom controller-init hook (spec section 6, `Controller` construction's
/// `nvme_init_func`): `Default` runs the full enable/reset sequence, `Skip`
/// leaves CC/CSTS untouched (the caller has already enabled the controller,
/// or wants to drive it by hand) while still allocating and programming a
/// fresh admin queue pair so commands can be submitted, and `Custom` runs an
/// arbitrary closure against the register window in place of the default
/// enable/reset sequence before that same admin queue pair is built.
pub enum InitFunc {
    Default,
    Skip,
    Custom(Box<dyn FnOnce(&RegisterWindow) -> Result<()> + Send>),
}

impl Default for InitFunc {
    fn default() -> Self {
        InitFunc::Default
    }
}

/// Bookkeeping for one live I/O queue pair, kept so a controller reset can
/// optionally recreate every queue that was live before it (spec section
/// 4.4, `reset(create_qpair)`).
#[derive(Clone, Copy, Debug)]
struct LiveIoQueue {
    qid: u16,
    depth: u16,
    vector: Option<u16>,
}

pub struct Controller {
    tag: String,
    regs: Arc<RegisterWindow>,
    admin: Arc<Mutex<QueuePair>>,
    timeouts: Arc<TimeoutTable>,
    registry: Arc<Registry>,
    page_size: usize,
    doorbell_stride: u16,
    next_io_qid: u16,
    live_io_queues: Vec<LiveIoQueue>,
}

impl Controller {
    /// Reset and enable the controller: CC.EN = 0, wait for CSTS.RDY = 0,
    /// program AQA/ASQ/ACQ, then CC.EN = 1 and wait for CSTS.RDY = 1 (spec
    /// section 4.4, "Enable/reset sequence").
    pub fn new(
        tag: impl Into<String>,
        regs: RegisterWindow,
        admin_depth: u16,
        registry: Arc<Registry>,
        timeouts: Arc<TimeoutTable>,
    ) -> Result<Self> {
        Self::with_init(tag, regs, admin_depth, registry, timeouts, InitFunc::Default)
    }

    /// Like [`Controller::new`] but lets the caller replace or skip the
    /// default enable/reset choreography (spec section 6, `nvme_init_func`).
    pub fn with_init(
        tag: impl Into<String>,
        regs: RegisterWindow,
        admin_depth: u16,
        registry: Arc<Registry>,
        timeouts: Arc<TimeoutTable>,
        init: InitFunc,
    ) -> Result<Self> {
        let tag = tag.into();
        let regs = Arc::new(regs);
        let cap = regs.read_cap();
        let page_size = cap.memory_page_size_min.max(4096) as usize;

        match init {
            InitFunc::Skip => {}
            InitFunc::Custom(f) => f(&regs)?,
            InitFunc::Default => {
                let cc = regs.read_cc();
                if cc.get_bit(0) {
                    regs.write_cc(cc & !1u32);
                    Self::wait_ready(&regs, false, Duration::from_millis(5000), &tag)?;
                }

                let sq = Buffer::allocate(
                    admin_depth as usize * 64,
                    format!("{tag}-asq"),
                    FillPattern::AllZero,
                    page_size,
                    None,
                )?;
                let cq = Buffer::allocate(
                    admin_depth as usize * 16,
                    format!("{tag}-acq"),
                    FillPattern::AllZero,
                    page_size,
                    None,
                )?;
                regs.write_aqa(admin_depth - 1, admin_depth - 1);
                regs.write_asq(sq.phys_addr());
                regs.write_acq(cq.phys_addr());

                let mut enable: u32 = 0;
                enable.set_bit(0, true); // EN
                enable.set_bits(4..8, 0); // CSS: NVM command set
                enable.set_bits(7..11, 0); // MPS: 4KiB (2^(12+0))
                enable.set_bits(11..14, 0); // AMS: round robin
                enable.set_bits(14..18, 6); // IOSQES: 2^6 = 64 bytes
                enable.set_bits(20..24, 4); // IOCQES: 2^4 = 16 bytes
                regs.write_cc(enable);
                Self::wait_ready(&regs, true, Duration::from_millis(5000), &tag)?;

                let key = QueueKey { controller: tag.clone(), qid: 0 };
                let _stats = registry.register(key.clone());

                let admin = QueuePair::new(
                    0,
                    admin_depth,
                    sq,
                    cq,
                    Arc::clone(&regs),
                    cap.doorbell_stride,
                    DoorbellPolicy::Eager,
                    None,
                    Arc::clone(&timeouts),
                    None,
                );
                let admin = Arc::new(Mutex::new(admin));
                registry.attach_qpair(&key, &admin);

                return Ok(Controller {
                    tag,
                    regs,
                    admin,
                    timeouts,
                    registry,
                    page_size,
                    doorbell_stride: cap.doorbell_stride,
                    next_io_qid: 1,
                    live_io_queues: Vec::new(),
                });
            }
        }

        // InitFunc::Skip / InitFunc::Custom: the caller is responsible for
        // enabling the controller and programming AQA/ASQ/ACQ (Skip) or did
        // so inside its closure (Custom); either way a fresh admin queue
        // pair of `admin_depth` is allocated and its physical addresses
        // programmed into ASQ/ACQ/AQA here so the two stay consistent with
        // what this `Controller` will use to submit admin commands.
        let sq = Buffer::allocate(
            admin_depth as usize * 64,
            format!("{tag}-asq"),
            FillPattern::AllZero,
            page_size,
            None,
        )?;
        let cq = Buffer::allocate(
            admin_depth as usize * 16,
            format!("{tag}-acq"),
            FillPattern::AllZero,
            page_size,
            None,
        )?;
        regs.write_aqa(admin_depth - 1, admin_depth - 1);
        regs.write_asq(sq.phys_addr());
        regs.write_acq(cq.phys_addr());
        let key = QueueKey { controller: tag.clone(), qid: 0 };
        let _stats = registry.register(key.clone());
        let admin = QueuePair::new(
            0,
            admin_depth,
            sq,
            cq,
            Arc::clone(&regs),
            cap.doorbell_stride,
            DoorbellPolicy::Eager,
            None,
            Arc::clone(&timeouts),
            None,
        );
        let admin = Arc::new(Mutex::new(admin));
        registry.attach_qpair(&key, &admin);
        Ok(Controller {
            tag,
            regs,
            admin,
            timeouts,
            registry,
            page_size,
            doorbell_stride: cap.doorbell_stride,
            next_io_qid: 1,
            live_io_queues: Vec::new(),
        })
    }

    fn wait_ready(regs: &RegisterWindow, want_ready: bool, timeout: Duration, tag: &str) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if regs.csts_fatal() {
                return Err(NvmeError::Construction(ConstructionError::ShutdownStatusTimeout {
                    expected: want_ready,
                    timeout_ms: timeout.as_millis() as u64,
                }));
            }
            if regs.csts_ready() == want_ready {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(NvmeError::Construction(ConstructionError::ShutdownStatusTimeout {
                    expected: want_ready,
                    timeout_ms: timeout.as_millis() as u64,
                }));
            }
            std::thread::sleep(Duration::from_millis(1));
            let _ = tag;
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn run_sync(&self, sqe: SubmissionQueueEntry, buffers: Vec<Arc<Buffer>>) -> Result<(u32, NvmeStatus)> {
        let slot: Arc<Mutex<Option<(u32, NvmeStatus)>>> = Arc::new(Mutex::new(None));
        let slot_cb = Arc::clone(&slot);
        let mut qp = self.admin.lock().unwrap();
        qp.submit(sqe, buffers, move |cdw0, status| {
            *slot_cb.lock().unwrap() = Some((cdw0, status));
        })?;
        qp.waitdone(1)?;
        drop(qp);
        slot.lock()
            .unwrap()
            .ok_or_else(|| NvmeError::Other("waitdone returned with no recorded status".into()))
    }

    fn admin_sqe(opcode: AdminOpcode, prps: [u64; 2], operands: [u32; 6]) -> SubmissionQueueEntry {
        SubmissionQueueEntry::new(opcode as u8, Fuse::None, TransferType::Prp, 0, 0, 0, prps, operands)
    }

    /// Identify Controller (CNS 0x01).
    pub fn identify_controller(&self) -> Result<ControllerIdentity> {
        let mut buf = Buffer::allocate(4096, "identify-ctrl", FillPattern::AllZero, self.page_size, None)?;
        let built = build_prp(&buf, 0, 4096, self.page_size)?;
        let mut operands = [0u32; 6];
        operands[0] = 0x01; // CNS = Identify Controller
        let sqe = Self::admin_sqe(AdminOpcode::Identify, [built.pair.prp1, built.pair.prp2], operands);
        let mut buffers: Vec<Arc<Buffer>> = built.list_pages.into_iter().map(Arc::new).collect();
        let (_, status) = self.run_sync(sqe, std::mem::take(&mut buffers))?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(ControllerIdentity {
            vendor_id: buf.data(1, 0)? as u16,
            serial_number: ascii_field(&mut buf, 4, 23)?,
            model_number: ascii_field(&mut buf, 24, 63)?,
            firmware_revision: ascii_field(&mut buf, 64, 71)?,
            max_data_transfer_size_pages: buf.get_byte(77)?,
            number_of_namespaces: buf.data(519, 516)? as u32,
        })
    }

    /// Identify Namespace (CNS 0x00) for `nsid`, returning the geometry an
    /// I/O queue pair needs.
    pub fn identify_namespace(&self, nsid: u32, mdts_pages: u8) -> Result<NamespaceGeometry> {
        let mut buf = Buffer::allocate(4096, "identify-ns", FillPattern::AllZero, self.page_size, None)?;
        let built = build_prp(&buf, 0, 4096, self.page_size)?;
        let mut operands = [0u32; 6];
        operands[0] = 0x00; // CNS = Identify Namespace
        let sqe = Self::admin_sqe(AdminOpcode::Identify, [built.pair.prp1, built.pair.prp2], operands);
        let mut sqe = sqe;
        sqe.nsid = nsid;
        let mut buffers: Vec<Arc<Buffer>> = built.list_pages.into_iter().map(Arc::new).collect();
        let (_, status) = self.run_sync(sqe, std::mem::take(&mut buffers))?;
        if !status.is_success() {
            return Err(NvmeError::Construction(ConstructionError::NamespaceRejected(nsid, status)));
        }
        let size_lbas = buf.data(7, 0)?;
        let flbas = buf.get_byte(26)?;
        let lbaf_index = (flbas & 0x0F) as usize;
        let lbaf_offset = 128 + lbaf_index * 4;
        let lbads = (buf.data((lbaf_offset + 2) as usize, (lbaf_offset + 2) as usize)? & 0xFF) as u32;
        let lba_size = 1usize << lbads;
        let mdts_bytes = if mdts_pages == 0 { 0 } else { (1usize << mdts_pages) * self.page_size };
        Ok(NamespaceGeometry { nsid, size_lbas, lba_size, mdts_bytes })
    }

    /// Create an I/O completion queue then an I/O submission queue bound to
    /// it, and wrap them in a [`Namespace`] targeting `nsid`.
    pub fn create_namespace_queue(
        &mut self,
        nsid: u32,
        geometry: NamespaceGeometry,
        depth: u16,
    ) -> Result<Namespace> {
        let qid = self.next_io_qid;
        self.next_io_qid += 1;

        let cq = Buffer::allocate(depth as usize * 16, format!("{}-iocq{qid}", self.tag), FillPattern::AllZero, self.page_size, None)?;
        let cq_phys = cq.phys_addr();
        let mut operands = [0u32; 6];
        operands[0].set_bits(0..16, depth as u32 - 1);
        operands[0].set_bits(16..32, qid as u32);
        operands[1].set_bit(0, true); // PC: physically contiguous
        let sqe = SubmissionQueueEntry::new(
            AdminOpcode::CreateIoCompletionQueue as u8,
            Fuse::None,
            TransferType::Prp,
            0,
            0,
            0,
            [cq_phys, 0],
            operands,
        );
        let (_, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::Construction(ConstructionError::QpairCreation(
                qid,
                format!("create io completion queue failed: {status}"),
            )));
        }

        let sq = Buffer::allocate(depth as usize * 64, format!("{}-iosq{qid}", self.tag), FillPattern::AllZero, self.page_size, None)?;
        let sq_phys = sq.phys_addr();
        let mut operands = [0u32; 6];
        operands[0].set_bits(0..16, depth as u32 - 1);
        operands[0].set_bits(16..32, qid as u32);
        operands[1].set_bit(0, true); // PC
        operands[1].set_bits(16..32, qid as u32); // CQID this SQ completes on
        let sqe = SubmissionQueueEntry::new(
            AdminOpcode::CreateIoSubmissionQueue as u8,
            Fuse::None,
            TransferType::Prp,
            0,
            0,
            0,
            [sq_phys, 0],
            operands,
        );
        let (_, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::Construction(ConstructionError::QpairCreation(
                qid,
                format!("create io submission queue failed: {status}"),
            )));
        }

        let key = QueueKey { controller: self.tag.clone(), qid };
        self.registry.register(key.clone());
        self.live_io_queues.push(LiveIoQueue { qid, depth, vector: None });

        let qp = QueuePair::new(
            qid,
            depth,
            sq,
            cq,
            Arc::clone(&self.regs),
            self.doorbell_stride,
            DoorbellPolicy::Eager,
            None,
            Arc::clone(&self.timeouts),
            Some(Arc::clone(&self.admin)),
        );
        let qp = Arc::new(Mutex::new(qp));
        self.registry.attach_qpair(&key, &qp);
        Ok(Namespace::new(geometry, qp, self.page_size))
    }

    /// Create a bare I/O queue pair for an [`crate::ioworker::IoWorker`] to
    /// own directly (spec section 4.8: "An I/O worker ... owns exactly one
    /// Qpair with deferred-doorbell policy and interrupts disabled"),
    /// without binding it to a namespace's read/write/compare builders.
    /// Mirrors `create_namespace_queue`'s admin-queue choreography; kept
    /// separate rather than shared because the two return different
    /// wrapper types (`Namespace` vs. a bare `Arc<Mutex<QueuePair>>`).
    pub fn create_ioworker_qpair(&mut self, depth: u16) -> Result<Arc<Mutex<QueuePair>>> {
        let qid = self.next_io_qid;
        self.next_io_qid += 1;

        let cq = Buffer::allocate(depth as usize * 16, format!("{}-iocq{qid}", self.tag), FillPattern::AllZero, self.page_size, None)?;
        let cq_phys = cq.phys_addr();
        let mut operands = [0u32; 6];
        operands[0].set_bits(0..16, depth as u32 - 1);
        operands[0].set_bits(16..32, qid as u32);
        operands[1].set_bit(0, true); // PC
        let sqe = SubmissionQueueEntry::new(
            AdminOpcode::CreateIoCompletionQueue as u8,
            Fuse::None,
            TransferType::Prp,
            0,
            0,
            0,
            [cq_phys, 0],
            operands,
        );
        let (_, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::Construction(ConstructionError::QpairCreation(
                qid,
                format!("create io completion queue failed: {status}"),
            )));
        }

        let sq = Buffer::allocate(depth as usize * 64, format!("{}-iosq{qid}", self.tag), FillPattern::AllZero, self.page_size, None)?;
        let sq_phys = sq.phys_addr();
        let mut operands = [0u32; 6];
        operands[0].set_bits(0..16, depth as u32 - 1);
        operands[0].set_bits(16..32, qid as u32);
        operands[1].set_bit(0, true); // PC
        operands[1].set_bits(16..32, qid as u32); // CQID this SQ completes on
        let sqe = SubmissionQueueEntry::new(
            AdminOpcode::CreateIoSubmissionQueue as u8,
            Fuse::None,
            TransferType::Prp,
            0,
            0,
            0,
            [sq_phys, 0],
            operands,
        );
        let (_, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::Construction(ConstructionError::QpairCreation(
                qid,
                format!("create io submission queue failed: {status}"),
            )));
        }

        let key = QueueKey { controller: self.tag.clone(), qid };
        self.registry.register(key.clone());
        self.live_io_queues.push(LiveIoQueue { qid, depth, vector: None });

        let qp = QueuePair::new(
            qid,
            depth,
            sq,
            cq,
            Arc::clone(&self.regs),
            self.doorbell_stride,
            DoorbellPolicy::DeferredUntilWaitdone,
            None,
            Arc::clone(&self.timeouts),
            Some(Arc::clone(&self.admin)),
        );
        let qp = Arc::new(Mutex::new(qp));
        self.registry.attach_qpair(&key, &qp);
        Ok(qp)
    }

    /// Delete an I/O namespace's submission then completion queue.
    pub fn delete_namespace_queue(&mut self, namespace: Namespace) -> Result<()> {
        let qpair = namespace.qpair();
        let qid = qpair.lock().unwrap().qid();

        let mut operands = [0u32; 6];
        operands[0].set_bits(16..32, qid as u32);
        let sqe = Self::admin_sqe(AdminOpcode::DeleteIoSubmissionQueue, [0, 0], operands);
        let (_, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::Construction(ConstructionError::QpairDeletion(qid, status.to_string())));
        }

        let sqe = Self::admin_sqe(AdminOpcode::DeleteIoCompletionQueue, [0, 0], operands);
        let (_, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::Construction(ConstructionError::QpairDeletion(qid, status.to_string())));
        }

        self.registry.unregister(&QueueKey { controller: self.tag.clone(), qid });
        self.live_io_queues.retain(|q| q.qid != qid);
        Ok(())
    }

    pub fn abort(&self, target_sqid: u16, target_cid: u16) -> Result<bool> {
        let mut operands = [0u32; 6];
        operands[0].set_bits(0..16, target_sqid as u32);
        operands[0].set_bits(16..32, target_cid as u32);
        let sqe = Self::admin_sqe(AdminOpcode::Abort, [0, 0], operands);
        let (cdw0, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(cdw0 & 1 == 0) // ABSC: 0 = command aborted
    }

    pub fn set_feature(&self, feature_id: u8, value: u32, save: bool) -> Result<u32> {
        let mut operands = [0u32; 6];
        operands[0].set_bits(0..8, feature_id as u32);
        operands[0].set_bit(31, save);
        operands[1] = value;
        let sqe = Self::admin_sqe(AdminOpcode::SetFeatures, [0, 0], operands);
        let (cdw0, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(cdw0)
    }

    pub fn get_feature(&self, feature_id: u8, select: u8) -> Result<u32> {
        let mut operands = [0u32; 6];
        operands[0].set_bits(0..8, feature_id as u32);
        operands[0].set_bits(8..11, select as u32);
        let sqe = Self::admin_sqe(AdminOpcode::GetFeatures, [0, 0], operands);
        let (cdw0, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(cdw0)
    }

    /// Post an Asynchronous Event Request, auto-refilling the admin queue's
    /// AER credit every time one completes (spec section 4.4: "the AER
    /// slot is kept full for the life of the controller").
    pub fn asynchronous_event_request(&self, on_event: impl Fn(u16, u8, u8) + Send + Sync + 'static) -> Result<()> {
        let sqe = Self::admin_sqe(AdminOpcode::AsynchronousEventRequest, [0, 0], [0; 6]);
        let admin = Arc::clone(&self.admin);
        let mut qp = self.admin.lock().unwrap();
        qp.submit(sqe, Vec::new(), move |cdw0, status| {
            let event_type = (cdw0 & 0x7) as u8;
            let log_page = ((cdw0 >> 16) & 0xFF) as u8;
            on_event(status.0, event_type, log_page);
            // refill immediately so the controller always has an AER
            // outstanding.
            if let Ok(mut qp) = admin.try_lock() {
                let _ = qp.submit(
                    Self::admin_sqe(AdminOpcode::AsynchronousEventRequest, [0, 0], [0; 6]),
                    Vec::new(),
                    |_, _| {},
                );
            }
        })?;
        Ok(())
    }

    /// Alias for [`Controller::asynchronous_event_request`] under the name
    /// the spec's method table uses (spec section 4.4, "`aer(refill, cb)`");
    /// `refill` controls whether the slot is kept topped up after each
    /// notification.
    pub fn aer(&self, refill: bool, cb: impl Fn(u16, u8, u8) + Send + Sync + 'static) -> Result<()> {
        if refill {
            self.asynchronous_event_request(cb)
        } else {
            let sqe = Self::admin_sqe(AdminOpcode::AsynchronousEventRequest, [0, 0], [0; 6]);
            let mut qp = self.admin.lock().unwrap();
            qp.submit(sqe, Vec::new(), move |cdw0, status| {
                let event_type = (cdw0 & 0x7) as u8;
                let log_page = ((cdw0 >> 16) & 0xFF) as u8;
                cb(status.0, event_type, log_page);
            })
        }
    }

    /// Firmware Image Download: transfer `data` to the offset-addressed
    /// firmware staging area.
    pub fn fw_download(&self, offset: u32, data: &Buffer) -> Result<()> {
        let built = build_prp(data, 0, data.len(), self.page_size)?;
        let mut operands = [0u32; 6];
        operands[0] = (data.len() / 4).saturating_sub(1) as u32;
        operands[1] = offset / 4;
        let sqe = Self::admin_sqe(AdminOpcode::FirmwareImageDownload, [built.pair.prp1, built.pair.prp2], operands);
        let buffers: Vec<Arc<Buffer>> = built.list_pages.into_iter().map(Arc::new).collect();
        let (_, status) = self.run_sync(sqe, buffers)?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(())
    }

    /// Firmware Commit: activate a previously downloaded firmware slot.
    pub fn fw_commit(&self, slot: u8, action: u8) -> Result<()> {
        let mut operands = [0u32; 6];
        operands[0].set_bits(0..3, slot as u32);
        operands[0].set_bits(3..6, action as u32);
        let sqe = Self::admin_sqe(AdminOpcode::FirmwareCommit, [0, 0], operands);
        let (_, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(())
    }

    /// NVMe-MI Send: transfer a management message out-of-band over the
    /// admin queue (opcode 0x1D).
    pub fn mi_send(&self, message_type: u8, data: &Buffer) -> Result<()> {
        let built = build_prp(data, 0, data.len(), self.page_size)?;
        let mut operands = [0u32; 6];
        operands[0].set_bits(0..8, message_type as u32);
        let sqe = Self::admin_sqe(AdminOpcode::MiSend, [built.pair.prp1, built.pair.prp2], operands);
        let buffers: Vec<Arc<Buffer>> = built.list_pages.into_iter().map(Arc::new).collect();
        let (_, status) = self.run_sync(sqe, buffers)?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(())
    }

    /// NVMe-MI Receive: read back a management response into `bytes` worth
    /// of buffer.
    pub fn mi_receive(&self, message_type: u8, bytes: usize) -> Result<Buffer> {
        let buf = Buffer::allocate(bytes, "mi-receive", FillPattern::AllZero, self.page_size, None)?;
        let built = build_prp(&buf, 0, bytes, self.page_size)?;
        let mut operands = [0u32; 6];
        operands[0].set_bits(0..8, message_type as u32);
        let sqe = Self::admin_sqe(AdminOpcode::MiReceive, [built.pair.prp1, built.pair.prp2], operands);
        let buffers: Vec<Arc<Buffer>> = built.list_pages.into_iter().map(Arc::new).collect();
        let (_, status) = self.run_sync(sqe, buffers)?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(buf)
    }

    /// Submit an arbitrary, already-built admin command and block for its
    /// completion; an escape hatch for vendor-specific or not-yet-wrapped
    /// admin opcodes (spec section 4.4, "`send_cmd` ... for commands this
    /// API doesn't name explicitly").
    pub fn send_cmd(&self, sqe: SubmissionQueueEntry, buffers: Vec<Arc<Buffer>>) -> Result<(u32, NvmeStatus)> {
        self.run_sync(sqe, buffers)
    }

    pub fn get_log_page(&self, log_id: u8, nsid: u32, bytes: usize) -> Result<Buffer> {
        let buf = Buffer::allocate(bytes, "log-page", FillPattern::AllZero, self.page_size, None)?;
        let built = build_prp(&buf, 0, bytes, self.page_size)?;
        let dwords = (bytes / 4).saturating_sub(1) as u32;
        let mut operands = [0u32; 6];
        operands[0].set_bits(0..8, log_id as u32);
        operands[0].set_bits(16..32, dwords & 0xFFFF);
        let mut sqe = Self::admin_sqe(AdminOpcode::GetLogPage, [built.pair.prp1, built.pair.prp2], operands);
        sqe.nsid = nsid;
        let mut buffers: Vec<Arc<Buffer>> = built.list_pages.into_iter().map(Arc::new).collect();
        let (_, status) = self.run_sync(sqe, std::mem::take(&mut buffers))?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(buf)
    }

    pub fn format_nvm(&self, nsid: u32, lbaf: u8, secure_erase: u8) -> Result<()> {
        let mut operands = [0u32; 6];
        operands[0].set_bits(0..4, lbaf as u32);
        operands[0].set_bits(9..12, secure_erase as u32);
        let mut sqe = Self::admin_sqe(AdminOpcode::FormatNvm, [0, 0], operands);
        sqe.nsid = nsid;
        let (_, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(())
    }

    pub fn keep_alive(&self) -> Result<()> {
        let sqe = Self::admin_sqe(AdminOpcode::KeepAlive, [0, 0], [0; 6]);
        let (_, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(())
    }

    pub fn sanitize(&self, sanact: u8, ause: bool) -> Result<()> {
        let mut operands = [0u32; 6];
        operands[0].set_bits(0..3, sanact as u32);
        operands[0].set_bit(3, ause);
        let sqe = Self::admin_sqe(AdminOpcode::Sanitize, [0, 0], operands);
        let (_, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(())
    }

    pub fn security_send(&self, secp: u8, spsp: u16, data: &Buffer) -> Result<()> {
        let built = build_prp(data, 0, data.len(), self.page_size)?;
        let mut operands = [0u32; 6];
        operands[0].set_bits(24..32, secp as u32);
        operands[0].set_bits(8..24, spsp as u32);
        operands[1] = data.len() as u32;
        let sqe = Self::admin_sqe(AdminOpcode::SecuritySend, [built.pair.prp1, built.pair.prp2], operands);
        let buffers: Vec<Arc<Buffer>> = built.list_pages.into_iter().map(Arc::new).collect();
        let (_, status) = self.run_sync(sqe, buffers)?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(())
    }

    pub fn security_receive(&self, secp: u8, spsp: u16, bytes: usize) -> Result<Buffer> {
        let buf = Buffer::allocate(bytes, "security-receive", FillPattern::AllZero, self.page_size, None)?;
        let built = build_prp(&buf, 0, bytes, self.page_size)?;
        let mut operands = [0u32; 6];
        operands[0].set_bits(24..32, secp as u32);
        operands[0].set_bits(8..24, spsp as u32);
        operands[1] = bytes as u32;
        let sqe = Self::admin_sqe(AdminOpcode::SecurityReceive, [built.pair.prp1, built.pair.prp2], operands);
        let buffers: Vec<Arc<Buffer>> = built.list_pages.into_iter().map(Arc::new).collect();
        let (_, status) = self.run_sync(sqe, buffers)?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(buf)
    }

    pub fn device_self_test(&self, nsid: u32, test_code: u8) -> Result<()> {
        let mut operands = [0u32; 6];
        operands[0].set_bits(0..4, test_code as u32);
        let mut sqe = Self::admin_sqe(AdminOpcode::DeviceSelfTest, [0, 0], operands);
        sqe.nsid = nsid;
        let (_, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(())
    }

    pub fn namespace_management_create(&self, size_lbas: u64, capacity_lbas: u64, flbas: u8) -> Result<u32> {
        let mut buf = Buffer::allocate(4096, "ns-mgmt", FillPattern::AllZero, self.page_size, None)?;
        buf.set_slice(Some(0), &size_lbas.to_le_bytes())?;
        buf.set_slice(Some(8), &capacity_lbas.to_le_bytes())?;
        buf.set_byte(26, flbas)?;
        let built = build_prp(&buf, 0, 4096, self.page_size)?;
        let mut operands = [0u32; 6];
        operands[0] = 0; // SEL = 0: create
        let sqe = Self::admin_sqe(AdminOpcode::NamespaceManagement, [built.pair.prp1, built.pair.prp2], operands);
        let buffers: Vec<Arc<Buffer>> = built.list_pages.into_iter().map(Arc::new).collect();
        let (cdw0, status) = self.run_sync(sqe, buffers)?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(cdw0)
    }

    pub fn namespace_management_delete(&self, nsid: u32) -> Result<()> {
        let mut operands = [0u32; 6];
        operands[0] = 1; // SEL = 1: delete
        let mut sqe = Self::admin_sqe(AdminOpcode::NamespaceManagement, [0, 0], operands);
        sqe.nsid = nsid;
        let (_, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::Construction(ConstructionError::NamespaceDeletion(nsid, status.to_string())));
        }
        Ok(())
    }

    pub fn namespace_attach(&self, nsid: u32, controller_ids: &[u16], attach: bool) -> Result<()> {
        let mut buf = Buffer::allocate(4096, "ns-attach", FillPattern::AllZero, self.page_size, None)?;
        buf.set_controller_list(controller_ids)?;
        let built = build_prp(&buf, 0, 4096, self.page_size)?;
        let mut operands = [0u32; 6];
        operands[0] = if attach { 0 } else { 1 };
        let mut sqe = Self::admin_sqe(AdminOpcode::NamespaceAttachment, [built.pair.prp1, built.pair.prp2], operands);
        sqe.nsid = nsid;
        let buffers: Vec<Arc<Buffer>> = built.list_pages.into_iter().map(Arc::new).collect();
        let (_, status) = self.run_sync(sqe, buffers)?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(())
    }

    pub fn directive_send(&self, nsid: u32, dtype: u8, doper: u8, dspec: u16) -> Result<()> {
        let mut operands = [0u32; 6];
        operands[1].set_bits(8..16, dtype as u32);
        operands[1].set_bits(0..8, doper as u32);
        operands[1].set_bits(16..32, dspec as u32);
        let mut sqe = Self::admin_sqe(AdminOpcode::DirectiveSend, [0, 0], operands);
        sqe.nsid = nsid;
        let (_, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(())
    }

    pub fn directive_receive(&self, nsid: u32, dtype: u8, doper: u8, bytes: usize) -> Result<Buffer> {
        let buf = Buffer::allocate(bytes, "directive-receive", FillPattern::AllZero, self.page_size, None)?;
        let built = build_prp(&buf, 0, bytes, self.page_size)?;
        let mut operands = [0u32; 6];
        operands[1].set_bits(8..16, dtype as u32);
        operands[1].set_bits(0..8, doper as u32);
        let mut sqe = Self::admin_sqe(AdminOpcode::DirectiveReceive, [built.pair.prp1, built.pair.prp2], operands);
        sqe.nsid = nsid;
        let buffers: Vec<Arc<Buffer>> = built.list_pages.into_iter().map(Arc::new).collect();
        let (_, status) = self.run_sync(sqe, buffers)?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(buf)
    }

    pub fn virtualization_management(&self, act: u8, cntlid: u16, num_resources: u16) -> Result<()> {
        let mut operands = [0u32; 6];
        operands[0].set_bits(0..8, act as u32);
        operands[0].set_bits(16..32, cntlid as u32);
        operands[1].set_bits(0..16, num_resources as u32);
        let sqe = Self::admin_sqe(AdminOpcode::VirtualizationManagement, [0, 0], operands);
        let (_, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(())
    }

    pub fn doorbell_buffer_config(&self, shadow_db: &Buffer, event_idx: &Buffer) -> Result<()> {
        let sqe = Self::admin_sqe(
            AdminOpcode::DoorbellBufferConfig,
            [shadow_db.phys_addr(), event_idx.phys_addr()],
            [0; 6],
        );
        let (_, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(())
    }

    pub fn get_lba_status(&self, nsid: u32, starting_lba: u64, bytes: usize) -> Result<Buffer> {
        let buf = Buffer::allocate(bytes, "lba-status", FillPattern::AllZero, self.page_size, None)?;
        let built = build_prp(&buf, 0, bytes, self.page_size)?;
        let mut operands = [0u32; 6];
        operands[0] = starting_lba.get_bits(0..32) as u32;
        operands[1] = starting_lba.get_bits(32..64) as u32;
        let mut sqe = Self::admin_sqe(AdminOpcode::GetLbaStatus, [built.pair.prp1, built.pair.prp2], operands);
        sqe.nsid = nsid;
        let buffers: Vec<Arc<Buffer>> = built.list_pages.into_iter().map(Arc::new).collect();
        let (_, status) = self.run_sync(sqe, buffers)?;
        if !status.is_success() {
            return Err(NvmeError::CommandFailed(status));
        }
        Ok(buf)
    }

    /// Recreate a previously-existing I/O completion+submission queue pair
    /// at the same `qid`/`depth`, bypassing `next_io_qid` allocation. Used
    /// by [`Controller::reset`] to restore queues a controller reset
    /// implicitly destroyed.
    fn recreate_bare_qpair(&mut self, qid: u16, depth: u16) -> Result<Arc<Mutex<QueuePair>>> {
        let cq = Buffer::allocate(depth as usize * 16, format!("{}-iocq{qid}", self.tag), FillPattern::AllZero, self.page_size, None)?;
        let cq_phys = cq.phys_addr();
        let mut operands = [0u32; 6];
        operands[0].set_bits(0..16, depth as u32 - 1);
        operands[0].set_bits(16..32, qid as u32);
        operands[1].set_bit(0, true); // PC
        let sqe = SubmissionQueueEntry::new(
            AdminOpcode::CreateIoCompletionQueue as u8,
            Fuse::None,
            TransferType::Prp,
            0,
            0,
            0,
            [cq_phys, 0],
            operands,
        );
        let (_, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::Construction(ConstructionError::QpairCreation(
                qid,
                format!("recreate io completion queue failed: {status}"),
            )));
        }

        let sq = Buffer::allocate(depth as usize * 64, format!("{}-iosq{qid}", self.tag), FillPattern::AllZero, self.page_size, None)?;
        let sq_phys = sq.phys_addr();
        let mut operands = [0u32; 6];
        operands[0].set_bits(0..16, depth as u32 - 1);
        operands[0].set_bits(16..32, qid as u32);
        operands[1].set_bit(0, true); // PC
        operands[1].set_bits(16..32, qid as u32); // CQID this SQ completes on
        let sqe = SubmissionQueueEntry::new(
            AdminOpcode::CreateIoSubmissionQueue as u8,
            Fuse::None,
            TransferType::Prp,
            0,
            0,
            0,
            [sq_phys, 0],
            operands,
        );
        let (_, status) = self.run_sync(sqe, Vec::new())?;
        if !status.is_success() {
            return Err(NvmeError::Construction(ConstructionError::QpairCreation(
                qid,
                format!("recreate io submission queue failed: {status}"),
            )));
        }

        let key = QueueKey { controller: self.tag.clone(), qid };
        self.registry.register(key.clone());

        let qp = QueuePair::new(
            qid,
            depth,
            sq,
            cq,
            Arc::clone(&self.regs),
            self.doorbell_stride,
            DoorbellPolicy::Eager,
            None,
            Arc::clone(&self.timeouts),
            Some(Arc::clone(&self.admin)),
        );
        let qp = Arc::new(Mutex::new(qp));
        self.registry.attach_qpair(&key, &qp);
        Ok(qp)
    }

    /// Controller reset (CC.EN 1 -> 0 -> 1): cancels every outstanding
    /// command on every known queue pair with a synthetic abort status.
    /// A reset implicitly destroys every I/O queue; when `create_qpair` is
    /// true, every I/O queue pair that was live before the reset is
    /// recreated with its original qid/depth and returned so the caller can
    /// rebind its namespaces and I/O workers to fresh handles (spec section
    /// 4.4, "`reset(create_qpair)` ... optionally recreates all previously
    /// live I/O queues with their original depths and vectors").
    pub fn reset(&mut self, create_qpair: bool) -> Result<Vec<Arc<Mutex<QueuePair>>>> {
        self.regs.write_cc(self.regs.read_cc() & !1u32);
        Self::wait_ready(&self.regs, false, Duration::from_millis(5000), &self.tag)?;
        self.admin.lock().unwrap().cancel_all(NvmeStatus(0x0007)); // command aborted due to sq deletion
        for q in &self.live_io_queues {
            self.registry.unregister(&QueueKey { controller: self.tag.clone(), qid: q.qid });
        }
        self.regs.write_cc(self.regs.read_cc() | 1u32);
        Self::wait_ready(&self.regs, true, Duration::from_millis(5000), &self.tag)?;

        if !create_qpair {
            self.live_io_queues.clear();
            return Ok(Vec::new());
        }
        let prior = std::mem::take(&mut self.live_io_queues);
        let mut recreated = Vec::with_capacity(prior.len());
        for q in &prior {
            let qp = self.recreate_bare_qpair(q.qid, q.depth)?;
            self.live_io_queues.push(*q);
            recreated.push(qp);
        }
        Ok(recreated)
    }
}

fn ascii_field(buf: &mut Buffer, start: usize, end_inclusive: usize) -> Result<String> {
    let slice = buf.get_slice(Some(start as i64), Some((end_inclusive + 1) as i64))?;
    Ok(String::from_utf8_lossy(slice).trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_identity_defaults_are_empty() {
        let id = ControllerIdentity::default();
        assert_eq!(id.vendor_id, 0);
        assert!(id.serial_number.is_empty());
    }
}
