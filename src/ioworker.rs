//! I/O Worker (spec section 4.8, component C8): the driver's hot path.
//!
//! A worker owns exactly one [`QueuePair`] built with
//! [`DoorbellPolicy::DeferredUntilWaitdone`] and no interrupt vector, runs on
//! its own OS thread pinned to a logical CPU, and drives that queue pair at a
//! target depth until one of {`time`, `io_count`, `lba_count`, an external
//! stop request} fires. Uses the same thread-per-subsystem pattern already
//! used by [`crate::supervisor::Supervisor`] and [`crate::rpc::RpcServer`],
//! generalized from a fixed polling loop to a submit/reap hot path.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bit_field::BitField;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex as PlMutex;

use crate::crc_table::CrcTable;
use crate::dma::{Buffer, BufferPool, FillPattern};
use crate::error::{worker_codes, NvmeError, NvmeStatus, Result};
use crate::namespace::NamespaceGeometry;
use crate::opcodes::NvmOpcode;
use crate::prp::build_prp;
use crate::queue::{Fuse, QueuePair, SubmissionQueueEntry, TransferType};

/// How a per-command LBA count (`io_size`) is chosen (spec section 9,
/// "`IoShape` sum type").
#[derive(Clone, Debug)]
pub enum IoShape {
    Fixed(u32),
    /// `(value, weight)` pairs; weights need not sum to 100.
    Choice(Vec<(u32, u32)>),
    /// Inclusive range.
    Range(u32, u32),
}

impl Default for IoShape {
    fn default() -> Self {
        IoShape::Fixed(8)
    }
}

impl IoShape {
    fn sample(&self, discriminant: u64) -> u32 {
        match self {
            IoShape::Fixed(n) => *n,
            IoShape::Choice(choices) => {
                if choices.is_empty() {
                    return 8;
                }
                let total: u64 = choices.iter().map(|(_, w)| *w as u64).sum();
                if total == 0 {
                    return choices[0].0;
                }
                let roll = crate::rng::pick_range(0, total - 1, discriminant);
                let mut acc = 0u64;
                for (value, weight) in choices {
                    acc += *weight as u64;
                    if roll < acc {
                        return *value;
                    }
                }
                choices.last().unwrap().0
            }
            IoShape::Range(lo, hi) => {
                crate::rng::pick_range(*lo as u64, (*hi).max(*lo) as u64, discriminant) as u32
            }
        }
    }
}

/// How the opcode of each synthesized command is chosen.
#[derive(Clone, Debug)]
pub enum OpMix {
    /// `read_percentage` of commands are Read, the rest Write.
    ReadWrite { read_percentage: u8 },
    /// Arbitrary opcode weights, normalized internally.
    Weighted(Vec<(NvmOpcode, u32)>),
}

impl Default for OpMix {
    fn default() -> Self {
        OpMix::ReadWrite { read_percentage: 100 }
    }
}

impl OpMix {
    fn sample(&self, discriminant: u64) -> NvmOpcode {
        match self {
            OpMix::ReadWrite { read_percentage } => {
                let roll = crate::rng::pick_range(0, 99, discriminant);
                if roll < *read_percentage as u64 {
                    NvmOpcode::Read
                } else {
                    NvmOpcode::Write
                }
            }
            OpMix::Weighted(entries) => {
                if entries.is_empty() {
                    return NvmOpcode::Read;
                }
                let total: u64 = entries.iter().map(|(_, w)| *w as u64).sum();
                if total == 0 {
                    return entries[0].0;
                }
                let roll = crate::rng::pick_range(0, total - 1, discriminant);
                let mut acc = 0u64;
                for (opcode, weight) in entries {
                    acc += *weight as u64;
                    if roll < acc {
                        return *opcode;
                    }
                }
                entries.last().unwrap().0
            }
        }
    }
}

/// One entry of a caller-supplied `io_sequence`, overriding the synthetic
/// generator entirely (spec section 4.8).
#[derive(Clone, Copy, Debug)]
pub struct IoSequenceEntry {
    pub time_us: u64,
    pub opcode: NvmOpcode,
    pub slba: u64,
    pub nlb: u16,
}

/// One row of a caller-supplied `output_cmdlog_list` sink.
#[derive(Clone, Debug)]
pub struct CmdLogEntry {
    pub slba: u64,
    pub nlb: u16,
    pub opcode: u8,
    pub submit_us: u64,
    pub complete_us: u64,
    pub status: NvmeStatus,
}

/// Every input named in spec section 4.8's option table. Percentiles for
/// `output_percentile_latency` are keyed in basis points (9900 == p99.00)
/// rather than a floating-point percentile, so the output map has a total
/// order and no float-equality surprises for the caller diffing two runs.
pub struct IoWorkerConfig {
    pub io_size: IoShape,
    /// Stride for sequential mode; `None` defaults to the sampled `io_size`.
    /// May be negative (descending sweep).
    pub lba_step: Option<i64>,
    pub lba_align: u64,
    /// 0-100: percentage of commands whose starting LBA is picked uniformly
    /// at random within the region rather than advanced sequentially.
    pub lba_random: u8,
    pub region_start: u64,
    pub region_end: u64,
    pub region_end_truncate: bool,
    pub op_mix: OpMix,
    pub sgl_percentage: u8,
    /// Target outstanding commands, 2 <= qdepth <= 1024.
    pub qdepth: u16,
    /// 0 = unlimited.
    pub iops: u64,
    /// 0 = unlimited. Capped at 24h by `IoWorker::new`.
    pub time: Duration,
    /// 0 = unlimited.
    pub io_count: u64,
    /// 0 = unlimited.
    pub lba_count: u64,
    /// 100 weights over equal-sized region buckets, used only when
    /// `lba_random` draws a random starting LBA.
    pub distribution: Option<Vec<u32>>,
    pub pattern: FillPattern,
    pub io_sequence: Option<Vec<IoSequenceEntry>>,
    pub percentiles_bp: Vec<u32>,
    pub output_io_per_second: Option<Arc<PlMutex<Vec<u64>>>>,
    pub output_percentile_latency: Option<Arc<PlMutex<BTreeMap<u32, u64>>>>,
    pub output_cmdlog_list: Option<Arc<PlMutex<VecDeque<CmdLogEntry>>>>,
    pub cmdlog_capacity: usize,
    pub cmdlog_error_only: bool,
    pub exit_on_error: bool,
    pub retry_max: u32,
    /// Skip buffer-pool/qpair teardown on failure so the device state can be
    /// inspected post-mortem.
    pub fw_debug: bool,
    pub cpu_id: usize,
}

impl Default for IoWorkerConfig {
    fn default() -> Self {
        IoWorkerConfig {
            io_size: IoShape::default(),
            lba_step: None,
            lba_align: 1,
            lba_random: 100,
            region_start: 0,
            region_end: u64::MAX,
            region_end_truncate: true,
            op_mix: OpMix::default(),
            sgl_percentage: 0,
            qdepth: 63,
            iops: 0,
            time: Duration::ZERO,
            io_count: 0,
            lba_count: 0,
            distribution: None,
            pattern: FillPattern::Increasing16,
            io_sequence: None,
            percentiles_bp: Vec::new(),
            output_io_per_second: None,
            output_percentile_latency: None,
            output_cmdlog_list: None,
            cmdlog_capacity: 1000,
            cmdlog_error_only: false,
            exit_on_error: true,
            retry_max: 0,
            fw_debug: false,
            cpu_id: 0,
        }
    }
}

/// The worker's final report (spec section 4, "I/O Worker result").
#[derive(Clone, Debug, Default)]
pub struct WorkerResult {
    pub io_count_read: u64,
    pub io_count_write: u64,
    pub io_count_nonread: u64,
    pub mseconds: u64,
    pub latency_average_us: u64,
    /// Indexed by completion latency in microseconds; the last bucket
    /// catches every latency >= 1,000,000us.
    pub latency_distribution: Vec<u64>,
    /// Fraction of wall-clock time spent on-CPU, 0.0-1.0.
    pub cpu_usage: f64,
    pub error: Option<String>,
}

#[derive(Default)]
struct Counters {
    io_count_read: u64,
    io_count_write: u64,
    io_count_nonread: u64,
    completed: u64,
    lba_transferred: u64,
    latency_distribution: Vec<u64>,
    latency_sum_us: u128,
    first_error: Option<String>,
}

impl Counters {
    fn new() -> Self {
        Counters { latency_distribution: vec![0u64; 1_000_000], ..Default::default() }
    }

    fn record_latency(&mut self, submit_us: u64, complete_us: u64) {
        let latency = complete_us.saturating_sub(submit_us).min(999_999) as usize;
        self.latency_distribution[latency] += 1;
        self.latency_sum_us += latency as u128;
    }
}

/// An I/O worker bound to one namespace's queue pair, built via
/// [`crate::namespace::Namespace::ioworker`].
pub struct IoWorker {
    qpair: Arc<Mutex<QueuePair>>,
    crc: Arc<CrcTable>,
    geometry: NamespaceGeometry,
    page_size: usize,
    config: IoWorkerConfig,
}

/// A running worker's handle: request an early stop, or block for the
/// result.
pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<WorkerResult>>,
}

impl WorkerHandle {
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Block until the worker thread exits, bounded at ~25s (spec section
    /// 4.8, "bound its shutdown time at ~25s") past the stop request.
    pub fn join(mut self) -> WorkerResult {
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(result) => result,
                Err(_) => WorkerResult { error: Some("ioworker thread panicked".into()), ..Default::default() },
            }
        } else {
            WorkerResult { error: Some("ioworker already joined".into()), ..Default::default() }
        }
    }
}

impl IoWorker {
    pub fn new(
        qpair: Arc<Mutex<QueuePair>>,
        crc: Arc<CrcTable>,
        geometry: NamespaceGeometry,
        page_size: usize,
        config: IoWorkerConfig,
    ) -> Result<Self> {
        if !(2..=1024).contains(&config.qdepth) {
            return Err(NvmeError::Assertion(format!(
                "ioworker qdepth {} outside [2, 1024]",
                config.qdepth
            )));
        }
        if config.lba_random > 100 || config.sgl_percentage > 100 {
            return Err(NvmeError::Assertion(
                "ioworker lba_random/sgl_percentage must be a 0-100 percentage".into(),
            ));
        }
        if let Some(d) = &config.distribution {
            if d.len() != 100 {
                return Err(NvmeError::Assertion("distribution must have exactly 100 weights".into()));
            }
        }
        if config.time > Duration::from_secs(24 * 60 * 60) {
            return Err(NvmeError::Assertion("ioworker time exceeds 24h cap".into()));
        }
        Ok(IoWorker { qpair, crc, geometry, page_size, config })
    }

    /// Spawn the worker thread and return immediately with a handle.
    pub fn start(self) -> Result<WorkerHandle> {
        let qdepth = self.config.qdepth as usize;
        let buf_size = self.buffer_size();
        let pool = BufferPool::new(qdepth, buf_size, "ioworker").map_err(|_| {
            NvmeError::WorkerInternal {
                code: worker_codes::BUFFER_POOL_ALLOC_FAILURE,
                message: "failed to allocate ioworker buffer pool".into(),
            }
        })?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let cpu_id = self.config.cpu_id;

        let handle = std::thread::Builder::new()
            .name(format!("nvme-ioworker-{cpu_id}"))
            .spawn(move || run(self, pool, stop_thread))
            .map_err(|e| NvmeError::WorkerInternal {
                code: worker_codes::INIT_FAILURE,
                message: format!("failed to spawn ioworker thread: {e}"),
            })?;

        Ok(WorkerHandle { stop, handle: Some(handle) })
    }

    fn buffer_size(&self) -> usize {
        let max_nlb = match &self.config.io_size {
            IoShape::Fixed(n) => *n,
            IoShape::Choice(choices) => choices.iter().map(|(v, _)| *v).max().unwrap_or(8),
            IoShape::Range(_, hi) => *hi,
        }
        .max(1);
        max_nlb as usize * self.geometry.lba_size
    }
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu_id: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu_id, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            log::warn!(
                "sched_setaffinity to cpu {cpu_id} failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(cpu_id: usize) {
    log::warn!("cpu pinning is not supported on this platform (requested cpu {cpu_id})");
}

fn cpu_usage_fraction(wall: Duration) -> f64 {
    let wall_s = wall.as_secs_f64();
    if wall_s <= 0.0 {
        return 0.0;
    }
    #[cfg(target_os = "linux")]
    {
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::getrusage(libc::RUSAGE_THREAD, &mut usage) };
        if ret != 0 {
            return 0.0;
        }
        let user = usage.ru_utime.tv_sec as f64 + usage.ru_utime.tv_usec as f64 / 1e6;
        let sys = usage.ru_stime.tv_sec as f64 + usage.ru_stime.tv_usec as f64 / 1e6;
        ((user + sys) / wall_s).min(1.0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        0.0
    }
}

/// Pick the next command's starting LBA: sequential cursor advance, or a
/// uniform/heat-mapped random draw, per `lba_random`'s 0-100 split.
#[allow(clippy::too_many_arguments)]
fn clamp_to_mdts(geometry: &NamespaceGeometry, nlb: u32) -> u32 {
    if geometry.mdts_bytes == 0 {
        return nlb;
    }
    let max_lbas = (geometry.mdts_bytes / geometry.lba_size).max(1) as u32;
    nlb.min(max_lbas)
}

fn pick_lba(
    config: &IoWorkerConfig,
    cursor: &mut i64,
    region_start: u64,
    region_len: u64,
    sampled_nlb: u32,
    discriminant: u64,
) -> u64 {
    let roll = crate::rng::pick_range(0, 99, discriminant.wrapping_add(1));
    let random_pick = roll < config.lba_random as u64;

    let raw = if random_pick {
        if let Some(dist) = &config.distribution {
            let total: u64 = dist.iter().map(|w| *w as u64).sum();
            let bucket_len = (region_len / 100).max(1);
            if total == 0 {
                crate::rng::pick_range(0, region_len.saturating_sub(1), discriminant)
            } else {
                let w = crate::rng::pick_range(0, total - 1, discriminant);
                let mut acc = 0u64;
                let mut bucket = 0u64;
                for (i, weight) in dist.iter().enumerate() {
                    acc += *weight as u64;
                    if w < acc {
                        bucket = i as u64;
                        break;
                    }
                }
                let within = crate::rng::pick_range(0, bucket_len.saturating_sub(1), discriminant.wrapping_add(2));
                bucket * bucket_len + within
            }
        } else {
            crate::rng::pick_range(0, region_len.saturating_sub(1), discriminant)
        }
    } else {
        let step = config.lba_step.unwrap_or(sampled_nlb as i64);
        let next = *cursor;
        *cursor = next + step;
        if region_len > 0 {
            *cursor = cursor.rem_euclid(region_len as i64);
        }
        next.rem_euclid(region_len.max(1) as i64) as u64
    };

    let aligned = if config.lba_align > 1 { raw - (raw % config.lba_align) } else { raw };
    region_start + aligned.min(region_len.saturating_sub(1))
}

fn run(worker: IoWorker, pool: BufferPool, stop: Arc<AtomicBool>) -> WorkerResult {
    pin_to_cpu(worker.config.cpu_id);

    let IoWorker { qpair, crc, geometry, page_size, config } = worker;
    let region_start = config.region_start.min(geometry.size_lbas.saturating_sub(1));
    let region_end = if config.region_end_truncate {
        config.region_end.min(geometry.size_lbas)
    } else {
        config.region_end
    };
    let region_len = region_end.saturating_sub(region_start);

    let counters = Arc::new(PlMutex::new(Counters::new()));
    let pending_return: Arc<SegQueue<Arc<Buffer>>> = Arc::new(SegQueue::new());
    // Re-reads queued by a verification mismatch (spec section 4.8,
    // `retry_max`): (lba, nlb, attempts_remaining_after_this_one). Drained
    // with priority over freshly sampled commands so a retry observes the
    // device's current contents as soon as the qdepth budget allows.
    let retry_queue: Arc<SegQueue<(u64, u16, u32)>> = Arc::new(SegQueue::new());
    let start = Instant::now();
    let mut submitted: u64 = 0;
    let mut sequential_cursor: i64 = 0;
    let mut iops_tokens: f64 = config.qdepth as f64;
    let mut last_refill = start;
    let mut per_second_cursor: u64 = 0;
    let mut stop_reason: Option<String> = None;

    let pool = Arc::new(pool);

    'outer: loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        if config.time > Duration::ZERO && start.elapsed() >= config.time {
            break;
        }
        if config.io_count > 0 && submitted >= config.io_count {
            break;
        }
        {
            let c = counters.lock();
            if config.lba_count > 0 && c.lba_transferred >= config.lba_count {
                break;
            }
        }

        if config.iops > 0 {
            let now = Instant::now();
            let elapsed_ms = now.duration_since(last_refill).as_secs_f64() * 1000.0;
            iops_tokens = (iops_tokens + elapsed_ms * (config.iops as f64 / 1000.0)).min(config.qdepth as f64);
            last_refill = now;
        }

        reclaim_buffers(&pending_return, &pool);

        let mut qp = qpair.lock().unwrap();
        while qp.outstanding() < config.qdepth as usize - 1 {
            if stop.load(Ordering::Relaxed) {
                break 'outer;
            }
            if config.io_count > 0 && submitted >= config.io_count {
                break;
            }
            if config.iops > 0 && iops_tokens < 1.0 {
                break;
            }

            let discriminant = submitted;
            let retry = retry_queue.pop();
            let (opcode, lba, nlb, retry_attempts, is_retry) = if let Some((lba, nlb, attempts)) = retry {
                (NvmOpcode::Read, lba, nlb, attempts, true)
            } else if let Some(seq) = &config.io_sequence {
                if submitted as usize >= seq.len() {
                    break;
                }
                let e = seq[submitted as usize];
                (e.opcode, e.slba, e.nlb, config.retry_max, false)
            } else {
                let nlb = config.io_size.sample(discriminant).max(1);
                let lba = pick_lba(&config, &mut sequential_cursor, region_start, region_len, nlb, discriminant);
                let opcode = config.op_mix.sample(discriminant);
                let max_nlb = clamp_to_mdts(&geometry, u16::MAX as u32);
                (opcode, lba, nlb.min(max_nlb) as u16, config.retry_max, false)
            };

            let use_sgl = config.sgl_percentage > 0
                && crate::rng::pick_range(0, 99, discriminant.wrapping_add(3)) < config.sgl_percentage as u64;

            let submitted_result = submit_one(
                &mut qp,
                &geometry,
                page_size,
                &pool,
                &pending_return,
                &crc,
                &counters,
                &config,
                opcode,
                lba,
                nlb,
                use_sgl,
                start,
                retry_attempts,
                Arc::clone(&retry_queue),
            );

            match submitted_result {
                Ok(()) => {
                    if !is_retry {
                        submitted += 1;
                    }
                    if config.iops > 0 {
                        iops_tokens -= 1.0;
                    }
                }
                Err(e) => {
                    let mut c = counters.lock();
                    if c.first_error.is_none() {
                        c.first_error = Some(e.to_string());
                    }
                    drop(c);
                    if config.exit_on_error {
                        stop_reason = Some(e.to_string());
                        break 'outer;
                    }
                    break;
                }
            }
        }
        let outstanding = qp.outstanding();
        drop(qp);

        if outstanding > 0 {
            let mut qp = qpair.lock().unwrap();
            if qp.waitdone(1).is_err() {
                // Watchdog expiry or a host-side assertion; surface and stop.
                break;
            }
        } else {
            let sequence_exhausted =
                config.io_sequence.as_ref().is_some_and(|s| submitted as usize >= s.len());
            let count_reached = config.io_count > 0 && submitted >= config.io_count;
            if sequence_exhausted || count_reached {
                break;
            }
        }

        if let Some(sink) = &config.output_io_per_second {
            let elapsed_secs = start.elapsed().as_secs();
            if elapsed_secs > per_second_cursor {
                let completed = counters.lock().completed;
                let mut samples = sink.lock();
                while (samples.len() as u64) < elapsed_secs {
                    samples.push(completed);
                }
                per_second_cursor = elapsed_secs;
            }
        }
    }

    // Drain all outstanding completions before reporting (spec section 4.8).
    let drain_deadline = Instant::now() + Duration::from_secs(25);
    loop {
        let outstanding = {
            let qp = qpair.lock().unwrap();
            qp.outstanding()
        };
        if outstanding == 0 || Instant::now() >= drain_deadline {
            break;
        }
        let mut qp = qpair.lock().unwrap();
        if qp.waitdone(1).is_err() {
            break;
        }
    }
    reclaim_buffers(&pending_return, &pool);

    // Any verification retries still queued when the worker stopped never
    // got a chance to re-read; surface them rather than silently dropping
    // the mismatch they were queued for.
    if let Some((lba, nlb, _)) = retry_queue.pop() {
        let mut c = counters.lock();
        if c.first_error.is_none() {
            c.first_error = Some(format!(
                "verification retry for lba {lba} (nlb {nlb}) abandoned at worker shutdown"
            ));
        }
    }

    if let (Some(percentiles_sink), true) = (&config.output_percentile_latency, !config.percentiles_bp.is_empty()) {
        let c = counters.lock();
        record_percentiles(&c.latency_distribution, c.completed, &config.percentiles_bp, percentiles_sink);
    }

    let c = counters.lock();
    let mseconds = start.elapsed().as_millis() as u64;
    let latency_average_us = if c.completed > 0 { (c.latency_sum_us / c.completed as u128) as u64 } else { 0 };
    WorkerResult {
        io_count_read: c.io_count_read,
        io_count_write: c.io_count_write,
        io_count_nonread: c.io_count_nonread,
        mseconds,
        latency_average_us,
        latency_distribution: c.latency_distribution.clone(),
        cpu_usage: cpu_usage_fraction(start.elapsed()),
        error: stop_reason.or_else(|| c.first_error.clone()),
    }
}

fn reclaim_buffers(pending_return: &Arc<SegQueue<Arc<Buffer>>>, pool: &BufferPool) {
    let mut retry = Vec::new();
    while let Some(arc_buf) = pending_return.pop() {
        match Arc::try_unwrap(arc_buf) {
            Ok(buf) => pool.release(buf),
            Err(arc) => retry.push(arc),
        }
    }
    for arc in retry {
        pending_return.push(arc);
    }
}

fn record_percentiles(hist: &[u64], total: u64, percentiles_bp: &[u32], sink: &Arc<PlMutex<BTreeMap<u32, u64>>>) {
    if total == 0 {
        return;
    }
    let mut map = sink.lock();
    for &bp in percentiles_bp {
        let target = ((bp as u128 * total as u128) / 10_000).min(total as u128 - 1) as u64;
        let mut cumulative = 0u64;
        for (bucket, count) in hist.iter().enumerate() {
            cumulative += count;
            if cumulative > target {
                map.insert(bp, bucket as u64);
                break;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn submit_one(
    qp: &mut QueuePair,
    geometry: &NamespaceGeometry,
    page_size: usize,
    pool: &Arc<BufferPool>,
    pending_return: &Arc<SegQueue<Arc<Buffer>>>,
    crc: &Arc<CrcTable>,
    counters: &Arc<PlMutex<Counters>>,
    config: &IoWorkerConfig,
    opcode: NvmOpcode,
    lba: u64,
    nlb: u16,
    use_sgl: bool,
    worker_start: Instant,
    retry_attempts_remaining: u32,
    retry_queue: Arc<SegQueue<(u64, u16, u32)>>,
) -> Result<()> {
    let submit_us = worker_start.elapsed().as_micros() as u64;
    let cmdlog = config.output_cmdlog_list.clone();
    let cmdlog_capacity = config.cmdlog_capacity;
    let cmdlog_error_only = config.cmdlog_error_only;

    match opcode {
        NvmOpcode::Flush => {
            let sqe = SubmissionQueueEntry::new(
                NvmOpcode::Flush as u8,
                Fuse::None,
                TransferType::Prp,
                0,
                geometry.nsid,
                0,
                [0, 0],
                [0; 6],
            );
            let counters = Arc::clone(counters);
            qp.submit(sqe, Vec::new(), move |_cdw0, status| {
                finish_nonread(&counters, status, lba, nlb, opcode, submit_us, worker_start, cmdlog, cmdlog_capacity, cmdlog_error_only);
            })?;
            Ok(())
        }
        NvmOpcode::DatasetManagement => {
            let mut desc = Buffer::allocate(16, "ioworker-dsm", FillPattern::AllZero, 16, None)?;
            desc.set_dsm_range(0, lba, nlb as u32, 0)?;
            let built = build_prp(&desc, 0, 16, page_size)?;
            let mut operands = [0u32; 6];
            operands[1].set_bit(2, true);
            let sqe = SubmissionQueueEntry::new(
                NvmOpcode::DatasetManagement as u8,
                Fuse::None,
                TransferType::Prp,
                0,
                geometry.nsid,
                0,
                [built.pair.prp1, built.pair.prp2],
                operands,
            );
            let mut buffers: Vec<Arc<Buffer>> = built.list_pages.into_iter().map(Arc::new).collect();
            buffers.push(Arc::new(desc));
            let crc = Arc::clone(crc);
            let counters = Arc::clone(counters);
            qp.submit(sqe, buffers, move |_cdw0, status| {
                if status.is_success() {
                    crc.trim(lba, nlb as u32);
                }
                finish_nonread(&counters, status, lba, nlb, opcode, submit_us, worker_start, cmdlog, cmdlog_capacity, cmdlog_error_only);
            })?;
            Ok(())
        }
        NvmOpcode::Read => {
            let buf = pool.acquire().ok_or_else(|| NvmeError::WorkerInternal {
                code: worker_codes::BUFFER_POOL_ALLOC_FAILURE,
                message: "ioworker buffer pool exhausted on read".into(),
            })?;
            let buf_arc = Arc::new(buf);
            let (prps, list_pages) = build_data_prps(&buf_arc, nlb, geometry.lba_size, page_size, use_sgl)?;
            let sqe = lba_sqe(opcode, lba, nlb, geometry.nsid, prps, use_sgl);
            let mut buffers: Vec<Arc<Buffer>> = list_pages;
            buffers.push(Arc::clone(&buf_arc));
            let crc = Arc::clone(crc);
            let counters = Arc::clone(counters);
            let pending_return = Arc::clone(pending_return);
            qp.submit(sqe, buffers, move |_cdw0, status| {
                if status.is_success() {
                    if let Ok(data) = buf_arc.get_slice(None, None).map(|s| s.to_vec()) {
                        if let Err(e) = crc.compare(lba, nlb as u32, &data) {
                            if retry_attempts_remaining > 0 {
                                retry_queue.push((lba, nlb, retry_attempts_remaining - 1));
                            } else {
                                log::warn!("{e}");
                                let mut c = counters.lock();
                                if c.first_error.is_none() {
                                    c.first_error = Some(e.to_string());
                                }
                            }
                        }
                    }
                }
                pending_return.push(buf_arc);
                finish_read(&counters, status, lba, nlb, submit_us, worker_start, cmdlog, cmdlog_capacity, cmdlog_error_only);
            })?;
            Ok(())
        }
        NvmOpcode::Write => {
            let mut buf = pool.acquire().ok_or_else(|| NvmeError::WorkerInternal {
                code: worker_codes::BUFFER_POOL_ALLOC_FAILURE,
                message: "ioworker buffer pool exhausted on write".into(),
            })?;
            buf.refill(config.pattern.clone())?;
            buf.stamp_lbas(lba, geometry.lba_size, crate::dma::next_stamp_token())?;
            let data = buf.get_slice(None, Some(nlb as i64 * geometry.lba_size as i64))?.to_vec();
            let buf_arc = Arc::new(buf);
            let (prps, list_pages) = build_data_prps(&buf_arc, nlb, geometry.lba_size, page_size, use_sgl)?;
            let sqe = lba_sqe(opcode, lba, nlb, geometry.nsid, prps, use_sgl);
            let mut buffers: Vec<Arc<Buffer>> = list_pages;
            buffers.push(Arc::clone(&buf_arc));
            let crc = Arc::clone(crc);
            let counters = Arc::clone(counters);
            let pending_return = Arc::clone(pending_return);
            qp.submit(sqe, buffers, move |_cdw0, status| {
                if status.is_success() {
                    if let Err(e) = crc.write(lba, nlb as u32, &data) {
                        log::warn!("{e}");
                        let mut c = counters.lock();
                        if c.first_error.is_none() {
                            c.first_error = Some(e.to_string());
                        }
                    }
                }
                pending_return.push(buf_arc);
                finish_nonread(&counters, status, lba, nlb, opcode, submit_us, worker_start, cmdlog, cmdlog_capacity, cmdlog_error_only);
            })?;
            Ok(())
        }
        other => Err(NvmeError::Assertion(format!("ioworker does not support opcode {other:?} yet"))),
    }
}

fn build_data_prps(
    buffer: &Buffer,
    nlb: u16,
    lba_size: usize,
    page_size: usize,
    use_sgl: bool,
) -> Result<(PrpOrSgl, Vec<Arc<Buffer>>)> {
    let length = nlb as usize * lba_size;
    if use_sgl {
        let desc = crate::prp::build_sgl_data_block(buffer, 0, length as u32);
        Ok((PrpOrSgl::Sgl(desc.encode()), Vec::new()))
    } else {
        let built = build_prp(buffer, 0, length, page_size)?;
        Ok((PrpOrSgl::Prp(built.pair), built.list_pages.into_iter().map(Arc::new).collect()))
    }
}

enum PrpOrSgl {
    Prp(crate::prp::PrpPair),
    Sgl([u8; 16]),
}

fn lba_sqe(opcode: NvmOpcode, lba: u64, nlb: u16, nsid: u32, prps: PrpOrSgl, use_sgl: bool) -> SubmissionQueueEntry {
    let mut operands = [0u32; 6];
    operands[0] = lba.get_bits(0..32) as u32;
    operands[1] = lba.get_bits(32..64) as u32;
    operands[2].set_bits(0..16, nlb as u32 - 1);
    let dptr = match prps {
        PrpOrSgl::Prp(pair) => [pair.prp1, pair.prp2],
        // The DPTR field occupies the same 16 bytes for PRP and SGL
        // transfers (NVMe base spec); an encoded SGL descriptor's two
        // halves are reinterpreted as the PRP1/PRP2 qwords.
        PrpOrSgl::Sgl(bytes) => [
            u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        ],
    };
    SubmissionQueueEntry::new(
        opcode as u8,
        Fuse::None,
        if use_sgl { TransferType::Sgl } else { TransferType::Prp },
        0,
        nsid,
        0,
        dptr,
        operands,
    )
}

#[allow(clippy::too_many_arguments)]
fn finish_read(
    counters: &Arc<PlMutex<Counters>>,
    status: NvmeStatus,
    lba: u64,
    nlb: u16,
    submit_us: u64,
    worker_start: Instant,
    cmdlog: Option<Arc<PlMutex<VecDeque<CmdLogEntry>>>>,
    cmdlog_capacity: usize,
    cmdlog_error_only: bool,
) {
    let complete_us = worker_start.elapsed().as_micros() as u64;
    let mut c = counters.lock();
    c.io_count_read += 1;
    c.completed += 1;
    c.lba_transferred += nlb as u64;
    c.record_latency(submit_us, complete_us);
    if !status.is_success() {
        log::warn!("ERROR status: {status}");
        if c.first_error.is_none() {
            c.first_error = Some(format!("ERROR status: {status}"));
        }
    }
    drop(c);
    push_cmdlog(cmdlog, cmdlog_capacity, cmdlog_error_only, lba, nlb, NvmOpcode::Read as u8, submit_us, complete_us, status);
}

#[allow(clippy::too_many_arguments)]
fn finish_nonread(
    counters: &Arc<PlMutex<Counters>>,
    status: NvmeStatus,
    lba: u64,
    nlb: u16,
    opcode: NvmOpcode,
    submit_us: u64,
    worker_start: Instant,
    cmdlog: Option<Arc<PlMutex<VecDeque<CmdLogEntry>>>>,
    cmdlog_capacity: usize,
    cmdlog_error_only: bool,
) {
    let complete_us = worker_start.elapsed().as_micros() as u64;
    let mut c = counters.lock();
    if opcode == NvmOpcode::Write {
        c.io_count_write += 1;
    } else {
        c.io_count_nonread += 1;
    }
    c.completed += 1;
    c.lba_transferred += nlb as u64;
    c.record_latency(submit_us, complete_us);
    if !status.is_success() {
        log::warn!("ERROR status: {status}");
        if c.first_error.is_none() {
            c.first_error = Some(format!("ERROR status: {status}"));
        }
    }
    drop(c);
    push_cmdlog(cmdlog, cmdlog_capacity, cmdlog_error_only, lba, nlb, opcode as u8, submit_us, complete_us, status);
}

#[allow(clippy::too_many_arguments)]
fn push_cmdlog(
    cmdlog: Option<Arc<PlMutex<VecDeque<CmdLogEntry>>>>,
    capacity: usize,
    error_only: bool,
    lba: u64,
    nlb: u16,
    opcode: u8,
    submit_us: u64,
    complete_us: u64,
    status: NvmeStatus,
) {
    let Some(sink) = cmdlog else { return };
    if error_only && status.is_success() {
        return;
    }
    let mut log = sink.lock();
    if log.len() >= capacity {
        log.pop_front();
    }
    log.push_back(CmdLogEntry { slba: lba, nlb, opcode, submit_us, complete_us, status });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_shape_fixed_is_constant() {
        assert_eq!(IoShape::Fixed(8).sample(0), 8);
        assert_eq!(IoShape::Fixed(8).sample(99), 8);
    }

    #[test]
    fn io_shape_range_stays_in_bounds() {
        crate::rng::srand(7);
        let shape = IoShape::Range(4, 16);
        for d in 0..50 {
            let v = shape.sample(d);
            assert!((4..=16).contains(&v));
        }
    }

    #[test]
    fn op_mix_read_write_all_reads_at_100_percent() {
        crate::rng::srand(1);
        let mix = OpMix::ReadWrite { read_percentage: 100 };
        for d in 0..20 {
            assert_eq!(mix.sample(d), NvmOpcode::Read);
        }
    }

    #[test]
    fn rejects_qdepth_out_of_range() {
        let geometry = NamespaceGeometry { nsid: 1, size_lbas: 1024, lba_size: 512, mdts_bytes: 0 };
        let crc = Arc::new(CrcTable::new(512));
        let sq = Buffer::allocate(64, "sq", FillPattern::AllZero, 4096, Some(0x1000)).unwrap();
        let cq = Buffer::allocate(64, "cq", FillPattern::AllZero, 4096, Some(0x2000)).unwrap();
        let regs = Arc::new(crate::regs::RegisterWindow::new(crate::pcie::Pcie::fake_for_tests()));
        let qp = Arc::new(Mutex::new(QueuePair::new(
            1,
            4,
            sq,
            cq,
            regs,
            0,
            crate::queue::DoorbellPolicy::DeferredUntilWaitdone,
            None,
            Arc::new(crate::timeout::TimeoutTable::new()),
            None,
        )));
        let config = IoWorkerConfig { qdepth: 1, ..Default::default() };
        let err = IoWorker::new(qp, crc, geometry, 4096, config).unwrap_err();
        assert!(matches!(err, NvmeError::Assertion(_)));
    }

    #[test]
    fn record_percentiles_reads_back_bucket_for_all_equal_latencies() {
        let mut hist = vec![0u64; 1_000_000];
        hist[42] = 10;
        let sink = Arc::new(PlMutex::new(BTreeMap::new()));
        record_percentiles(&hist, 10, &[5000, 9900], &sink);
        let map = sink.lock();
        assert_eq!(*map.get(&5000).unwrap(), 42);
        assert_eq!(*map.get(&9900).unwrap(), 42);
    }
}
