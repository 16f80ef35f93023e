//! Pinned, page-aligned DMA memory (spec section 4.1, component C1).
//!
//! A `Buffer` is a userspace analogue of a kernel driver's physical
//! allocation: instead of a bare physical address handed out by a kernel
//! allocator, userspace locks an anonymous mapping with `mlock` and resolves
//! its physical address by walking `/proc/self/pagemap`, the standard
//! technique used by kernel-bypass userspace NVMe drivers.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;

use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_queue::ArrayQueue;
use rand::{Rng, SeedableRng};
use rand_hc::Hc128Rng;

use crate::error::{NvmeError, Result};

const PAGE_SIZE: usize = 4096;

static NEXT_STAMP_TOKEN: AtomicU32 = AtomicU32::new(1);

/// Hand out a fresh value for `Buffer::stamp_lbas`'s `token` argument: every
/// call across the process gets a distinct, increasing value.
pub fn next_stamp_token() -> u32 {
    NEXT_STAMP_TOKEN.fetch_add(1, Ordering::Relaxed)
}

/// How a buffer's contents should be initialized at allocation time
/// (spec section 4.1).
#[derive(Clone, Debug)]
pub enum FillPattern {
    AllZero,
    AllOne,
    /// Repeat this 32-bit value across the buffer.
    Repeated(u32),
    /// Pseudo-random bytes with the given compressibility, 0-100: 100 means
    /// "fully compressible" (all-zero runs), 0 means fully random.
    Random { seed: u64, compressibility_pct: u8 },
    /// Bytes loaded verbatim from a file, truncated or zero-padded to size.
    File(std::path::PathBuf),
    /// Bytes 0,1 form a little-endian u16 that increases by one every two
    /// bytes across the buffer.
    Increasing16,
    Decreasing16,
}

/// A pinned, physically-contiguous, page-aligned region of memory with a
/// stable physical address, a byte offset, and a human-readable tag.
///
/// Invariants (spec section 3): physical base is page-aligned; size is at
/// least 1 byte; offset < size.
pub struct Buffer {
    virt: NonNull<u8>,
    phys_base: u64,
    size: usize,
    offset: usize,
    tag: String,
    /// Set when the physical base was supplied by the caller (tests, or a
    /// fake register window) rather than resolved via pagemap.
    fake_phys: bool,
}

unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Allocate `size` bytes aligned to `alignment` (must be a power of two,
    /// default 4096), fill them per `pattern`, and tag the allocation with
    /// `tag` for diagnostics.
    pub fn allocate(
        size: usize,
        tag: impl Into<String>,
        pattern: FillPattern,
        alignment: usize,
        fake_phys_addr: Option<u64>,
    ) -> Result<Self> {
        if size == 0 {
            return Err(NvmeError::Assertion("buffer size must be >= 1 byte".into()));
        }
        if !alignment.is_power_of_two() {
            return Err(NvmeError::Assertion(format!(
                "alignment {alignment} is not a power of two"
            )));
        }
        let mapped_len = size.next_multiple_of(alignment.max(PAGE_SIZE));
        let virt = map_anonymous(mapped_len)?;
        let phys_base = match fake_phys_addr {
            Some(a) => a,
            None => resolve_physical_address(virt)?,
        };
        let mut buf = Buffer {
            virt,
            phys_base,
            size: mapped_len,
            offset: 0,
            tag: tag.into(),
            fake_phys: fake_phys_addr.is_some(),
        };
        buf.fill(pattern)?;
        buf.size = size;
        Ok(buf)
    }

    /// Re-initialize the buffer's contents in place, e.g. between successive
    /// writes issued by an [`crate::ioworker::IoWorker`] against a pooled
    /// buffer that already holds a previous command's data.
    pub fn refill(&mut self, pattern: FillPattern) -> Result<()> {
        self.fill(pattern)
    }

    fn fill(&mut self, pattern: FillPattern) -> Result<()> {
        let slice = unsafe { std::slice::from_raw_parts_mut(self.virt.as_ptr(), self.size) };
        match pattern {
            FillPattern::AllZero => slice.fill(0),
            FillPattern::AllOne => slice.fill(0xFF),
            FillPattern::Repeated(v) => {
                for chunk in slice.chunks_mut(4) {
                    let bytes = v.to_le_bytes();
                    chunk.copy_from_slice(&bytes[..chunk.len()]);
                }
            }
            FillPattern::Random { seed, compressibility_pct } => {
                let mut rng = Hc128Rng::seed_from_u64(seed);
                let pct = compressibility_pct.min(100) as u32;
                for byte in slice.iter_mut() {
                    *byte = if rng.gen_range(0..100) < pct { 0 } else { rng.gen() };
                }
            }
            FillPattern::File(path) => fill_from_file(slice, &path)?,
            FillPattern::Increasing16 => fill_step16(slice, 1),
            FillPattern::Decreasing16 => fill_step16(slice, -1),
        }
        Ok(())
    }

    /// Physical address of `offset` within this buffer (physical base plus
    /// the current byte offset).
    pub fn phys_addr(&self) -> u64 {
        self.phys_base + self.offset as u64
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn set_offset(&mut self, offset: usize) -> Result<()> {
        if offset >= self.size {
            return Err(NvmeError::Assertion(format!(
                "offset {offset} out of range for buffer of size {}",
                self.size
            )));
        }
        self.offset = offset;
        Ok(())
    }

    #[inline]
    fn check_bounds(&self, index: usize) -> Result<()> {
        if index >= self.size {
            return Err(NvmeError::Assertion(format!(
                "index {index} out of range for buffer '{}' of size {}",
                self.tag, self.size
            )));
        }
        Ok(())
    }

    pub fn get_byte(&self, index: usize) -> Result<u8> {
        self.check_bounds(index)?;
        Ok(unsafe { *self.virt.as_ptr().add(index) })
    }

    pub fn set_byte(&mut self, index: usize, value: u8) -> Result<()> {
        self.check_bounds(index)?;
        unsafe { *self.virt.as_ptr().add(index) = value };
        Ok(())
    }

    /// Half-open byte range `[start, end)`. `None`/negative-as-from-end
    /// endpoints behave like Python slices: `None` for `end` means "to the
    /// end of the buffer", a negative value counts from the end.
    fn resolve_range(&self, start: Option<i64>, end: Option<i64>) -> Result<(usize, usize)> {
        let len = self.size as i64;
        let norm = |v: i64| -> i64 { if v < 0 { (len + v).max(0) } else { v } };
        let s = norm(start.unwrap_or(0)).min(len) as usize;
        let e = norm(end.unwrap_or(len)).min(len) as usize;
        if s > e {
            return Err(NvmeError::Assertion(format!(
                "invalid slice range [{s}, {e}) for buffer of size {len}"
            )));
        }
        Ok((s, e))
    }

    pub fn get_slice(&self, start: Option<i64>, end: Option<i64>) -> Result<&[u8]> {
        let (s, e) = self.resolve_range(start, end)?;
        Ok(unsafe { std::slice::from_raw_parts(self.virt.as_ptr().add(s), e - s) })
    }

    pub fn set_slice(&mut self, start: Option<i64>, data: &[u8]) -> Result<()> {
        let (s, e) = self.resolve_range(start, Some(start.unwrap_or(0) + data.len() as i64))?;
        if e - s != data.len() {
            return Err(NvmeError::Assertion(
                "slice write length mismatch".to_string(),
            ));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.virt.as_ptr().add(s), data.len())
        };
        Ok(())
    }

    /// Decode an inclusive little-endian field `[lo, hi]` (byte indices,
    /// inclusive on both ends) as the requested width.
    pub fn data(&self, hi: usize, lo: usize) -> Result<u64> {
        if hi < lo {
            return Err(NvmeError::Assertion("hi must be >= lo".into()));
        }
        let width = hi - lo + 1;
        if width > 8 {
            return Err(NvmeError::Assertion("data() field wider than 8 bytes".into()));
        }
        let mut out = [0u8; 8];
        let bytes = self.get_slice(Some(lo as i64), Some((hi + 1) as i64))?;
        out[..bytes.len()].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(out))
    }

    /// Write a 16-byte Dataset Management range descriptor at `index * 16`:
    /// {context attributes u32 (bytes 0-3), length u32 (bytes 4-7), starting
    /// LBA u64 (bytes 8-15)} per the NVMe base spec's DSM range layout.
    pub fn set_dsm_range(&mut self, index: usize, lba: u64, count: u32, attr: u32) -> Result<()> {
        let off = index * 16;
        let mut rec = [0u8; 16];
        rec[0..4].copy_from_slice(&attr.to_le_bytes());
        rec[4..8].copy_from_slice(&count.to_le_bytes());
        rec[8..16].copy_from_slice(&lba.to_le_bytes());
        self.set_slice(Some(off as i64), &rec)
    }

    /// Write a 32-byte Copy command source-range descriptor at `index * 32`.
    pub fn set_copy_range(&mut self, index: usize, slba: u64, nlb: u16) -> Result<()> {
        let off = index * 32;
        let mut rec = [0u8; 32];
        rec[8..16].copy_from_slice(&slba.to_le_bytes());
        rec[16..18].copy_from_slice(&nlb.to_le_bytes());
        self.set_slice(Some(off as i64), &rec)
    }

    /// Write a 4-byte controller id into a Namespace Attachment / Namespace
    /// Management controller list at `index * 2` (list entries are u16).
    pub fn set_controller_list(&mut self, controller_ids: &[u16]) -> Result<()> {
        let mut rec = vec![0u8; 2 + controller_ids.len() * 2];
        rec[0..2].copy_from_slice(&(controller_ids.len() as u16).to_le_bytes());
        for (i, cid) in controller_ids.iter().enumerate() {
            let off = 2 + i * 2;
            rec[off..off + 2].copy_from_slice(&cid.to_le_bytes());
        }
        self.set_slice(Some(0), &rec)
    }

    /// CRC-8/SMBus over the whole buffer; used by tests that need a cheap
    /// content fingerprint without pulling in the LBA-keyed CRC table.
    pub fn crc8(&self) -> u8 {
        let mut crc: u8 = 0;
        let slice = unsafe { std::slice::from_raw_parts(self.virt.as_ptr(), self.size) };
        for &byte in slice {
            crc ^= byte;
            for _ in 0..8 {
                crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x07 } else { crc << 1 };
            }
        }
        crc
    }

    /// Count of differing bytes between `self` and `other` up to the
    /// shorter buffer's length.
    pub fn distance(&self, other: &Buffer) -> usize {
        let a = unsafe { std::slice::from_raw_parts(self.virt.as_ptr(), self.size) };
        let b = unsafe { std::slice::from_raw_parts(other.virt.as_ptr(), other.size) };
        a.iter().zip(b.iter()).filter(|(x, y)| x != y).count()
    }

    /// Overwrite the first 4 bytes of each `lba_size`-byte sector with its
    /// LBA number and bytes 504..508 with a monotonically increasing token,
    /// so a test can detect stale or reordered data on round-trip (spec
    /// section 4.1).
    pub fn stamp_lbas(&mut self, starting_lba: u64, lba_size: usize, token: u32) -> Result<()> {
        let sectors = self.size / lba_size;
        for i in 0..sectors {
            let base = i * lba_size;
            let lba = starting_lba + i as u64;
            self.set_slice(Some(base as i64), &(lba as u32).to_le_bytes())?;
            if lba_size >= 508 {
                self.set_slice(Some((base + 504) as i64), &token.to_le_bytes())?;
            }
        }
        Ok(())
    }

    /// Write the buffer's bytes to `path`, used by `fw_debug` to capture
    /// the in-flight buffer contents when a worker skips teardown on error.
    pub fn dump(&self, path: impl AsRef<Path>) -> Result<()> {
        let slice = unsafe { std::slice::from_raw_parts(self.virt.as_ptr(), self.size) };
        let mut f = File::create(path)?;
        f.write_all(slice)?;
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::munlock(self.virt.as_ptr() as *const libc::c_void, self.size);
            let _ = libc::munmap(self.virt.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

/// A worker's fixed ring of DMA buffers, pre-allocated once at startup
/// instead of per-command (SPEC_FULL.md §2, C1: "running out of buffers
/// fails worker startup with error code -5", spec section 5).
///
/// Backed by `crossbeam_queue::ArrayQueue`, the same lock-free queue the
/// teacher's CQE staging path already depends on `crossbeam-queue` for, so
/// a worker can hand a buffer to one in-flight command and get it back from
/// another thread's completion callback without a blocking mutex on the hot
/// path.
pub struct BufferPool {
    free: ArrayQueue<Buffer>,
    capacity: usize,
    buf_size: usize,
}

impl BufferPool {
    /// Allocate `count` buffers of `buf_size` bytes each, tagged
    /// `"{tag_prefix}-{i}"`. Fails the whole pool (spec section 5, error
    /// code -5) if any single allocation fails.
    pub fn new(count: usize, buf_size: usize, tag_prefix: &str) -> Result<Self> {
        if count == 0 {
            return Err(NvmeError::Assertion("buffer pool size must be >= 1".into()));
        }
        let free = ArrayQueue::new(count);
        for i in 0..count {
            let buf = Buffer::allocate(buf_size, format!("{tag_prefix}-{i}"), FillPattern::AllZero, 4096, None)?;
            // count entries never exceed the queue's declared capacity.
            debug_assert!(free.push(buf).is_ok());
        }
        Ok(BufferPool { free, capacity: count, buf_size })
    }

    /// Take exclusive ownership of one buffer, or `None` if the pool is
    /// fully checked out (the caller's qdepth bound should make this rare;
    /// callers retry or throttle rather than treat it as fatal).
    pub fn acquire(&self) -> Option<Buffer> {
        self.free.pop()
    }

    /// Return a buffer to the pool once no command references it anymore.
    pub fn release(&self, buf: Buffer) {
        let _ = self.free.push(buf);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }
}

#[cfg(test)]
mod pool_tests {
    use super::*;

    #[test]
    fn acquire_then_release_round_trips() {
        let pool = BufferPool::new(2, 512, "pool-test").unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        pool.release(a);
        assert!(pool.acquire().is_some());
        pool.release(b);
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        assert!(BufferPool::new(0, 512, "empty").is_err());
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("tag", &self.tag)
            .field("size", &self.size)
            .field("phys_addr", &format_args!("{:#x}", self.phys_addr()))
            .field("offset", &self.offset)
            .field("fake_phys", &self.fake_phys)
            .finish()
    }
}

fn map_anonymous(len: usize) -> Result<NonNull<u8>> {
    use nix::sys::mman::{mmap_anonymous, MapFlags, ProtFlags};
    let mapping = unsafe {
        mmap_anonymous(
            None,
            std::num::NonZeroUsize::new(len).unwrap(),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE,
        )
    }
    .map_err(|e| NvmeError::Other(format!("mmap failed: {e}")))?;
    unsafe {
        let _ = libc::mlock(mapping.as_ptr() as *const libc::c_void, len);
    }
    Ok(mapping.cast())
}

/// Resolve the physical address backing a virtual page by reading its PFN
/// from `/proc/self/pagemap`. This is the standard userspace technique for
/// DPDK/SPDK-style kernel-bypass drivers.
fn resolve_physical_address(virt: NonNull<u8>) -> Result<u64> {
    let vaddr = virt.as_ptr() as usize;
    let page_idx = vaddr / PAGE_SIZE;
    let mut f = OpenOptions::new().read(true).open("/proc/self/pagemap")?;
    f.seek(SeekFrom::Start((page_idx * 8) as u64))?;
    let mut entry = [0u8; 8];
    f.read_exact(&mut entry)?;
    let raw = u64::from_le_bytes(entry);
    if raw & (1 << 63) == 0 {
        return Err(NvmeError::Other(
            "page not present; cannot resolve physical address".into(),
        ));
    }
    let pfn = raw & 0x007F_FFFF_FFFF_FFFF;
    let page_offset = vaddr % PAGE_SIZE;
    Ok(pfn * PAGE_SIZE as u64 + page_offset as u64)
}

fn fill_from_file(slice: &mut [u8], path: &Path) -> Result<()> {
    let mut f = File::open(path)?;
    let n = f.read(slice)?;
    if n < slice.len() {
        slice[n..].fill(0);
    }
    Ok(())
}

fn fill_step16(slice: &mut [u8], step: i32) {
    let mut v: u16 = 0;
    for chunk in slice.chunks_mut(2) {
        let bytes = v.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
        v = v.wrapping_add(step as u16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_zero_size_rejected() {
        assert!(Buffer::allocate(0, "x", FillPattern::AllZero, 4096, Some(0x1000)).is_err());
    }

    #[test]
    fn alloc_and_roundtrip_slice() {
        let mut b = Buffer::allocate(512, "t", FillPattern::AllZero, 4096, Some(0x2000)).unwrap();
        assert_eq!(b.phys_addr(), 0x2000);
        b.set_slice(Some(10), b"hello world").unwrap();
        assert_eq!(b.get_slice(Some(10), Some(21)).unwrap(), b"hello world");
    }

    #[test]
    fn negative_indices_are_from_end() {
        let b = Buffer::allocate(16, "t", FillPattern::Repeated(0xAABBCCDD), 4096, Some(0x3000))
            .unwrap();
        let whole = b.get_slice(None, None).unwrap();
        let tail = b.get_slice(Some(-4), None).unwrap();
        assert_eq!(tail, &whole[12..]);
    }

    #[test]
    fn dsm_range_layout() {
        let mut b = Buffer::allocate(64, "dsm", FillPattern::AllZero, 4096, Some(0x4000)).unwrap();
        b.set_dsm_range(1, 42, 8, 0).unwrap();
        // record 1 starts at byte 16; lba occupies bytes 8..16 of the
        // record, i.e. absolute bytes 24..32.
        assert_eq!(b.data(31, 24).unwrap(), 42);
        assert_eq!(b.data(27, 24).unwrap(), 42);
        assert_eq!(b.data(23, 20).unwrap(), 8); // length field
    }

    #[test]
    fn stamp_lbas_writes_lba_and_token() {
        let mut b = Buffer::allocate(1024, "io", FillPattern::AllOne, 4096, Some(0x5000)).unwrap();
        b.stamp_lbas(7, 512, 99).unwrap();
        assert_eq!(b.data(3, 0).unwrap(), 7);
        assert_eq!(b.data(511, 508).unwrap(), 99);
        assert_eq!(b.data(515, 512).unwrap(), 8);
    }

    #[test]
    fn out_of_range_index_is_bounds_fault() {
        let b = Buffer::allocate(4, "t", FillPattern::AllZero, 4096, Some(0x6000)).unwrap();
        assert!(b.get_byte(4).is_err());
    }
}
