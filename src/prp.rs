//! PRP and SGL construction (spec section 4.2, component C2).
//!
//! Translates a logical buffer + byte offset + length into the NVMe
//! `DPTR` field of a submission queue entry: either a `(prp1, prp2)` pair,
//! or (when requested) an SGL descriptor chain.

use crate::dma::{Buffer, FillPattern};
use crate::error::{NvmeError, Result};

/// The two DPTR qwords for the PRP path. `prp2` is 0 when unused.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PrpPair {
    pub prp1: u64,
    pub prp2: u64,
}

/// Any DMA buffers allocated as PRP list pages must be kept alive at least
/// as long as the command is in flight; the queue pair's per-slot command
/// record holds these.
pub struct PrpBuild {
    pub pair: PrpPair,
    pub list_pages: Vec<Buffer>,
}

/// Build the PRP1/PRP2 fields (and any PRP list pages) for a transfer of
/// `length` bytes starting at `byte_offset` within `buffer`, per spec
/// section 4.2's three cases.
pub fn build_prp(
    buffer: &Buffer,
    byte_offset: usize,
    length: usize,
    page_size: usize,
) -> Result<PrpBuild> {
    if length == 0 {
        return Err(NvmeError::Assertion("PRP transfer length must be > 0".into()));
    }
    let phys = buffer.phys_addr() + byte_offset as u64;
    let page_remainder = page_size as u64 - (phys % page_size as u64);

    if (length as u64) <= page_remainder {
        return Ok(PrpBuild {
            pair: PrpPair { prp1: phys, prp2: 0 },
            list_pages: Vec::new(),
        });
    }

    if (length as u64) <= page_remainder + page_size as u64 {
        let next_page = (phys - (phys % page_size as u64)) + page_size as u64;
        return Ok(PrpBuild {
            pair: PrpPair { prp1: phys, prp2: next_page },
            list_pages: Vec::new(),
        });
    }

    // More than two pages: PRP1 points at the data, PRP2 points at a PRP
    // list page containing subsequent page physical addresses, chaining to
    // further list pages every 511 entries (the last slot of a full list is
    // reserved for the chain pointer).
    let first_page_len = page_remainder;
    let remaining = (length as u64) - first_page_len;
    let mut page_addrs = Vec::new();
    let mut next = phys - (phys % page_size as u64) + page_size as u64;
    let mut left = remaining;
    while left > 0 {
        page_addrs.push(next);
        next += page_size as u64;
        left = left.saturating_sub(page_size as u64);
    }

    let (list_head_phys, list_pages) = build_prp_list_chain(&page_addrs, page_size)?;
    Ok(PrpBuild {
        pair: PrpPair { prp1: phys, prp2: list_head_phys },
        list_pages,
    })
}

/// Lay `addrs` out as consecutive PRP list pages, each holding up to 511
/// data-page addresses plus (if more remain) a chaining pointer in its last
/// slot to the next list page.
fn build_prp_list_chain(addrs: &[u64], page_size: usize) -> Result<(u64, Vec<Buffer>)> {
    const ENTRIES_PER_PAGE_WITH_CHAIN: usize = 511;
    let mut pages = Vec::new();
    let mut remaining = addrs;
    let mut next_page_phys: Option<u64> = None;

    // Build pages back-to-front so each page can embed the physical address
    // of the page that follows it.
    let mut chunks = Vec::new();
    while !remaining.is_empty() {
        let take = remaining.len().min(ENTRIES_PER_PAGE_WITH_CHAIN);
        let chain_needed = remaining.len() > ENTRIES_PER_PAGE_WITH_CHAIN;
        let take = if chain_needed { ENTRIES_PER_PAGE_WITH_CHAIN } else { take };
        chunks.push((&remaining[..take], chain_needed));
        remaining = &remaining[take..];
    }

    for (chunk, has_chain) in chunks.into_iter().rev() {
        let mut list = Buffer::allocate(
            page_size,
            "prp-list",
            FillPattern::AllZero,
            page_size,
            None,
        )?;
        for (i, addr) in chunk.iter().enumerate() {
            list.set_slice(Some((i * 8) as i64), &addr.to_le_bytes())?;
        }
        if has_chain {
            let next = next_page_phys.ok_or_else(|| {
                NvmeError::Assertion("PRP list chain build invariant violated".into())
            })?;
            list.set_slice(Some((ENTRIES_PER_PAGE_WITH_CHAIN * 8) as i64), &next.to_le_bytes())?;
        }
        next_page_phys = Some(list.phys_addr());
        pages.push(list);
    }
    pages.reverse();
    let head = next_page_phys
        .ok_or_else(|| NvmeError::Assertion("PRP list chain was empty".into()))?;
    Ok((head, pages))
}

/// One SGL descriptor. The NVMe base spec defines a 16-byte descriptor with
/// a type/sub-type nibble in the last byte; variants here mirror the four
/// kinds referenced by spec section 4.2.
#[derive(Clone, Debug)]
pub enum SglDescriptor {
    DataBlock { address: u64, length: u32 },
    BitBucket { length: u32 },
    Segment { address: u64, length: u32 },
    LastSegment { address: u64, length: u32 },
}

impl SglDescriptor {
    const TYPE_DATA_BLOCK: u8 = 0x0;
    const TYPE_BIT_BUCKET: u8 = 0x1;
    const TYPE_SEGMENT: u8 = 0x2;
    const TYPE_LAST_SEGMENT: u8 = 0x3;

    /// Encode this descriptor into its 16-byte wire representation.
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        let (addr, len, ty) = match *self {
            SglDescriptor::DataBlock { address, length } => (address, length, Self::TYPE_DATA_BLOCK),
            SglDescriptor::BitBucket { length } => (0, length, Self::TYPE_BIT_BUCKET),
            SglDescriptor::Segment { address, length } => (address, length, Self::TYPE_SEGMENT),
            SglDescriptor::LastSegment { address, length } => {
                (address, length, Self::TYPE_LAST_SEGMENT)
            }
        };
        out[0..8].copy_from_slice(&addr.to_le_bytes());
        out[8..12].copy_from_slice(&len.to_le_bytes());
        out[15] = ty << 4;
        out
    }
}

/// Build a single-descriptor SGL for a contiguous transfer. Multi-segment
/// SGL chains (used for scatter transfers across several buffers) are built
/// by the caller composing `Segment`/`LastSegment` descriptors that point at
/// further `Buffer`-backed descriptor arrays; this entry point covers the
/// common single-buffer case used by the namespace I/O builders and the I/O
/// worker's `sgl_percentage` path.
pub fn build_sgl_data_block(buffer: &Buffer, byte_offset: usize, length: u32) -> SglDescriptor {
    SglDescriptor::DataBlock {
        address: buffer.phys_addr() + byte_offset as u64,
        length,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::FillPattern;

    #[test]
    fn single_page_transfer_has_no_prp2() {
        let b = Buffer::allocate(4096, "t", FillPattern::AllZero, 4096, Some(0x10000)).unwrap();
        let built = build_prp(&b, 0, 4096, 4096).unwrap();
        assert_eq!(built.pair.prp1, 0x10000);
        assert_eq!(built.pair.prp2, 0);
        assert!(built.list_pages.is_empty());
    }

    #[test]
    fn two_page_transfer_uses_prp2_as_second_page() {
        let b = Buffer::allocate(8192, "t", FillPattern::AllZero, 4096, Some(0x20000)).unwrap();
        let built = build_prp(&b, 0, 8192, 4096).unwrap();
        assert_eq!(built.pair.prp1, 0x20000);
        assert_eq!(built.pair.prp2, 0x21000);
        assert!(built.list_pages.is_empty());
    }

    #[test]
    fn unaligned_offset_two_page_case() {
        // offset 0x800 into an aligned buffer leaves 0x800 bytes in the
        // first page; a 4096-byte transfer thus needs exactly a second page.
        let b = Buffer::allocate(3 * 4096, "t", FillPattern::AllZero, 4096, Some(0x30000)).unwrap();
        let built = build_prp(&b, 0x800, 4096, 4096).unwrap();
        assert_eq!(built.pair.prp1, 0x30800);
        assert_eq!(built.pair.prp2, 0x31000);
    }

    #[test]
    fn many_page_transfer_builds_prp_list() {
        let b = Buffer::allocate(16 * 4096, "t", FillPattern::AllZero, 4096, Some(0x40000)).unwrap();
        let built = build_prp(&b, 0, 16 * 4096, 4096).unwrap();
        assert_eq!(built.pair.prp1, 0x40000);
        assert_eq!(built.list_pages.len(), 1);
        assert_eq!(built.pair.prp2, built.list_pages[0].phys_addr());
    }

    #[test]
    fn sgl_data_block_roundtrips_address_and_length() {
        let b = Buffer::allocate(4096, "t", FillPattern::AllZero, 4096, Some(0x50000)).unwrap();
        let d = build_sgl_data_block(&b, 16, 512);
        let enc = d.encode();
        let addr = u64::from_le_bytes(enc[0..8].try_into().unwrap());
        let len = u32::from_le_bytes(enc[8..12].try_into().unwrap());
        assert_eq!(addr, 0x50010);
        assert_eq!(len, 512);
        assert_eq!(enc[15] >> 4, 0x0);
    }
}
