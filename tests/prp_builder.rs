//! Integration tests for PRP/SGL data-pointer construction, driven entirely
//! through the crate's public surface with deterministic fake physical
//! addresses (no real hardware needed).

use rnvme::dma::{Buffer, FillPattern};
use rnvme::prp::{build_prp, build_sgl_data_block, SglDescriptor};

const PAGE: usize = 4096;

fn buffer_at(phys: u64, size: usize) -> Buffer {
    Buffer::allocate(size, "prp-test", FillPattern::AllZero, PAGE, Some(phys)).unwrap()
}

#[test]
fn single_page_transfer_needs_only_prp1() {
    let buf = buffer_at(0x1000, PAGE);
    let build = build_prp(&buf, 0, 512, PAGE).unwrap();
    assert_eq!(build.pair.prp1, 0x1000);
    assert_eq!(build.pair.prp2, 0);
    assert!(build.list_pages.is_empty());
}

#[test]
fn exactly_two_pages_uses_prp2_as_second_page_address() {
    let buf = buffer_at(0x2000, PAGE * 2);
    let build = build_prp(&buf, 0, PAGE * 2, PAGE).unwrap();
    assert_eq!(build.pair.prp1, 0x2000);
    assert_eq!(build.pair.prp2, 0x3000);
    assert!(build.list_pages.is_empty());
}

#[test]
fn unaligned_offset_still_fits_two_pages() {
    let buf = buffer_at(0x4000, PAGE * 2);
    // 100 bytes into the first page, spanning across the page boundary.
    let build = build_prp(&buf, 100, PAGE, PAGE).unwrap();
    assert_eq!(build.pair.prp1, 0x4064);
    assert_eq!(build.pair.prp2, 0x5000);
}

#[test]
fn many_page_transfer_chains_a_prp_list() {
    let buf = buffer_at(0x10_000, PAGE * 8);
    let build = build_prp(&buf, 0, PAGE * 8, PAGE).unwrap();
    assert_eq!(build.pair.prp1, 0x10_000);
    assert_ne!(build.pair.prp2, 0);
    assert!(!build.list_pages.is_empty());
}

#[test]
fn zero_length_transfer_is_rejected() {
    let buf = buffer_at(0x1000, PAGE);
    assert!(build_prp(&buf, 0, 0, PAGE).is_err());
}

#[test]
fn sgl_data_block_encodes_address_and_length() {
    let buf = buffer_at(0x9000, PAGE);
    let desc = build_sgl_data_block(&buf, 0, 4096);
    match desc {
        SglDescriptor::DataBlock { address, length } => {
            assert_eq!(address, 0x9000);
            assert_eq!(length, 4096);
        }
        other => panic!("expected DataBlock, got {other:?}"),
    }
}
