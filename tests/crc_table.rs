//! Integration tests for the LBA-keyed CRC table, driven entirely through
//! the crate's public surface.

use std::sync::Arc;
use std::thread;

use rnvme::CrcTable;

const LBA_SIZE: usize = 512;

#[test]
fn write_read_round_trip_across_many_lbas() {
    let table = CrcTable::new(LBA_SIZE);
    let data: Vec<u8> = (0..LBA_SIZE * 4).map(|i| (i % 256) as u8).collect();
    table.write(100, 4, &data).unwrap();
    assert!(table.compare(100, 4, &data).is_ok());

    let mut corrupted = data.clone();
    corrupted[0] ^= 0xFF;
    assert!(table.compare(100, 4, &corrupted).is_err());
}

#[test]
fn deallocate_then_zero_read_is_clean() {
    let table = CrcTable::new(LBA_SIZE);
    table.write(0, 1, &vec![0x42u8; LBA_SIZE]).unwrap();
    table.trim(0, 1);
    assert!(table.compare(0, 1, &vec![0u8; LBA_SIZE]).is_ok());
    assert!(table.compare(0, 1, &vec![1u8; LBA_SIZE]).is_err());
}

#[test]
fn format_clears_every_prior_expectation() {
    let table = CrcTable::new(LBA_SIZE);
    table.write(5, 1, &vec![0xAAu8; LBA_SIZE]).unwrap();
    table.clear_all();
    // An unwritten LBA compares clean against anything, even what used to
    // mismatch.
    assert!(table.compare(5, 1, &vec![0x00u8; LBA_SIZE]).is_ok());
}

#[test]
fn save_and_load_round_trips_through_a_file() {
    let table = CrcTable::new(LBA_SIZE);
    table.write(1, 1, &vec![0x11u8; LBA_SIZE]).unwrap();
    table.write_uncorrectable(2, 1);
    table.trim(3, 1);

    let path = std::env::temp_dir().join(format!("rnvme-crc-table-{}.csv", std::process::id()));
    table.save(&path).unwrap();

    let reloaded = CrcTable::new(LBA_SIZE);
    reloaded.load(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert!(reloaded.compare(1, 1, &vec![0x11u8; LBA_SIZE]).is_ok());
    assert!(reloaded.compare(2, 1, &vec![0u8; LBA_SIZE]).is_err());
    assert!(reloaded.compare(3, 1, &vec![0u8; LBA_SIZE]).is_ok());
}

#[test]
fn concurrent_writers_to_disjoint_ranges_never_corrupt_each_other() {
    let table = Arc::new(CrcTable::new(LBA_SIZE));
    let mut handles = Vec::new();
    for worker in 0..4u64 {
        let table = Arc::clone(&table);
        handles.push(thread::spawn(move || {
            let base = worker * 16;
            let data = vec![worker as u8; LBA_SIZE * 4];
            let _guard = table.lock_range(base, 4);
            table.write(base, 4, &data).unwrap();
            assert!(table.compare(base, 4, &data).is_ok());
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}
