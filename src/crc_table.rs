//! Per-namespace data-integrity tracking (spec section 4.7, component C7).
//!
//! Maps every LBA to a 32-bit CRC token of the last data written there, so a
//! subsequent read can be verified against what the test actually wrote
//! instead of trusting the device unconditionally. Grounded on the
//! `crc32fast` crate (IEEE CRC-32, hardware accelerated) rather than the
//! teacher's bespoke CRC-8, since whole-LBA integrity checking over
//! potentially gigabyte-sized namespaces needs a fast, well-tested
//! implementation.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::ops::Range;
use std::path::Path;
use std::sync::RwLock;

use crc32fast::Hasher;

use crate::error::{NvmeError, Result};

/// Sentinel token for an LBA that was written with the Write Uncorrectable
/// command: any subsequent read of it is expected to fail at the device
/// level, so no CRC is stored.
pub const UNCORRECTABLE_TOKEN: u32 = u32::MAX;

/// Sentinel token for an LBA that has never been written, or that was
/// deallocated (Dataset Management / Write Zeroes): the device is expected
/// to return all-zero data, which hashes to this constant for a given
/// `lba_size` only by coincidence, so deallocated LBAs are tracked
/// out-of-band via [`State::Deallocated`] rather than compared against a
/// fixed CRC.
const DEALLOCATED_TOKEN: u32 = 0;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Unwritten,
    Written(u32),
    Deallocated,
    Uncorrectable,
}

/// Tracks the expected contents of every LBA in a namespace by CRC, with
/// range locking so a worker cannot read an LBA range that another worker
/// is concurrently overwriting (spec section 4.7, "reads and writes each
/// hold a range lock for their LBA span for the duration of the operation").
pub struct CrcTable {
    lba_size: usize,
    tokens: RwLock<HashMap<u64, State>>,
    locked_ranges: RwLock<Vec<Range<u64>>>,
}

impl CrcTable {
    pub fn new(lba_size: usize) -> Self {
        CrcTable {
            lba_size,
            tokens: RwLock::new(HashMap::new()),
            locked_ranges: RwLock::new(Vec::new()),
        }
    }

    pub fn lba_size(&self) -> usize {
        self.lba_size
    }

    fn range_overlaps_locked(&self, range: &Range<u64>) -> bool {
        self.locked_ranges
            .read()
            .unwrap()
            .iter()
            .any(|r| r.start < range.end && range.start < r.end)
    }

    /// Acquire an exclusive lock over `[lba, lba+count)`, blocking (via a
    /// brief spin/yield loop) until any overlapping range already held is
    /// released. Returns a guard that releases the lock on drop.
    pub fn lock_range(&self, lba: u64, count: u32) -> RangeLock<'_> {
        let range = lba..(lba + count as u64);
        loop {
            {
                let mut locked = self.locked_ranges.write().unwrap();
                if !locked.iter().any(|r| r.start < range.end && range.start < r.end) {
                    locked.push(range.clone());
                    break;
                }
            }
            std::thread::yield_now();
        }
        RangeLock { table: self, range }
    }

    fn release_range(&self, range: &Range<u64>) {
        let mut locked = self.locked_ranges.write().unwrap();
        if let Some(pos) = locked.iter().position(|r| r == range) {
            locked.remove(pos);
        }
    }

    /// Record that `count` LBAs starting at `lba` were just written with
    /// `data` (exactly `count * lba_size` bytes): one CRC token per LBA,
    /// overwriting whatever was stored before ("last-written-wins").
    pub fn write(&self, lba: u64, count: u32, data: &[u8]) -> Result<()> {
        self.check_len(count, data.len())?;
        let mut tokens = self.tokens.write().unwrap();
        for i in 0..count as u64 {
            let chunk = &data[(i as usize) * self.lba_size..(i as usize + 1) * self.lba_size];
            let token = crc_of(lba + i, chunk);
            tokens.insert(lba + i, State::Written(token));
        }
        Ok(())
    }

    /// Record `write_uncorrectable`: the LBA's device-level contents become
    /// permanently unreadable until the next write.
    pub fn write_uncorrectable(&self, lba: u64, count: u32) {
        let mut tokens = self.tokens.write().unwrap();
        for i in 0..count as u64 {
            tokens.insert(lba + i, State::Uncorrectable);
        }
    }

    /// Record a Dataset Management deallocate or Write Zeroes over
    /// `[lba, lba+count)`: subsequent reads are expected to return all-zero
    /// data ("deallocate returns zero").
    pub fn trim(&self, lba: u64, count: u32) {
        let mut tokens = self.tokens.write().unwrap();
        for i in 0..count as u64 {
            tokens.insert(lba + i, State::Deallocated);
        }
    }

    /// Mark LBAs as having no tracked expectation (used when a namespace is
    /// reformatted and prior CRC state would otherwise cause spurious
    /// mismatches).
    pub fn mark_nomapping(&self, lba: u64, count: u32) {
        let mut tokens = self.tokens.write().unwrap();
        for i in 0..count as u64 {
            tokens.remove(&(lba + i));
        }
    }

    /// Drop every tracked token, used after a Format NVM command succeeds:
    /// the device's entire LBA space reverts to an unwritten state and any
    /// prior expectation would be stale (spec section 4.6, `format`).
    pub fn clear_all(&self) {
        self.tokens.write().unwrap().clear();
    }

    /// Verify `data` (read back from the device) against the recorded
    /// expectation for `[lba, lba+count)`. Returns the first mismatching LBA
    /// and its expected/actual tokens, if any.
    pub fn compare(&self, lba: u64, count: u32, data: &[u8]) -> Result<()> {
        self.check_len(count, data.len())?;
        let tokens = self.tokens.read().unwrap();
        for i in 0..count as u64 {
            let chunk = &data[(i as usize) * self.lba_size..(i as usize + 1) * self.lba_size];
            let this_lba = lba + i;
            let actual = crc_of(this_lba, chunk);
            match tokens.get(&this_lba).copied().unwrap_or(State::Unwritten) {
                State::Unwritten => {} // nothing to compare against yet
                State::Deallocated => {
                    if chunk.iter().any(|&b| b != 0) {
                        return Err(NvmeError::VerificationMismatch {
                            lba: this_lba,
                            expected: DEALLOCATED_TOKEN,
                            actual,
                        });
                    }
                }
                State::Uncorrectable => {
                    return Err(NvmeError::VerificationMismatch {
                        lba: this_lba,
                        expected: UNCORRECTABLE_TOKEN,
                        actual,
                    })
                }
                State::Written(expected) => {
                    if expected != actual {
                        return Err(NvmeError::VerificationMismatch {
                            lba: this_lba,
                            expected,
                            actual,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn check_len(&self, count: u32, len: usize) -> Result<()> {
        if len != count as usize * self.lba_size {
            return Err(NvmeError::Assertion(format!(
                "expected {} bytes for {count} LBAs of size {}, got {len}",
                count as usize * self.lba_size,
                self.lba_size
            )));
        }
        Ok(())
    }

    /// Persist the table to `path` as newline-delimited `lba,state,token`
    /// records, for a test harness to diff across driver restarts.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let tokens = self.tokens.read().unwrap();
        let mut out = String::new();
        for (lba, state) in tokens.iter() {
            let (tag, token) = match state {
                State::Unwritten => continue,
                State::Written(t) => ("w", *t),
                State::Deallocated => ("d", DEALLOCATED_TOKEN),
                State::Uncorrectable => ("u", UNCORRECTABLE_TOKEN),
            };
            out.push_str(&format!("{lba},{tag},{token}\n"));
        }
        std::fs::File::create(path)?.write_all(out.as_bytes())?;
        Ok(())
    }

    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut contents = String::new();
        std::fs::File::open(path)?.read_to_string(&mut contents)?;
        let mut tokens = self.tokens.write().unwrap();
        tokens.clear();
        for line in contents.lines() {
            let mut parts = line.splitn(3, ',');
            let lba: u64 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| NvmeError::Other("malformed crc table record".into()))?;
            let tag = parts.next().unwrap_or("w");
            let token: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let state = match tag {
                "d" => State::Deallocated,
                "u" => State::Uncorrectable,
                _ => State::Written(token),
            };
            tokens.insert(lba, state);
        }
        Ok(())
    }
}

/// RAII guard releasing a range lock acquired via [`CrcTable::lock_range`].
pub struct RangeLock<'a> {
    table: &'a CrcTable,
    range: Range<u64>,
}

impl Drop for RangeLock<'_> {
    fn drop(&mut self) {
        self.table.release_range(&self.range);
    }
}

/// CRC of one LBA's contents, with the LBA itself mixed into the digest so
/// two LBAs holding identical bytes never collide on the same token (spec
/// section 3's `crc32(P, L)`/section 4.7's `mix(lba+i, buffer_sector_i)`).
fn crc_of(lba: u64, chunk: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&lba.to_le_bytes());
    hasher.update(chunk);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritten_lba_compares_clean_against_anything() {
        let t = CrcTable::new(512);
        let data = vec![0xAAu8; 512];
        assert!(t.compare(0, 1, &data).is_ok());
    }

    #[test]
    fn write_then_compare_matching_data_succeeds() {
        let t = CrcTable::new(512);
        let data = vec![0x5Au8; 512];
        t.write(10, 1, &data).unwrap();
        assert!(t.compare(10, 1, &data).is_ok());
    }

    #[test]
    fn write_then_compare_different_data_fails() {
        let t = CrcTable::new(512);
        t.write(10, 1, &vec![0x5Au8; 512]).unwrap();
        let err = t.compare(10, 1, &vec![0x00u8; 512]).unwrap_err();
        assert!(matches!(err, NvmeError::VerificationMismatch { lba: 10, .. }));
    }

    #[test]
    fn trim_then_compare_nonzero_data_fails() {
        let t = CrcTable::new(512);
        t.write(5, 1, &vec![0x11u8; 512]).unwrap();
        t.trim(5, 1);
        assert!(t.compare(5, 1, &vec![0u8; 512]).is_ok());
        assert!(t.compare(5, 1, &vec![1u8; 512]).is_err());
    }

    #[test]
    fn uncorrectable_lba_always_mismatches() {
        let t = CrcTable::new(512);
        t.write_uncorrectable(3, 1);
        assert!(t.compare(3, 1, &vec![0u8; 512]).is_err());
    }

    #[test]
    fn overlapping_range_locks_block_until_released() {
        let t = CrcTable::new(512);
        let guard = t.lock_range(0, 4);
        assert!(t.range_overlaps_locked(&(2..3)));
        drop(guard);
        assert!(!t.range_overlaps_locked(&(2..3)));
    }
}
