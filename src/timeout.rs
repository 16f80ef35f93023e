//! Per-opcode timeout table (spec section 3, `Controller` data model).

use std::collections::HashMap;
use std::sync::RwLock;

/// Default per-command deadline, in milliseconds (spec section 4.4).
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// The process-wide watchdog deadline for a `waitdone` call that never
/// returns (spec section 7, kind 3: surfaced as [`crate::error::NvmeError::DriverWatchdogTimeout`]).
pub const DRIVER_WATCHDOG_MS: u64 = 30_000;

/// Maps an opcode (admin or NVM, disambiguated by the caller) to its
/// deadline, falling back to [`DEFAULT_TIMEOUT_MS`].
#[derive(Debug)]
pub struct TimeoutTable {
    overrides: RwLock<HashMap<u8, u64>>,
    default_ms: RwLock<u64>,
}

impl Default for TimeoutTable {
    fn default() -> Self {
        TimeoutTable {
            overrides: RwLock::new(HashMap::new()),
            default_ms: RwLock::new(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl TimeoutTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_default(&self, ms: u64) {
        *self.default_ms.write().unwrap() = ms;
    }

    pub fn default_ms(&self) -> u64 {
        *self.default_ms.read().unwrap()
    }

    pub fn set_opcode_override(&self, opcode: u8, ms: u64) {
        self.overrides.write().unwrap().insert(opcode, ms);
    }

    pub fn timeout_for(&self, opcode: u8) -> u64 {
        self.overrides
            .read()
            .unwrap()
            .get(&opcode)
            .copied()
            .unwrap_or_else(|| self.default_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_default() {
        let t = TimeoutTable::new();
        assert_eq!(t.timeout_for(0x02), DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn opcode_override_takes_precedence() {
        let t = TimeoutTable::new();
        t.set_opcode_override(0x80, 60_000);
        assert_eq!(t.timeout_for(0x80), 60_000);
        assert_eq!(t.timeout_for(0x02), DEFAULT_TIMEOUT_MS);
    }
}
