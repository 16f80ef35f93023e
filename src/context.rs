//! Process-wide driver context (spec section 4.9, component C9).
//!
//! A kernel driver keeps its kernel-global state behind
//! `lazy_static`/`spin::Once` because a kernel only ever has one address
//! space. A userspace test driver is a normal process, so the same "exactly
//! one, lazily built, globally reachable" shape is expressed with
//! `once_cell::sync::OnceCell` instead: one [`Context`] per process, holding
//! the live-controller registry the supervisor thread watches, the default
//! timeout table every queue pair inherits from, and the `srand` seeding
//! entry point (spec section 9) every `Hc128Rng` in the crate is ultimately
//! derived from.

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::rng;
use crate::supervisor::Registry;
use crate::timeout::TimeoutTable;

/// Shared, process-wide driver state.
pub struct Context {
    registry: Arc<Registry>,
    timeouts: Arc<TimeoutTable>,
}

static GLOBAL: OnceCell<Context> = OnceCell::new();

impl Context {
    fn new() -> Self {
        Context {
            registry: Arc::new(Registry::new()),
            timeouts: Arc::new(TimeoutTable::new()),
        }
    }

    /// The single process-wide context, built on first access.
    pub fn global() -> &'static Context {
        GLOBAL.get_or_init(Context::new)
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn timeouts(&self) -> Arc<TimeoutTable> {
        Arc::clone(&self.timeouts)
    }

    /// Seed the process-wide RNG (spec section 9, `srand`). The only
    /// supported seeding mechanism: every `Hc128Rng` the driver constructs
    /// derives from this seed via [`rng::child_rng`].
    pub fn srand(&self, seed: u64) {
        rng::srand(seed);
    }

    pub fn current_seed(&self) -> u64 {
        rng::current_seed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_context_is_a_singleton() {
        let a = Context::global() as *const Context;
        let b = Context::global() as *const Context;
        assert_eq!(a, b);
    }
}
