//! # Externally-Owned Tunables
//!
//! Debug/behavior knobs owned by the embedding environment. The core
//! reads them but does not own their storage; an embedder typically wires
//! them to its own sysctl-style surface.

use core::sync::atomic::{AtomicBool, Ordering};

/// Runtime-adjustable knobs.
#[derive(Debug, Default)]
pub struct Tunables {
    /// Narrow context reload to the registers a context actually uses,
    /// instead of the full leak-safe superset.
    fast_switch: AtomicBool,
    /// Verbose protocol tracing.
    debug: AtomicBool,
}

impl Tunables {
    /// Tunables with every knob at its default (off).
    pub const fn new() -> Self {
        Self {
            fast_switch: AtomicBool::new(false),
            debug: AtomicBool::new(false),
        }
    }

    /// Is the fast context-switch mode enabled?
    #[inline]
    pub fn fast_switch(&self) -> bool {
        self.fast_switch.load(Ordering::Relaxed)
    }

    /// Enable or disable fast context switching.
    pub fn set_fast_switch(&self, enabled: bool) {
        self.fast_switch.store(enabled, Ordering::Relaxed);
    }

    /// Is verbose tracing enabled?
    #[inline]
    pub fn debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    /// Enable or disable verbose tracing.
    pub fn set_debug(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Relaxed);
    }
}
