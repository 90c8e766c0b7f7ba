//! # Cross-CPU Signaling Primitives
//!
//! The lazy-switch protocol publishes two per-context conditions to other
//! CPUs: "the interrupt handler is using this context" and "a save is in
//! progress". The flags themselves are an atomic word (they are polled and
//! flipped from CPUs other than the one that set them); a condvar parks
//! waiters instead of letting them spin.
//!
//! The blocking-notification semaphore lives here too: a monitored task
//! acquires it on the way back to user level, an explicit restart or a
//! signal-style interruption releases it.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

// =============================================================================
// Protocol Flags
// =============================================================================

/// The overflow handler is currently using the context.
pub const FLAG_BUSY: u32 = 1 << 0;

/// A save of the context's live registers is in progress.
pub const FLAG_SAVING: u32 = 1 << 1;

/// Atomic condition flags with blocking waiters.
#[derive(Debug, Default)]
pub struct SyncFlags {
    bits: AtomicU32,
    gate: Mutex<()>,
    cond: Condvar,
}

impl SyncFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `flag`. Must only be done by the party that owns the
    /// corresponding protocol step.
    pub fn raise(&self, flag: u32) {
        self.bits.fetch_or(flag, Ordering::AcqRel);
    }

    /// Try to raise `flag`; fails if it was already raised.
    pub fn try_raise(&self, flag: u32) -> bool {
        self.bits.fetch_or(flag, Ordering::AcqRel) & flag == 0
    }

    /// Lower `flag` and wake every waiter.
    pub fn lower(&self, flag: u32) {
        self.bits.fetch_and(!flag, Ordering::AcqRel);
        let _gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        self.cond.notify_all();
    }

    /// Is `flag` currently raised?
    pub fn is_raised(&self, flag: u32) -> bool {
        self.bits.load(Ordering::Acquire) & flag != 0
    }

    /// Block until `flag` is lowered.
    pub fn wait_lowered(&self, flag: u32) {
        let mut gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        while self.bits.load(Ordering::Acquire) & flag != 0 {
            gate = self.cond.wait(gate).unwrap_or_else(|e| e.into_inner());
        }
    }
}

// =============================================================================
// Blocking-Notification Semaphore
// =============================================================================

/// How a semaphore wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Released by a post (an explicit restart).
    Posted,
    /// Aborted by signal-style interruption; the reset is not replayed.
    Interrupted,
}

#[derive(Debug, Default)]
struct SemState {
    posts: u32,
    interrupt_epoch: u64,
}

/// Counting semaphore with interruptible waits.
#[derive(Debug, Default)]
pub struct Semaphore {
    state: Mutex<SemState>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release one waiter (or bank the post for the next one).
    pub fn post(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.posts += 1;
        self.cond.notify_one();
    }

    /// Abort every current waiter without consuming posts.
    pub fn interrupt(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.interrupt_epoch += 1;
        self.cond.notify_all();
    }

    /// Block until posted or interrupted.
    pub fn wait(&self) -> WaitOutcome {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let epoch = state.interrupt_epoch;
        loop {
            if state.posts > 0 {
                state.posts -= 1;
                return WaitOutcome::Posted;
            }
            if state.interrupt_epoch != epoch {
                return WaitOutcome::Interrupted;
            }
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }
}
