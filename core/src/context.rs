//! # Monitoring Context
//!
//! Per-session state: mode flags, the per-register virtualized 64-bit
//! software counters, the register bitmasks, the notification target and
//! the cross-CPU protocol flags.
//!
//! A context's authoritative counter state is either live on exactly one
//! CPU's hardware or fully folded into the soft counters here — never
//! both, never split. The ownership module (`crate::ownership`) moves it
//! between the two.

use core::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use perfmon_hal::{CpuId, PmuDescription};
use spin::Mutex;

use crate::regset::RegSet;
use crate::sampling::SampleBuffer;
use crate::sync::SyncFlags;
use crate::task::TaskHandle;

bitflags! {
    /// Context mode flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtxFlags: u32 {
        /// Session observes one CPU instead of one task.
        const SYSTEM_WIDE = 1 << 0;
        /// Overflow notification blocks the monitored task until restart.
        const BLOCKING = 1 << 1;
        /// Only the creating task may operate on the context.
        const PROTECTED = 1 << 2;
        /// Children inherit the context across one fork.
        const INHERIT_ONCE = 1 << 3;
        /// Children inherit the context across every fork.
        const INHERIT_ALL = 1 << 4;
        /// The context holds a watchpoint-register reservation.
        const USING_DBREGS = 1 << 5;
    }
}

/// Per-context state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxState {
    /// Configured but not bound to hardware.
    Disabled,
    /// Bound to hardware, monitoring stopped.
    Ready,
    /// Bound to hardware, monitoring running.
    Active,
    /// Overflow notification outstanding; hardware frozen until restart.
    Frozen,
}

// =============================================================================
// Soft Counters
// =============================================================================

/// One virtualized 64-bit counter extending a hardware counting register.
#[derive(Debug, Clone, Default)]
pub struct SoftCounter {
    /// Current 64-bit virtual value. While the context is live on a CPU
    /// this excludes the low hardware bits; saved, it is the whole value.
    pub val: u64,
    /// Value most recently loaded or armed into the counter.
    pub last_reset: u64,
    /// Reset value applied on an explicit restart.
    pub long_reset: u64,
    /// Reset value applied when no notification is requested.
    pub short_reset: u64,
    /// Sibling registers to re-arm when this counter overflows.
    pub reset_set: RegSet,
    /// Randomized-reset seed.
    pub seed: u64,
    /// Randomized-reset mask; the random addend is bounded by it.
    pub rand_mask: u64,
    /// Overflow requests user notification.
    pub notify: bool,
    /// Reset values are randomized.
    pub randomize: bool,
}

impl SoftCounter {
    /// Next value of the reset randomizer (Lehmer generator, as small and
    /// fast as interrupt context demands).
    fn next_random(&mut self) -> u64 {
        if self.seed == 0 {
            self.seed = 0x2545_F491;
        }
        self.seed = (self.seed.wrapping_mul(16807)) % 0x7fff_ffff;
        self.seed & self.rand_mask
    }

    /// Compute and record the counter's next reset value.
    pub fn arm_reset(&mut self, long: bool) -> u64 {
        let base = if long { self.long_reset } else { self.short_reset };
        let value = if self.randomize {
            base.wrapping_add(self.next_random())
        } else {
            base
        };
        self.last_reset = value;
        value
    }
}

// =============================================================================
// Context
// =============================================================================

/// Mutable context state, guarded by the context lock.
#[derive(Debug)]
pub struct ContextInner {
    pub state: CtxState,
    pub flags: CtxFlags,
    /// One soft counter per data register slot.
    pub soft_pmds: Vec<SoftCounter>,
    /// Saved control-register values.
    pub pmcs: Vec<u64>,
    /// Data registers this context uses.
    pub used_pmds: RegSet,
    /// Control registers this context uses.
    pub used_pmcs: RegSet,
    /// Data registers to reload on the next switch-in.
    pub reload_pmds: RegSet,
    /// Control registers to reload on the next switch-in.
    pub reload_pmcs: RegSet,
    /// Registers recorded into sample entries.
    pub smpl_pmds: RegSet,
    /// Registers touched by watchpoints.
    pub wp_regs: RegSet,
    /// Overflowed counters awaiting a long reset from restart.
    pub ovfl_regs: RegSet,
    /// Saved overflow-status word from the last save.
    pub saved_status: u64,
    /// Saved monitoring-active control bit.
    pub saved_psr: bool,
    /// CPU a system-wide session is bound to.
    pub bound_cpu: Option<CpuId>,
    /// Task that created and is monitored by this session.
    pub owner: Option<TaskHandle>,
    /// Notification target; validity re-checked on every send.
    pub notify_target: Option<TaskHandle>,
    /// Attached sampling buffer.
    pub buffer: Option<Arc<SampleBuffer>>,
    /// A cross-task restart is waiting for the monitored task to pick up.
    pub pending_restart: bool,
}

/// One monitoring session's context.
#[derive(Debug)]
pub struct Context {
    inner: Mutex<ContextInner>,
    /// CPU whose hardware holds this context's live state, or -1.
    owner_cpu: AtomicI64,
    /// BUSY/SAVING cross-CPU protocol flags.
    pub(crate) protocol: SyncFlags,
}

const NO_CPU: i64 = -1;

impl Context {
    /// Build a disabled context for `owner`.
    pub(crate) fn new(
        desc: &PmuDescription,
        owner: TaskHandle,
        flags: CtxFlags,
        notify_target: Option<TaskHandle>,
        smpl_pmds: RegSet,
        buffer: Option<Arc<SampleBuffer>>,
    ) -> Self {
        Self {
            inner: Mutex::new(ContextInner {
                state: CtxState::Disabled,
                flags,
                soft_pmds: vec![SoftCounter::default(); desc.pmds.len()],
                pmcs: desc.pmcs.iter().map(|d| d.reset_value).collect(),
                used_pmds: RegSet::EMPTY,
                used_pmcs: RegSet::EMPTY,
                reload_pmds: RegSet::EMPTY,
                reload_pmcs: RegSet::EMPTY,
                smpl_pmds,
                wp_regs: RegSet::EMPTY,
                ovfl_regs: RegSet::EMPTY,
                saved_status: 0,
                saved_psr: false,
                bound_cpu: None,
                owner: Some(owner),
                notify_target,
                buffer,
                pending_restart: false,
            }),
            owner_cpu: AtomicI64::new(NO_CPU),
            protocol: SyncFlags::new(),
        }
    }

    /// Lock the mutable state.
    pub(crate) fn lock(&self) -> spin::MutexGuard<'_, ContextInner> {
        self.inner.lock()
    }

    /// CPU currently holding this context's live registers.
    pub(crate) fn owner_cpu(&self) -> Option<CpuId> {
        match self.owner_cpu.load(Ordering::Acquire) {
            NO_CPU => None,
            cpu => Some(cpu as CpuId),
        }
    }

    /// Record the CPU holding this context's live registers.
    pub(crate) fn set_owner_cpu(&self, cpu: Option<CpuId>) {
        let value = cpu.map_or(NO_CPU, |c| c as i64);
        self.owner_cpu.store(value, Ordering::Release);
    }
}
