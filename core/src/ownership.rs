//! # PMU Ownership and Lazy Switching
//!
//! At most one context is live on a given CPU's hardware at a time, and a
//! context's authoritative state is either live on exactly one CPU or
//! fully saved in its soft counters. This module moves state between the
//! two without ever violating that invariant:
//!
//! - **Lazy save**: a departing owner's registers are copied out only
//!   when somebody else actually needs the CPU.
//! - **Cross-CPU fetch**: when a read, restart or enable needs a
//!   context whose last-known CPU is elsewhere, the requester resolves
//!   the save itself under the SAVING flag. Three outcomes are handled:
//!   the remote image is no longer owned (nothing to do), a save is
//!   already underway (wait for it), or the overflow handler is using the
//!   context (wait for not-busy before starting).
//! - **Reload**: restores a context onto a CPU, evicting the present
//!   owner, optionally writing the full leak-safe register superset, and
//!   running the overflow handler synchronously if the saved status word
//!   carries a pending overflow.
//! - **Exit flush**: one-shot save when the monitored task dies; pending
//!   overflows are folded into the virtual counters and nobody is
//!   notified.
//!
//! Ownership operations do not fail; they wait until the invariant is
//! re-established.

use perfmon_hal::{CpuId, STATUS_FREEZE};
use spin::Mutex;

use crate::context::{Context, ContextInner, CtxState};
use crate::monitor::{Monitor, SessionId};
use crate::overflow;
use crate::regset::RegSet;
use crate::sync::{FLAG_BUSY, FLAG_SAVING};

// =============================================================================
// Per-CPU Owner Table
// =============================================================================

/// Which session currently holds each CPU's live registers.
#[derive(Debug)]
pub(crate) struct OwnerTable {
    slots: Vec<Mutex<Option<SessionId>>>,
}

impl OwnerTable {
    pub(crate) fn new(num_cpus: usize) -> Self {
        Self {
            slots: (0..num_cpus).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Current owner of `cpu`'s registers.
    pub(crate) fn owner(&self, cpu: CpuId) -> Option<SessionId> {
        *self.slots[cpu].lock()
    }

    /// Install `session` as the owner of `cpu`.
    pub(crate) fn set(&self, cpu: CpuId, session: SessionId) {
        *self.slots[cpu].lock() = Some(session);
    }

    /// Clear `cpu`'s slot if `session` still owns it.
    pub(crate) fn clear_if(&self, cpu: CpuId, session: SessionId) -> bool {
        let mut slot = self.slots[cpu].lock();
        if *slot == Some(session) {
            *slot = None;
            true
        } else {
            false
        }
    }
}

// =============================================================================
// Register Movement Helpers
// =============================================================================

/// Read the current 64-bit value of data register `reg`.
///
/// While live, a counting register's virtual value is the soft part plus
/// the hardware's low bits; saved, the soft counter holds everything.
pub(crate) fn read_virtual(
    mon: &Monitor,
    inner: &ContextInner,
    live_cpu: Option<CpuId>,
    reg: usize,
) -> u64 {
    let desc = mon.desc();
    match live_cpu {
        Some(cpu) if desc.is_counting(reg) => {
            let hw = mon.backend().read_pmd(cpu, reg) & desc.counter_mask();
            inner.soft_pmds[reg].val.wrapping_add(hw)
        }
        Some(cpu) => mon.backend().read_pmd(cpu, reg),
        None => inner.soft_pmds[reg].val,
    }
}

/// Arm the reset values of `regs` and their declared siblings.
///
/// `long` chooses between the restart (long) and in-handler (short)
/// reset policy. Live counters get their low bits written back to
/// hardware.
pub(crate) fn reset_counters(
    mon: &Monitor,
    inner: &mut ContextInner,
    live_cpu: Option<CpuId>,
    regs: RegSet,
    long: bool,
) {
    let desc = mon.desc();
    let mask = desc.counter_mask();

    let mut all = regs;
    for reg in regs.iter() {
        all |= inner.soft_pmds[reg].reset_set;
    }

    for reg in all.iter() {
        if !inner.used_pmds.test(reg) || !desc.is_counting(reg) {
            continue;
        }
        let value = inner.soft_pmds[reg].arm_reset(long);
        match live_cpu {
            Some(cpu) => {
                mon.backend().write_pmd(cpu, reg, value & mask);
                inner.soft_pmds[reg].val = value & !mask;
            }
            None => inner.soft_pmds[reg].val = value,
        }
    }
}

// =============================================================================
// Ownership Operations
// =============================================================================

impl Monitor {
    /// Evict whatever context currently owns `cpu`'s registers.
    pub(crate) fn lazy_save(&self, cpu: CpuId) {
        let Some(sid) = self.owners().owner(cpu) else {
            return;
        };
        let Ok(ctx) = self.get(sid) else {
            // Session died without clearing its slot; nothing to save.
            self.owners().clear_if(cpu, sid);
            return;
        };
        self.save_context(sid, &ctx, cpu);
    }

    /// Save `ctx`'s live registers out of `cpu` under the SAVING flag.
    fn save_context(&self, sid: SessionId, ctx: &Context, cpu: CpuId) {
        loop {
            if ctx.owner_cpu() != Some(cpu) {
                // Already saved by someone else, or moved.
                return;
            }
            ctx.protocol.wait_lowered(FLAG_BUSY);
            if ctx.protocol.try_raise(FLAG_SAVING) {
                break;
            }
            // A save was underway when we arrived; wait for it to finish
            // rather than racing ahead with stale state.
            ctx.protocol.wait_lowered(FLAG_SAVING);
        }

        if ctx.owner_cpu() == Some(cpu) && self.owners().owner(cpu) == Some(sid) {
            let mut inner = ctx.lock();
            self.copy_registers_out(&mut inner, cpu);
            self.owners().clear_if(cpu, sid);
            ctx.set_owner_cpu(None);
        }
        ctx.protocol.lower(FLAG_SAVING);
    }

    /// Pull `ctx`'s state off whatever CPU holds it, if any.
    ///
    /// This is the cross-CPU fetch: the requester asks for an immediate
    /// save of the remote register image and does not proceed until the
    /// context is fully in software.
    pub(crate) fn fetch_state(&self, sid: SessionId, ctx: &Context) {
        loop {
            let Some(cpu) = ctx.owner_cpu() else {
                return;
            };
            ctx.protocol.wait_lowered(FLAG_BUSY);
            if !ctx.protocol.try_raise(FLAG_SAVING) {
                ctx.protocol.wait_lowered(FLAG_SAVING);
                continue;
            }
            if ctx.owner_cpu() != Some(cpu) {
                // The owner changed while we raced for the flag.
                ctx.protocol.lower(FLAG_SAVING);
                continue;
            }
            let mut inner = ctx.lock();
            self.copy_registers_out(&mut inner, cpu);
            self.owners().clear_if(cpu, sid);
            ctx.set_owner_cpu(None);
            drop(inner);
            ctx.protocol.lower(FLAG_SAVING);
            return;
        }
    }

    /// Copy every register the context uses from `cpu` into soft storage
    /// and mark the full reload set.
    fn copy_registers_out(&self, inner: &mut ContextInner, cpu: CpuId) {
        let backend = self.backend();
        let desc = self.desc();
        let mask = desc.counter_mask();

        backend.set_monitoring(cpu, false);

        let status = backend.read_status(cpu);
        if status & !STATUS_FREEZE != 0 && status & STATUS_FREEZE == 0 {
            // Overflow bits without the freeze indicator should not
            // happen; benign, but worth a trace.
            log::warn!("cpu{}: unexpected freeze-bit pattern {:#x}", cpu, status);
        }
        inner.saved_status = status;
        backend.write_status(cpu, STATUS_FREEZE);

        for reg in inner.used_pmds.iter() {
            let hw = backend.read_pmd(cpu, reg);
            let sc = &mut inner.soft_pmds[reg];
            if desc.is_counting(reg) {
                sc.val = sc.val.wrapping_add(hw & mask);
            } else {
                sc.val = hw;
            }
        }
        for reg in inner.used_pmcs.iter() {
            inner.pmcs[reg] = backend.read_pmc(cpu, reg);
        }
        inner.reload_pmds = inner.used_pmds;
        inner.reload_pmcs = inner.used_pmcs;

        log::debug!(
            "cpu{}: context saved, pmds={:?} status={:#x}",
            cpu,
            inner.used_pmds,
            status
        );
    }

    /// Make `ctx` live on `cpu`, restoring its registers.
    pub(crate) fn reload(&self, sid: SessionId, ctx: &Context, cpu: CpuId) {
        // Fast path: the context never left this CPU; only the saved
        // control word needs restoring.
        if ctx.owner_cpu() == Some(cpu) && self.owners().owner(cpu) == Some(sid) {
            let inner = ctx.lock();
            self.backend().set_monitoring(cpu, inner.saved_psr);
            return;
        }

        self.lazy_save(cpu);
        self.fetch_state(sid, ctx);

        let mut inner = ctx.lock();
        self.write_registers_in(&mut inner, cpu);
        self.owners().set(cpu, sid);
        ctx.set_owner_cpu(Some(cpu));

        let status = core::mem::take(&mut inner.saved_status);
        let resume = inner.saved_psr;
        drop(inner);

        if status & !STATUS_FREEZE != 0 {
            // The saved state carries an unconsumed overflow; consume it
            // now rather than deferring to a later interrupt.
            self.run_overflow(ctx, cpu, status, 0);
        } else {
            self.backend().write_status(cpu, 0);
            self.backend().set_monitoring(cpu, resume);
        }
    }

    /// Write the context's registers into `cpu`'s hardware.
    ///
    /// With the fast-switch tunable off, every implemented register is
    /// written — unused ones get their platform reset value — so no stale
    /// configuration from a previous owner can leak to a task that could
    /// observe it.
    pub(crate) fn write_registers_in(&self, inner: &mut ContextInner, cpu: CpuId) {
        let backend = self.backend();
        let desc = self.desc();
        let mask = desc.counter_mask();
        let fast = self.tunables().fast_switch();

        let pmcs = if fast {
            inner.used_pmcs
        } else {
            RegSet::from_mask(desc.impl_pmcs)
        };
        for reg in pmcs.iter() {
            let value = if inner.used_pmcs.test(reg) {
                inner.pmcs[reg]
            } else {
                desc.pmcs[reg].reset_value
            };
            backend.write_pmc(cpu, reg, value);
        }

        let pmds = if fast {
            inner.used_pmds
        } else {
            RegSet::from_mask(desc.impl_pmds)
        };
        for reg in pmds.iter() {
            if inner.used_pmds.test(reg) {
                if desc.is_counting(reg) {
                    let sc = &mut inner.soft_pmds[reg];
                    backend.write_pmd(cpu, reg, sc.val & mask);
                    sc.val &= !mask;
                } else {
                    backend.write_pmd(cpu, reg, inner.soft_pmds[reg].val);
                }
            } else {
                backend.write_pmd(cpu, reg, desc.pmds[reg].reset_value);
            }
        }

        inner.reload_pmds = RegSet::EMPTY;
        inner.reload_pmcs = RegSet::EMPTY;
    }

    /// One-shot save when the monitored task terminates or the session
    /// is disabled.
    ///
    /// Runs under the SAVING flag like any other save, so a concurrent
    /// fetch cannot hand the CPU to a new owner and have the flush rip
    /// that owner's registers out. Pending overflows are folded into the
    /// virtual counters inline; no notification is sent — the task's
    /// exit is the implicit notification to any waiter.
    pub(crate) fn exit_flush(&self, sid: SessionId, ctx: &Context) {
        let backend = self.backend();
        let desc = self.desc();
        let range = desc.counter_mask().wrapping_add(1);

        loop {
            let Some(cpu) = ctx.owner_cpu() else {
                break;
            };
            ctx.protocol.wait_lowered(FLAG_BUSY);
            if !ctx.protocol.try_raise(FLAG_SAVING) {
                ctx.protocol.wait_lowered(FLAG_SAVING);
                continue;
            }
            if ctx.owner_cpu() != Some(cpu) || self.owners().owner(cpu) != Some(sid) {
                // Saved by someone else while we raced for the flag.
                ctx.protocol.lower(FLAG_SAVING);
                continue;
            }

            let mut inner = ctx.lock();
            backend.set_monitoring(cpu, false);
            let status = backend.read_status(cpu);
            backend.write_status(cpu, STATUS_FREEZE);

            for reg in RegSet::from_mask(status & !STATUS_FREEZE).iter() {
                if inner.used_pmds.test(reg) && desc.is_counting(reg) {
                    let sc = &mut inner.soft_pmds[reg];
                    sc.val = sc.val.wrapping_add(range);
                    backend.write_pmd(cpu, reg, 0);
                }
            }

            self.copy_registers_out(&mut inner, cpu);
            drop(inner);
            self.owners().clear_if(cpu, sid);
            ctx.set_owner_cpu(None);
            ctx.protocol.lower(FLAG_SAVING);
            break;
        }

        let mut inner = ctx.lock();
        inner.saved_status = 0;
        inner.saved_psr = false;
        inner.state = CtxState::Disabled;
    }

    /// Run the overflow handler with the BUSY flag raised and write its
    /// verdict back into the status register.
    pub(crate) fn run_overflow(
        &self,
        ctx: &Context,
        cpu: CpuId,
        status: u64,
        ip: u64,
    ) -> overflow::FreezeAction {
        ctx.protocol.raise(FLAG_BUSY);
        let action = overflow::handle(self, ctx, cpu, status, ip);
        match action {
            overflow::FreezeAction::Unfreeze => {
                self.backend().write_status(cpu, 0);
                let inner = ctx.lock();
                let resume = inner.saved_psr;
                self.backend().set_monitoring(cpu, resume);
            }
            overflow::FreezeAction::KeepFrozen => {
                self.backend().write_status(cpu, STATUS_FREEZE);
            }
        }
        ctx.protocol.lower(FLAG_BUSY);
        action
    }
}
