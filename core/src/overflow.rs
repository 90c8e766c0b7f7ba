//! # Overflow Handling
//!
//! Interrupt-time consumption of the hardware overflow status word. Each
//! hardware wrap is folded into the 64-bit virtual counter; only a wrap
//! of the *virtual* value counts as a true overflow and drives sampling,
//! reset policy and notification.
//!
//! The handler decides what happens to the hardware freeze bit: resume
//! counting immediately (no notification wanted, counters re-armed with
//! the short reset) or stay frozen until an explicit restart (a
//! notification is outstanding). A notification whose target died is
//! logged and dropped; the session then stays frozen until its owner
//! restarts or destroys it.

use perfmon_hal::{CpuId, STATUS_FREEZE};

use crate::context::{Context, CtxFlags, CtxState};
use crate::monitor::Monitor;
use crate::ownership::{read_virtual, reset_counters};
use crate::regset::RegSet;
use crate::sampling::{Append, SampleEntry};
use crate::task::{OverflowSignal, OVERFLOW_SIGNAL};

/// What the caller must do with the hardware freeze bit afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeAction {
    /// Clear the status word and resume counting.
    Unfreeze,
    /// Leave the hardware frozen until an explicit restart.
    KeepFrozen,
}

/// Consume one overflow status word for `ctx`, live on `cpu`.
///
/// Called with the context's BUSY flag raised and the hardware frozen.
pub(crate) fn handle(
    mon: &Monitor,
    ctx: &Context,
    cpu: CpuId,
    status: u64,
    ip: u64,
) -> FreezeAction {
    let desc = mon.desc();
    let range = desc.counter_mask().wrapping_add(1);
    let mut inner = ctx.lock();

    // Step 1: fold each hardware wrap into its virtual counter and find
    // the true (64-bit) overflows.
    let mut true_ovfl = RegSet::EMPTY;
    let mut notify_set = RegSet::EMPTY;
    for reg in RegSet::from_mask(status & !STATUS_FREEZE).iter() {
        if !inner.used_pmds.test(reg) || !desc.is_counting(reg) {
            log::warn!("cpu{}: overflow on unexpected register pmd{}", cpu, reg);
            continue;
        }
        let sc = &mut inner.soft_pmds[reg];
        let old = sc.val;
        sc.val = old.wrapping_add(range);
        mon.backend().write_pmd(cpu, reg, 0);
        if sc.val < old {
            true_ovfl.set(reg);
            if sc.notify {
                notify_set.set(reg);
            }
        }
    }

    if true_ovfl.is_empty() {
        // Hardware wraps only; the virtual counters absorbed them.
        return FreezeAction::Unfreeze;
    }

    log::trace!(
        "cpu{}: true overflow {:?}, notify {:?}, ip={:#x}",
        cpu,
        true_ovfl,
        notify_set,
        ip
    );

    // Step 2: record a sample if a buffer is attached.
    if let Some(buf) = inner.buffer.clone() {
        let values: Vec<u64> = buf
            .recorded()
            .iter()
            .map(|reg| read_virtual(mon, &inner, Some(cpu), reg))
            .collect();
        let first = true_ovfl.first().unwrap_or(0);
        let entry = SampleEntry {
            pid: inner.owner.map_or(0, |t| t.pid()),
            cpu: cpu as u32,
            last_reset: inner.soft_pmds[first].last_reset,
            ip,
            ovfl_regs: true_ovfl.mask(),
            tstamp: mon.backend().timestamp(cpu),
            period: 0,
        };
        match buf.append(entry, &values) {
            Append::Recorded { filled: true } => {
                buf.note_full();
                if notify_set.is_empty() {
                    // Nobody to tell; recycle the buffer silently.
                    buf.reset();
                } else {
                    // The consumer must see the full buffer first; the
                    // reset waits for its restart.
                    buf.defer_reset();
                }
            }
            Append::Recorded { filled: false } => {}
            Append::Dropped => {
                log::debug!("cpu{}: sample dropped, buffer full", cpu);
            }
        }
    }

    // Step 3: no notification wanted; re-arm and resume.
    if notify_set.is_empty() {
        reset_counters(mon, &mut inner, Some(cpu), true_ovfl, false);
        return FreezeAction::Unfreeze;
    }

    // Step 4: notification. Every truly overflowed counter is remembered
    // so the eventual restart can apply the long reset to all of them,
    // not just the notifying ones, and the session freezes until then.
    inner.ovfl_regs |= true_ovfl;
    inner.state = CtxState::Frozen;
    inner.saved_psr = false;

    let owner = inner.owner;
    match inner.notify_target {
        Some(target) => {
            let signal = OverflowSignal {
                signal: OVERFLOW_SIGNAL,
                sender: owner.map_or(0, |t| t.pid()),
                ovfl_regs: notify_set.mask(),
            };
            // The liveness check and the delivery are one step under the
            // context lock, so the target cannot tear down in between.
            match mon.tasks().send_signal(target, signal) {
                Ok(()) => {
                    if inner.flags.contains(CtxFlags::BLOCKING) && Some(target) != owner {
                        // Self-notification never blocks.
                        if let Some(owner) = owner {
                            mon.tasks().set_block_pending(owner);
                        }
                    }
                }
                Err(_) => {
                    log::warn!(
                        "cpu{}: notification target gone, session stays frozen",
                        cpu
                    );
                    inner.notify_target = None;
                }
            }
        }
        None => {
            log::debug!("cpu{}: overflow with no notification target", cpu);
        }
    }

    FreezeAction::KeepFrozen
}
