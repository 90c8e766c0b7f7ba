//! # Session Operations
//!
//! The monitoring API proper: create, program, start, stop, read,
//! restart, tear down. Every operation validates the caller against the
//! session's protection flag and the session's current state before
//! touching anything.
//!
//! Register batches are not transactional: arguments are validated and
//! applied one at a time, the first invalid argument stops the batch with
//! `InvalidArgument`, its slot is tagged [`RegArgFlags::RETFL_INVALID`],
//! and earlier writes remain applied.

use std::sync::Arc;

use bitflags::bitflags;
use perfmon_hal::{CpuId, RegClass};

use crate::context::{Context, ContextInner, CtxFlags, CtxState};
use crate::error::{PmuError, Result};
use crate::monitor::{Monitor, SessionId};
use crate::ownership::{read_virtual, reset_counters};
use crate::regset::RegSet;
use crate::sampling::{SampleBuffer, SampleView};
use crate::task::TaskHandle;

// =============================================================================
// Argument Types
// =============================================================================

bitflags! {
    /// Per-register argument flags, in and out.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegArgFlags: u32 {
        /// Overflow of this counter requests a notification.
        const OVFL_NOTIFY = 1 << 0;
        /// Randomize this counter's reset values.
        const RANDOMIZE = 1 << 1;
        /// Set on return in the argument that failed validation.
        const RETFL_INVALID = 1 << 31;
    }
}

/// One control-register write.
#[derive(Debug, Clone)]
pub struct PmcArg {
    pub reg: usize,
    pub value: u64,
    pub flags: RegArgFlags,
}

impl PmcArg {
    pub fn new(reg: usize, value: u64) -> Self {
        Self {
            reg,
            value,
            flags: RegArgFlags::empty(),
        }
    }
}

/// One data-register write or read slot.
#[derive(Debug, Clone)]
pub struct PmdArg {
    pub reg: usize,
    /// Value to load, or the 64-bit virtual value on read.
    pub value: u64,
    /// Reset value applied by an explicit restart.
    pub long_reset: u64,
    /// Reset value applied when no notification is requested.
    pub short_reset: u64,
    /// Mask of sibling registers re-armed when this one overflows.
    pub reset_regs: u64,
    /// Randomized-reset seed.
    pub seed: u64,
    /// Randomized-reset mask.
    pub rand_mask: u64,
    /// Filled on read: the value most recently armed into the counter.
    pub last_reset: u64,
    pub flags: RegArgFlags,
}

impl PmdArg {
    pub fn new(reg: usize, value: u64) -> Self {
        Self {
            reg,
            value,
            long_reset: 0,
            short_reset: 0,
            reset_regs: 0,
            seed: 0,
            rand_mask: 0,
            last_reset: 0,
            flags: RegArgFlags::empty(),
        }
    }
}

/// Parameters of a new session.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub flags: CtxFlags,
    /// Notification target; defaults to nobody.
    pub notify: Option<TaskHandle>,
    /// Sampling-buffer slots; zero for no buffer.
    pub smpl_entries: usize,
    /// Registers recorded in each sample entry.
    pub smpl_regs: RegSet,
    /// For system-wide sessions: mask with exactly the observed CPU set.
    pub cpu_mask: u64,
}

impl Default for CreateRequest {
    fn default() -> Self {
        Self {
            flags: CtxFlags::empty(),
            notify: None,
            smpl_entries: 0,
            smpl_regs: RegSet::EMPTY,
            cpu_mask: 0,
        }
    }
}

/// What a successful create hands back.
#[derive(Debug)]
pub struct CreateResponse {
    pub session: SessionId,
    /// Read-only view of the sampling buffer, when one was requested.
    pub view: Option<SampleView>,
}

// =============================================================================
// Helpers
// =============================================================================

fn check_access(inner: &ContextInner, caller: TaskHandle) -> Result<()> {
    if inner.flags.contains(CtxFlags::PROTECTED) && inner.owner != Some(caller) {
        return Err(PmuError::PermissionDenied);
    }
    Ok(())
}

/// Apply the restart actions: long reset of the recorded overflow set,
/// deferred buffer recycle, unfreeze.
pub(crate) fn apply_restart(mon: &Monitor, inner: &mut ContextInner, live_cpu: Option<CpuId>) {
    let regs = core::mem::take(&mut inner.ovfl_regs);
    reset_counters(mon, inner, live_cpu, regs, true);
    if let Some(buf) = &inner.buffer {
        if buf.reset_pending() {
            buf.reset();
        }
    }
    inner.state = CtxState::Active;
    inner.saved_psr = true;
    if let Some(cpu) = live_cpu {
        mon.backend().write_status(cpu, 0);
        mon.backend().set_monitoring(cpu, true);
    }
}

// =============================================================================
// Operations
// =============================================================================

impl Monitor {
    /// Create a session for `caller`.
    ///
    /// Per-task sessions monitor the caller; system-wide sessions bind to
    /// the single CPU set in `cpu_mask` and pin the caller there. The
    /// session starts out disabled.
    pub fn create_session(&self, caller: TaskHandle, req: &CreateRequest) -> Result<CreateResponse> {
        if !self.tasks().is_live(caller) {
            return Err(PmuError::NotFound);
        }
        let flags = req.flags;
        if flags.contains(CtxFlags::INHERIT_ONCE) && flags.contains(CtxFlags::INHERIT_ALL) {
            return Err(PmuError::InvalidArgument);
        }
        if flags.contains(CtxFlags::USING_DBREGS) {
            // Watchpoint reservations go through `use_watchpoints`.
            return Err(PmuError::InvalidArgument);
        }
        if flags.contains(CtxFlags::BLOCKING)
            && (flags.contains(CtxFlags::SYSTEM_WIDE) || req.notify.is_none())
        {
            return Err(PmuError::InvalidArgument);
        }
        if let Some(target) = req.notify {
            if !self.tasks().is_live(target) {
                return Err(PmuError::InvalidArgument);
            }
        }
        let desc = self.desc();
        if !req.smpl_regs.subset_of(RegSet::from_mask(desc.impl_pmds)) {
            return Err(PmuError::InvalidArgument);
        }

        let buffer = if req.smpl_entries > 0 {
            Some(SampleBuffer::new(req.smpl_entries, req.smpl_regs)?)
        } else {
            None
        };

        let bound_cpu = if flags.contains(CtxFlags::SYSTEM_WIDE) {
            if req.cpu_mask.count_ones() != 1 {
                return Err(PmuError::InvalidArgument);
            }
            let cpu = req.cpu_mask.trailing_zeros() as CpuId;
            if cpu >= desc.num_cpus {
                return Err(PmuError::InvalidArgument);
            }
            if let Some(pinned) = self.tasks().pinned(caller) {
                if pinned != cpu {
                    return Err(PmuError::InvalidArgument);
                }
            }
            Some(cpu)
        } else {
            if self.tasks().session_of(caller).is_some() {
                return Err(PmuError::Busy);
            }
            None
        };

        match bound_cpu {
            Some(cpu) => self.registry().begin_system_session(cpu, caller)?,
            None => self.registry().begin_task_session()?,
        }

        let result = (|| {
            if let Some(cpu) = bound_cpu {
                self.tasks().pin(caller, cpu)?;
            }
            let ctx = Arc::new(Context::new(
                desc,
                caller,
                flags,
                req.notify,
                req.smpl_regs,
                buffer.clone(),
            ));
            ctx.lock().bound_cpu = bound_cpu;
            let sid = self.insert_session(ctx)?;
            if let Err(err) = self.tasks().attach_session(caller, sid) {
                self.remove_session(sid);
                return Err(err);
            }
            Ok(sid)
        })();

        match result {
            Ok(session) => {
                log::debug!(
                    "session {:?} created by pid {} flags {:?}",
                    session,
                    caller.pid(),
                    flags
                );
                Ok(CreateResponse {
                    session,
                    view: buffer.map(SampleView::new),
                })
            }
            Err(err) => {
                match bound_cpu {
                    Some(cpu) => {
                        self.tasks().unpin(caller);
                        self.registry().end_system_session(cpu);
                    }
                    None => self.registry().end_task_session(),
                }
                Err(err)
            }
        }
    }

    /// Bind the session to `cpu`'s hardware: evict the current owner,
    /// reset every register to its platform value, program the session's
    /// configuration, and claim ownership. Monitoring stays stopped.
    pub fn enable(&self, caller: TaskHandle, cpu: CpuId, session: SessionId) -> Result<()> {
        if cpu >= self.num_cpus() {
            return Err(PmuError::InvalidArgument);
        }
        let ctx = self.get(session)?;
        {
            let inner = ctx.lock();
            check_access(&inner, caller)?;
            if inner.state != CtxState::Disabled {
                return Err(PmuError::Busy);
            }
            if inner.flags.contains(CtxFlags::SYSTEM_WIDE) {
                if inner.bound_cpu != Some(cpu) {
                    return Err(PmuError::InvalidArgument);
                }
            } else if inner.owner != Some(caller) {
                return Err(PmuError::PermissionDenied);
            }
        }

        if let Some(current) = self.owners().owner(cpu) {
            if current != session {
                self.lazy_save(cpu);
            }
        }
        self.backend().reset_registers(cpu);

        let mut inner = ctx.lock();
        self.write_registers_in(&mut inner, cpu);
        self.owners().set(cpu, session);
        ctx.set_owner_cpu(Some(cpu));
        inner.saved_status = 0;
        inner.saved_psr = false;
        inner.state = CtxState::Ready;
        Ok(())
    }

    /// Begin counting. The session must be enabled and own `cpu`'s
    /// registers.
    pub fn start(&self, caller: TaskHandle, cpu: CpuId, session: SessionId) -> Result<()> {
        if cpu >= self.num_cpus() {
            return Err(PmuError::InvalidArgument);
        }
        let ctx = self.get(session)?;
        let mut inner = ctx.lock();
        check_access(&inner, caller)?;
        match inner.state {
            CtxState::Ready => {}
            CtxState::Active => return Ok(()),
            CtxState::Disabled | CtxState::Frozen => return Err(PmuError::Busy),
        }
        if ctx.owner_cpu() != Some(cpu) || self.owners().owner(cpu) != Some(session) {
            return Err(PmuError::Busy);
        }
        self.backend().write_status(cpu, 0);
        self.backend().set_monitoring(cpu, true);
        inner.saved_psr = true;
        inner.state = CtxState::Active;
        Ok(())
    }

    /// Stop counting. Stopping a stopped session is a no-op; counter
    /// values are untouched either way.
    pub fn stop(&self, caller: TaskHandle, session: SessionId) -> Result<()> {
        let ctx = self.get(session)?;
        let mut inner = ctx.lock();
        check_access(&inner, caller)?;
        if inner.state == CtxState::Active {
            if let Some(cpu) = ctx.owner_cpu() {
                self.backend().set_monitoring(cpu, false);
            }
            inner.saved_psr = false;
            inner.state = CtxState::Ready;
        }
        Ok(())
    }

    /// Unbind the session from hardware, folding live values into the
    /// soft counters. Pending overflows are absorbed without notifying.
    pub fn disable(&self, caller: TaskHandle, session: SessionId) -> Result<()> {
        let ctx = self.get(session)?;
        {
            let inner = ctx.lock();
            check_access(&inner, caller)?;
            if inner.state == CtxState::Disabled {
                return Ok(());
            }
        }
        self.exit_flush(session, &ctx);
        Ok(())
    }

    /// Program control registers. Writes reach the hardware immediately
    /// while the session is live.
    pub fn write_pmcs(
        &self,
        caller: TaskHandle,
        session: SessionId,
        args: &mut [PmcArg],
    ) -> Result<()> {
        let ctx = self.get(session)?;
        let mut inner = ctx.lock();
        check_access(&inner, caller)?;
        if inner.state == CtxState::Active {
            return Err(PmuError::Busy);
        }
        let desc = self.desc();
        let live_cpu = ctx.owner_cpu();
        for arg in args.iter_mut() {
            arg.flags.remove(RegArgFlags::RETFL_INVALID);
            let reg = arg.reg;
            if !desc.is_impl_pmc(reg) || !desc.check_pmc(reg, arg.value) {
                arg.flags.insert(RegArgFlags::RETFL_INVALID);
                return Err(PmuError::InvalidArgument);
            }
            inner.pmcs[reg] = arg.value;
            inner.used_pmcs.set(reg);
            // A control register pulls its dependent data registers into
            // the session's used set.
            inner.used_pmds |= RegSet::from_mask(desc.pmcs[reg].dependents);
            if let Some(cpu) = live_cpu {
                self.backend().write_pmc(cpu, reg, arg.value);
            }
        }
        Ok(())
    }

    /// Program data registers: initial 64-bit value, reset values, reset
    /// siblings, randomization, and the per-counter notify flag.
    pub fn write_pmds(
        &self,
        caller: TaskHandle,
        session: SessionId,
        args: &mut [PmdArg],
    ) -> Result<()> {
        let ctx = self.get(session)?;
        let mut inner = ctx.lock();
        check_access(&inner, caller)?;
        if inner.state == CtxState::Active {
            return Err(PmuError::Busy);
        }
        let desc = self.desc();
        let mask = desc.counter_mask();
        let live_cpu = ctx.owner_cpu();
        for arg in args.iter_mut() {
            arg.flags.remove(RegArgFlags::RETFL_INVALID);
            let reg = arg.reg;
            let writable = desc.is_impl_pmd(reg)
                && matches!(desc.pmds[reg].class, RegClass::Counting | RegClass::Buffer)
                && desc.check_pmd(reg, arg.value);
            if !writable {
                arg.flags.insert(RegArgFlags::RETFL_INVALID);
                return Err(PmuError::InvalidArgument);
            }
            inner.used_pmds.set(reg);
            let counting = desc.is_counting(reg);
            let sc = &mut inner.soft_pmds[reg];
            sc.long_reset = arg.long_reset;
            sc.short_reset = arg.short_reset;
            sc.reset_set = RegSet::from_mask(arg.reset_regs);
            sc.seed = arg.seed;
            sc.rand_mask = arg.rand_mask;
            sc.notify = arg.flags.contains(RegArgFlags::OVFL_NOTIFY);
            sc.randomize = arg.flags.contains(RegArgFlags::RANDOMIZE);
            sc.last_reset = arg.value;
            match live_cpu {
                Some(cpu) if counting => {
                    self.backend().write_pmd(cpu, reg, arg.value & mask);
                    sc.val = arg.value & !mask;
                }
                Some(cpu) => {
                    self.backend().write_pmd(cpu, reg, arg.value);
                    sc.val = arg.value;
                }
                None => sc.val = arg.value,
            }
        }
        Ok(())
    }

    /// Read data registers as full 64-bit virtual values. If the session
    /// is live on another CPU its state is fetched first, so the values
    /// are current, not stale.
    pub fn read_pmds(
        &self,
        caller: TaskHandle,
        cpu: CpuId,
        session: SessionId,
        args: &mut [PmdArg],
    ) -> Result<()> {
        if cpu >= self.num_cpus() {
            return Err(PmuError::InvalidArgument);
        }
        let ctx = self.get(session)?;
        {
            let inner = ctx.lock();
            check_access(&inner, caller)?;
        }
        if let Some(owner_cpu) = ctx.owner_cpu() {
            if owner_cpu != cpu {
                self.fetch_state(session, &ctx);
            }
        }
        let inner = ctx.lock();
        let desc = self.desc();
        let live_cpu = ctx.owner_cpu();
        for arg in args.iter_mut() {
            arg.flags.remove(RegArgFlags::RETFL_INVALID);
            if !desc.is_impl_pmd(arg.reg) || !inner.used_pmds.test(arg.reg) {
                arg.flags.insert(RegArgFlags::RETFL_INVALID);
                return Err(PmuError::InvalidArgument);
            }
            arg.value = read_virtual(self, &inner, live_cpu, arg.reg);
            arg.last_reset = inner.soft_pmds[arg.reg].last_reset;
        }
        Ok(())
    }

    /// Acknowledge an overflow notification and resume counting.
    ///
    /// From the monitored task itself the restart is immediate: long
    /// reset of the overflowed counters, deferred buffer recycle,
    /// unfreeze. From anyone else it is deferred to the monitored task's
    /// next return to user level; with blocking notification this is also
    /// what wakes the blocked task.
    pub fn restart(&self, caller: TaskHandle, session: SessionId) -> Result<()> {
        let ctx = self.get(session)?;
        let mut inner = ctx.lock();
        check_access(&inner, caller)?;
        let buffer_pending = inner.buffer.as_ref().is_some_and(|b| b.reset_pending());
        if inner.state != CtxState::Frozen && !buffer_pending {
            return Err(PmuError::InvalidArgument);
        }
        if inner.owner == Some(caller) {
            let live_cpu = ctx.owner_cpu();
            apply_restart(self, &mut inner, live_cpu);
        } else {
            inner.pending_restart = true;
            if inner.flags.contains(CtxFlags::BLOCKING) {
                if let Some(owner) = inner.owner {
                    if let Some(sem) = self.tasks().semaphore(owner) {
                        sem.post();
                    }
                }
            }
        }
        Ok(())
    }

    /// Tear the session down: flush live state, release every
    /// reservation, and retire the session id. Sample-buffer views handed
    /// out at create keep the buffer memory alive on their own.
    pub fn destroy(&self, caller: TaskHandle, session: SessionId) -> Result<()> {
        let ctx = self.get(session)?;
        {
            let inner = ctx.lock();
            check_access(&inner, caller)?;
        }
        self.teardown_session(session, &ctx);
        log::debug!("session {:?} destroyed", session);
        Ok(())
    }

    /// Flush, release and retire a session unconditionally. Shared by
    /// `destroy` and the task-exit hook.
    pub(crate) fn teardown_session(&self, session: SessionId, ctx: &Arc<Context>) {
        self.exit_flush(session, ctx);

        let mut inner = ctx.lock();
        inner.state = CtxState::Disabled;
        let flags = inner.flags;
        let owner = inner.owner.take();
        let bound_cpu = inner.bound_cpu;
        inner.notify_target = None;
        inner.buffer = None;
        drop(inner);

        if let Some(owner) = owner {
            if flags.contains(CtxFlags::BLOCKING) {
                // Release the monitored task if it is parked waiting for
                // a restart that will never come.
                if let Some(sem) = self.tasks().semaphore(owner) {
                    sem.interrupt();
                }
            }
            self.tasks().detach_session(owner);
            if flags.contains(CtxFlags::SYSTEM_WIDE) {
                self.tasks().unpin(owner);
            }
        }
        if flags.contains(CtxFlags::USING_DBREGS) {
            self.registry()
                .release_watchpoints(flags.contains(CtxFlags::SYSTEM_WIDE));
        }
        match bound_cpu {
            Some(cpu) => self.registry().end_system_session(cpu),
            None => self.registry().end_task_session(),
        }
        self.remove_session(session);
    }

    /// Restrict the session to its owner. Owner-only.
    pub fn protect(&self, caller: TaskHandle, session: SessionId) -> Result<()> {
        let ctx = self.get(session)?;
        let mut inner = ctx.lock();
        if inner.owner != Some(caller) {
            return Err(PmuError::PermissionDenied);
        }
        inner.flags.insert(CtxFlags::PROTECTED);
        Ok(())
    }

    /// Lift the owner-only restriction. Owner-only.
    pub fn unprotect(&self, caller: TaskHandle, session: SessionId) -> Result<()> {
        let ctx = self.get(session)?;
        let mut inner = ctx.lock();
        if inner.owner != Some(caller) {
            return Err(PmuError::PermissionDenied);
        }
        inner.flags.remove(CtxFlags::PROTECTED);
        Ok(())
    }

    /// Reserve the watchpoint registers in `regs` for this session.
    /// `Busy` while the debugging API holds any watchpoints.
    pub fn use_watchpoints(
        &self,
        caller: TaskHandle,
        session: SessionId,
        regs: RegSet,
    ) -> Result<()> {
        let ctx = self.get(session)?;
        let mut inner = ctx.lock();
        check_access(&inner, caller)?;
        if inner.flags.contains(CtxFlags::USING_DBREGS) {
            inner.wp_regs |= regs;
            return Ok(());
        }
        self.registry()
            .reserve_watchpoints(inner.flags.contains(CtxFlags::SYSTEM_WIDE))?;
        inner.flags.insert(CtxFlags::USING_DBREGS);
        inner.wp_regs = regs;
        Ok(())
    }

    /// Drop the session's watchpoint reservation.
    pub fn drop_watchpoints(&self, caller: TaskHandle, session: SessionId) -> Result<()> {
        let ctx = self.get(session)?;
        let mut inner = ctx.lock();
        check_access(&inner, caller)?;
        if !inner.flags.contains(CtxFlags::USING_DBREGS) {
            return Ok(());
        }
        inner.flags.remove(CtxFlags::USING_DBREGS);
        inner.wp_regs = RegSet::EMPTY;
        self.registry()
            .release_watchpoints(inner.flags.contains(CtxFlags::SYSTEM_WIDE));
        Ok(())
    }
}
