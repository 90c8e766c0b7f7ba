//! # Monitor
//!
//! The root object: the hardware backend, the session slab, the task
//! table, the per-CPU owner table and the global session registry, tied
//! together with the hooks the embedding environment calls on task
//! lifecycle events, context switches and overflow interrupts.
//!
//! Sessions are referenced by [`SessionId`], an index into the slab plus
//! a generation counter; a destroyed session's id goes stale instead of
//! dangling.

use core::fmt;
use std::sync::Arc;

use perfmon_hal::{CpuId, PmuBackend, PmuDescription, Tunables, STATUS_FREEZE};
use spin::{Once, RwLock};

use crate::context::{Context, CtxFlags, CtxState};
use crate::error::{PmuError, Result};
use crate::overflow::FreezeAction;
use crate::ownership::OwnerTable;
use crate::registry::SessionRegistry;
use crate::session::apply_restart;
use crate::sync::WaitOutcome;
use crate::task::{TaskHandle, TaskTable};

/// Hard cap on concurrently live sessions.
pub const MAX_SESSIONS: usize = 4096;

/// Weak reference to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    index: u32,
    generation: u32,
}

impl SessionId {
    /// Placeholder id that matches no slot.
    pub(crate) fn invalid() -> Self {
        Self {
            index: u32::MAX,
            generation: u32::MAX,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

#[derive(Debug)]
struct SessionSlot {
    generation: u32,
    ctx: Option<Arc<Context>>,
}

// =============================================================================
// Monitor
// =============================================================================

/// One performance-monitoring domain over one PMU backend.
pub struct Monitor {
    backend: Arc<dyn PmuBackend>,
    tunables: Arc<Tunables>,
    registry: SessionRegistry,
    tasks: TaskTable,
    owners: OwnerTable,
    sessions: RwLock<Vec<SessionSlot>>,
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("pmu", &self.desc().name)
            .field("num_cpus", &self.num_cpus())
            .finish_non_exhaustive()
    }
}

impl Monitor {
    pub fn new(backend: Arc<dyn PmuBackend>, tunables: Arc<Tunables>) -> Self {
        let num_cpus = backend.description().num_cpus;
        log::debug!(
            "monitor: {} cpus, pmu \"{}\"",
            num_cpus,
            backend.description().name
        );
        Self {
            registry: SessionRegistry::new(num_cpus),
            tasks: TaskTable::new(),
            owners: OwnerTable::new(num_cpus),
            sessions: RwLock::new(Vec::new()),
            backend,
            tunables,
        }
    }

    pub fn backend(&self) -> &dyn PmuBackend {
        &*self.backend
    }

    pub(crate) fn desc(&self) -> &PmuDescription {
        self.backend.description()
    }

    pub fn num_cpus(&self) -> usize {
        self.desc().num_cpus
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub(crate) fn owners(&self) -> &OwnerTable {
        &self.owners
    }

    // -------------------------------------------------------------------------
    // Session slab
    // -------------------------------------------------------------------------

    pub(crate) fn insert_session(&self, ctx: Arc<Context>) -> Result<SessionId> {
        let mut slots = self.sessions.write();
        if let Some(index) = slots.iter().position(|s| s.ctx.is_none()) {
            let slot = &mut slots[index];
            slot.generation += 1;
            slot.ctx = Some(ctx);
            return Ok(SessionId {
                index: index as u32,
                generation: slot.generation,
            });
        }
        if slots.len() >= MAX_SESSIONS {
            return Err(PmuError::ResourceExhausted);
        }
        slots.push(SessionSlot {
            generation: 0,
            ctx: Some(ctx),
        });
        Ok(SessionId {
            index: (slots.len() - 1) as u32,
            generation: 0,
        })
    }

    pub(crate) fn get(&self, session: SessionId) -> Result<Arc<Context>> {
        let slots = self.sessions.read();
        match slots.get(session.index as usize) {
            Some(slot) if slot.generation == session.generation => {
                slot.ctx.clone().ok_or(PmuError::NotFound)
            }
            _ => Err(PmuError::NotFound),
        }
    }

    pub(crate) fn remove_session(&self, session: SessionId) {
        let mut slots = self.sessions.write();
        if let Some(slot) = slots.get_mut(session.index as usize) {
            if slot.generation == session.generation {
                slot.ctx = None;
                slot.generation += 1;
            }
        }
    }

    /// Current state of a session, for diagnostics.
    pub fn session_state(&self, session: SessionId) -> Result<CtxState> {
        Ok(self.get(session)?.lock().state)
    }

    // -------------------------------------------------------------------------
    // Task lifecycle hooks
    // -------------------------------------------------------------------------

    /// Register a task with the monitoring layer.
    pub fn register_task(&self) -> TaskHandle {
        self.tasks.register()
    }

    /// Hook for task termination: the task's session, if any, is flushed
    /// and torn down without notification, and the handle goes stale.
    pub fn task_exit(&self, task: TaskHandle) {
        if let Some(session) = self.tasks.session_of(task) {
            if let Ok(ctx) = self.get(session) {
                self.teardown_session(session, &ctx);
            }
        }
        self.tasks.unregister(task);
    }

    /// Hook for fork: registers the child and, when the parent's session
    /// asks for inheritance, clones the session configuration onto the
    /// child with counters re-armed from their long reset values.
    pub fn task_fork(&self, parent: TaskHandle) -> Result<TaskHandle> {
        let child = self.tasks.register();
        let Some(session) = self.tasks.session_of(parent) else {
            return Ok(child);
        };
        let Ok(ctx) = self.get(session) else {
            return Ok(child);
        };

        let src = ctx.lock();
        if src.flags.contains(CtxFlags::SYSTEM_WIDE)
            || !src
                .flags
                .intersects(CtxFlags::INHERIT_ONCE | CtxFlags::INHERIT_ALL)
        {
            return Ok(child);
        }
        let mut flags = src.flags;
        // One-shot inheritance stops at the first generation.
        flags.remove(CtxFlags::INHERIT_ONCE);

        self.registry.begin_task_session()?;
        if flags.contains(CtxFlags::USING_DBREGS) {
            if let Err(err) = self.registry.reserve_watchpoints(false) {
                self.registry.end_task_session();
                return Err(err);
            }
        }

        let desc = self.desc();
        let child_ctx = Arc::new(Context::new(
            desc,
            child,
            flags,
            src.notify_target,
            src.smpl_pmds,
            src.buffer.clone(),
        ));
        {
            let mut dst = child_ctx.lock();
            dst.pmcs = src.pmcs.clone();
            dst.used_pmds = src.used_pmds;
            dst.used_pmcs = src.used_pmcs;
            dst.reload_pmds = src.used_pmds;
            dst.reload_pmcs = src.used_pmcs;
            dst.wp_regs = src.wp_regs;
            for (reg, sc) in dst.soft_pmds.iter_mut().enumerate() {
                *sc = src.soft_pmds[reg].clone();
                if src.used_pmds.test(reg) && desc.is_counting(reg) {
                    // The child counts its own events from scratch.
                    sc.val = sc.long_reset;
                    sc.last_reset = sc.long_reset;
                }
            }
            dst.state = match src.state {
                CtxState::Active => CtxState::Active,
                CtxState::Ready => CtxState::Ready,
                CtxState::Disabled | CtxState::Frozen => CtxState::Disabled,
            };
            dst.saved_psr = dst.state == CtxState::Active;
        }
        drop(src);

        let child_session = match self.insert_session(child_ctx) {
            Ok(id) => id,
            Err(err) => {
                if flags.contains(CtxFlags::USING_DBREGS) {
                    self.registry.release_watchpoints(false);
                }
                self.registry.end_task_session();
                return Err(err);
            }
        };
        self.tasks.attach_session(child, child_session)?;
        log::debug!(
            "fork: pid {} inherited session {:?} as {:?}",
            parent.pid(),
            session,
            child_session
        );
        Ok(child)
    }

    // -------------------------------------------------------------------------
    // Context-switch hooks
    // -------------------------------------------------------------------------

    /// Hook for a task being scheduled out of `cpu`. Monitoring stops;
    /// the registers stay put for the lazy-save protocol.
    pub fn switch_out(&self, task: TaskHandle, cpu: CpuId) {
        let Some(session) = self.tasks.session_of(task) else {
            return;
        };
        let Ok(ctx) = self.get(session) else {
            return;
        };
        if ctx.lock().flags.contains(CtxFlags::SYSTEM_WIDE) {
            return;
        }
        if ctx.owner_cpu() == Some(cpu) {
            self.backend.set_monitoring(cpu, false);
        }
    }

    /// Hook for a task being scheduled onto `cpu`. The task's session, if
    /// bound to hardware, is made live here, and any deferred restart is
    /// applied.
    pub fn switch_in(&self, task: TaskHandle, cpu: CpuId) {
        let Some(session) = self.tasks.session_of(task) else {
            return;
        };
        let Ok(ctx) = self.get(session) else {
            return;
        };
        {
            let inner = ctx.lock();
            if inner.flags.contains(CtxFlags::SYSTEM_WIDE) || inner.state == CtxState::Disabled {
                return;
            }
        }
        self.reload(session, &ctx, cpu);
        let mut inner = ctx.lock();
        if inner.pending_restart {
            inner.pending_restart = false;
            apply_restart(self, &mut inner, Some(cpu));
        }
    }

    /// Hook for the task's return to user level: parks the task while a
    /// blocking notification awaits its restart, then applies any
    /// deferred restart.
    pub fn return_to_user(&self, task: TaskHandle) {
        if self.tasks.take_block_pending(task) {
            if let Some(sem) = self.tasks.semaphore(task) {
                match sem.wait() {
                    WaitOutcome::Posted => {}
                    WaitOutcome::Interrupted => return,
                }
            }
        }
        let Some(session) = self.tasks.session_of(task) else {
            return;
        };
        let Ok(ctx) = self.get(session) else {
            return;
        };
        let mut inner = ctx.lock();
        if inner.pending_restart {
            inner.pending_restart = false;
            let live_cpu = ctx.owner_cpu();
            apply_restart(self, &mut inner, live_cpu);
        }
    }

    // -------------------------------------------------------------------------
    // Interrupt hook
    // -------------------------------------------------------------------------

    /// Hook for the PMU overflow interrupt on `cpu`.
    ///
    /// Reads and consumes the overflow status word; spurious interrupts
    /// (no overflow bits, or no owning session) are cleared and logged.
    pub fn handle_interrupt(&self, cpu: CpuId, ip: u64) -> Option<FreezeAction> {
        let status = self.backend.read_status(cpu);
        if status & !STATUS_FREEZE == 0 {
            if status != 0 {
                self.backend.write_status(cpu, 0);
            }
            return None;
        }
        let Some(session) = self.owners.owner(cpu) else {
            log::warn!("cpu{}: overflow without owner, status {:#x}", cpu, status);
            self.backend.write_status(cpu, 0);
            return None;
        };
        let Ok(ctx) = self.get(session) else {
            log::warn!("cpu{}: overflow for dead session", cpu);
            self.owners.clear_if(cpu, session);
            self.backend.write_status(cpu, 0);
            return None;
        };
        Some(self.run_overflow(&ctx, cpu, status, ip))
    }
}

// =============================================================================
// Global instance
// =============================================================================

static MONITOR: Once<Monitor> = Once::new();

/// Install the process-wide monitor. First call wins; later calls return
/// the existing instance.
pub fn init_global(backend: Arc<dyn PmuBackend>, tunables: Arc<Tunables>) -> &'static Monitor {
    MONITOR.call_once(|| Monitor::new(backend, tunables))
}

/// The process-wide monitor, if installed.
pub fn global() -> Option<&'static Monitor> {
    MONITOR.get()
}
