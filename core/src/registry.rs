//! # Session Registry
//!
//! Process-wide arbitration between the two monitoring modes: any number
//! of per-task sessions, or system-wide sessions each owning one CPU —
//! never both at once. The registry also arbitrates debug-register
//! (watchpoint) use between the monitoring API and the unrelated
//! debugging API, which are mutually exclusive machine-wide.
//!
//! All mutations run under one lock so every exclusivity check and its
//! matching count update are a single critical section.

use perfmon_hal::CpuId;
use spin::Mutex;

use crate::error::{PmuError, Result};
use crate::task::TaskHandle;

#[derive(Debug)]
struct RegistryState {
    /// Live per-task sessions.
    task_sessions: u32,
    /// Live system-wide sessions.
    system_sessions: u32,
    /// Owning task of each CPU's system-wide session.
    system_owner: Vec<Option<TaskHandle>>,
    /// Watchpoint users via the monitoring API, per-task sessions.
    task_watchpoints: u32,
    /// Watchpoint users via the monitoring API, system-wide sessions.
    system_watchpoints: u32,
    /// Watchpoint users via the debugging API.
    debugger_watchpoints: u32,
}

/// Global session accounting. One instance per [`Monitor`].
///
/// [`Monitor`]: crate::monitor::Monitor
#[derive(Debug)]
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
}

/// Counters snapshot, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub task_sessions: u32,
    pub system_sessions: u32,
    pub monitor_watchpoints: u32,
    pub debugger_watchpoints: u32,
}

impl SessionRegistry {
    pub fn new(num_cpus: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                task_sessions: 0,
                system_sessions: 0,
                system_owner: vec![None; num_cpus],
                task_watchpoints: 0,
                system_watchpoints: 0,
                debugger_watchpoints: 0,
            }),
        }
    }

    /// Account a new per-task session. `Busy` while any system-wide
    /// session exists.
    pub fn begin_task_session(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.system_sessions > 0 {
            log::debug!("registry: task session refused, {} system-wide live", state.system_sessions);
            return Err(PmuError::Busy);
        }
        state.task_sessions += 1;
        Ok(())
    }

    /// Release a per-task session.
    pub fn end_task_session(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.task_sessions > 0);
        state.task_sessions = state.task_sessions.saturating_sub(1);
    }

    /// Account a new system-wide session owning `cpu`. `Busy` while any
    /// per-task session exists or the CPU slot is taken.
    pub fn begin_system_session(&self, cpu: CpuId, owner: TaskHandle) -> Result<()> {
        let mut state = self.state.lock();
        if state.task_sessions > 0 {
            log::debug!("registry: system session refused, {} per-task live", state.task_sessions);
            return Err(PmuError::Busy);
        }
        match state.system_owner.get(cpu) {
            Some(None) => {}
            Some(Some(_)) => return Err(PmuError::Busy),
            None => return Err(PmuError::InvalidArgument),
        }
        state.system_owner[cpu] = Some(owner);
        state.system_sessions += 1;
        Ok(())
    }

    /// Release the system-wide session owning `cpu`.
    pub fn end_system_session(&self, cpu: CpuId) {
        let mut state = self.state.lock();
        if let Some(slot) = state.system_owner.get_mut(cpu) {
            debug_assert!(slot.is_some());
            *slot = None;
        }
        state.system_sessions = state.system_sessions.saturating_sub(1);
    }

    /// The task owning `cpu`'s system-wide session, if any.
    pub fn system_owner(&self, cpu: CpuId) -> Option<TaskHandle> {
        self.state.lock().system_owner.get(cpu).copied().flatten()
    }

    /// Reserve watchpoint registers for a monitoring session. `Busy`
    /// while the debugging API holds any.
    pub fn reserve_watchpoints(&self, for_system_wide: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.debugger_watchpoints > 0 {
            return Err(PmuError::Busy);
        }
        if for_system_wide {
            state.system_watchpoints += 1;
        } else {
            state.task_watchpoints += 1;
        }
        Ok(())
    }

    /// Release a monitoring-API watchpoint reservation.
    pub fn release_watchpoints(&self, for_system_wide: bool) {
        let mut state = self.state.lock();
        if for_system_wide {
            state.system_watchpoints = state.system_watchpoints.saturating_sub(1);
        } else {
            state.task_watchpoints = state.task_watchpoints.saturating_sub(1);
        }
    }

    /// Claim watchpoint registers on behalf of the debugging API. `Busy`
    /// while any monitoring session holds them.
    pub fn claim_debugger(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.task_watchpoints + state.system_watchpoints > 0 {
            return Err(PmuError::Busy);
        }
        state.debugger_watchpoints += 1;
        Ok(())
    }

    /// Release a debugging-API watchpoint claim.
    pub fn release_debugger(&self) {
        let mut state = self.state.lock();
        state.debugger_watchpoints = state.debugger_watchpoints.saturating_sub(1);
    }

    /// Current counters.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.lock();
        RegistrySnapshot {
            task_sessions: state.task_sessions,
            system_sessions: state.system_sessions,
            monitor_watchpoints: state.task_watchpoints + state.system_watchpoints,
            debugger_watchpoints: state.debugger_watchpoints,
        }
    }
}
