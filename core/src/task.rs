//! # Task Table
//!
//! Monitored tasks are registered by the embedding environment and
//! referenced everywhere else through [`TaskHandle`] — an arena index plus
//! a generation counter. A handle whose generation no longer matches its
//! slot refers to a task that has exited; every use re-validates, so the
//! notification path can never dereference a half-torn-down task.
//!
//! Each live task row carries the pieces of the notification protocol
//! that belong to the task rather than to a context: the signal mailbox,
//! the blocking-notification semaphore, the deferred block/restart marks,
//! and the CPU pinning used by system-wide sessions.

use std::sync::Arc;

use perfmon_hal::CpuId;
use spin::RwLock;

use crate::error::{PmuError, Result};
use crate::monitor::SessionId;
use crate::sync::Semaphore;

/// Signal number used for overflow notification delivery.
pub const OVERFLOW_SIGNAL: u32 = 27; // SIGPROF

/// Weak reference to a monitored task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    index: u32,
    generation: u32,
}

impl TaskHandle {
    /// Stable numeric id, used as the pid in sample records and signal
    /// payloads.
    #[inline]
    pub fn pid(self) -> u32 {
        self.index
    }
}

/// Payload of an overflow notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowSignal {
    /// Always [`OVERFLOW_SIGNAL`].
    pub signal: u32,
    /// Pid of the task whose counters overflowed.
    pub sender: u32,
    /// Mask of the counting registers that overflowed.
    pub ovfl_regs: u64,
}

#[derive(Debug)]
struct TaskState {
    mailbox: Vec<OverflowSignal>,
    semaphore: Arc<Semaphore>,
    pinned: Option<CpuId>,
    block_pending: bool,
    session: Option<SessionId>,
}

impl TaskState {
    fn new() -> Self {
        Self {
            mailbox: Vec::new(),
            semaphore: Arc::new(Semaphore::new()),
            pinned: None,
            block_pending: false,
            session: None,
        }
    }
}

#[derive(Debug)]
struct TaskSlot {
    generation: u32,
    state: Option<TaskState>,
}

/// Arena of monitored tasks.
#[derive(Debug, Default)]
pub struct TaskTable {
    slots: RwLock<Vec<TaskSlot>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task, reusing a dead slot if one exists.
    pub fn register(&self) -> TaskHandle {
        let mut slots = self.slots.write();
        if let Some(index) = slots.iter().position(|s| s.state.is_none()) {
            let slot = &mut slots[index];
            slot.generation += 1;
            slot.state = Some(TaskState::new());
            return TaskHandle {
                index: index as u32,
                generation: slot.generation,
            };
        }
        slots.push(TaskSlot {
            generation: 0,
            state: Some(TaskState::new()),
        });
        TaskHandle {
            index: (slots.len() - 1) as u32,
            generation: 0,
        }
    }

    /// Tear a task down. Its generation is bumped, so outstanding handles
    /// become stale; a bumped generation is what the notification sender
    /// observes as "target gone".
    pub fn unregister(&self, task: TaskHandle) -> bool {
        let mut slots = self.slots.write();
        match slots.get_mut(task.index as usize) {
            Some(slot) if slot.generation == task.generation && slot.state.is_some() => {
                if let Some(state) = slot.state.take() {
                    // Abort any blocked wait so the exiting task is not
                    // stuck on a notification that will never come.
                    state.semaphore.interrupt();
                }
                slot.generation += 1;
                true
            }
            _ => false,
        }
    }

    /// Does `task` still refer to a live task?
    pub fn is_live(&self, task: TaskHandle) -> bool {
        let slots = self.slots.read();
        matches!(
            slots.get(task.index as usize),
            Some(slot) if slot.generation == task.generation && slot.state.is_some()
        )
    }

    fn with_state<T>(&self, task: TaskHandle, f: impl FnOnce(&mut TaskState) -> T) -> Result<T> {
        let mut slots = self.slots.write();
        match slots.get_mut(task.index as usize) {
            Some(slot) if slot.generation == task.generation => match slot.state.as_mut() {
                Some(state) => Ok(f(state)),
                None => Err(PmuError::NotFound),
            },
            _ => Err(PmuError::NotFound),
        }
    }

    /// Deliver an overflow signal. Fails when the handle is stale.
    pub fn send_signal(&self, task: TaskHandle, signal: OverflowSignal) -> Result<()> {
        self.with_state(task, |state| state.mailbox.push(signal))
    }

    /// Drain the task's delivered signals.
    pub fn take_signals(&self, task: TaskHandle) -> Vec<OverflowSignal> {
        self.with_state(task, |state| core::mem::take(&mut state.mailbox))
            .unwrap_or_default()
    }

    /// Pin the task to `cpu`. Fails if already pinned elsewhere.
    pub fn pin(&self, task: TaskHandle, cpu: CpuId) -> Result<()> {
        self.with_state(task, |state| match state.pinned {
            Some(existing) if existing != cpu => Err(PmuError::InvalidArgument),
            _ => {
                state.pinned = Some(cpu);
                Ok(())
            }
        })?
    }

    /// Remove the task's pinning.
    pub fn unpin(&self, task: TaskHandle) {
        let _ = self.with_state(task, |state| state.pinned = None);
    }

    /// Where the task is pinned, if anywhere.
    pub fn pinned(&self, task: TaskHandle) -> Option<CpuId> {
        self.with_state(task, |state| state.pinned).ok().flatten()
    }

    /// Mark the task to block on its next return to user level.
    pub fn set_block_pending(&self, task: TaskHandle) {
        let _ = self.with_state(task, |state| state.block_pending = true);
    }

    /// Consume the deferred-block mark.
    pub fn take_block_pending(&self, task: TaskHandle) -> bool {
        self.with_state(task, |state| core::mem::replace(&mut state.block_pending, false))
            .unwrap_or(false)
    }

    /// The task's blocking-notification semaphore.
    pub fn semaphore(&self, task: TaskHandle) -> Option<Arc<Semaphore>> {
        self.with_state(task, |state| Arc::clone(&state.semaphore)).ok()
    }

    /// Attach a session to the task. Fails `Busy` if one is attached.
    pub fn attach_session(&self, task: TaskHandle, session: SessionId) -> Result<()> {
        self.with_state(task, |state| match state.session {
            Some(_) => Err(PmuError::Busy),
            None => {
                state.session = Some(session);
                Ok(())
            }
        })?
    }

    /// Detach the task's session, if any.
    pub fn detach_session(&self, task: TaskHandle) {
        let _ = self.with_state(task, |state| state.session = None);
    }

    /// The session attached to the task.
    pub fn session_of(&self, task: TaskHandle) -> Option<SessionId> {
        self.with_state(task, |state| state.session).ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handles_are_rejected() {
        let table = TaskTable::new();
        let t = table.register();
        assert!(table.is_live(t));

        assert!(table.unregister(t));
        assert!(!table.is_live(t));
        assert_eq!(
            table.send_signal(
                t,
                OverflowSignal {
                    signal: OVERFLOW_SIGNAL,
                    sender: 0,
                    ovfl_regs: 0,
                }
            ),
            Err(PmuError::NotFound)
        );

        // Slot reuse bumps the generation; the old handle stays dead.
        let t2 = table.register();
        assert_eq!(t.pid(), t2.pid());
        assert!(!table.is_live(t));
        assert!(table.is_live(t2));
    }

    #[test]
    fn signals_queue_and_drain() {
        let table = TaskTable::new();
        let t = table.register();
        let sig = OverflowSignal {
            signal: OVERFLOW_SIGNAL,
            sender: 7,
            ovfl_regs: 1 << 4,
        };
        table.send_signal(t, sig).unwrap();
        table.send_signal(t, sig).unwrap();
        assert_eq!(table.take_signals(t), vec![sig, sig]);
        assert!(table.take_signals(t).is_empty());
    }

    #[test]
    fn pinning_conflicts_are_rejected() {
        let table = TaskTable::new();
        let t = table.register();
        table.pin(t, 2).unwrap();
        assert_eq!(table.pin(t, 3), Err(PmuError::InvalidArgument));
        table.pin(t, 2).unwrap();
        table.unpin(t);
        table.pin(t, 3).unwrap();
        assert_eq!(table.pinned(t), Some(3));
    }

    #[test]
    fn one_session_per_task() {
        let table = TaskTable::new();
        let t = table.register();
        table.attach_session(t, SessionId::for_tests(0, 0)).unwrap();
        assert_eq!(
            table.attach_session(t, SessionId::for_tests(1, 0)),
            Err(PmuError::Busy)
        );
        table.detach_session(t);
        table.attach_session(t, SessionId::for_tests(1, 0)).unwrap();
    }
}
