//! # Performance-Monitoring Core
//!
//! Hardware-counter session management over a [`perfmon_hal::PmuBackend`]:
//! a global registry arbitrating per-task and system-wide sessions,
//! per-context lazy save/restore of PMU state across CPUs, interrupt-time
//! overflow handling extending hardware counters to 64 bits, ring-buffer
//! sampling, and overflow notification that stays safe across target
//! teardown.
//!
//! The embedding environment registers tasks, drives the context-switch
//! and interrupt hooks on [`Monitor`], and exposes the session operations
//! to its users.

pub mod command;
pub mod context;
pub mod error;
pub mod monitor;
pub mod overflow;
mod ownership;
pub mod registry;
pub mod regset;
pub mod sampling;
pub mod session;
pub mod sync;
pub mod task;

#[cfg(test)]
mod scenario_tests;

pub use command::{ArgCount, Command, CommandOutput, CommandSpec};
pub use context::{CtxFlags, CtxState};
pub use error::{PmuError, Result};
pub use monitor::{global, init_global, Monitor, SessionId, MAX_SESSIONS};
pub use overflow::FreezeAction;
pub use registry::{RegistrySnapshot, SessionRegistry};
pub use regset::RegSet;
pub use sampling::{
    SampleEntry, SampleHeader, SampleRecord, SampleView, MAX_SAMPLE_ENTRIES,
    SAMPLE_FORMAT_VERSION,
};
pub use session::{CreateRequest, CreateResponse, PmcArg, PmdArg, RegArgFlags};
pub use task::{OverflowSignal, TaskHandle, TaskTable, OVERFLOW_SIGNAL};
