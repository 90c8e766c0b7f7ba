//! # Perfmon Hardware Abstraction Layer
//!
//! Platform-facing half of the perfmon subsystem:
//!
//! - The counter register model: which PMU registers exist, their class,
//!   their dependency masks, and their write-checker callbacks.
//! - The [`PmuBackend`] capability trait the core drives hardware through.
//! - A software-simulated PMU ([`SimPmu`]) for tests and for embedders
//!   without privileged counter access.
//! - Externally-owned tunables the core reads but does not own.
//!
//! The core never depends on a specific register encoding or access
//! mechanism; everything hardware-shaped goes through this crate.

pub mod backend;
pub mod registers;
pub mod sim;
pub mod tunables;

pub use backend::{PmuBackend, STATUS_FREEZE};
pub use registers::{PmuDescription, RegClass, RegisterDesc};
pub use sim::SimPmu;
pub use tunables::Tunables;

/// Logical CPU identifier.
pub type CpuId = usize;
