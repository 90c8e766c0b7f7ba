//! # PMU Backend Capability Trait
//!
//! The register access capability the core drives hardware through:
//! read/write of individual PMC/PMD registers, the overflow status word,
//! the monitoring control bit, and a per-CPU monotonic timestamp.
//!
//! All operations take an explicit CPU so the core can act on a remote
//! CPU's register image during the cross-CPU handover protocol. Reads of
//! unimplemented registers return zero and writes to them are dropped;
//! validation against the register model happens above this layer.

use crate::registers::PmuDescription;
use crate::CpuId;

/// Freeze indicator bit of the overflow status word.
///
/// The remaining bits mark which counting data registers have a pending
/// unconsumed overflow.
pub const STATUS_FREEZE: u64 = 1 << 0;

/// Register access capability implemented per platform.
pub trait PmuBackend: Send + Sync {
    /// The register model this backend implements.
    fn description(&self) -> &PmuDescription;

    /// Read control register `reg` on `cpu`.
    fn read_pmc(&self, cpu: CpuId, reg: usize) -> u64;

    /// Write control register `reg` on `cpu`.
    fn write_pmc(&self, cpu: CpuId, reg: usize, value: u64);

    /// Read data register `reg` on `cpu`.
    fn read_pmd(&self, cpu: CpuId, reg: usize) -> u64;

    /// Write data register `reg` on `cpu`. Counting registers hold only
    /// the low `counter_width` bits of the value.
    fn write_pmd(&self, cpu: CpuId, reg: usize, value: u64);

    /// Read the overflow status word of `cpu`.
    fn read_status(&self, cpu: CpuId) -> u64;

    /// Write the overflow status word of `cpu`. Writing zero clears all
    /// pending overflow bits and unfreezes the PMU.
    fn write_status(&self, cpu: CpuId, value: u64);

    /// Set or clear the monitoring-active control bit of `cpu`.
    fn set_monitoring(&self, cpu: CpuId, active: bool);

    /// Current state of the monitoring-active control bit of `cpu`.
    fn monitoring(&self, cpu: CpuId) -> bool;

    /// Reset every implemented register of `cpu` to its platform reset
    /// value, clear the status word and stop monitoring.
    fn reset_registers(&self, cpu: CpuId);

    /// Monotonic per-CPU timestamp, used to order sample records.
    fn timestamp(&self, cpu: CpuId) -> u64;
}
