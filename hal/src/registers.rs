//! # Counter Register Model
//!
//! Static description of a platform's PMU register file: which control
//! (PMC) and data (PMD) registers are implemented, their class, the
//! dependency masks tying control registers to the data registers they
//! drive, and optional per-register write checkers.
//!
//! The core consumes this model read-only.

// =============================================================================
// Register Classes
// =============================================================================

/// What a PMU register is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegClass {
    /// Global control register (privilege masks, enables).
    Control,
    /// Control register selecting the event a paired counter measures.
    MonitorSelect,
    /// Counting data register, extended to 64 bits in software.
    Counting,
    /// Data register backing a hardware capture buffer (not a counter).
    Buffer,
}

/// Per-register write validator.
///
/// Runs before any hardware write of the register. Returning `false`
/// rejects the value without touching hardware.
pub type WriteChecker = fn(desc: &PmuDescription, reg: usize, value: u64) -> bool;

// =============================================================================
// Register Descriptors
// =============================================================================

/// Description of a single PMU register.
#[derive(Debug, Clone, Copy)]
pub struct RegisterDesc {
    /// Register class.
    pub class: RegClass,
    /// For control registers: mask of data registers driven by this one.
    /// Zero for data registers.
    pub dependents: u64,
    /// Platform reset value.
    pub reset_value: u64,
    /// Optional write checker.
    pub checker: Option<WriteChecker>,
}

impl RegisterDesc {
    /// A register with no dependents, zero reset value and no checker.
    pub const fn plain(class: RegClass) -> Self {
        Self {
            class,
            dependents: 0,
            reset_value: 0,
            checker: None,
        }
    }
}

// =============================================================================
// PMU Description
// =============================================================================

/// Complete register-file description for one platform.
///
/// Register numbers index into `pmcs`/`pmds`; the `impl_*` masks mark
/// which of those slots are actually populated on this platform.
#[derive(Debug, Clone)]
pub struct PmuDescription {
    /// Platform name, for diagnostics.
    pub name: &'static str,
    /// Number of logical CPUs the backend exposes.
    pub num_cpus: usize,
    /// Width of the hardware counting registers, in bits.
    pub counter_width: u32,
    /// Control-register descriptors.
    pub pmcs: Vec<RegisterDesc>,
    /// Data-register descriptors.
    pub pmds: Vec<RegisterDesc>,
    /// Mask of implemented control registers.
    pub impl_pmcs: u64,
    /// Mask of implemented data registers.
    pub impl_pmds: u64,
}

impl PmuDescription {
    /// Mask covering the value bits of a hardware counting register.
    #[inline]
    pub fn counter_mask(&self) -> u64 {
        if self.counter_width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.counter_width) - 1
        }
    }

    /// Is control register `reg` implemented?
    #[inline]
    pub fn is_impl_pmc(&self, reg: usize) -> bool {
        reg < 64 && self.impl_pmcs & (1 << reg) != 0
    }

    /// Is data register `reg` implemented?
    #[inline]
    pub fn is_impl_pmd(&self, reg: usize) -> bool {
        reg < 64 && self.impl_pmds & (1 << reg) != 0
    }

    /// Is data register `reg` a counting register?
    #[inline]
    pub fn is_counting(&self, reg: usize) -> bool {
        self.is_impl_pmd(reg) && self.pmds[reg].class == RegClass::Counting
    }

    /// Mask of all implemented counting data registers.
    pub fn counting_pmds(&self) -> u64 {
        let mut mask = 0;
        for (i, desc) in self.pmds.iter().enumerate() {
            if self.is_impl_pmd(i) && desc.class == RegClass::Counting {
                mask |= 1 << i;
            }
        }
        mask
    }

    /// Run the write checker for control register `reg`, if any.
    pub fn check_pmc(&self, reg: usize, value: u64) -> bool {
        match self.pmcs.get(reg).and_then(|d| d.checker) {
            Some(checker) => checker(self, reg, value),
            None => true,
        }
    }

    /// Run the write checker for data register `reg`, if any.
    pub fn check_pmd(&self, reg: usize, value: u64) -> bool {
        match self.pmds.get(reg).and_then(|d| d.checker) {
            Some(checker) => checker(self, reg, value),
            None => true,
        }
    }
}
