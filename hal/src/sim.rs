//! # Simulated PMU Backend
//!
//! A software register file implementing [`PmuBackend`], one image per
//! simulated CPU. Used by the test suite and by embedders that want the
//! session machinery without privileged hardware access.
//!
//! The simulated platform models a small in-order PMU:
//!
//! - PMC0..PMC3: global control registers
//! - PMC4..PMC7: monitor-select registers, each driving the PMD with the
//!   same number
//! - PMD4..PMD7: counting registers, `counter_width` bits wide
//! - PMD8..PMD11: capture-buffer registers
//!
//! Counting past the hardware width wraps the register, records the
//! overflow in the status word and freezes the PMU, exactly as a real
//! interrupt-raising PMU would.

use spin::Mutex;

use crate::backend::{PmuBackend, STATUS_FREEZE};
use crate::registers::{PmuDescription, RegClass, RegisterDesc};
use crate::CpuId;

/// Default width of the simulated counting registers.
pub const SIM_COUNTER_WIDTH: u32 = 47;

/// Monitor-select registers only accept event/privilege bits in the low
/// halfword; everything above is reserved.
const MONITOR_SELECT_VALID: u64 = 0xffff;

fn check_monitor_select(_desc: &PmuDescription, _reg: usize, value: u64) -> bool {
    value & !MONITOR_SELECT_VALID == 0
}

/// Register image of one simulated CPU.
#[derive(Debug)]
struct CpuRegs {
    pmcs: Vec<u64>,
    pmds: Vec<u64>,
    status: u64,
    monitoring: bool,
    clock: u64,
}

/// Software PMU with one register image per CPU.
#[derive(Debug)]
pub struct SimPmu {
    desc: PmuDescription,
    cpus: Vec<Mutex<CpuRegs>>,
}

impl SimPmu {
    /// Build a simulated PMU with `num_cpus` register images and the
    /// default counter width.
    pub fn new(num_cpus: usize) -> Self {
        Self::with_width(num_cpus, SIM_COUNTER_WIDTH)
    }

    /// Build a simulated PMU with an explicit counter width.
    pub fn with_width(num_cpus: usize, counter_width: u32) -> Self {
        let desc = Self::describe(num_cpus, counter_width);
        let cpus = (0..num_cpus)
            .map(|_| {
                Mutex::new(CpuRegs {
                    pmcs: vec![0; desc.pmcs.len()],
                    pmds: vec![0; desc.pmds.len()],
                    status: 0,
                    monitoring: false,
                    clock: 0,
                })
            })
            .collect();
        Self { desc, cpus }
    }

    fn describe(num_cpus: usize, counter_width: u32) -> PmuDescription {
        let mut pmcs = Vec::with_capacity(8);
        for _ in 0..4 {
            pmcs.push(RegisterDesc::plain(RegClass::Control));
        }
        for i in 4..8usize {
            pmcs.push(RegisterDesc {
                class: RegClass::MonitorSelect,
                dependents: 1 << i,
                reset_value: 0,
                checker: Some(check_monitor_select),
            });
        }

        let mut pmds = Vec::with_capacity(12);
        for _ in 0..4 {
            // PMD0..PMD3 are not populated on this platform.
            pmds.push(RegisterDesc::plain(RegClass::Buffer));
        }
        for _ in 4..8 {
            pmds.push(RegisterDesc::plain(RegClass::Counting));
        }
        for _ in 8..12 {
            pmds.push(RegisterDesc::plain(RegClass::Buffer));
        }

        PmuDescription {
            name: "sim",
            num_cpus,
            counter_width,
            pmcs,
            pmds,
            impl_pmcs: 0xff,
            impl_pmds: 0xff0,
        }
    }

    /// Advance counting register `reg` on `cpu` by `delta` events.
    ///
    /// Returns whether the events were applied; a frozen or stopped PMU
    /// drops them. Counting past the hardware width wraps the register,
    /// records the overflow in the status word and freezes the PMU.
    pub fn tick(&self, cpu: CpuId, reg: usize, delta: u64) -> bool {
        if !self.desc.is_counting(reg) {
            return false;
        }
        let mask = self.desc.counter_mask();
        let mut regs = self.cpus[cpu].lock();
        if regs.status & STATUS_FREEZE != 0 || !regs.monitoring {
            return false;
        }
        let old = regs.pmds[reg] & mask;
        let new = old.wrapping_add(delta) & mask;
        regs.pmds[reg] = new;
        if new < old || delta > mask - old {
            regs.status |= (1 << reg) | STATUS_FREEZE;
        }
        true
    }

    /// Force a pending overflow for the counting registers in `regs_mask`,
    /// freezing the PMU. Simulates the state an overflow interrupt finds.
    pub fn raise_overflow(&self, cpu: CpuId, regs_mask: u64) {
        let mut regs = self.cpus[cpu].lock();
        regs.status |= (regs_mask & !STATUS_FREEZE) | STATUS_FREEZE;
        log::trace!("sim: cpu{} overflow raised, status={:#x}", cpu, regs.status);
    }
}

impl PmuBackend for SimPmu {
    fn description(&self) -> &PmuDescription {
        &self.desc
    }

    fn read_pmc(&self, cpu: CpuId, reg: usize) -> u64 {
        if !self.desc.is_impl_pmc(reg) {
            return 0;
        }
        self.cpus[cpu].lock().pmcs[reg]
    }

    fn write_pmc(&self, cpu: CpuId, reg: usize, value: u64) {
        if !self.desc.is_impl_pmc(reg) {
            return;
        }
        self.cpus[cpu].lock().pmcs[reg] = value;
    }

    fn read_pmd(&self, cpu: CpuId, reg: usize) -> u64 {
        if !self.desc.is_impl_pmd(reg) {
            return 0;
        }
        self.cpus[cpu].lock().pmds[reg]
    }

    fn write_pmd(&self, cpu: CpuId, reg: usize, value: u64) {
        if !self.desc.is_impl_pmd(reg) {
            return;
        }
        let value = if self.desc.is_counting(reg) {
            value & self.desc.counter_mask()
        } else {
            value
        };
        self.cpus[cpu].lock().pmds[reg] = value;
    }

    fn read_status(&self, cpu: CpuId) -> u64 {
        self.cpus[cpu].lock().status
    }

    fn write_status(&self, cpu: CpuId, value: u64) {
        self.cpus[cpu].lock().status = value;
    }

    fn set_monitoring(&self, cpu: CpuId, active: bool) {
        self.cpus[cpu].lock().monitoring = active;
    }

    fn monitoring(&self, cpu: CpuId) -> bool {
        self.cpus[cpu].lock().monitoring
    }

    fn reset_registers(&self, cpu: CpuId) {
        let mut regs = self.cpus[cpu].lock();
        for (i, desc) in self.desc.pmcs.iter().enumerate() {
            regs.pmcs[i] = desc.reset_value;
        }
        for (i, desc) in self.desc.pmds.iter().enumerate() {
            regs.pmds[i] = desc.reset_value;
        }
        regs.status = 0;
        regs.monitoring = false;
    }

    fn timestamp(&self, cpu: CpuId) -> u64 {
        let mut regs = self.cpus[cpu].lock();
        regs.clock += 1;
        regs.clock
    }
}
