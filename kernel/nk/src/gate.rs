//! Privileged register loads
//!
//! Every write to CR0, CR3, CR4 or a model specific register made on behalf of the outer kernel
//! goes through a [`RegisterGate`].

use kernel_arch_x86_64::{
    cpu_info::CpuFeatures,
    paging::PAddr,
    registers::{ControlRegisters, Cr0, Cr4},
};
use log::trace;

use crate::{frame::FrameTable, policy};

pub struct RegisterGate<'a, R: ControlRegisters> {
    registers: &'a mut R,
    frames: &'a mut FrameTable,
    features: CpuFeatures,
    initialized: bool,
}

impl<'a, R: ControlRegisters> RegisterGate<'a, R> {
    pub fn new(
        registers: &'a mut R,
        frames: &'a mut FrameTable,
        features: CpuFeatures,
        initialized: bool,
    ) -> Self {
        Self {
            registers,
            frames,
            features,
            initialized,
        }
    }

    /// Loads CR0 with write protection forced on
    pub fn load_cr0(&mut self, value: Cr0) {
        self.registers.write_cr0(policy::enforce_cr0(value));
        policy::check_cr0(self.registers.read_cr0()).enforce();
    }

    /// Loads CR4 with SMEP forced on where the CPU supports it
    pub fn load_cr4(&mut self, value: Cr4) {
        self.registers
            .write_cr4(policy::enforce_cr4(value, &self.features));
        policy::check_cr4(self.registers.read_cr4(), &self.features).enforce();
    }

    /// Writes a model specific register. EFER must keep NXE set.
    pub fn load_msr(&mut self, msr: u32, value: u64) {
        self.registers.write_msr(msr, value);
        policy::check_msr(msr, self.registers.read_msr(msr)).enforce();
    }

    /// Loads CR3. Once initialized, `value` must reference a top-level table; the check happens
    /// before the register is written.
    pub fn load_top_level_table(&mut self, value: u64) {
        policy::check_table_base(value, self.frames, self.initialized).enforce();
        let previous = PAddr(self.registers.read_cr3()).frame_base();
        self.registers.write_cr3(value);
        if self.initialized {
            if let Ok(descriptor) = self.frames.try_get_mut(previous) {
                descriptor.set_active(false);
            }
            self.frames
                .get_mut(PAddr(value).frame_base())
                .set_active(true);
        }
        trace!("CR3 loaded with {value:#x}");
    }
}
