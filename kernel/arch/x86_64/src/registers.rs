//! Control registers and model specific registers

use core::arch::asm;

use bitfield_struct::bitfield;

/// Extended feature enable register
pub const IA32_EFER: u32 = 0xC000_0080;

/// Control register 0
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Cr0 {
    /// Protected mode enable
    pub protection_enable: bool,
    pub monitor_coprocessor: bool,
    pub emulation: bool,
    pub task_switched: bool,
    pub extension_type: bool,
    pub numeric_error: bool,
    #[bits(10)]
    _res1: u16,
    /// Write protect; if set, supervisor-mode writes to read-only pages fault
    pub write_protect: bool,
    _res2: bool,
    pub alignment_mask: bool,
    #[bits(10)]
    _res3: u16,
    pub not_write_through: bool,
    pub cache_disable: bool,
    /// Paging enable
    pub paging: bool,
    #[bits(32)]
    _res4: u32,
}

/// Control register 4
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Cr4 {
    #[bits(4)]
    _res1: u8,
    pub page_size_extensions: bool,
    pub physical_address_extension: bool,
    _res2: bool,
    pub page_global_enable: bool,
    #[bits(12)]
    _res3: u16,
    /// Supervisor mode execution prevention
    pub smep: bool,
    /// Supervisor mode access prevention
    pub smap: bool,
    #[bits(42)]
    _res4: u64,
}

/// Extended feature enable register (`IA32_EFER`)
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Efer {
    /// System call extensions
    pub syscall_enable: bool,
    #[bits(7)]
    _res1: u8,
    /// Long mode enable
    pub long_mode_enable: bool,
    _res2: bool,
    /// Long mode active
    pub long_mode_active: bool,
    /// No-execute enable; if cleared, the execute-disable bit of page table entries is reserved
    pub no_execute_enable: bool,
    #[bits(52)]
    _res3: u64,
}

/// Source and sink of the privileged registers the nested kernel protects.
///
/// Only the nested kernel may hold an implementation that reaches real hardware.
pub trait ControlRegisters {
    fn read_cr0(&self) -> Cr0;
    fn write_cr0(&mut self, value: Cr0);
    fn read_cr3(&self) -> u64;
    fn write_cr3(&mut self, value: u64);
    fn read_cr4(&self) -> Cr4;
    fn write_cr4(&mut self, value: Cr4);
    fn read_msr(&self, msr: u32) -> u64;
    fn write_msr(&mut self, msr: u32, value: u64);
}

/// The registers of the executing CPU
#[derive(Debug)]
pub struct HardwareRegisters {
    _private: (),
}

impl HardwareRegisters {
    /// # Safety
    /// The caller must run in ring 0 and must be the only code writing these registers.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl ControlRegisters for HardwareRegisters {
    fn read_cr0(&self) -> Cr0 {
        let value: u64;
        unsafe {
            asm!("mov {0}, cr0", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        Cr0::from_bits(value)
    }

    fn write_cr0(&mut self, value: Cr0) {
        unsafe {
            asm!("mov cr0, {0}", in(reg) value.into_bits(), options(nostack, preserves_flags));
        }
    }

    fn read_cr3(&self) -> u64 {
        let value: u64;
        unsafe {
            asm!("mov {0}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        value
    }

    fn write_cr3(&mut self, value: u64) {
        unsafe {
            asm!("mov cr3, {0}", in(reg) value, options(nostack, preserves_flags));
        }
    }

    fn read_cr4(&self) -> Cr4 {
        let value: u64;
        unsafe {
            asm!("mov {0}, cr4", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        Cr4::from_bits(value)
    }

    fn write_cr4(&mut self, value: Cr4) {
        unsafe {
            asm!("mov cr4, {0}", in(reg) value.into_bits(), options(nostack, preserves_flags));
        }
    }

    fn read_msr(&self, msr: u32) -> u64 {
        let low: u32;
        let high: u32;
        unsafe {
            asm!(
                "rdmsr",
                in("ecx") msr,
                out("eax") low,
                out("edx") high,
                options(nomem, nostack, preserves_flags)
            );
        }
        (u64::from(high) << 32) | u64::from(low)
    }

    #[allow(
        clippy::cast_possible_truncation,
        reason = "wrmsr takes the value split into two halves"
    )]
    fn write_msr(&mut self, msr: u32, value: u64) {
        unsafe {
            asm!(
                "wrmsr",
                in("ecx") msr,
                in("eax") value as u32,
                in("edx") (value >> 32) as u32,
                options(nostack, preserves_flags)
            );
        }
    }
}
