//! Stand-ins for the hardware in unit tests

use alloc::{
    collections::{BTreeMap, BTreeSet},
    vec::Vec,
};
use core::cell::RefCell;

use kernel_arch_x86_64::{
    interrupts::{InterruptControl, RFLAGS_IF},
    paging::{PAddr, PageEntry, PageFault, PageOracle, VAddr, ENTRIES_PER_TABLE},
    registers::{ControlRegisters, Cr0, Cr4},
};

/// Page tables held in a map. Pages that were never written read as zero and physical memory is
/// identity mapped.
#[derive(Debug, Default)]
pub struct MockMemory {
    tables: BTreeMap<u64, [PageEntry; ENTRIES_PER_TABLE]>,
    tables_read: RefCell<BTreeSet<u64>>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, table: PAddr, index: usize, entry: PageEntry) {
        self.write_entry(table, index, entry).unwrap();
    }

    pub fn get(&self, table: PAddr, index: usize) -> PageEntry {
        self.tables
            .get(&table.frame_base().0)
            .map_or(PageEntry::new(), |entries| entries[index])
    }

    /// Every table the code under test has read from
    pub fn tables_read(&self) -> Vec<u64> {
        self.tables_read.borrow().iter().copied().collect()
    }
}

impl PageOracle for MockMemory {
    fn read_entry(&self, table: PAddr, index: usize) -> Result<PageEntry, PageFault> {
        if index >= ENTRIES_PER_TABLE {
            return Err(PageFault::InvalidIndex(index));
        }
        self.tables_read.borrow_mut().insert(table.frame_base().0);
        Ok(self.get(table, index))
    }

    fn write_entry(
        &mut self,
        table: PAddr,
        index: usize,
        entry: PageEntry,
    ) -> Result<(), PageFault> {
        if index >= ENTRIES_PER_TABLE {
            return Err(PageFault::InvalidIndex(index));
        }
        self.tables
            .entry(table.frame_base().0)
            .or_insert([PageEntry::new(); ENTRIES_PER_TABLE])[index] = entry;
        Ok(())
    }

    fn virtual_address(&self, physical: PAddr) -> VAddr {
        VAddr(physical.0)
    }
}

/// Registers that record every write and can be told to drop bits
#[derive(Debug, Default)]
pub struct MockRegisters {
    pub cr0: Cr0,
    pub cr3: u64,
    pub cr4: Cr4,
    pub msrs: BTreeMap<u32, u64>,
    /// Bits that never stick when written to CR0
    pub cr0_stuck_clear: u64,
    /// Bits that never stick when written to CR4
    pub cr4_stuck_clear: u64,
    /// Bits that never stick when written to any MSR
    pub msr_stuck_clear: u64,
    /// Number of writes setting CR0.WP that are ignored before one takes effect
    pub wp_refusals: usize,
    pub cr0_writes: Vec<Cr0>,
    pub cr3_writes: Vec<u64>,
    pub cr4_writes: Vec<Cr4>,
    pub msr_writes: Vec<(u32, u64)>,
}

impl MockRegisters {
    /// Registers as left by a 64-bit boot loader
    pub fn booted() -> Self {
        Self {
            cr0: Cr0::from_bits(0x8005_0033),
            cr4: Cr4::new().with_physical_address_extension(true),
            ..Self::default()
        }
    }
}

impl ControlRegisters for MockRegisters {
    fn read_cr0(&self) -> Cr0 {
        self.cr0
    }

    fn write_cr0(&mut self, value: Cr0) {
        self.cr0_writes.push(value);
        let mut bits = value.into_bits() & !self.cr0_stuck_clear;
        if value.write_protect() && self.wp_refusals > 0 {
            self.wp_refusals -= 1;
            bits = Cr0::from_bits(bits).with_write_protect(false).into_bits();
        }
        self.cr0 = Cr0::from_bits(bits);
    }

    fn read_cr3(&self) -> u64 {
        self.cr3
    }

    fn write_cr3(&mut self, value: u64) {
        self.cr3_writes.push(value);
        self.cr3 = value;
    }

    fn read_cr4(&self) -> Cr4 {
        self.cr4
    }

    fn write_cr4(&mut self, value: Cr4) {
        self.cr4_writes.push(value);
        self.cr4 = Cr4::from_bits(value.into_bits() & !self.cr4_stuck_clear);
    }

    fn read_msr(&self, msr: u32) -> u64 {
        self.msrs.get(&msr).copied().unwrap_or_default()
    }

    fn write_msr(&mut self, msr: u32, value: u64) {
        self.msr_writes.push((msr, value));
        self.msrs.insert(msr, value & !self.msr_stuck_clear);
    }
}

/// RFLAGS of a CPU that only ever runs the code under test
#[derive(Debug)]
pub struct MockInterrupts {
    pub flags: u64,
    pub disables: usize,
    pub restores: usize,
}

impl MockInterrupts {
    pub const fn new() -> Self {
        Self {
            flags: RFLAGS_IF | 0b10,
            disables: 0,
            restores: 0,
        }
    }

    pub const fn enabled(&self) -> bool {
        self.flags & RFLAGS_IF != 0
    }
}

impl InterruptControl for MockInterrupts {
    type Saved = u64;

    fn save_and_disable(&mut self) -> u64 {
        self.disables += 1;
        let flags = self.flags;
        self.flags &= !RFLAGS_IF;
        flags
    }

    fn restore(&mut self, flags: u64) {
        self.restores += 1;
        self.flags = flags;
    }
}
