//! Paging related definitions

use bitfield_struct::bitfield;
use thiserror::Error;

/// Size of the smallest page frame in bytes
pub const PAGE_SIZE: u64 = 4096;
/// Number of entries in a page table page of any level
pub const ENTRIES_PER_TABLE: usize = 512;
/// Mask to get the address bits out of an entry referencing a table or a 4 kiB page
pub const FRAME_MASK: u64 = 0x000f_ffff_ffff_f000;
/// Mask to get the address bits out of an entry mapping a 2 MiB page
pub const LARGE_FRAME_MASK: u64 = 0x000f_ffff_ffe0_0000;
/// Mask to get the address bits out of an entry mapping a 1 GiB page
pub const HUGE_FRAME_MASK: u64 = 0x000f_ffff_c000_0000;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum PageFault {
    #[error("Page {0:x} not present")]
    NotPresent(u64),
    #[error("Entry index {0} is outside of a page table")]
    InvalidIndex(usize),
    #[error("Page Oracle cannot map {0:x} into the direct map")]
    BrokenPageOracle(u64),
}

/// A Physical Address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PAddr(pub u64);

impl PAddr {
    /// Index of the 4 kiB frame containing this address
    #[must_use]
    pub const fn frame_number(self) -> u64 {
        self.0 / PAGE_SIZE
    }

    /// Start of the 4 kiB frame containing this address, with any flag bits stripped
    #[must_use]
    pub const fn frame_base(self) -> Self {
        Self(self.0 & FRAME_MASK)
    }
}

/// A Virtual Address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VAddr(pub u64);

impl VAddr {
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }
}

/// Size of the region mapped by a leaf entry
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageSize {
    Size4KiB,
    Size2MiB,
    Size1GiB,
}

impl PageSize {
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Size4KiB => PAGE_SIZE,
            Self::Size2MiB => 1 << 21,
            Self::Size1GiB => 1 << 30,
        }
    }

    /// Mask selecting the physical frame of a leaf entry of this size
    #[must_use]
    pub const fn frame_mask(self) -> u64 {
        match self {
            Self::Size4KiB => FRAME_MASK,
            Self::Size2MiB => LARGE_FRAME_MASK,
            Self::Size1GiB => HUGE_FRAME_MASK,
        }
    }

    /// Mask selecting the bits of a virtual address that are an offset into the page
    #[must_use]
    pub const fn offset_mask(self) -> u64 {
        self.bytes() - 1
    }
}

/// Level of a page table page in the 4-level hierarchy
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Page table, entries map 4 kiB pages
    L1 = 1,
    /// Page directory, entries reference page tables or map 2 MiB pages
    L2 = 2,
    /// Page directory pointer table, entries reference page directories or map 1 GiB pages
    L3 = 3,
    /// Page map level 4, the top-level table loaded into CR3
    L4 = 4,
}

/// What a present entry of a table refers to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryTarget {
    /// The entry references a page table page of the given level
    Table(Level),
    /// The entry maps a page of the given size
    Leaf(PageSize),
}

impl Level {
    /// Level of the tables referenced by entries of this table
    #[must_use]
    pub const fn child(self) -> Option<Self> {
        match self {
            Self::L4 => Some(Self::L3),
            Self::L3 => Some(Self::L2),
            Self::L2 => Some(Self::L1),
            Self::L1 => None,
        }
    }

    /// Level of the table whose entries reference tables of this level
    #[must_use]
    pub const fn parent(self) -> Option<Self> {
        match self {
            Self::L4 => None,
            Self::L3 => Some(Self::L4),
            Self::L2 => Some(Self::L3),
            Self::L1 => Some(Self::L2),
        }
    }

    /// Size of the page mapped by an entry of this table with the page size bit set
    #[must_use]
    pub const fn large_page_size(self) -> Option<PageSize> {
        match self {
            Self::L3 => Some(PageSize::Size1GiB),
            Self::L2 => Some(PageSize::Size2MiB),
            Self::L4 | Self::L1 => None,
        }
    }

    const fn shift(self) -> u64 {
        12 + 9 * (self as u64 - 1)
    }

    /// Index of the entry of this table that translates `virtual_addr`
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        reason = "Magnitude reduced to fit into usize"
    )]
    pub const fn index_of(self, virtual_addr: VAddr) -> usize {
        ((virtual_addr.0 >> self.shift()) % ENTRIES_PER_TABLE as u64) as usize
    }

    /// Decides whether a present entry of this table references a further table or maps a page.
    ///
    /// The page size bit is only honoured where the hardware honours it; on a level 1 entry the
    /// same bit selects the PAT and on a level 4 entry it is reserved.
    #[must_use]
    pub const fn target(self, entry: PageEntry) -> EntryTarget {
        match self.child() {
            None => EntryTarget::Leaf(PageSize::Size4KiB),
            Some(child) => match self.large_page_size() {
                Some(size) if entry.page_size() => EntryTarget::Leaf(size),
                _ => EntryTarget::Table(child),
            },
        }
    }
}

/// A single entry of a page table page of any level
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    /// Present; must be `true` for the entry to be walked
    pub present: bool,
    /// Read/write; if 0, writes may not be allowed to the region controlled by this entry
    pub write_enable: bool,
    /// User/supervisor; if 0, user-mode accesses are not allowed to the region controlled by this entry
    pub user_mode_access: bool,
    /// Page-level write-through
    pub page_level_write_through: bool,
    /// Page-level cache disable
    pub page_level_cache_disable: bool,
    /// Accessed; indicates whether this entry has been used for linear-address translation
    pub accessed: bool,
    /// Dirty; only meaningful for entries mapping a page
    pub dirty: bool,
    /// Page size; on level 3 and level 2 entries, the entry maps a 1 GiB or 2 MiB page
    pub page_size: bool,
    /// Global; if CR4.PGE = 1, determines whether the translation is global
    pub global: bool,
    /// Available for system programmers
    #[bits(3)]
    pub available: u8,
    /// Physical address bits 12..52 of the referenced table or page
    #[bits(40)]
    pub page_addr: u64,
    #[bits(11)]
    _ign: u16,
    /// If IA32_EFER.NXE = 1, execute-disable
    pub disable_execution: bool,
}

impl PageEntry {
    /// Creates a present, writable entry referencing the table at `table`
    #[must_use]
    pub const fn table(table: PAddr) -> Self {
        Self::from_bits((table.0 & FRAME_MASK) | 0b11)
    }

    /// Physical address of the 4 kiB aligned frame referenced by this entry
    #[must_use]
    pub const fn phys_addr(self) -> PAddr {
        PAddr(self.into_bits() & FRAME_MASK)
    }

    /// Physical address of the page mapped by this entry, truncated to the page's natural alignment
    #[must_use]
    pub const fn leaf_frame(self, size: PageSize) -> PAddr {
        PAddr(self.into_bits() & size.frame_mask())
    }
}

/// Gives the nested kernel access to page table pages by physical address.
pub trait PageOracle {
    /// Reads entry `index` of the table page at `table`
    ///
    /// # Errors
    /// This function returns an error if the table cannot be accessed or the index is out of range.
    fn read_entry(&self, table: PAddr, index: usize) -> Result<PageEntry, PageFault>;

    /// Writes entry `index` of the table page at `table`
    ///
    /// # Errors
    /// This function returns an error if the table cannot be accessed or the index is out of range.
    fn write_entry(&mut self, table: PAddr, index: usize, entry: PageEntry)
        -> Result<(), PageFault>;

    /// Virtual address through which the frame at `physical` is accessed
    fn virtual_address(&self, physical: PAddr) -> VAddr;
}

/// Accesses page table pages through a linear map of all physical memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DirectMapOracle {
    offset: u64,
}

impl DirectMapOracle {
    /// Base of the direct map set up by FreeBSD-style kernels
    pub const DIRECT_MAP_BASE: u64 = 0xffff_fe00_0000_0000;

    /// Creates an oracle for a direct map starting at `offset`. An offset of zero means
    /// physical memory is identity mapped.
    ///
    /// # Safety
    /// Every page table frame must be readable and writable at `offset + physical` for as long as
    /// the oracle is in use.
    #[must_use]
    pub const unsafe fn new(offset: u64) -> Self {
        Self { offset }
    }

    #[allow(clippy::cast_possible_truncation, reason = "Pointers are 64 bits wide")]
    fn entry_ptr(&self, table: PAddr, index: usize) -> Result<*mut u64, PageFault> {
        if index >= ENTRIES_PER_TABLE {
            return Err(PageFault::InvalidIndex(index));
        }
        let base = table.frame_base();
        let virt = self
            .offset
            .checked_add(base.0)
            .ok_or(PageFault::BrokenPageOracle(base.0))?;
        Ok((virt as usize as *mut u64).wrapping_add(index))
    }
}

impl PageOracle for DirectMapOracle {
    fn read_entry(&self, table: PAddr, index: usize) -> Result<PageEntry, PageFault> {
        let ptr = self.entry_ptr(table, index)?;
        Ok(PageEntry::from_bits(unsafe { ptr.read_volatile() }))
    }

    fn write_entry(
        &mut self,
        table: PAddr,
        index: usize,
        entry: PageEntry,
    ) -> Result<(), PageFault> {
        let ptr = self.entry_ptr(table, index)?;
        unsafe { ptr.write_volatile(entry.into_bits()) };
        Ok(())
    }

    fn virtual_address(&self, physical: PAddr) -> VAddr {
        VAddr(self.offset.wrapping_add(physical.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_layout_matches_hardware() {
        let entry = PageEntry::new()
            .with_present(true)
            .with_write_enable(true)
            .with_page_size(true)
            .with_page_addr(0x4_0000)
            .with_disable_execution(true);
        assert_eq!(entry.into_bits(), 0x8000_0000_4000_0083);
        assert_eq!(entry.phys_addr(), PAddr(0x4000_0000));
    }

    #[test]
    fn leaf_frames_truncate_to_page_alignment() {
        // bit 12 is the PAT bit on large pages
        let entry = PageEntry::from_bits(0x8000_0000_0060_1083);
        assert_eq!(entry.leaf_frame(PageSize::Size2MiB), PAddr(0x60_0000));
        assert_eq!(entry.leaf_frame(PageSize::Size4KiB), PAddr(0x60_1000));
        let huge = PageEntry::from_bits(0x0000_0000_4000_1083);
        assert_eq!(huge.leaf_frame(PageSize::Size1GiB), PAddr(0x4000_0000));
    }

    #[test]
    fn indices_follow_the_level_shift() {
        let va = VAddr(0xffff_8080_4060_1234);
        assert_eq!(Level::L4.index_of(va), 0x101);
        assert_eq!(Level::L3.index_of(va), 0x001);
        assert_eq!(Level::L2.index_of(va), 0x003);
        assert_eq!(Level::L1.index_of(va), 0x001);
    }

    #[test]
    fn page_size_bit_only_counts_on_directory_levels() {
        let large = PageEntry::table(PAddr(0x20_0000)).with_page_size(true);
        assert_eq!(Level::L4.target(large), EntryTarget::Table(Level::L3));
        assert_eq!(Level::L3.target(large), EntryTarget::Leaf(PageSize::Size1GiB));
        assert_eq!(Level::L2.target(large), EntryTarget::Leaf(PageSize::Size2MiB));
        assert_eq!(Level::L1.target(large), EntryTarget::Leaf(PageSize::Size4KiB));
        let table = PageEntry::table(PAddr(0x3000));
        assert_eq!(Level::L2.target(table), EntryTarget::Table(Level::L1));
    }

    #[test]
    fn direct_map_rejects_out_of_table_indices() {
        let oracle = unsafe { DirectMapOracle::new(DirectMapOracle::DIRECT_MAP_BASE) };
        assert_eq!(
            oracle.read_entry(PAddr(0x1000), ENTRIES_PER_TABLE),
            Err(PageFault::InvalidIndex(ENTRIES_PER_TABLE))
        );
        assert_eq!(
            oracle.virtual_address(PAddr(0x1000)),
            VAddr(0xffff_fe00_0000_1000)
        );
    }

    #[test]
    fn direct_map_reads_and_writes_identity_mapped_tables() {
        #[repr(align(4096))]
        struct Table([u64; ENTRIES_PER_TABLE]);

        let mut table = Table([0; ENTRIES_PER_TABLE]);
        let physical = PAddr(core::ptr::addr_of_mut!(table) as u64);
        let mut oracle = unsafe { DirectMapOracle::new(0) };
        oracle
            .write_entry(physical, 7, PageEntry::table(PAddr(0x5000)))
            .unwrap();
        assert_eq!(
            oracle.read_entry(physical, 7).unwrap(),
            PageEntry::table(PAddr(0x5000))
        );
        assert_eq!(table.0[7], 0x5003);
    }
}
