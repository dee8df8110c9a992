//! Page table updates on behalf of the outer kernel
//!
//! Once initialized, page table pages are read-only to the outer kernel. It declares new tables,
//! removes unused ones and changes entries through these operations, which keep the frame
//! descriptors in step with the page tables.

use kernel_arch_x86_64::paging::{
    EntryTarget, Level, PAddr, PageEntry, PageFault, PageOracle, PageSize, ENTRIES_PER_TABLE,
    PAGE_SIZE,
};
use log::trace;

use crate::{
    frame::{FrameKind, FrameTable},
    policy::{fatal, Violation},
};

fn write<M: PageOracle>(memory: &mut M, table: PAddr, index: usize, entry: PageEntry) {
    memory
        .write_entry(table, index, entry)
        .unwrap_or_else(|fault| fatal(fault.into()));
}

/// Level of a declared page table page
fn table_level(frames: &FrameTable, table: PAddr) -> Level {
    let kind = frames.get(table).kind();
    kind.table_level()
        .unwrap_or_else(|| fatal(Violation::InvalidPageType { address: table.0, kind }))
}

/// Frame referenced by a present entry of a table of level `level`
const fn target_frame(level: Level, entry: PageEntry) -> PAddr {
    match level.target(entry) {
        EntryTarget::Table(_) => entry.phys_addr(),
        EntryTarget::Leaf(size) => entry.leaf_frame(size),
    }
}

/// Whether a leaf of `size` at `base` covers a frame the outer kernel must not write
fn covers_protected_frame(frames: &FrameTable, base: PAddr, size: PageSize) -> bool {
    (0..size.bytes() / PAGE_SIZE)
        .map(|page| PAddr(base.0 + page * PAGE_SIZE))
        .any(|frame| {
            frames
                .try_get(frame)
                .is_ok_and(|descriptor| descriptor.kind().is_protected())
        })
}

/// Turns an unused frame into an empty page table page of `level`
pub fn declare_table<M: PageOracle>(
    frames: &mut FrameTable,
    memory: &mut M,
    table: PAddr,
    level: Level,
) {
    let table = table.frame_base();
    frames.promote(table, FrameKind::table(level));
    for index in 0..ENTRIES_PER_TABLE {
        write(memory, table, index, PageEntry::new());
    }
    let descriptor = frames.get_mut(table);
    descriptor.set_mapped_virtual_address(memory.virtual_address(table));
    descriptor.set_user_accessible(false);
    trace!("{:x} declared as {level:?}", table.0);
}

/// Returns an empty, unreferenced page table page that is not loaded in CR3 to the unused pool
pub fn remove_table<M: PageOracle>(frames: &mut FrameTable, memory: &M, table: PAddr) {
    let table = table.frame_base();
    table_level(frames, table);
    if frames.get(table).is_active() {
        fatal(Violation::ActiveTableRemoval(table.0));
    }
    for index in 0..ENTRIES_PER_TABLE {
        let entry = memory
            .read_entry(table, index)
            .unwrap_or_else(|fault| fatal(fault.into()));
        if entry.present() {
            fatal(Violation::TableNotEmpty {
                address: table.0,
                index,
            });
        }
    }
    frames.demote(table);
    trace!("{:x} removed", table.0);
}

/// Replaces entry `index` of the declared table `table` with `entry`.
///
/// Table entries must reference a table of the next level down, apart from a top-level table
/// mapping itself. Leaf mappings of frames the outer kernel must not write are made read-only,
/// including large leaves that cover such a frame anywhere in their range.
/// Data frames left without any mapping return to the unused pool.
pub fn update_mapping<M: PageOracle>(
    frames: &mut FrameTable,
    memory: &mut M,
    table: PAddr,
    index: usize,
    entry: PageEntry,
) {
    let table = table.frame_base();
    let level = table_level(frames, table);
    let old = memory
        .read_entry(table, index)
        .unwrap_or_else(|fault| fatal(fault.into()));

    let mut entry = entry;
    if entry.present() {
        match level.target(entry) {
            EntryTarget::Table(child) => {
                let target = entry.phys_addr();
                let expected = FrameKind::table(child);
                let found = frames.get(target).kind();
                let self_map = level == Level::L4 && target == table;
                if found != expected && !self_map {
                    fatal(Violation::InvalidTableReference {
                        address: target.0,
                        expected,
                        found,
                    });
                }
                frames.add_reference(target);
            }
            EntryTarget::Leaf(size) => {
                let target = entry.leaf_frame(size);
                let descriptor = frames.get_mut(target);
                match descriptor.kind() {
                    FrameKind::Unused => {
                        descriptor.set_kind(if entry.user_mode_access() {
                            FrameKind::UserData
                        } else {
                            FrameKind::KernelData
                        });
                        descriptor.set_user_accessible(entry.user_mode_access());
                    }
                    kind if kind.is_protected() => entry.set_write_enable(false),
                    _ => {}
                }
                if size != PageSize::Size4KiB && covers_protected_frame(frames, target, size) {
                    entry.set_write_enable(false);
                }
                frames.add_reference(target);
            }
        }
    }

    if old.present() {
        let target = target_frame(level, old);
        let remaining = frames.drop_reference(target);
        if remaining == 0 && frames.get(target).kind().is_leaf_data() {
            frames.demote(target);
        }
    }

    write(memory, table, index, entry);
    trace!("{:x}[{index}] = {:x}", table.0, entry.into_bits());
}

/// Reads entry `index` of the declared table `table`
///
/// # Errors
/// This function returns an error if the entry cannot be read.
pub fn read_mapping<M: PageOracle>(
    frames: &FrameTable,
    memory: &M,
    table: PAddr,
    index: usize,
) -> Result<PageEntry, PageFault> {
    let table = table.frame_base();
    table_level(frames, table);
    memory.read_entry(table, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockMemory;

    fn leaf(address: u64) -> PageEntry {
        PageEntry::from_bits(address | 0b11)
    }

    /// L4 at 0x1000, L3 at 0x2000, L2 at 0x3000 and L1 at 0x4000, all declared but unlinked
    struct Tables {
        frames: FrameTable,
        memory: MockMemory,
    }

    impl Tables {
        fn new() -> Self {
            let mut frames = FrameTable::new(0x40_0000);
            let mut memory = MockMemory::new();
            declare_table(&mut frames, &mut memory, PAddr(0x1000), Level::L4);
            declare_table(&mut frames, &mut memory, PAddr(0x2000), Level::L3);
            declare_table(&mut frames, &mut memory, PAddr(0x3000), Level::L2);
            declare_table(&mut frames, &mut memory, PAddr(0x4000), Level::L1);
            Self { frames, memory }
        }

        fn map(&mut self, table: u64, index: usize, entry: PageEntry) {
            update_mapping(&mut self.frames, &mut self.memory, PAddr(table), index, entry);
        }

        fn link(&mut self, table: u64, index: usize, child: u64) {
            self.map(table, index, PageEntry::table(PAddr(child)));
        }

        fn kind(&self, frame: u64) -> FrameKind {
            self.frames.get(PAddr(frame)).kind()
        }

        fn count(&self, frame: u64) -> u16 {
            self.frames.get(PAddr(frame)).reference_count()
        }
    }

    #[test]
    fn declared_tables_start_empty() {
        let mut frames = FrameTable::new(0x10_0000);
        let mut memory = MockMemory::new();
        memory.set(PAddr(0x4000), 9, leaf(0x9000));
        declare_table(&mut frames, &mut memory, PAddr(0x4000), Level::L1);

        let descriptor = frames.get(PAddr(0x4000));
        assert_eq!(descriptor.kind(), FrameKind::Level1Table);
        assert_eq!(descriptor.reference_count(), 0);
        assert_eq!(descriptor.mapped_virtual_address().0, 0x4000);
        assert_eq!(memory.get(PAddr(0x4000), 9), PageEntry::new());
    }

    #[test]
    #[should_panic(expected = "cannot promote frame 0x2000 from Level3Table to Level1Table")]
    fn declaring_a_table_twice_is_fatal() {
        let mut tables = Tables::new();
        declare_table(&mut tables.frames, &mut tables.memory, PAddr(0x2000), Level::L1);
    }

    #[test]
    fn linking_tables_counts_references() {
        let mut tables = Tables::new();
        tables.link(0x1000, 0, 0x2000);
        tables.link(0x2000, 0, 0x3000);
        assert_eq!(tables.count(0x2000), 1);
        assert_eq!(tables.count(0x3000), 1);
        assert_eq!(
            tables.memory.get(PAddr(0x1000), 0),
            PageEntry::table(PAddr(0x2000))
        );
        assert_eq!(
            read_mapping(&tables.frames, &tables.memory, PAddr(0x2000), 0),
            Ok(PageEntry::table(PAddr(0x3000)))
        );
    }

    #[test]
    fn top_level_table_may_map_itself() {
        let mut tables = Tables::new();
        tables.link(0x1000, 511, 0x1000);
        assert_eq!(tables.kind(0x1000), FrameKind::Level4Table);
        assert_eq!(tables.count(0x1000), 1);
    }

    #[test]
    #[should_panic(expected = "where Level3Table is required")]
    fn skipping_a_level_is_fatal() {
        Tables::new().link(0x1000, 0, 0x3000);
    }

    #[test]
    fn new_leaves_take_their_kind_from_the_user_bit() {
        let mut tables = Tables::new();
        tables.map(0x4000, 0, leaf(0x10000));
        tables.map(0x4000, 1, leaf(0x11000).with_user_mode_access(true));
        assert_eq!(tables.kind(0x10000), FrameKind::KernelData);
        assert_eq!(tables.kind(0x11000), FrameKind::UserData);
        assert!(tables.frames.get(PAddr(0x11000)).is_user_accessible());
        assert_eq!(tables.count(0x11000), 1);
    }

    #[test]
    fn page_table_pages_are_mapped_read_only() {
        let mut tables = Tables::new();
        tables.map(0x4000, 0, leaf(0x2000));
        let entry = tables.memory.get(PAddr(0x4000), 0);
        assert!(entry.present());
        assert!(!entry.write_enable());
        assert_eq!(tables.count(0x2000), 1);
    }

    #[test]
    fn unmapped_data_frames_are_released() {
        let mut tables = Tables::new();
        tables.map(0x4000, 0, leaf(0x10000));
        tables.map(0x4000, 1, leaf(0x10000));
        tables.map(0x4000, 0, PageEntry::new());
        assert_eq!(tables.kind(0x10000), FrameKind::KernelData);
        assert_eq!(tables.count(0x10000), 1);

        tables.map(0x4000, 1, leaf(0x11000));
        assert_eq!(tables.kind(0x10000), FrameKind::Unused);
        assert_eq!(tables.kind(0x11000), FrameKind::KernelData);
    }

    #[test]
    fn remapping_the_same_frame_keeps_its_count() {
        let mut tables = Tables::new();
        tables.map(0x4000, 0, leaf(0x10000));
        tables.map(0x4000, 0, leaf(0x10000).with_disable_execution(true));
        assert_eq!(tables.count(0x10000), 1);
        assert_eq!(tables.kind(0x10000), FrameKind::KernelData);
    }

    #[test]
    fn large_leaves_use_the_large_frame() {
        let mut tables = Tables::new();
        tables.map(0x3000, 0, PageEntry::from_bits(0x20_1083));
        assert_eq!(tables.count(0x20_0000), 1);
        assert_eq!(tables.count(0x20_1000), 0);
    }

    #[test]
    #[should_panic(expected = "is not a page table page")]
    fn entries_of_undeclared_tables_cannot_change() {
        Tables::new().map(0x8000, 0, leaf(0x10000));
    }

    #[test]
    fn unreferenced_tables_can_be_removed() {
        let mut tables = Tables::new();
        tables.link(0x3000, 0, 0x4000);
        tables.map(0x3000, 0, PageEntry::new());
        remove_table(&mut tables.frames, &tables.memory, PAddr(0x4000));
        assert_eq!(tables.kind(0x4000), FrameKind::Unused);
    }

    #[test]
    #[should_panic(expected = "cannot demote Level1Table frame 0x4000 with 1 references")]
    fn referenced_tables_cannot_be_removed() {
        let mut tables = Tables::new();
        tables.link(0x3000, 0, 0x4000);
        remove_table(&mut tables.frames, &tables.memory, PAddr(0x4000));
    }

    #[test]
    #[should_panic(expected = "cannot remove the active top-level table 0x1000")]
    fn active_table_cannot_be_removed() {
        let mut tables = Tables::new();
        tables.frames.get_mut(PAddr(0x1000)).set_active(true);
        remove_table(&mut tables.frames, &tables.memory, PAddr(0x1000));
    }

    #[test]
    #[should_panic(expected = "cannot remove page table page 0x4000: entry 3 is still present")]
    fn tables_with_present_entries_cannot_be_removed() {
        let mut tables = Tables::new();
        tables.link(0x3000, 0, 0x4000);
        tables.map(0x4000, 3, leaf(0x10000));
        tables.map(0x3000, 0, PageEntry::new());
        remove_table(&mut tables.frames, &tables.memory, PAddr(0x4000));
    }

    #[test]
    fn emptied_tables_release_their_frames_before_removal() {
        let mut tables = Tables::new();
        tables.link(0x3000, 0, 0x4000);
        tables.map(0x4000, 3, leaf(0x10000));
        tables.map(0x4000, 3, PageEntry::new());
        tables.map(0x3000, 0, PageEntry::new());
        remove_table(&mut tables.frames, &tables.memory, PAddr(0x4000));
        assert_eq!(tables.kind(0x4000), FrameKind::Unused);
        assert_eq!(tables.kind(0x10000), FrameKind::Unused);
        assert_eq!(tables.count(0x10000), 0);
    }

    #[test]
    fn large_leaves_over_page_tables_are_read_only() {
        let mut tables = Tables::new();
        tables.map(0x3000, 1, leaf(0).with_page_size(true));
        let entry = tables.memory.get(PAddr(0x3000), 1);
        assert!(entry.present());
        assert!(!entry.write_enable());
        assert_eq!(tables.count(0), 1);
    }

    #[test]
    fn large_leaves_over_data_stay_writable() {
        let mut tables = Tables::new();
        tables.map(0x3000, 1, leaf(0x20_0000).with_page_size(true));
        assert!(tables.memory.get(PAddr(0x3000), 1).write_enable());
    }
}
