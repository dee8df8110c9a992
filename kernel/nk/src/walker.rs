//! Page table walker
//!
//! Classifies every frame reachable from a page table page. Tables are stamped with their level,
//! leaves with [`FrameKind::KernelData`], and every visit counts as one reference.
//!
//! A frame whose kind is not [`FrameKind::Unused`] has been visited before. The walk does not
//! descend into it again, which is the only thing that stops it on a recursive self-mapping.

use kernel_arch_x86_64::paging::{
    EntryTarget, Level, PAddr, PageEntry, PageOracle, ENTRIES_PER_TABLE,
};
use log::trace;

use crate::{
    frame::{FrameKind, FrameTable},
    policy::{fatal, Violation},
};

pub struct Walker<'a, M: PageOracle> {
    frames: &'a mut FrameTable,
    memory: &'a M,
}

impl<'a, M: PageOracle> Walker<'a, M> {
    pub fn new(frames: &'a mut FrameTable, memory: &'a M) -> Self {
        Self { frames, memory }
    }

    /// Classifies the page referenced by `entry` and everything beneath it.
    ///
    /// `level` is the level of the table `entry` references, so an entry with the page size bit
    /// and `level` [`Level::L2`] maps a 1 GiB page. Only the first `entries` entries of the
    /// referenced table are walked if it is the top-level table; lower tables are always walked
    /// in full.
    ///
    /// Classifying a top-level table a second time changes nothing.
    pub fn classify(&mut self, entry: PageEntry, entries: usize, level: Level) {
        let target = level
            .parent()
            .map_or(EntryTarget::Table(level), |parent| parent.target(entry));
        match target {
            EntryTarget::Table(Level::L4)
                if self.frames.get(entry.phys_addr()).kind() == FrameKind::Level4Table =>
            {
                trace!("{:x} already classified", entry.phys_addr().0);
            }
            EntryTarget::Table(level) => self.walk_table(entry.phys_addr(), entries, level),
            EntryTarget::Leaf(size) => self.declare_leaf(entry.leaf_frame(size)),
        }
    }

    fn walk_table(&mut self, table: PAddr, entries: usize, level: Level) {
        let descriptor = self.frames.get_mut(table);
        let revisit = descriptor.kind() != FrameKind::Unused;
        if !revisit {
            descriptor.set_mapped_virtual_address(self.memory.virtual_address(table));
        }
        if descriptor.kind() != FrameKind::Level4Table {
            descriptor.set_kind(FrameKind::table(level));
        }
        descriptor.set_user_accessible(false);
        self.frames.add_reference(table);
        if revisit {
            trace!("{:x} revisited as {level:?}", table.0);
            return;
        }
        trace!("{:x} classified as {level:?}", table.0);

        let entries = if level == Level::L4 {
            entries.min(ENTRIES_PER_TABLE)
        } else {
            ENTRIES_PER_TABLE
        };
        for index in 0..entries {
            let next = self
                .memory
                .read_entry(table, index)
                .unwrap_or_else(|fault| fatal(Violation::PageTable(fault)));
            if !next.present() {
                continue;
            }
            match level.target(next) {
                EntryTarget::Table(child) => {
                    self.walk_table(next.phys_addr(), ENTRIES_PER_TABLE, child);
                }
                EntryTarget::Leaf(size) => self.declare_leaf(next.leaf_frame(size)),
            }
        }
    }

    fn declare_leaf(&mut self, frame: PAddr) {
        let descriptor = self.frames.get_mut(frame);
        if descriptor.kind() == FrameKind::Unused {
            descriptor.set_kind(FrameKind::KernelData);
        }
        self.frames.add_reference(frame);
    }
}
