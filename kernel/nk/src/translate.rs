//! Virtual to physical address translation

use kernel_arch_x86_64::paging::{
    EntryTarget, Level, PAddr, PageEntry, PageFault, PageOracle, PageSize, VAddr,
};

use crate::policy::fatal;

/// Where an entry lives in the page table hierarchy
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EntryLocation {
    /// Page table page containing the entry
    pub table: PAddr,
    pub index: usize,
    /// Level of `table`
    pub level: Level,
}

/// The leaf entry that maps a virtual address
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Translation {
    pub location: EntryLocation,
    pub entry: PageEntry,
    pub size: PageSize,
}

impl Translation {
    /// Base of the mapped page
    #[must_use]
    pub const fn frame(&self) -> PAddr {
        self.entry.leaf_frame(self.size)
    }

    #[must_use]
    pub const fn physical_address(&self, virtual_addr: VAddr) -> PAddr {
        PAddr(self.frame().0 + (virtual_addr.0 & self.size.offset_mask()))
    }
}

pub struct Translator<'a, M: PageOracle> {
    memory: &'a M,
}

impl<'a, M: PageOracle> Translator<'a, M> {
    pub const fn new(memory: &'a M) -> Self {
        Self { memory }
    }

    /// Finds the leaf entry mapping `virtual_addr` under the top-level table `root`, or `None` if
    /// an entry on the way is not present.
    ///
    /// # Errors
    /// This function returns an error if a page table page cannot be read.
    pub fn find_entry(
        &self,
        root: PAddr,
        virtual_addr: VAddr,
    ) -> Result<Option<Translation>, PageFault> {
        let mut table = root.frame_base();
        let mut level = Level::L4;
        loop {
            let index = level.index_of(virtual_addr);
            let entry = self.memory.read_entry(table, index)?;
            if !entry.present() {
                return Ok(None);
            }
            match level.target(entry) {
                EntryTarget::Table(child) => {
                    table = entry.phys_addr();
                    level = child;
                }
                EntryTarget::Leaf(size) => {
                    return Ok(Some(Translation {
                        location: EntryLocation {
                            table,
                            index,
                            level,
                        },
                        entry,
                        size,
                    }));
                }
            }
        }
    }

    /// # Errors
    /// This function returns an error if `virtual_addr` is not mapped under `root`.
    pub fn try_translate(&self, root: PAddr, virtual_addr: VAddr) -> Result<PAddr, PageFault> {
        self.find_entry(root, virtual_addr)?
            .map(|translation| translation.physical_address(virtual_addr))
            .ok_or(PageFault::NotPresent(virtual_addr.0))
    }

    /// Translates an address the caller knows to be mapped. Anything else is fatal.
    pub fn translate(&self, root: PAddr, virtual_addr: VAddr) -> PAddr {
        self.try_translate(root, virtual_addr)
            .unwrap_or_else(|fault| fatal(fault.into()))
    }
}
