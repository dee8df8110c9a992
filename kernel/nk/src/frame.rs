//! Frame descriptor table
//!
//! There is one descriptor for each physical page frame of the system. It records what the
//! nested kernel knows about the frame and the data stored in it, which is what the MMU checks
//! are based on.

use alloc::{vec, vec::Vec};

use bitfield_struct::bitfield;
use kernel_arch_x86_64::paging::{Level, PAddr, VAddr, PAGE_SIZE};

use crate::policy::{fatal, Violation};

/// Physical memory tracked by default (32 GiB)
pub const DEFAULT_MEMORY_SIZE: u64 = 0x0000_0008_0000_0000;

/// Largest value the 12-bit reference counter holds
pub const MAX_REFERENCE_COUNT: u16 = 4095;

/// The count must be at least this value to remove a mapping to a frame
pub const MIN_REFERENCES_TO_REMOVE_MAPPING: u16 = 1;

/// Use of a physical frame
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FrameKind {
    #[default]
    Unused = 0,
    Level1Table,
    Level2Table,
    Level3Table,
    Level4Table,
    /// Valid leaf page of no particular kind
    GenericLeaf,
    KernelData,
    UserData,
    Code,
    /// Frame belonging to the nested kernel itself
    TrustedSystem,
    /// Secure (ghost) memory
    GhostSecure,
    DirectMapL1,
    DirectMapL2,
    DirectMapL3,
    DirectMapL4,
}

impl FrameKind {
    /// Kind of a page table page of the given level
    #[must_use]
    pub const fn table(level: Level) -> Self {
        match level {
            Level::L1 => Self::Level1Table,
            Level::L2 => Self::Level2Table,
            Level::L3 => Self::Level3Table,
            Level::L4 => Self::Level4Table,
        }
    }

    /// Level of the page table page, if this kind is one
    #[must_use]
    pub const fn table_level(self) -> Option<Level> {
        match self {
            Self::Level1Table => Some(Level::L1),
            Self::Level2Table => Some(Level::L2),
            Self::Level3Table => Some(Level::L3),
            Self::Level4Table => Some(Level::L4),
            _ => None,
        }
    }

    /// Whether the frame holds an ordinary data page that may be reclaimed once unreferenced
    #[must_use]
    pub const fn is_leaf_data(self) -> bool {
        matches!(self, Self::GenericLeaf | Self::KernelData | Self::UserData)
    }

    /// Whether writable mappings of the frame would let the outer kernel bypass the nested kernel
    #[must_use]
    pub const fn is_protected(self) -> bool {
        !matches!(
            self,
            Self::Unused | Self::GenericLeaf | Self::KernelData | Self::UserData
        )
    }
}

/// Attributes of a frame orthogonal to its kind
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct FrameState {
    /// The frame is a ghost (secure) page table page
    pub secure_table: bool,
    pub stack: bool,
    pub code: bool,
    pub active: bool,
    pub user: bool,
    /// Number of live mappings of the frame
    #[bits(12)]
    pub count: u16,
    #[bits(15)]
    _reserved: u16,
}

/// What the nested kernel knows about one physical frame
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameDescriptor {
    kind: FrameKind,
    state: FrameState,
    mapped_virtual_address: VAddr,
}

impl FrameDescriptor {
    pub const EMPTY: Self = Self {
        kind: FrameKind::Unused,
        state: FrameState::new(),
        mapped_virtual_address: VAddr(0),
    };

    #[must_use]
    pub const fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: FrameKind) {
        self.kind = kind;
    }

    /// Virtual address through which a page table page is accessed
    #[must_use]
    pub const fn mapped_virtual_address(&self) -> VAddr {
        self.mapped_virtual_address
    }

    pub fn set_mapped_virtual_address(&mut self, address: VAddr) {
        self.mapped_virtual_address = address;
    }

    #[must_use]
    pub const fn reference_count(&self) -> u16 {
        self.state.count()
    }

    #[must_use]
    pub const fn is_secure_table_page(&self) -> bool {
        self.state.secure_table()
    }

    pub fn set_secure_table_page(&mut self, value: bool) {
        self.state.set_secure_table(value);
    }

    #[must_use]
    pub const fn is_stack_frame(&self) -> bool {
        self.state.stack()
    }

    pub fn set_stack_frame(&mut self, value: bool) {
        self.state.set_stack(value);
    }

    #[must_use]
    pub const fn is_code_frame(&self) -> bool {
        self.state.code()
    }

    pub fn set_code_frame(&mut self, value: bool) {
        self.state.set_code(value);
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.state.active()
    }

    pub fn set_active(&mut self, value: bool) {
        self.state.set_active(value);
    }

    #[must_use]
    pub const fn is_user_accessible(&self) -> bool {
        self.state.user()
    }

    pub fn set_user_accessible(&mut self, value: bool) {
        self.state.set_user(value);
    }

    fn checked_add_reference(&mut self) -> Option<u16> {
        let count = self.state.count();
        (count < MAX_REFERENCE_COUNT).then(|| {
            self.state.set_count(count + 1);
            count + 1
        })
    }

    fn checked_drop_reference(&mut self) -> Option<u16> {
        let count = self.state.count();
        (count >= MIN_REFERENCES_TO_REMOVE_MAPPING).then(|| {
            self.state.set_count(count - 1);
            count - 1
        })
    }
}

impl Default for FrameDescriptor {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Descriptors for every frame of physical memory, indexed by frame number
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameTable {
    descriptors: Vec<FrameDescriptor>,
}

impl FrameTable {
    /// Creates a zeroed table covering `memory_size` bytes of physical memory
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        reason = "Magnitude reduced to fit into usize"
    )]
    pub fn new(memory_size: u64) -> Self {
        Self {
            descriptors: vec![FrameDescriptor::EMPTY; (memory_size / PAGE_SIZE) as usize],
        }
    }

    /// Number of frames described
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Forgets everything known about physical memory
    pub fn reset(&mut self) {
        self.descriptors.fill(FrameDescriptor::EMPTY);
    }

    #[allow(
        clippy::cast_possible_truncation,
        reason = "Checked against the table length"
    )]
    fn index(&self, frame: PAddr) -> Result<usize, Violation> {
        let index = frame.frame_number();
        if index < self.descriptors.len() as u64 {
            Ok(index as usize)
        } else {
            Err(Violation::FrameOutOfBounds {
                index,
                len: self.descriptors.len() as u64,
            })
        }
    }

    /// Descriptor of the frame containing `frame`
    ///
    /// # Errors
    /// This function returns an error if the frame lies beyond the described memory.
    pub fn try_get(&self, frame: PAddr) -> Result<&FrameDescriptor, Violation> {
        self.index(frame).map(|index| &self.descriptors[index])
    }

    /// Descriptor of the frame containing `frame`. A frame beyond the described memory means the
    /// page tables reference memory that does not exist, which is fatal.
    #[must_use]
    pub fn get(&self, frame: PAddr) -> &FrameDescriptor {
        self.try_get(frame).unwrap_or_else(|violation| fatal(violation))
    }

    /// # Errors
    /// This function returns an error if the frame lies beyond the described memory.
    pub fn try_get_mut(&mut self, frame: PAddr) -> Result<&mut FrameDescriptor, Violation> {
        let index = self.index(frame)?;
        Ok(&mut self.descriptors[index])
    }

    pub fn get_mut(&mut self, frame: PAddr) -> &mut FrameDescriptor {
        self.try_get_mut(frame)
            .unwrap_or_else(|violation| fatal(violation))
    }

    /// Records one more mapping of `frame`, returning the new count
    pub fn add_reference(&mut self, frame: PAddr) -> u16 {
        self.get_mut(frame)
            .checked_add_reference()
            .unwrap_or_else(|| fatal(Violation::ReferenceOverflow(frame.0)))
    }

    /// Records the removal of a mapping of `frame`, returning the new count
    pub fn drop_reference(&mut self, frame: PAddr) -> u16 {
        self.get_mut(frame)
            .checked_drop_reference()
            .unwrap_or_else(|| fatal(Violation::ReferenceUnderflow(frame.0)))
    }

    /// Gives an unused, unreferenced frame the role `kind`
    pub fn promote(&mut self, frame: PAddr, kind: FrameKind) {
        let descriptor = self.get_mut(frame);
        if descriptor.kind() != FrameKind::Unused || descriptor.reference_count() != 0 {
            fatal(Violation::InvalidPromotion {
                address: frame.0,
                from: descriptor.kind(),
                to: kind,
            });
        }
        descriptor.set_kind(kind);
    }

    /// Returns an unreferenced frame to the unused pool
    pub fn demote(&mut self, frame: PAddr) {
        let descriptor = self.get_mut(frame);
        if descriptor.reference_count() != 0 {
            fatal(Violation::InvalidDemotion {
                address: frame.0,
                kind: descriptor.kind(),
                references: descriptor.reference_count(),
            });
        }
        *descriptor = FrameDescriptor::EMPTY;
    }

    /// All described frames with their physical address
    pub fn iter(&self) -> impl Iterator<Item = (PAddr, &FrameDescriptor)> {
        (0..)
            .zip(&self.descriptors)
            .map(|(index, descriptor)| (PAddr(index * PAGE_SIZE), descriptor))
    }

    /// Number of frames currently of kind `kind`
    #[must_use]
    pub fn count_of(&self, kind: FrameKind) -> usize {
        self.descriptors
            .iter()
            .filter(|descriptor| descriptor.kind() == kind)
            .count()
    }
}
