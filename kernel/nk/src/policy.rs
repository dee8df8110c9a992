//! Integrity policy
//!
//! Decides whether a register value or page table base is acceptable. The checks return a
//! [`Verdict`] and never halt on their own; [`Verdict::enforce`] is the single place where a
//! fatal verdict turns into a halt.

use kernel_arch_x86_64::{
    cpu_info::CpuFeatures,
    paging::{PAddr, PageFault},
    registers::{Cr0, Cr4, Efer, IA32_EFER},
};
use log::{error, warn};
use thiserror::Error;

use crate::{
    boundary::BoundaryState,
    frame::{FrameKind, FrameTable},
};

/// Integrity violations. Each one halts the system.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("attempt to clear the CR0.WP bit: {0:#x}")]
    WriteProtectCleared(u64),
    #[error("attempt to clear the CR4.SMEP bit: {0:#x}")]
    SmepCleared(u64),
    #[error("attempt to clear the EFER.NXE bit: {0:#x}")]
    NoExecuteCleared(u64),
    #[error("loading non-L4 page {address:#x} of kind {kind:?} into CR3")]
    NotTopLevelTable { address: u64, kind: FrameKind },
    #[error("frame index {index:#x} beyond descriptor table of {len:#x} entries")]
    FrameOutOfBounds { index: u64, len: u64 },
    #[error("reference count of frame {0:#x} overflowed")]
    ReferenceOverflow(u64),
    #[error("frame {0:#x} holds no references")]
    ReferenceUnderflow(u64),
    #[error("frame {address:#x} of kind {kind:?} is not a page table page")]
    InvalidPageType { address: u64, kind: FrameKind },
    #[error("cannot promote frame {address:#x} from {from:?} to {to:?}")]
    InvalidPromotion {
        address: u64,
        from: FrameKind,
        to: FrameKind,
    },
    #[error("cannot demote {kind:?} frame {address:#x} with {references} references")]
    InvalidDemotion {
        address: u64,
        kind: FrameKind,
        references: u16,
    },
    #[error("entry references frame {address:#x} of kind {found:?} where {expected:?} is required")]
    InvalidTableReference {
        address: u64,
        expected: FrameKind,
        found: FrameKind,
    },
    #[error("cannot remove the active top-level table {0:#x}")]
    ActiveTableRemoval(u64),
    #[error("cannot remove page table page {address:#x}: entry {index} is still present")]
    TableNotEmpty { address: u64, index: usize },
    #[error("page table access failed: {0}")]
    PageTable(#[from] PageFault),
    #[error("trusted boundary is {found:?}, expected {expected:?}")]
    BoundaryState {
        expected: BoundaryState,
        found: BoundaryState,
    },
    #[error("initialization requested twice")]
    AlreadyInitialized,
}

/// Protections that cannot be established on this CPU. The system keeps running without them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum Degradation {
    #[error("SMEP not supported, supervisor execution of user pages is not prevented")]
    SmepUnsupported,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Permit,
    Degraded(Degradation),
    Fatal(Violation),
}

impl Verdict {
    /// Logs a degraded verdict and halts on a fatal one
    #[track_caller]
    pub fn enforce(self) {
        match self {
            Self::Permit => {}
            Self::Degraded(degradation) => warn!("Nested Kernel: {degradation}"),
            Self::Fatal(violation) => fatal(violation),
        }
    }
}

/// Halts the system
#[cold]
#[track_caller]
pub fn fatal(violation: Violation) -> ! {
    error!("Nested Kernel: {violation}");
    panic!("Nested Kernel: {violation}");
}

/// The value actually written when CR0 is loaded with `value`
#[must_use]
pub const fn enforce_cr0(value: Cr0) -> Cr0 {
    value.with_write_protect(true)
}

/// Checks CR0 as read back after a load
#[must_use]
pub const fn check_cr0(loaded: Cr0) -> Verdict {
    if loaded.write_protect() {
        Verdict::Permit
    } else {
        Verdict::Fatal(Violation::WriteProtectCleared(loaded.into_bits()))
    }
}

/// The value actually written when CR4 is loaded with `value`
#[must_use]
pub const fn enforce_cr4(value: Cr4, features: &CpuFeatures) -> Cr4 {
    if features.smep {
        value.with_smep(true)
    } else {
        value
    }
}

/// Checks CR4 as read back after a load
#[must_use]
pub const fn check_cr4(loaded: Cr4, features: &CpuFeatures) -> Verdict {
    if !features.smep {
        Verdict::Degraded(Degradation::SmepUnsupported)
    } else if loaded.smep() {
        Verdict::Permit
    } else {
        Verdict::Fatal(Violation::SmepCleared(loaded.into_bits()))
    }
}

/// Checks a model specific register as read back after a write. Only EFER is protected.
#[must_use]
pub const fn check_msr(msr: u32, loaded: u64) -> Verdict {
    if msr == IA32_EFER && !Efer::from_bits(loaded).no_execute_enable() {
        Verdict::Fatal(Violation::NoExecuteCleared(loaded))
    } else {
        Verdict::Permit
    }
}

/// Checks a value about to be loaded into CR3. Before initialization nothing is known about
/// physical memory and every value is permitted.
#[must_use]
pub fn check_table_base(value: u64, frames: &FrameTable, initialized: bool) -> Verdict {
    if !initialized {
        return Verdict::Permit;
    }
    let root = PAddr(value).frame_base();
    match frames.try_get(root) {
        Ok(descriptor) if descriptor.kind() == FrameKind::Level4Table => Verdict::Permit,
        Ok(descriptor) => Verdict::Fatal(Violation::NotTopLevelTable {
            address: value,
            kind: descriptor.kind(),
        }),
        Err(violation) => Verdict::Fatal(violation),
    }
}
