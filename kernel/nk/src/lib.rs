//! Nested kernel protected MMU
//!
//! Keeps an independent record of what every physical frame is used for and mediates all
//! changes to the page tables and the paging control registers, so that the outer kernel cannot
//! turn off write protection or execute protection.
#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod boundary;
pub mod frame;
pub mod gate;
pub mod pmmu;
pub mod policy;
#[cfg(test)]
mod testing;
pub mod translate;
pub mod vmmu;
pub mod walker;

pub use frame::{FrameDescriptor, FrameKind, FrameTable};
pub use pmmu::{BootParameters, Config, NestedKernel};
pub use policy::{Verdict, Violation};
