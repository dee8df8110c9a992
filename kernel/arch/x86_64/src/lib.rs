//! x86_64 primitives used by the nested kernel
#![no_std]

pub mod cpu_info;
#[cfg(feature = "critical-section")]
pub mod critical_section;
pub mod interrupts;
pub mod paging;
pub mod registers;
pub mod secure_stack;
