//! Trusted call boundary
//!
//! Entering disables interrupts and clears CR0.WP so the nested kernel can write protected
//! pages. Exiting sets CR0.WP again and restores the interrupt state. Calls do not nest.

use alloc::boxed::Box;
use core::hint::spin_loop;

use kernel_arch_x86_64::{
    interrupts::InterruptControl, registers::ControlRegisters, secure_stack::SecureStack,
};

use crate::policy::{fatal, Violation};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum BoundaryState {
    #[default]
    Idle,
    Entering,
    InsideTrustedCall,
    Exiting,
}

pub struct TrustedBoundary {
    stack: Box<SecureStack>,
    state: BoundaryState,
}

impl TrustedBoundary {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stack: Box::new(SecureStack::new()),
            state: BoundaryState::Idle,
        }
    }

    #[must_use]
    pub const fn state(&self) -> BoundaryState {
        self.state
    }

    /// Stack to run the trusted call on
    pub fn stack_ptr(&mut self) -> *mut SecureStack {
        core::ptr::addr_of_mut!(*self.stack)
    }

    /// Untrusted stack pointer saved by the last switch onto the secure stack
    #[must_use]
    pub fn saved_stack_pointer(&self) -> usize {
        self.stack.saved_stack_pointer()
    }

    fn transition(&mut self, expected: BoundaryState, next: BoundaryState) {
        if self.state != expected {
            fatal(Violation::BoundaryState {
                expected,
                found: self.state,
            });
        }
        self.state = next;
    }

    /// Returns the interrupt state to hand back to [`TrustedBoundary::exit`]
    pub fn enter<I: InterruptControl>(
        &mut self,
        registers: &mut impl ControlRegisters,
        interrupts: &mut I,
    ) -> I::Saved {
        self.transition(BoundaryState::Idle, BoundaryState::Entering);
        let saved = interrupts.save_and_disable();
        let cr0 = registers.read_cr0();
        registers.write_cr0(cr0.with_write_protect(false));
        self.state = BoundaryState::InsideTrustedCall;
        saved
    }

    pub fn exit<I: InterruptControl>(
        &mut self,
        registers: &mut impl ControlRegisters,
        interrupts: &mut I,
        saved: I::Saved,
    ) {
        self.transition(BoundaryState::InsideTrustedCall, BoundaryState::Exiting);
        loop {
            let cr0 = registers.read_cr0();
            if cr0.write_protect() {
                break;
            }
            registers.write_cr0(cr0.with_write_protect(true));
            spin_loop();
        }
        interrupts.restore(saved);
        self.state = BoundaryState::Idle;
    }
}

impl Default for TrustedBoundary {
    fn default() -> Self {
        Self::new()
    }
}
