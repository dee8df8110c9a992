//! Dedicated stack for trusted calls

use core::arch::asm;

pub const SECURE_STACK_SIZE: usize = 16384;

/// Stack used only while inside a trusted call.
///
/// The untrusted stack pointer is kept in the highest slot, at the base of the stack. One
/// instance belongs to one CPU.
#[repr(C, align(4096))]
pub struct SecureStack([u8; SECURE_STACK_SIZE]);

impl SecureStack {
    #[must_use]
    pub const fn new() -> Self {
        Self([0; SECURE_STACK_SIZE])
    }

    /// The untrusted stack pointer saved by the last switch onto this stack
    #[must_use]
    pub fn saved_stack_pointer(&self) -> usize {
        let mut slot = [0; 8];
        slot.copy_from_slice(&self.0[SECURE_STACK_SIZE - 8..]);
        usize::from_ne_bytes(slot)
    }

    #[cfg_attr(target_os = "none", allow(dead_code))]
    fn save_stack_pointer(&mut self, stack_pointer: usize) {
        self.0[SECURE_STACK_SIZE - 8..].copy_from_slice(&stack_pointer.to_ne_bytes());
    }
}

impl Default for SecureStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Current value of the stack pointer
#[must_use]
pub fn stack_pointer() -> usize {
    let rsp: usize;
    unsafe {
        asm!("mov {0}, rsp", out(reg) rsp, options(nomem, nostack, preserves_flags));
    }
    rsp
}

extern "C-unwind" fn trampoline(call: *mut &mut dyn FnMut()) {
    let call = unsafe { &mut *call };
    call();
}

/// Runs `call` with the stack pointer switched to the base of `stack`, then switches back.
///
/// Hosted builds save the stack pointer but run `call` in place. A panic inside `call` unwinds out
/// of this function.
///
/// # Safety
/// `stack` must be valid for the duration of the call and must not be in use by another call.
/// Interrupts must be disabled.
pub unsafe fn run_on_stack(stack: *mut SecureStack, mut call: &mut dyn FnMut()) {
    unsafe { switch_and_call(stack, core::ptr::addr_of_mut!(call)) }
}

#[cfg(target_os = "none")]
unsafe fn switch_and_call(stack: *mut SecureStack, call: *mut &mut dyn FnMut()) {
    let base = stack as usize + SECURE_STACK_SIZE;
    unsafe {
        asm!(
            "mov [{base} - 8], rsp",
            "lea rsp, [{base} - 16]",
            "call {trampoline}",
            "mov rsp, [rsp + 8]",
            base = in(reg) base,
            trampoline = sym trampoline,
            in("rdi") call,
            clobber_abi("C"),
        );
    }
}

#[cfg(not(target_os = "none"))]
unsafe fn switch_and_call(stack: *mut SecureStack, call: *mut &mut dyn FnMut()) {
    unsafe { (*stack).save_stack_pointer(stack_pointer()) };
    trampoline(call);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_runs_once_and_leaves_the_saved_pointer() {
        let mut stack = SecureStack::new();
        let mut calls = 0;
        unsafe { run_on_stack(&mut stack, &mut || calls += 1) };
        assert_eq!(calls, 1);
        assert_ne!(stack.saved_stack_pointer(), 0);
    }

    #[test]
    #[should_panic(expected = "failed inside the trusted call")]
    fn panics_unwind_out_of_the_call() {
        let mut stack = SecureStack::new();
        unsafe { run_on_stack(&mut stack, &mut || panic!("failed inside the trusted call")) };
    }
}
