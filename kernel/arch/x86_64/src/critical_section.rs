//! Critical sections for a single CPU, made by masking interrupts

use core::arch::asm;

use crate::interrupts::RFLAGS_IF;

/// State returned by `acquire` when interrupts were already masked
const WAS_MASKED: u8 = 0;
/// State returned by `acquire` when interrupts were enabled
const WAS_ENABLED: u8 = 1;

/// Restore state for RFLAGS read before masking interrupts
const fn restore_state(rflags: u64) -> u8 {
    if rflags & RFLAGS_IF == 0 {
        WAS_MASKED
    } else {
        WAS_ENABLED
    }
}

struct X86CriticalSection;

unsafe impl critical_section::Impl for X86CriticalSection {
    unsafe fn acquire() -> u8 {
        let rflags: u64;
        unsafe {
            asm!(
                "pushf",
                "pop {0}",
                "cli",
                out(reg) rflags,
                options(nomem)
            );
        }
        restore_state(rflags)
    }

    unsafe fn release(state: u8) {
        if state == WAS_ENABLED {
            unsafe { asm!("sti", options(nomem, nostack)) };
        }
    }
}

#[expect(clippy::no_mangle_with_rust_abi)]
mod ඞ {
    critical_section::set_impl!(super::X86CriticalSection);
}
