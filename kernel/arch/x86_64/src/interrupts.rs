//! Interrupt state around trusted sections

/// Interrupt enable flag in RFLAGS
pub const RFLAGS_IF: u64 = 0x200;

/// Saves and restores the interrupt state of the executing CPU
pub trait InterruptControl {
    /// What [`InterruptControl::restore`] needs to undo a
    /// [`InterruptControl::save_and_disable`]
    type Saved;

    /// Disables maskable interrupts, returning the previous state
    fn save_and_disable(&mut self) -> Self::Saved;
    /// Restores the state returned by the matching [`InterruptControl::save_and_disable`]
    fn restore(&mut self, saved: Self::Saved);
}

/// Interrupt control of the executing CPU, through the global critical section
#[cfg(feature = "critical-section")]
#[derive(Debug)]
pub struct HardwareInterrupts {
    _private: (),
}

#[cfg(feature = "critical-section")]
impl HardwareInterrupts {
    /// # Safety
    /// The caller must run in ring 0.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(feature = "critical-section")]
impl InterruptControl for HardwareInterrupts {
    type Saved = critical_section::RestoreState;

    fn save_and_disable(&mut self) -> Self::Saved {
        unsafe { critical_section::acquire() }
    }

    fn restore(&mut self, saved: Self::Saved) {
        unsafe { critical_section::release(saved) }
    }
}
