//! Protected MMU
//!
//! [`NestedKernel`] owns the frame descriptors, the privileged registers and the page table
//! memory. Every operation that changes any of them runs as a trusted call: interrupts off,
//! CR0.WP clear, on the secure stack.

#[cfg(feature = "hardware")]
use kernel_arch_x86_64::{
    interrupts::HardwareInterrupts, paging::DirectMapOracle, registers::HardwareRegisters,
};
use kernel_arch_x86_64::{
    cpu_info::CpuFeatures,
    interrupts::InterruptControl,
    paging::{Level, PAddr, PageEntry, PageFault, PageOracle, VAddr, PAGE_SIZE},
    registers::{ControlRegisters, Cr0, Cr4, Efer, IA32_EFER},
    secure_stack::run_on_stack,
};
use log::{debug, info, warn};

use crate::{
    boundary::{BoundaryState, TrustedBoundary},
    frame::{FrameKind, FrameTable, DEFAULT_MEMORY_SIZE},
    gate::RegisterGate,
    policy::{fatal, Violation},
    translate::{Translation, Translator},
    vmmu,
    walker::Walker,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Bytes of physical memory covered by the frame descriptors
    pub memory_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
        }
    }
}

/// What the boot code knows about the running system
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BootParameters {
    /// The top-level table currently loaded in CR3
    pub root_table: PAddr,
    /// Number of top-level entries in use
    pub top_level_entries: usize,
    /// First physical frame not yet handed out by the boot code
    pub first_free_frame: PAddr,
    /// Start of the kernel code
    pub code_start: VAddr,
    /// End of the kernel code, exclusive
    pub code_end: VAddr,
}

/// State that is only touched inside a trusted call
struct Protected<R, M> {
    registers: R,
    memory: M,
    frames: FrameTable,
    features: CpuFeatures,
    initialized: bool,
}

impl<R: ControlRegisters, M: PageOracle> Protected<R, M> {
    fn gate(&mut self) -> RegisterGate<'_, R> {
        RegisterGate::new(
            &mut self.registers,
            &mut self.frames,
            self.features,
            self.initialized,
        )
    }

    fn init(&mut self, boot: &BootParameters) {
        if self.initialized {
            fatal(Violation::AlreadyInitialized);
        }
        self.frames.reset();
        if let Err(violation) = self.frames.try_get(boot.first_free_frame) {
            fatal(violation);
        }
        debug!(
            "Nested Kernel: tracking {} frames, first free frame {:#x}",
            self.frames.len(),
            boot.first_free_frame.0
        );

        let root = boot.root_table.frame_base();
        Walker::new(&mut self.frames, &self.memory).classify(
            PageEntry::table(root),
            boot.top_level_entries,
            Level::L4,
        );
        self.frames.get_mut(root).set_active(true);
        debug!(
            "Nested Kernel: {} page table pages",
            [Level::L4, Level::L3, Level::L2, Level::L1]
                .into_iter()
                .map(|level| self.frames.count_of(FrameKind::table(level)))
                .sum::<usize>()
        );

        self.establish_no_execute();
        self.protect_code(root, boot.code_start, boot.code_end);
        self.initialized = true;
        info!("Nested Kernel: initialized");
    }

    /// Sets EFER.NXE if the CPU supports it. This is the only place it is ever set on behalf of
    /// the outer kernel.
    fn establish_no_execute(&mut self) {
        if !self.features.nx {
            warn!("Nested Kernel: NX not supported, EFER.NXE left clear");
            return;
        }
        let efer = Efer::from_bits(self.registers.read_msr(IA32_EFER));
        if !efer.no_execute_enable() {
            self.gate()
                .load_msr(IA32_EFER, efer.with_no_execute_enable(true).into_bits());
        }
    }

    /// Marks the frames of `[start, end)` as code and removes write access from their mappings
    fn protect_code(&mut self, root: PAddr, start: VAddr, end: VAddr) {
        let mut page = start.page_base();
        let mut protected = 0_usize;
        while page < end {
            match Translator::new(&self.memory).find_entry(root, page) {
                Ok(Some(translation)) => {
                    let descriptor = self
                        .frames
                        .get_mut(translation.physical_address(page).frame_base());
                    descriptor.set_kind(FrameKind::Code);
                    descriptor.set_code_frame(true);
                    descriptor.set_user_accessible(false);
                    let location = translation.location;
                    self.memory
                        .write_entry(
                            location.table,
                            location.index,
                            translation.entry.with_write_enable(false),
                        )
                        .unwrap_or_else(|fault| fatal(fault.into()));
                    protected += 1;
                }
                Ok(None) => warn!("Nested Kernel: code page {:#x} is not mapped", page.0),
                Err(fault) => fatal(fault.into()),
            }
            match page.0.checked_add(PAGE_SIZE) {
                Some(next) => page = VAddr(next),
                None => break,
            }
        }
        debug!("Nested Kernel: {protected} code pages write protected");
    }
}

/// The nested kernel of one CPU
pub struct NestedKernel<R, M, I> {
    protected: Protected<R, M>,
    interrupts: I,
    boundary: TrustedBoundary,
}

#[cfg(feature = "hardware")]
impl NestedKernel<HardwareRegisters, DirectMapOracle, HardwareInterrupts> {
    /// Creates the nested kernel of the executing CPU, accessing page tables through the direct
    /// map.
    ///
    /// # Safety
    /// Must be called once, in ring 0, on a CPU running with paging enabled. Physical memory must
    /// be mapped at [`DirectMapOracle::DIRECT_MAP_BASE`].
    #[must_use]
    pub unsafe fn on_hardware(config: &Config) -> Self {
        let (registers, memory, interrupts) = unsafe {
            (
                HardwareRegisters::new(),
                DirectMapOracle::new(DirectMapOracle::DIRECT_MAP_BASE),
                HardwareInterrupts::new(),
            )
        };
        Self::new(config, registers, memory, interrupts, CpuFeatures::detect())
    }
}

impl<R: ControlRegisters, M: PageOracle, I: InterruptControl> NestedKernel<R, M, I> {
    #[must_use]
    pub fn new(
        config: &Config,
        registers: R,
        memory: M,
        interrupts: I,
        features: CpuFeatures,
    ) -> Self {
        Self {
            protected: Protected {
                registers,
                memory,
                frames: FrameTable::new(config.memory_size),
                features,
                initialized: false,
            },
            interrupts,
            boundary: TrustedBoundary::new(),
        }
    }

    /// Runs `operation` as a trusted call
    fn trusted<T>(&mut self, operation: impl FnOnce(&mut Protected<R, M>) -> T) -> T {
        let stack = self.boundary.stack_ptr();
        let saved = self
            .boundary
            .enter(&mut self.protected.registers, &mut self.interrupts);
        let protected = &mut self.protected;
        let mut operation = Some(operation);
        let mut result = None;
        unsafe {
            run_on_stack(stack, &mut || {
                if let Some(operation) = operation.take() {
                    result = Some(operation(protected));
                }
            });
        }
        self.boundary
            .exit(&mut self.protected.registers, &mut self.interrupts, saved);
        result.unwrap_or_else(|| unreachable!("trusted call returned without running"))
    }

    /// Builds the frame descriptors from the page tables the boot code set up and write protects
    /// the kernel code. May only be called once.
    pub fn init(&mut self, boot: &BootParameters) {
        self.trusted(|protected| protected.init(boot));
    }

    pub fn load_cr0(&mut self, value: Cr0) {
        self.trusted(|protected| protected.gate().load_cr0(value));
    }

    pub fn load_cr4(&mut self, value: Cr4) {
        self.trusted(|protected| protected.gate().load_cr4(value));
    }

    pub fn load_msr(&mut self, msr: u32, value: u64) {
        self.trusted(|protected| protected.gate().load_msr(msr, value));
    }

    pub fn load_top_level_table(&mut self, value: u64) {
        self.trusted(|protected| protected.gate().load_top_level_table(value));
    }

    /// Declares `table` as an empty page table page of `level`
    pub fn declare_table(&mut self, table: PAddr, level: Level) {
        self.trusted(|protected| {
            vmmu::declare_table(&mut protected.frames, &mut protected.memory, table, level);
        });
    }

    /// Returns the empty, unreferenced page table page `table` to the unused pool
    pub fn remove_table(&mut self, table: PAddr) {
        self.trusted(|protected| {
            vmmu::remove_table(&mut protected.frames, &protected.memory, table);
        });
    }

    /// Replaces entry `index` of the page table page `table`
    pub fn update_mapping(&mut self, table: PAddr, index: usize, entry: PageEntry) {
        self.trusted(|protected| {
            vmmu::update_mapping(
                &mut protected.frames,
                &mut protected.memory,
                table,
                index,
                entry,
            );
        });
    }

    /// The top-level table loaded in CR3
    #[must_use]
    pub fn active_root(&self) -> PAddr {
        PAddr(self.protected.registers.read_cr3()).frame_base()
    }

    /// Finds the entry mapping `virtual_addr` in the active page tables
    ///
    /// # Errors
    /// This function returns an error if a page table page cannot be read.
    pub fn find_entry(&self, virtual_addr: VAddr) -> Result<Option<Translation>, PageFault> {
        Translator::new(&self.protected.memory).find_entry(self.active_root(), virtual_addr)
    }

    /// # Errors
    /// This function returns an error if `virtual_addr` is not mapped.
    pub fn try_translate(&self, virtual_addr: VAddr) -> Result<PAddr, PageFault> {
        Translator::new(&self.protected.memory).try_translate(self.active_root(), virtual_addr)
    }

    /// Translates a virtual address that must be mapped in the active page tables
    #[must_use]
    pub fn translate(&self, virtual_addr: VAddr) -> PAddr {
        Translator::new(&self.protected.memory).translate(self.active_root(), virtual_addr)
    }

    /// Reads entry `index` of the page table page `table`
    ///
    /// # Errors
    /// This function returns an error if the entry cannot be read.
    pub fn read_mapping(&self, table: PAddr, index: usize) -> Result<PageEntry, PageFault> {
        vmmu::read_mapping(&self.protected.frames, &self.protected.memory, table, index)
    }

    #[must_use]
    pub const fn frames(&self) -> &FrameTable {
        &self.protected.frames
    }

    #[must_use]
    pub const fn registers(&self) -> &R {
        &self.protected.registers
    }

    #[must_use]
    pub const fn features(&self) -> CpuFeatures {
        self.protected.features
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.protected.initialized
    }

    #[must_use]
    pub const fn boundary_state(&self) -> BoundaryState {
        self.boundary.state()
    }
}
