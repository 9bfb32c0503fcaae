//! Virtual machine interface.
use crate::{
    config::VmConfig,
    emulate::Emulator,
    hw::Vmx,
    memory::{Memory, MemoryRegion, SlotFlags, SlotInfo},
    mmu::MmuFactory,
    mode::init_rmode_tss,
    percpu::CoreArena,
    run::{RunRequest, RunResult},
    stats::{self, Stats},
    vcpu::{ActiveVcpu, Regs, Sregs, Translation, Vcpu},
    vmcs::{Field, VmcsDescriptor, VmcsRegion},
    VmError, PAGE_SHIFT,
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use crossbeam_utils::Backoff;
use spin::{Mutex, MutexGuard};

/// Guest virtual address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Gva(u64);

impl Gva {
    /// Create a new virtual address with a check.
    #[inline(always)]
    pub const fn new(addr: u64) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Cast into u64.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Guest physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Gpa(u64);

impl Gpa {
    /// Create a new physical address with a check.
    #[inline]
    pub const fn new(addr: u64) -> Option<Self> {
        if addr < 0xffff_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast into u64.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Guest frame number.
    #[inline]
    pub const fn gfn(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<u64> for $t {
            type Output = Self;

            fn add(self, other: u64) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::Sub<u64> for $t {
            type Output = Self;

            fn sub(self, other: u64) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::BitAnd<u64> for $t {
            type Output = Self;

            fn bitand(self, other: u64) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Gva);
impl_arith!(Gpa);

impl core::fmt::Debug for Gva {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gva(0x{:x})", self.0)
    }
}

impl core::fmt::Debug for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}

/// The virtual machine.
///
/// Lock order is vcpu before memory. The memory lock is only held for short
/// swaps inside [`Memory`].
pub struct Vm {
    pub(crate) hw: Arc<dyn Vmx>,
    desc: VmcsDescriptor,
    pub(crate) config: VmConfig,
    pub(crate) arena: Arc<CoreArena>,
    pub(crate) memory: Memory,
    vcpus: Vec<Mutex<Option<Vcpu>>>,
    pub(crate) stats: Stats,
    mmu_factory: Box<MmuFactory>,
    pub(crate) emulator: Box<dyn Emulator>,
}

/// Builder factory to build a virtual machine.
pub struct VmBuilder {
    hw: Arc<dyn Vmx>,
    mmu_factory: Box<MmuFactory>,
    emulator: Box<dyn Emulator>,
    config: VmConfig,
    arena: Option<Arc<CoreArena>>,
}

impl VmBuilder {
    /// Get a builder object to create a new vm.
    ///
    /// `mmu_factory` creates the shadow MMU of each vcpu; `emulator` serves
    /// every vcpu of the machine.
    pub fn new(hw: Arc<dyn Vmx>, mmu_factory: Box<MmuFactory>, emulator: Box<dyn Emulator>) -> Self {
        Self {
            hw,
            mmu_factory,
            emulator,
            config: VmConfig::default(),
            arena: None,
        }
    }

    /// Set the configuration.
    #[inline]
    pub fn config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    /// Share the per-core arena with other machines on the same cores.
    #[inline]
    pub fn arena(mut self, arena: Arc<CoreArena>) -> Self {
        self.arena = Some(arena);
        self
    }

    /// Finalize this builder.
    pub fn finalize(self) -> Result<Vm, VmError> {
        let Self {
            hw,
            mmu_factory,
            emulator,
            config,
            arena,
        } = self;
        let config = config.normalized();
        let desc = VmcsDescriptor::probe(&*hw);
        let arena = arena.unwrap_or_else(|| Arc::new(CoreArena::new(hw.nr_cores())));
        log::info!(
            "vm: {} vcpus, vmcs revision 0x{:x} size 0x{:x}",
            config.max_vcpus,
            desc.revision_id,
            desc.size
        );
        Ok(Vm {
            hw,
            desc,
            config,
            arena,
            memory: Memory::default(),
            vcpus: (0..config.max_vcpus).map(|_| Mutex::new(None)).collect(),
            stats: Stats::default(),
            mmu_factory,
            emulator,
        })
    }
}

impl Vm {
    /// Take the lock of vcpu #index.
    ///
    /// While spinning, the calling core serves evictions posted to it: the
    /// holder may be waiting for this core to drop the vmcs.
    fn lock_vcpu(&self, index: usize) -> Result<MutexGuard<'_, Option<Vcpu>>, VmError> {
        let slot = self.vcpus.get(index).ok_or(VmError::InvalidVcpu(index))?;
        let backoff = Backoff::new();
        loop {
            if let Some(guard) = slot.try_lock() {
                return Ok(guard);
            }
            self.arena.service(&*self.hw);
            backoff.snooze();
        }
    }

    /// Create vcpu #index.
    ///
    /// The first vcpu installs the default region into an empty slot 0. The
    /// real-mode TSS is initialized in the last three pages of slot 0 and the
    /// vcpu starts in real mode.
    pub fn create_vcpu(&self, index: usize) -> Result<(), VmError> {
        if index >= self.config.max_vcpus {
            return Err(VmError::InvalidVcpu(index));
        }
        let mut slot = self.lock_vcpu(index)?;
        if slot.is_some() {
            return Err(VmError::VcpuExists(index));
        }

        let hw = &*self.hw;
        let region = VmcsRegion::allocate(&self.desc, hw)?;
        region.clear(hw)?;

        if self.memory.slot(0).is_none() {
            let default = self.config.default_region;
            self.memory.set_region(
                &MemoryRegion {
                    slot: 0,
                    guest_phys_addr: default.base,
                    memory_size: default.size,
                    flags: SlotFlags::empty(),
                    init_data: None,
                },
                &self.stats,
            )?;
        }
        let tss = self.memory.rmode_tss_base().ok_or(VmError::NoRealModeTss)?;
        init_rmode_tss(&self.memory, tss)?;

        let mmu = (self.mmu_factory)(index)?;
        let mut vcpu = Vcpu::new(index, region, hw, mmu);
        if let Err(e) = vcpu.activate(self).and_then(|mut active| active.setup()) {
            vcpu.destroy(self);
            return Err(e);
        }
        *slot = Some(vcpu);
        log::info!("vcpu #{}: created", index);
        Ok(())
    }

    /// Destroy vcpu #index.
    pub fn destroy_vcpu(&self, index: usize) -> Result<(), VmError> {
        let vcpu = self
            .lock_vcpu(index)?
            .take()
            .ok_or(VmError::VcpuNotCreated(index))?;
        vcpu.destroy(self);
        Ok(())
    }

    /// Load vcpu #index on the calling core and run `f` on it.
    ///
    /// The vcpu lock is held for the duration of `f`. Returning unloads the
    /// vcpu, which keeps its vmcs resident on this core until another core
    /// needs it.
    pub fn with_vcpu<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut ActiveVcpu<'_>) -> Result<R, VmError>,
    ) -> Result<R, VmError> {
        let mut guard = self.lock_vcpu(index)?;
        let vcpu = guard.as_mut().ok_or(VmError::VcpuNotCreated(index))?;
        let mut active = vcpu.activate(self)?;
        f(&mut active)
    }

    /// Run a vcpu until the supervisor must act.
    pub fn run(&self, req: &RunRequest) -> Result<RunResult, VmError> {
        self.with_vcpu(req.vcpu, |vcpu| vcpu.run(req))
    }

    /// Set or clear a memory region.
    ///
    /// Every vcpu drops its cached translations afterwards.
    pub fn set_memory_region(&self, region: &MemoryRegion<'_>) -> Result<(), VmError> {
        self.memory.set_region(region, &self.stats)?;
        self.for_each_vcpu(|vcpu| vcpu.reset_mmu())
    }

    /// Populated memory slots.
    pub fn memory_slots(&self) -> Vec<SlotInfo> {
        self.memory.slots()
    }

    /// Fetch and clear the dirty bitmap of `slot`.
    ///
    /// If any frame was dirty, the frames of the slot are write-protected
    /// again and every vcpu flushes its TLB. The memory configuration is
    /// pinned for the whole call.
    pub fn get_dirty_log(&self, slot: usize) -> Result<Vec<u64>, VmError> {
        let _busy = self.memory.busy();
        let (log, any) = self.memory.take_dirty_log(slot)?;
        if any {
            self.for_each_vcpu(|vcpu| {
                let ctx = vcpu.mmu_context()?;
                vcpu.vcpu.mmu.slot_remove_write_access(&ctx, slot);
                // A write of GUEST_CR3 flushes the guest TLB on entry.
                let vmcs = vcpu.vmcs();
                vmcs.write(Field::GuestCr3, vmcs.read(Field::GuestCr3)?)?;
                stats::inc(&self.stats.tlb_flush);
                Ok(())
            })?;
        }
        Ok(log)
    }

    fn for_each_vcpu(&self, mut f: impl FnMut(&mut ActiveVcpu<'_>) -> Result<(), VmError>) -> Result<(), VmError> {
        for index in 0..self.vcpus.len() {
            match self.with_vcpu(index, &mut f) {
                Ok(()) | Err(VmError::VcpuNotCreated(_)) => (),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Get the general purpose registers of a vcpu.
    pub fn get_regs(&self, index: usize) -> Result<Regs, VmError> {
        self.with_vcpu(index, |vcpu| vcpu.get_regs())
    }

    /// Set the general purpose registers of a vcpu.
    pub fn set_regs(&self, index: usize, regs: &Regs) -> Result<(), VmError> {
        self.with_vcpu(index, |vcpu| vcpu.set_regs(regs))
    }

    /// Get the segment and control registers of a vcpu.
    pub fn get_sregs(&self, index: usize) -> Result<Sregs, VmError> {
        self.with_vcpu(index, |vcpu| vcpu.get_sregs())
    }

    /// Set the segment and control registers of a vcpu.
    pub fn set_sregs(&self, index: usize, sregs: &Sregs) -> Result<(), VmError> {
        self.with_vcpu(index, |vcpu| vcpu.set_sregs(sregs))
    }

    /// Translate a guest virtual address of a vcpu.
    pub fn translate(&self, index: usize, linear_address: u64) -> Result<Translation, VmError> {
        self.with_vcpu(index, |vcpu| vcpu.translate(linear_address))
    }

    /// Queue an external interrupt on a vcpu.
    pub fn request_interrupt(&self, index: usize, irq: u32) -> Result<(), VmError> {
        self.with_vcpu(index, |vcpu| vcpu.request_interrupt(irq))
    }

    /// Configure guest debugging of a vcpu.
    pub fn set_guest_debug(
        &self,
        index: usize,
        enabled: bool,
        breakpoints: [Option<u64>; 4],
        singlestep: bool,
    ) -> Result<(), VmError> {
        self.with_vcpu(index, |vcpu| vcpu.set_guest_debug(enabled, breakpoints, singlestep))
    }

    /// Serve the vmcs evictions posted to the calling core.
    ///
    /// The host calls this from the handler of the interrupt sent by
    /// [`Vmx::notify_core`].
    pub fn service_evictions(&self) {
        self.arena.service(&*self.hw);
    }

    /// Event counters.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Guest physical memory.
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Configuration of the machine.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        for slot in self.vcpus.iter() {
            if let Some(vcpu) = slot.lock().take() {
                vcpu.destroy(self);
            }
        }
    }
}
