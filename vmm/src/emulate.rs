//! Interface to the instruction emulator.
//!
//! The engine emulates single instructions that hardware would not run
//! natively: accesses that fault on MMIO, and privileged instructions of
//! real-mode guests. The emulator decodes and executes the instruction and
//! reaches guest memory only through the [`EmulateOps`] table the engine
//! hands in.
use crate::{
    hw::GuestRegisters,
    mmu::{Mmu, MmuContext},
    mode::RFLAGS_VM,
    vcpu::ActiveVcpu,
    vm::Gva,
    vmcs::Field,
    VmError, PAGE_SIZE,
};

/// CPU mode the instruction executes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    /// Real mode (virtual-8086).
    Real,
    /// 16-bit protected mode.
    Prot16,
    /// 32-bit protected mode.
    Prot32,
    /// 64-bit mode.
    Prot64,
}

/// Segment bases. All zero in 64-bit mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentBases {
    pub cs: u64,
    pub ds: u64,
    pub es: u64,
    pub ss: u64,
    pub fs: u64,
    pub gs: u64,
}

/// Guest state given to the emulator.
///
/// The emulator updates `regs`, `rip` and `rflags` in place. They are
/// written back to the vcpu only when the instruction completes.
pub struct EmulationContext<'a> {
    pub mode: CpuMode,
    pub bases: SegmentBases,
    /// Faulting address of a page fault, zero otherwise.
    pub cr2: u64,
    pub rip: u64,
    pub rflags: u64,
    pub regs: &'a mut GuestRegisters,
}

/// Status of a memory operation of [`EmulateOps`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStatus {
    /// The access completed.
    Continue,
    /// The address is unmapped in the guest: a guest page fault.
    PropagateFault,
    /// The engine cannot complete the access now.
    Unhandleable,
}

/// Memory operations the engine offers to the emulator.
pub trait EmulateOps {
    /// Read ordinary guest memory.
    fn read_std(&mut self, addr: u64, buf: &mut [u8]) -> MemoryStatus;
    /// Write ordinary guest memory.
    fn write_std(&mut self, addr: u64, data: &[u8]) -> MemoryStatus;
    /// Read memory that may be MMIO.
    fn read_emulated(&mut self, addr: u64, buf: &mut [u8]) -> MemoryStatus;
    /// Write memory that may be MMIO.
    fn write_emulated(&mut self, addr: u64, data: &[u8]) -> MemoryStatus;
    /// Atomic compare-exchange on memory that may be MMIO.
    fn cmpxchg_emulated(&mut self, addr: u64, old: &[u8], new: &[u8]) -> MemoryStatus;
}

/// The instruction emulator did not complete the instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulationFailed;

/// Emulates one instruction at a time.
pub trait Emulator: Send + Sync {
    /// Emulate the instruction at `ctxt.rip`.
    fn emulate(&self, ctxt: &mut EmulationContext<'_>, ops: &mut dyn EmulateOps) -> Result<(), EmulationFailed>;
}

/// Result of emulating one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulationResult {
    /// Completed; the guest can resume.
    Done,
    /// An MMIO access must be completed by the supervisor.
    DoMmio,
    /// The instruction cannot be emulated.
    Fail,
}

/// Pending MMIO access of a vcpu.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmioState {
    /// An access is waiting for the supervisor.
    pub needed: bool,
    /// `data` holds the completion of a read.
    pub read_completed: bool,
    pub phys_addr: u64,
    pub size: usize,
    pub is_write: bool,
    pub data: [u8; 8],
}

impl MmioState {
    /// Take the completion data of the previous read.
    pub fn complete(&mut self, data: [u8; 8]) {
        self.data = data;
        self.read_completed = true;
    }
}

/// The [`EmulateOps`] of a loaded vcpu.
pub(crate) struct GuestMemoryOps<'a, 'b> {
    pub mmu: &'b mut dyn Mmu,
    pub ctx: &'b MmuContext<'a>,
    pub mmio: &'b mut MmioState,
}

impl GuestMemoryOps<'_, '_> {
    fn translate(&mut self, addr: u64) -> Option<u64> {
        let gva = Gva::new(addr)?;
        self.mmu.gva_to_gpa(self.ctx, gva).map(|gpa| gpa.as_u64())
    }
}

impl EmulateOps for GuestMemoryOps<'_, '_> {
    fn read_std(&mut self, addr: u64, buf: &mut [u8]) -> MemoryStatus {
        let mut done = 0;
        while done < buf.len() {
            let addr = addr + done as u64;
            let offset = (addr as usize) & (PAGE_SIZE - 1);
            let len = (PAGE_SIZE - offset).min(buf.len() - done);
            let Some(gpa) = self.translate(addr) else {
                return MemoryStatus::PropagateFault;
            };
            if self.ctx.memory.read(gpa, &mut buf[done..done + len]) != len {
                return MemoryStatus::Unhandleable;
            }
            done += len;
        }
        MemoryStatus::Continue
    }

    fn write_std(&mut self, addr: u64, data: &[u8]) -> MemoryStatus {
        log::warn!("emulator write_std at 0x{:x} ({} bytes) is not supported", addr, data.len());
        MemoryStatus::Unhandleable
    }

    fn read_emulated(&mut self, addr: u64, buf: &mut [u8]) -> MemoryStatus {
        if self.mmio.read_completed {
            let len = buf.len().min(8);
            buf[..len].copy_from_slice(&self.mmio.data[..len]);
            self.mmio.read_completed = false;
            return MemoryStatus::Continue;
        }
        if self.read_std(addr, buf) == MemoryStatus::Continue {
            return MemoryStatus::Continue;
        }
        let Some(gpa) = self.translate(addr) else {
            return MemoryStatus::PropagateFault;
        };
        self.mmio.needed = true;
        self.mmio.phys_addr = gpa;
        self.mmio.size = buf.len();
        self.mmio.is_write = false;
        MemoryStatus::Unhandleable
    }

    fn write_emulated(&mut self, addr: u64, data: &[u8]) -> MemoryStatus {
        let Some(gpa) = self.translate(addr) else {
            return MemoryStatus::PropagateFault;
        };
        let len = data.len().min(8);
        self.mmio.needed = true;
        self.mmio.phys_addr = gpa;
        self.mmio.size = len;
        self.mmio.is_write = true;
        self.mmio.data = [0; 8];
        self.mmio.data[..len].copy_from_slice(&data[..len]);
        MemoryStatus::Continue
    }

    fn cmpxchg_emulated(&mut self, addr: u64, _old: &[u8], new: &[u8]) -> MemoryStatus {
        log::trace!("emulating exchange at 0x{:x} as write", addr);
        self.write_emulated(addr, new)
    }
}

impl ActiveVcpu<'_> {
    /// Emulate the instruction at the guest rip.
    ///
    /// `cr2` is the faulting address when called for a page fault.
    pub(crate) fn emulate_instruction(&mut self, cr2: u64) -> Result<EmulationResult, VmError> {
        let vmcs = self.vmcs;
        let rflags = vmcs.read(Field::GuestRflags)?;
        let mode = if rflags & RFLAGS_VM != 0 {
            CpuMode::Real
        } else {
            match self.cs_db_l_bits()? {
                (_, true) => CpuMode::Prot64,
                (true, false) => CpuMode::Prot32,
                _ => CpuMode::Prot16,
            }
        };
        let mut bases = SegmentBases {
            fs: vmcs.read(Field::GuestFsBase)?,
            gs: vmcs.read(Field::GuestGsBase)?,
            ..Default::default()
        };
        if mode != CpuMode::Prot64 {
            bases.cs = vmcs.read(Field::GuestCsBase)?;
            bases.ds = vmcs.read(Field::GuestDsBase)?;
            bases.es = vmcs.read(Field::GuestEsBase)?;
            bases.ss = vmcs.read(Field::GuestSsBase)?;
        }
        let rip = vmcs.read(Field::GuestRip)?;
        let ctx = self.mmu_context()?;
        let vm = self.vm;
        let vcpu = &mut *self.vcpu;
        vcpu.regs.rsp = vmcs.read(Field::GuestRsp)?;
        vcpu.mmio.is_write = false;

        let mut ectxt = EmulationContext {
            mode,
            bases,
            cr2,
            rip,
            rflags,
            regs: &mut vcpu.regs,
        };
        let mut ops = GuestMemoryOps {
            mmu: &mut *vcpu.mmu,
            ctx: &ctx,
            mmio: &mut vcpu.mmio,
        };
        let result = vm.emulator.emulate(&mut ectxt, &mut ops);
        let (rip, rflags) = (ectxt.rip, ectxt.rflags);

        if result.is_err() {
            if vcpu.mmio.needed {
                return Ok(EmulationResult::DoMmio);
            }
            log::warn!("vcpu #{}: emulation failed at rip 0x{:x}", vcpu.index, rip);
            return Ok(EmulationResult::Fail);
        }

        vmcs.write(Field::GuestRsp, vcpu.regs.rsp)?;
        vmcs.write(Field::GuestRip, rip)?;
        vmcs.write(Field::GuestRflags, rflags)?;
        if vcpu.mmio.is_write {
            return Ok(EmulationResult::DoMmio);
        }
        Ok(EmulationResult::Done)
    }
}
