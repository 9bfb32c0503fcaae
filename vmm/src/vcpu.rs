//! Virtual CPU implementation.
use crate::{
    emulate::{EmulateOps, GuestMemoryOps, MemoryStatus, MmioState},
    hw::{FxArea, GuestRegisters, Vmx},
    interrupt::PendingInterrupts,
    mmu::{Mmu, MmuContext, PagingMode},
    mode::{self, RFLAGS_RF, RFLAGS_TF},
    msr::MsrList,
    vm::{Gva, Vm},
    vm_control::*,
    vmcs::{instruction_error, ActiveVmcs, Field, Segment, VmcsRegion},
    VmError, PAGE_SIZE,
};
use alloc::boxed::Box;

/// Task register shape saved while the guest runs in real mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RealModeState {
    /// The guest runs in (emulated) real mode.
    pub active: bool,
    pub tr_base: u64,
    pub tr_limit: u32,
    pub tr_ar: u32,
    /// RFLAGS.IOPL of the guest, hidden while in virtual-8086 mode.
    pub save_iopl: u64,
}

/// Guest debugging state set by the supervisor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestDebug {
    pub enabled: bool,
    pub breakpoints: [Option<u64>; 4],
    pub singlestep: bool,
}

/// Virtual cpu.
pub struct Vcpu {
    /// vcpu id.
    pub(crate) index: usize,
    pub(crate) vmcs: VmcsRegion,
    /// Core the vmcs was last loaded on.
    pub(crate) core: Option<usize>,
    /// Indicate whether this vcpu is launched after vmclear.
    pub(crate) launched: bool,
    pub(crate) regs: GuestRegisters,
    pub(crate) cr3: u64,
    pub(crate) cr8: u64,
    pub(crate) shadow_efer: u64,
    pub(crate) apic_base: u64,
    pub(crate) rmode: RealModeState,
    pub(crate) msrs: MsrList,
    pub(crate) irq: PendingInterrupts,
    pub(crate) mmio: MmioState,
    pub(crate) host_fx: FxArea,
    pub(crate) guest_fx: FxArea,
    pub(crate) debug: GuestDebug,
    pub(crate) mmu: Box<dyn Mmu>,
}

impl Vcpu {
    pub(crate) fn new(index: usize, vmcs: VmcsRegion, hw: &dyn Vmx, mmu: Box<dyn Mmu>) -> Self {
        Self {
            index,
            vmcs,
            core: None,
            launched: false,
            regs: GuestRegisters::default(),
            cr3: 0,
            cr8: 0,
            shadow_efer: 0,
            apic_base: 0,
            rmode: RealModeState::default(),
            msrs: MsrList::new(hw),
            irq: PendingInterrupts::default(),
            mmio: MmioState::default(),
            host_fx: FxArea::reset(),
            guest_fx: FxArea::reset(),
            debug: GuestDebug::default(),
            mmu,
        }
    }

    /// Make the vmcs of this vcpu current on the calling core.
    ///
    /// If the vcpu last ran on another core, its vmcs is first evicted from
    /// there and the per-core host fields are refreshed.
    pub(crate) fn activate<'a>(&'a mut self, vm: &'a Vm) -> Result<ActiveVcpu<'a>, VmError> {
        let hw: &'a dyn Vmx = &*vm.hw;
        let core = hw.core_id();
        let pa = self.vmcs.pa();
        if let Some(prev) = self.core.filter(|&prev| prev != core) {
            vm.arena.evict(hw, prev, pa, true);
            self.launched = false;
        }
        if vm.arena.current(core) != Some(pa) {
            hw.vmptrld(pa)
                .map_err(|e| VmError::VmxOperationError(instruction_error(hw, e)))?;
            vm.arena.set_current(hw, pa);
        }
        let vmcs = ActiveVmcs::new(hw);
        if self.core != Some(core) {
            // Linux uses per-cpu TSS and GDT, so set them here.
            let host = hw.host_state();
            vmcs.write(Field::HostTrBase, host.tr_base)?;
            vmcs.write(Field::HostGdtrBase, host.gdtr_base)?;
            vmcs.write(Field::HostIa32SysenterEspMsr, host.sysenter_esp)?;
            self.core = Some(core);
            log::trace!("vcpu #{}: bound to core #{}", self.index, core);
        }
        Ok(ActiveVcpu { vm, vcpu: self, vmcs })
    }

    /// Evict the vmcs from every core that holds it. The vcpu is dropped
    /// afterwards, which frees the mmu and the vmcs region.
    pub(crate) fn destroy(self, vm: &Vm) {
        let hw = &*vm.hw;
        let pa = self.vmcs.pa();
        for core in 0..vm.arena.nr_cores() {
            if self.core == Some(core) || vm.arena.current(core) == Some(pa) {
                vm.arena.evict(hw, core, pa, true);
            }
        }
        log::info!("vcpu #{}: destroyed", self.index);
    }
}

/// A vcpu whose vmcs is current on this core.
///
/// It lives as long as the vcpu lock is held; dropping it is the unload.
pub struct ActiveVcpu<'a> {
    pub(crate) vm: &'a Vm,
    pub(crate) vcpu: &'a mut Vcpu,
    pub(crate) vmcs: ActiveVmcs<'a>,
}

/// General purpose registers of the supervisor interface.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Regs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// A segment register with its access rights decoded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: bool,
    pub dpl: u8,
    pub db: bool,
    pub s: bool,
    pub l: bool,
    pub g: bool,
    pub avl: bool,
    pub unusable: bool,
}

impl SegmentDescriptor {
    /// Decode the access-rights field. An unusable segment reports no other
    /// attribute.
    pub fn from_access_rights(selector: u16, base: u64, limit: u32, ar: u32) -> Self {
        let mut seg = Self {
            base,
            limit,
            selector,
            ..Default::default()
        };
        if ar & AR_UNUSABLE != 0 {
            seg.unusable = true;
            return seg;
        }
        seg.type_ = (ar & 15) as u8;
        seg.s = ar & (1 << 4) != 0;
        seg.dpl = ((ar >> 5) & 3) as u8;
        seg.present = ar & (1 << 7) != 0;
        seg.avl = ar & (1 << 12) != 0;
        seg.l = ar & (1 << 13) != 0;
        seg.db = ar & (1 << 14) != 0;
        seg.g = ar & (1 << 15) != 0;
        seg
    }

    /// Encode the access-rights field.
    pub fn access_rights(&self) -> u32 {
        if self.unusable {
            return AR_UNUSABLE;
        }
        (self.type_ as u32 & 15)
            | (self.s as u32) << 4
            | (self.dpl as u32 & 3) << 5
            | (self.present as u32) << 7
            | (self.avl as u32) << 12
            | (self.l as u32) << 13
            | (self.db as u32) << 14
            | (self.g as u32) << 15
    }
}

const AR_UNUSABLE: u32 = 1 << 16;

/// GDTR or IDTR.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

/// Segment and control registers of the supervisor interface.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Sregs {
    pub cs: SegmentDescriptor,
    pub ds: SegmentDescriptor,
    pub es: SegmentDescriptor,
    pub fs: SegmentDescriptor,
    pub gs: SegmentDescriptor,
    pub ss: SegmentDescriptor,
    pub tr: SegmentDescriptor,
    pub ldt: SegmentDescriptor,
    pub gdt: DescriptorTable,
    pub idt: DescriptorTable,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub apic_base: u64,
    /// An interrupt is queued. Ignored by [`ActiveVcpu::set_sregs`].
    pub pending_int: bool,
}

impl Sregs {
    fn segments(&self) -> [(Segment, &SegmentDescriptor); 8] {
        [
            (Segment::Cs, &self.cs),
            (Segment::Ds, &self.ds),
            (Segment::Es, &self.es),
            (Segment::Fs, &self.fs),
            (Segment::Gs, &self.gs),
            (Segment::Ss, &self.ss),
            (Segment::Tr, &self.tr),
            (Segment::Ldtr, &self.ldt),
        ]
    }
}

/// Result of [`ActiveVcpu::translate`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub linear_address: u64,
    pub physical_address: u64,
    pub valid: bool,
    pub writeable: bool,
    pub usermode: bool,
}

const APIC_DEFAULT_PHYS_BASE: u64 = 0xfee0_0000;
const MSR_IA32_APICBASE_BSP: u64 = 1 << 8;
const MSR_IA32_APICBASE_ENABLE: u64 = 1 << 11;

impl<'a> ActiveVcpu<'a> {
    /// Index of the vcpu.
    #[inline]
    pub fn index(&self) -> usize {
        self.vcpu.index
    }

    /// The vmcs of the vcpu.
    #[inline]
    pub fn vmcs(&self) -> ActiveVmcs<'a> {
        self.vmcs
    }

    #[inline]
    pub(crate) fn hw(&self) -> &'a dyn Vmx {
        self.vmcs.hw()
    }

    pub(crate) fn paging_mode(&self) -> Result<PagingMode, VmError> {
        Ok(if !self.is_paging()? {
            PagingMode::None
        } else if self.is_long_mode()? {
            PagingMode::Long
        } else if self.is_pae()? {
            PagingMode::Pae
        } else {
            PagingMode::Legacy
        })
    }

    pub(crate) fn mmu_context(&self) -> Result<MmuContext<'a>, VmError> {
        let vm: &'a Vm = self.vm;
        Ok(MmuContext {
            vmcs: self.vmcs,
            memory: &vm.memory,
            stats: &vm.stats,
            cr3: self.vcpu.cr3,
            paging: self.paging_mode()?,
        })
    }

    /// Throw away the shadow translations of this vcpu.
    pub fn reset_mmu(&mut self) -> Result<(), VmError> {
        let ctx = self.mmu_context()?;
        self.vcpu.mmu.reset_context(&ctx)
    }

    /// Read guest virtual memory. False if part of the range is unmapped.
    pub(crate) fn read_guest(&mut self, addr: u64, buf: &mut [u8]) -> Result<bool, VmError> {
        let ctx = self.mmu_context()?;
        let mut ops = GuestMemoryOps {
            mmu: &mut *self.vcpu.mmu,
            ctx: &ctx,
            mmio: &mut self.vcpu.mmio,
        };
        Ok(ops.read_std(addr, buf) == MemoryStatus::Continue)
    }

    /// Write guest virtual memory. False if part of the range is unmapped.
    pub(crate) fn write_guest(&mut self, addr: u64, data: &[u8]) -> Result<bool, VmError> {
        let ctx = self.mmu_context()?;
        let mut done = 0;
        while done < data.len() {
            let addr = addr.wrapping_add(done as u64);
            let offset = (addr as usize) & (PAGE_SIZE - 1);
            let len = (PAGE_SIZE - offset).min(data.len() - done);
            let Some(gpa) = Gva::new(addr).and_then(|gva| self.vcpu.mmu.gva_to_gpa(&ctx, gva)) else {
                return Ok(false);
            };
            if ctx.memory.write(gpa.as_u64(), &data[done..done + len]) != len {
                return Ok(false);
            }
            done += len;
        }
        Ok(true)
    }

    /// Retire the instruction that caused the exit.
    pub(crate) fn skip_emulated_instruction(&mut self) -> Result<(), VmError> {
        let vmcs = self.vmcs;
        let len = vmcs.read(Field::VmexitInstructionLength)?;
        vmcs.write(Field::GuestRip, vmcs.read(Field::GuestRip)?.wrapping_add(len))?;
        // Clear the interrupt shadow of the retired instruction.
        let shadow = (Interruptibility::STI | Interruptibility::MOV_SS).bits() as u64;
        let state = vmcs.read(Field::GuestInterruptibilityState)?;
        if state & shadow != 0 {
            vmcs.write(Field::GuestInterruptibilityState, state & !shadow)?;
        }
        Ok(())
    }

    /// Bring a freshly created vcpu to the architectural reset state.
    ///
    /// The guest starts at f000:fff0 in real mode.
    pub(crate) fn setup(&mut self) -> Result<(), VmError> {
        let vmcs = self.vmcs;
        let hw = self.hw();
        let vcpu = &mut *self.vcpu;

        vcpu.regs = GuestRegisters {
            // Processor identification of the reset state.
            rdx: 1,
            ..Default::default()
        };
        vcpu.cr8 = 0;
        vcpu.apic_base = APIC_DEFAULT_PHYS_BASE | MSR_IA32_APICBASE_BSP | MSR_IA32_APICBASE_ENABLE;
        hw.fx_save(&mut vcpu.host_fx);
        vcpu.guest_fx = FxArea::reset();

        // 26.3.1.2 Checks on Guest Segment Registers
        //
        // CS.base should be 0xffff0000, but virtual-8086 mode requires
        // CS.base == CS.selector << 4.
        vmcs.write_segment(Segment::Cs, 0xf000, 0xf_0000, 0xffff, 0x9b)?;
        for seg in [Segment::Ds, Segment::Es, Segment::Fs, Segment::Gs, Segment::Ss] {
            vmcs.write_segment(seg, 0, 0, 0xffff, 0x93)?;
        }
        vmcs.write_segment(Segment::Tr, 0, 0, 0xffff, 0x8b)?;
        vmcs.write_segment(Segment::Ldtr, 0, 0, 0xffff, 0x82)?;

        vmcs.write(Field::GuestIa32SysenterCsMsr, 0)?;
        vmcs.write(Field::GuestIa32SysenterEspMsr, 0)?;
        vmcs.write(Field::GuestIa32SysenterEipMsr, 0)?;

        vmcs.write(Field::GuestRflags, 0x2)?;
        vmcs.write(Field::GuestRip, 0xfff0)?;
        vmcs.write(Field::GuestRsp, 0)?;
        vmcs.write(Field::GuestCr3, 0)?;
        vmcs.write(Field::GuestDr7, 0x400)?;

        vmcs.write(Field::GuestGdtrBase, 0)?;
        vmcs.write(Field::GuestGdtrLimit, 0xffff)?;
        vmcs.write(Field::GuestIdtrBase, 0)?;
        vmcs.write(Field::GuestIdtrLimit, 0xffff)?;

        vmcs.write(Field::GuestActivityState, 0)?;
        vmcs.write(Field::GuestInterruptibilityState, 0)?;
        vmcs.write(Field::GuestPendingDbgExceptions, 0)?;

        // Every port access exits, the bitmaps are unused.
        vmcs.write(Field::IoBitmapA, 0)?;
        vmcs.write(Field::IoBitmapB, 0)?;

        vmcs.write(Field::TscOffset, hw.rdtsc().wrapping_neg())?;
        // 26.3.1.5 Checks on Guest Non-Register State
        vmcs.write(Field::GuestLinkPointer, !0)?;

        // 26.2.1.1 VM-Execution Control Fields
        //
        // Reserved bits in the pin-based and primary processor-based
        // VM-execution controls must be set properly. Software may consult the
        // VMX capability MSRs to determine the proper settings (see Appendix
        // A.3.1 and A.3.2).
        let pin = VmcsPinBasedVmexecCtl::EXTERNAL_INTERRUPT_EXITING | VmcsPinBasedVmexecCtl::NMI_EXITING;
        vmcs.write(
            Field::PinBasedExecControls,
            adjust_controls(hw.rdmsr(IA32_VMX_PINBASED_CTLS), pin.bits()) as u64,
        )?;
        let proc = VmcsProcBasedVmexecCtl::HLT_EXITING
            | VmcsProcBasedVmexecCtl::CR8LOADEXIT
            | VmcsProcBasedVmexecCtl::CR8STOREEXIT
            | VmcsProcBasedVmexecCtl::UNCONDIOEXIT
            | VmcsProcBasedVmexecCtl::INVLPGEXIT
            | VmcsProcBasedVmexecCtl::MOVDREXIT
            | VmcsProcBasedVmexecCtl::USETSCOFF;
        vmcs.write(
            Field::ProcessorBasedVmexecControls,
            adjust_controls(hw.rdmsr(IA32_VMX_PROC_BASED_CTLS), proc.bits()) as u64,
        )?;

        vmcs.write(Field::ExceptionBitmap, 1 << mode::PF_VECTOR)?;
        vmcs.write(Field::PageFaultErrCodeMask, 0)?;
        vmcs.write(Field::PageFaultErrCodeMatch, 0)?;
        vmcs.write(Field::Cr3TargetCount, 0)?;

        // 26.2.2 Checks on Host Control Registers, MSRs, and SSP
        // 26.2.3 Checks on Host Segment and Descriptor-Table Registers
        let host = hw.host_state();
        let segments = hw.save_host_segments();
        vmcs.write(Field::HostCr0, host.cr0)?;
        vmcs.write(Field::HostCr4, host.cr4)?;
        vmcs.write(Field::HostCr3, host.cr3)?;
        vmcs.write(Field::HostCsSelector, host.cs_selector as u64)?;
        vmcs.write(Field::HostDsSelector, host.ds_selector as u64)?;
        vmcs.write(Field::HostEsSelector, host.es_selector as u64)?;
        vmcs.write(Field::HostSsSelector, host.ss_selector as u64)?;
        vmcs.write(Field::HostFsSelector, segments.fs_selector as u64)?;
        vmcs.write(Field::HostGsSelector, segments.gs_selector as u64)?;
        vmcs.write(Field::HostFsBase, segments.fs_base)?;
        vmcs.write(Field::HostGsBase, segments.gs_base)?;
        vmcs.write(Field::HostTrSelector, host.tr_selector as u64)?;
        vmcs.write(Field::HostIdtrBase, host.idtr_base)?;
        // Vmexit location
        vmcs.write(Field::HostRip, host.exit_rip)?;
        vmcs.write(Field::HostIa32SysenterCsMsr, host.sysenter_cs as u64)?;
        vmcs.write(Field::HostIa32SysenterEspMsr, host.sysenter_esp)?;
        vmcs.write(Field::HostIa32SysenterEipMsr, host.sysenter_eip)?;

        vcpu.msrs = MsrList::new(hw);
        vcpu.msrs.install(&vmcs)?;

        // 26.2.1.2 VM-Exit Control Fields
        vmcs.write(
            Field::VmexitControls,
            adjust_controls(
                hw.rdmsr(IA32_VMX_EXIT_CTLS),
                VmcsExitCtl::HOST_ADDRESS_SPACE_SIZE.bits(),
            ) as u64,
        )?;
        // 26.2.1.3 VM-Entry Control Fields
        vmcs.write(
            Field::VmentryControls,
            adjust_controls(hw.rdmsr(IA32_VMX_ENTRY_CTLS), 0) as u64,
        )?;
        vmcs.write(Field::VmentryInterruptionInfo, 0)?;

        vmcs.write(Field::VirtualApicPageAddr, 0)?;
        vmcs.write(Field::TprThreshold, 0)?;

        vmcs.write(Field::Cr0GuestHostMask, mode::GUEST_CR0_MASK)?;
        vmcs.write(Field::Cr4GuestHostMask, mode::GUEST_CR4_MASK)?;

        self.load_cr0(0x6000_0010)?; // enter rmode
        self.load_cr4(0)?;
        self.load_efer(0);
        self.reset_mmu()
    }

    /// Get the general purpose registers.
    pub fn get_regs(&mut self) -> Result<Regs, VmError> {
        let vmcs = self.vmcs;
        let mut rflags = vmcs.read(Field::GuestRflags)?;
        if self.vcpu.debug.enabled && self.vcpu.debug.singlestep {
            rflags &= !(RFLAGS_TF | RFLAGS_RF);
        }
        let r = &self.vcpu.regs;
        Ok(Regs {
            rax: r.rax,
            rbx: r.rbx,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            rsp: vmcs.read(Field::GuestRsp)?,
            rbp: r.rbp,
            r8: r.r8,
            r9: r.r9,
            r10: r.r10,
            r11: r.r11,
            r12: r.r12,
            r13: r.r13,
            r14: r.r14,
            r15: r.r15,
            rip: vmcs.read(Field::GuestRip)?,
            rflags,
        })
    }

    /// Set the general purpose registers.
    pub fn set_regs(&mut self, regs: &Regs) -> Result<(), VmError> {
        let vmcs = self.vmcs;
        let r = &mut self.vcpu.regs;
        r.rax = regs.rax;
        r.rbx = regs.rbx;
        r.rcx = regs.rcx;
        r.rdx = regs.rdx;
        r.rsi = regs.rsi;
        r.rdi = regs.rdi;
        r.rsp = regs.rsp;
        r.rbp = regs.rbp;
        r.r8 = regs.r8;
        r.r9 = regs.r9;
        r.r10 = regs.r10;
        r.r11 = regs.r11;
        r.r12 = regs.r12;
        r.r13 = regs.r13;
        r.r14 = regs.r14;
        r.r15 = regs.r15;
        vmcs.write(Field::GuestRsp, regs.rsp)?;
        vmcs.write(Field::GuestRip, regs.rip)?;
        let mut rflags = regs.rflags;
        if self.vcpu.debug.enabled && self.vcpu.debug.singlestep {
            rflags |= RFLAGS_TF | RFLAGS_RF;
        }
        vmcs.write(Field::GuestRflags, rflags)
    }

    fn get_segment(&self, seg: Segment) -> Result<SegmentDescriptor, VmError> {
        let (sel, base, limit, ar) = seg.fields();
        let vmcs = self.vmcs;
        Ok(SegmentDescriptor::from_access_rights(
            vmcs.read(sel)? as u16,
            vmcs.read(base)?,
            vmcs.read(limit)? as u32,
            vmcs.read(ar)? as u32,
        ))
    }

    /// Get the segment and control registers.
    pub fn get_sregs(&mut self) -> Result<Sregs, VmError> {
        let vmcs = self.vmcs;
        Ok(Sregs {
            cs: self.get_segment(Segment::Cs)?,
            ds: self.get_segment(Segment::Ds)?,
            es: self.get_segment(Segment::Es)?,
            fs: self.get_segment(Segment::Fs)?,
            gs: self.get_segment(Segment::Gs)?,
            ss: self.get_segment(Segment::Ss)?,
            tr: self.get_segment(Segment::Tr)?,
            ldt: self.get_segment(Segment::Ldtr)?,
            gdt: DescriptorTable {
                base: vmcs.read(Field::GuestGdtrBase)?,
                limit: vmcs.read(Field::GuestGdtrLimit)? as u16,
            },
            idt: DescriptorTable {
                base: vmcs.read(Field::GuestIdtrBase)?,
                limit: vmcs.read(Field::GuestIdtrLimit)? as u16,
            },
            cr0: self.guest_cr0()?,
            cr2: self.vcpu.regs.cr2,
            cr3: self.vcpu.cr3,
            cr4: self.guest_cr4()?,
            cr8: self.vcpu.cr8,
            efer: self.vcpu.shadow_efer,
            apic_base: self.vcpu.apic_base,
            pending_int: !self.vcpu.irq.is_empty(),
        })
    }

    /// Set the segment and control registers.
    ///
    /// The values are taken as they are: the real-mode flag follows CR0.PE
    /// but the segment rewrites of a mode transition are not replayed.
    pub fn set_sregs(&mut self, sregs: &Sregs) -> Result<(), VmError> {
        let vmcs = self.vmcs;
        for (seg, desc) in sregs.segments() {
            vmcs.write_segment(seg, desc.selector, desc.base, desc.limit, desc.access_rights())?;
        }
        vmcs.write(Field::GuestIdtrLimit, sregs.idt.limit as u64)?;
        vmcs.write(Field::GuestIdtrBase, sregs.idt.base)?;
        vmcs.write(Field::GuestGdtrLimit, sregs.gdt.limit as u64)?;
        vmcs.write(Field::GuestGdtrBase, sregs.gdt.base)?;

        self.vcpu.regs.cr2 = sregs.cr2;
        let mut mmu_reset_needed = self.vcpu.cr3 != sregs.cr3;
        self.vcpu.cr3 = sregs.cr3;
        self.vcpu.cr8 = sregs.cr8;

        mmu_reset_needed |= self.vcpu.shadow_efer != sregs.efer;
        self.load_efer(sregs.efer);
        self.vcpu.apic_base = sregs.apic_base;

        mmu_reset_needed |= self.guest_cr0()? != sregs.cr0;
        self.vcpu.rmode.active = sregs.cr0 & mode::CR0_PE == 0;
        self.update_exception_bitmap()?;
        vmcs.write(Field::Cr0ReadShadow, sregs.cr0)?;
        vmcs.write(Field::GuestCr0, sregs.cr0 | mode::VM_CR0_ALWAYS_ON)?;

        mmu_reset_needed |= self.guest_cr4()? != sregs.cr4;
        self.load_cr4(sregs.cr4)?;

        if mmu_reset_needed {
            self.reset_mmu()?;
        }
        Ok(())
    }

    /// Translate a guest virtual address.
    pub fn translate(&mut self, linear_address: u64) -> Result<Translation, VmError> {
        let ctx = self.mmu_context()?;
        let gpa = Gva::new(linear_address).and_then(|gva| self.vcpu.mmu.gva_to_gpa(&ctx, gva));
        Ok(Translation {
            linear_address,
            physical_address: gpa.map(|gpa| gpa.as_u64()).unwrap_or(0),
            valid: gpa.is_some(),
            writeable: true,
            usermode: false,
        })
    }

    /// Configure guest debugging.
    ///
    /// Breakpoint addresses are recorded; #DB is intercepted while enabled.
    pub fn set_guest_debug(
        &mut self,
        enabled: bool,
        breakpoints: [Option<u64>; 4],
        singlestep: bool,
    ) -> Result<(), VmError> {
        let vmcs = self.vmcs;
        let old_singlestep = self.vcpu.debug.singlestep;
        let mut exception_bitmap = vmcs.read(Field::ExceptionBitmap)?;
        let mut dr7 = 0x400;

        if enabled {
            dr7 |= 0x200;
            for (i, bp) in breakpoints.iter().enumerate() {
                if bp.is_some() {
                    dr7 |= 2 << (i * 2);
                }
            }
            exception_bitmap |= 1 << mode::DB_VECTOR;
            self.vcpu.debug = GuestDebug {
                enabled,
                breakpoints,
                singlestep,
            };
        } else {
            exception_bitmap &= !(1 << mode::DB_VECTOR);
            self.vcpu.debug = GuestDebug::default();
        }

        if old_singlestep && !self.vcpu.debug.singlestep {
            vmcs.clear_bits(Field::GuestRflags, RFLAGS_TF | RFLAGS_RF)?;
        }
        vmcs.write(Field::ExceptionBitmap, exception_bitmap)?;
        vmcs.write(Field::GuestDr7, dr7)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_rights_round_trip() {
        let cs = SegmentDescriptor::from_access_rights(0x8, 0, 0xffff_ffff, 0xa09b);
        assert_eq!(cs.type_, 0xb);
        assert!(cs.s && cs.present && cs.l && cs.g);
        assert!(!cs.db);
        assert_eq!(cs.access_rights(), 0xa09b);
    }

    #[test]
    fn unusable_segment_hides_attributes() {
        let seg = SegmentDescriptor::from_access_rights(0, 0x1000, 0xffff, AR_UNUSABLE | 0x93);
        assert!(seg.unusable);
        assert!(!seg.present);
        assert_eq!(seg.type_, 0);
        assert_eq!(seg.base, 0x1000);
        assert_eq!(seg.access_rights(), AR_UNUSABLE);
    }
}
