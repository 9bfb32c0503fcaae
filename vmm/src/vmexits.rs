//! Exit dispatcher.
//!
//! Exit reasons index a fixed table of handlers. A handler either resolves
//! the exit inside the monitor and lets the guest resume, or describes it in
//! a [`VmExit`] for the supervisor. Reasons without a handler are reported as
//! [`VmExit::Unknown`].
use crate::{
    config::HaltPolicy,
    emulate::EmulationResult,
    mmu::PageFault,
    mode::{DB_VECTOR, GP_VECTOR, RFLAGS_DF, RFLAGS_IF, RFLAGS_VM},
    run::{IoDirection, IoRequest, MmioRequest, VmExit},
    stats,
    vcpu::ActiveVcpu,
    vm::Gva,
    vm_control::VmcsProcBasedVmexecCtl,
    vmcs::{BasicExitReason, Field, InterruptionInfo, InterruptionType},
    VmError,
};
use iced_x86::{Decoder, DecoderOptions, Instruction, OpKind};

/// What the run loop does after an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Enter the guest again.
    Resume,
    /// Return to the supervisor.
    Report(VmExit),
}

/// Handler of one exit reason.
pub type ExitHandler = fn(&mut ActiveVcpu<'_>) -> Result<ExitAction, VmError>;

const NR_EXIT_HANDLERS: usize = 49;

static EXIT_HANDLERS: [Option<ExitHandler>; NR_EXIT_HANDLERS] = {
    let mut table: [Option<ExitHandler>; NR_EXIT_HANDLERS] = [None; NR_EXIT_HANDLERS];
    table[BasicExitReason::ExceptionOrNmi as usize] = Some(handle_exception);
    table[BasicExitReason::ExternalInt as usize] = Some(handle_external_interrupt);
    table[BasicExitReason::InterruptWindow as usize] = Some(handle_interrupt_window);
    table[BasicExitReason::Cpuid as usize] = Some(handle_cpuid);
    table[BasicExitReason::Hlt as usize] = Some(handle_halt);
    table[BasicExitReason::Invlpg as usize] = Some(handle_invlpg);
    table[BasicExitReason::MovCr as usize] = Some(handle_cr);
    table[BasicExitReason::MovDr as usize] = Some(handle_dr);
    table[BasicExitReason::IoInstruction as usize] = Some(handle_io);
    table[BasicExitReason::Rdmsr as usize] = Some(handle_rdmsr);
    table[BasicExitReason::Wrmsr as usize] = Some(handle_wrmsr);
    table
};


impl ActiveVcpu<'_> {
    /// Dispatch the exit the hardware just reported.
    pub(crate) fn handle_exit(&mut self) -> Result<ExitAction, VmError> {
        let vmcs = self.vmcs;
        let raw = vmcs.read(Field::VmexitReason)? as u32;
        let reason = vmcs.exit_reason()?;
        let vectoring = InterruptionInfo(vmcs.read(Field::IdtVectoringInfo)? as u32);
        if vectoring.valid() && reason.get_basic_reason() != Some(BasicExitReason::ExceptionOrNmi) {
            log::warn!(
                "vcpu #{}: unexpected, valid vectoring info 0x{:x} and exit reason 0x{:x}",
                self.vcpu.index,
                vectoring.0,
                raw
            );
        }
        log::trace!("vcpu #{}: exit 0x{:x}", self.vcpu.index, raw);
        if reason.entry_failure {
            return Ok(ExitAction::Report(VmExit::Unknown {
                hardware_exit_reason: raw,
            }));
        }
        match EXIT_HANDLERS.get(reason.basic as usize).copied().flatten() {
            Some(handler) => handler(self),
            None => Ok(ExitAction::Report(VmExit::Unknown {
                hardware_exit_reason: raw,
            })),
        }
    }

    /// Register by its encoding in exit qualifications. RSP lives in the
    /// vmcs.
    pub(crate) fn reg(&self, index: u8) -> Result<u64, VmError> {
        match index & 0xf {
            4 => self.vmcs.read(Field::GuestRsp),
            i => Ok(self.vcpu.regs.get(i)),
        }
    }

    pub(crate) fn set_reg(&mut self, index: u8, value: u64) -> Result<(), VmError> {
        match index & 0xf {
            4 => {
                self.vcpu.regs.rsp = value;
                self.vmcs.write(Field::GuestRsp, value)
            }
            i => {
                self.vcpu.regs.set(i, value);
                Ok(())
            }
        }
    }

    /// An event is queued for the next entry.
    fn event_pending(&self) -> Result<bool, VmError> {
        Ok(InterruptionInfo(self.vmcs.read(Field::VmentryInterruptionInfo)? as u32).valid())
    }

    /// Retire the instruction unless it faulted.
    fn complete_instruction(&mut self) -> Result<(), VmError> {
        if self.event_pending()? {
            return Ok(());
        }
        self.skip_emulated_instruction()
    }

    fn mmio_request(&self) -> MmioRequest {
        let mmio = &self.vcpu.mmio;
        MmioRequest {
            phys_addr: mmio.phys_addr,
            data: mmio.data,
            len: mmio.size,
            is_write: mmio.is_write,
        }
    }

    /// Repeat count of the string I/O instruction at rip: RCX masked to the
    /// address size of the instruction.
    fn get_io_count(&mut self) -> Result<u64, VmError> {
        let vmcs = self.vmcs;
        let bitness = if vmcs.read(Field::GuestRflags)? & RFLAGS_VM != 0 {
            16
        } else {
            match self.cs_db_l_bits()? {
                (_, true) => 64,
                (true, false) => 32,
                _ => 16,
            }
        };
        let mut rip = vmcs.read(Field::GuestRip)?;
        if bitness != 64 {
            rip = rip.wrapping_add(vmcs.read(Field::GuestCsBase)?);
        }
        // Every intel instruction is at most 15 bytes.
        let len = (vmcs.read(Field::VmexitInstructionLength)? as usize).clamp(1, 15);
        let mut bytes = [0u8; 15];
        if !self.read_guest(rip, &mut bytes[..len])? {
            return Err(VmError::FailedToDecodeInstruction);
        }

        let mut decoder = Decoder::with_ip(bitness, &bytes[..len], rip, DecoderOptions::NONE);
        let mut insn = Instruction::default();
        if !decoder.can_decode() {
            return Err(VmError::FailedToDecodeInstruction);
        }
        decoder.decode_out(&mut insn);
        let address_size = (0..insn.op_count())
            .find_map(|i| match insn.op_kind(i) {
                OpKind::MemorySegSI | OpKind::MemoryESDI => Some(2),
                OpKind::MemorySegESI | OpKind::MemoryESEDI => Some(4),
                OpKind::MemorySegRSI | OpKind::MemoryESRDI => Some(8),
                _ => None,
            })
            .ok_or(VmError::FailedToDecodeInstruction)?;
        Ok(self.vcpu.regs.rcx & (!0u64 >> (64 - address_size * 8)))
    }
}

fn handle_exception(vcpu: &mut ActiveVcpu<'_>) -> Result<ExitAction, VmError> {
    let vmcs = vcpu.vmcs;
    let intr_info = InterruptionInfo(vmcs.read(Field::VmexitInterruptionInfo)? as u32);
    let vectoring = InterruptionInfo(vmcs.read(Field::IdtVectoringInfo)? as u32);
    if vectoring.valid() && !intr_info.is_page_fault() {
        log::warn!(
            "vcpu #{}: unexpected, vectoring info 0x{:x} intr info 0x{:x}",
            vcpu.vcpu.index,
            vectoring.0,
            intr_info.0
        );
    }
    // An interrupt whose delivery was interrupted goes back to the queue.
    if vectoring.is_external_interrupt() {
        vcpu.vcpu.irq.request(vectoring.vector());
    }
    if intr_info.kind() == InterruptionType::Nmi {
        vcpu.hw().reflect_nmi();
        return Ok(ExitAction::Resume);
    }
    let error_code = if intr_info.error_code_valid() {
        vmcs.read(Field::VmexitInterruptionErrCode)? as u32
    } else {
        0
    };
    if intr_info.is_page_fault() {
        let cr2 = vmcs.read(Field::VmexitQualification)?;
        if let Some(gva) = Gva::new(cr2) {
            let ctx = vcpu.mmu_context()?;
            if vcpu.vcpu.mmu.page_fault(&ctx, gva, error_code)? == PageFault::Fixed {
                return Ok(ExitAction::Resume);
            }
            match vcpu.emulate_instruction(cr2)? {
                EmulationResult::Done => return Ok(ExitAction::Resume),
                EmulationResult::DoMmio => {
                    stats::inc(&vcpu.vm.stats.mmio_exits);
                    return Ok(ExitAction::Report(VmExit::Mmio(vcpu.mmio_request())));
                }
                EmulationResult::Fail => {
                    log::warn!("vcpu #{}: page fault at 0x{:x}: emulate fail", vcpu.vcpu.index, cr2);
                }
            }
        }
    }
    let vector = intr_info.vector();
    if vcpu.vcpu.rmode.active
        && vector as u32 == GP_VECTOR
        && error_code == 0
        && vcpu.emulate_instruction(0)? == EmulationResult::Done
    {
        return Ok(ExitAction::Resume);
    }
    if intr_info.kind() == InterruptionType::HardwareException && vector as u32 == DB_VECTOR {
        return Ok(ExitAction::Report(VmExit::Debug));
    }
    Ok(ExitAction::Report(VmExit::Exception { vector, error_code }))
}

fn handle_external_interrupt(vcpu: &mut ActiveVcpu<'_>) -> Result<ExitAction, VmError> {
    stats::inc(&vcpu.vm.stats.irq_exits);
    Ok(ExitAction::Resume)
}

fn handle_io(vcpu: &mut ActiveVcpu<'_>) -> Result<ExitAction, VmError> {
    stats::inc(&vcpu.vm.stats.io_exits);
    let vmcs = vcpu.vmcs;
    let q = vmcs.read(Field::VmexitQualification)?;
    let mut io = IoRequest {
        direction: if q & 8 != 0 { IoDirection::In } else { IoDirection::Out },
        size: (q & 7) as u8 + 1,
        string: q & 16 != 0,
        string_down: vmcs.read(Field::GuestRflags)? & RFLAGS_DF != 0,
        rep: q & 32 != 0,
        port: (q >> 16) as u16,
        count: 1,
        address: 0,
        value: 0,
    };
    if io.string {
        io.count = match vcpu.get_io_count() {
            Ok(count) => count,
            Err(VmError::FailedToDecodeInstruction) => {
                log::warn!("vcpu #{}: cannot decode string i/o instruction", vcpu.vcpu.index);
                return Ok(ExitAction::Resume);
            }
            Err(e) => return Err(e),
        };
        io.address = vmcs.read(Field::GuestLinearAddr)?;
    } else {
        io.value = vcpu.vcpu.regs.rax;
    }
    Ok(ExitAction::Report(VmExit::Io(io)))
}

fn handle_invlpg(vcpu: &mut ActiveVcpu<'_>) -> Result<ExitAction, VmError> {
    let address = vcpu.vmcs.read(Field::VmexitQualification)?;
    if let Some(gva) = Gva::new(address) {
        let ctx = vcpu.mmu_context()?;
        vcpu.vcpu.mmu.inval_page(&ctx, gva);
    }
    stats::inc(&vcpu.vm.stats.invlpg);
    vcpu.skip_emulated_instruction()?;
    Ok(ExitAction::Resume)
}

fn handle_cr(vcpu: &mut ActiveVcpu<'_>) -> Result<ExitAction, VmError> {
    let q = vcpu.vmcs.read(Field::VmexitQualification)?;
    let cr = q & 15;
    let reg = ((q >> 8) & 15) as u8;
    match (q >> 4) & 3 {
        // mov to cr
        0 => {
            let value = vcpu.reg(reg)?;
            let handled = match cr {
                0 => vcpu.set_cr0(value).map(|_| true),
                3 => vcpu.set_cr3(value).map(|_| true),
                4 => vcpu.set_cr4(value).map(|_| true),
                8 => vcpu.set_cr8(value).map(|_| true),
                _ => Ok(false),
            }?;
            if handled {
                vcpu.complete_instruction()?;
                return Ok(ExitAction::Resume);
            }
        }
        // mov from cr
        1 => {
            let value = match cr {
                3 => Some(vcpu.vcpu.cr3),
                8 => Some(vcpu.vcpu.cr8),
                _ => None,
            };
            if let Some(value) = value {
                vcpu.set_reg(reg, value)?;
                vcpu.skip_emulated_instruction()?;
                return Ok(ExitAction::Resume);
            }
        }
        // lmsw
        3 => {
            vcpu.lmsw((q >> 16) & 0xf)?;
            vcpu.skip_emulated_instruction()?;
            return Ok(ExitAction::Resume);
        }
        _ => (),
    }
    log::warn!(
        "vcpu #{}: unhandled control register: op {} cr {}",
        vcpu.vcpu.index,
        (q >> 4) & 3,
        cr
    );
    Ok(ExitAction::Report(VmExit::Unknown {
        hardware_exit_reason: BasicExitReason::MovCr as u32,
    }))
}

fn handle_dr(vcpu: &mut ActiveVcpu<'_>) -> Result<ExitAction, VmError> {
    let q = vcpu.vmcs.read(Field::VmexitQualification)?;
    let dr = q & 7;
    let reg = ((q >> 8) & 15) as u8;
    // mov from dr
    if q & 16 != 0 {
        let value = match dr {
            6 => 0xffff_0ff0,
            7 => 0x400,
            _ => 0,
        };
        vcpu.set_reg(reg, value)?;
    }
    vcpu.skip_emulated_instruction()?;
    Ok(ExitAction::Resume)
}

fn handle_cpuid(_vcpu: &mut ActiveVcpu<'_>) -> Result<ExitAction, VmError> {
    Ok(ExitAction::Report(VmExit::Cpuid))
}

fn handle_rdmsr(vcpu: &mut ActiveVcpu<'_>) -> Result<ExitAction, VmError> {
    let ecx = vcpu.vcpu.regs.rcx as u32;
    if vcpu.cpl()? != 0 {
        vcpu.inject_gp()?;
        return Ok(ExitAction::Resume);
    }
    match vcpu.guest_rdmsr(ecx)? {
        Some(data) => {
            vcpu.vcpu.regs.rax = data & 0xffff_ffff;
            vcpu.vcpu.regs.rdx = data >> 32;
            vcpu.skip_emulated_instruction()?;
        }
        None => vcpu.inject_gp()?,
    }
    Ok(ExitAction::Resume)
}

fn handle_wrmsr(vcpu: &mut ActiveVcpu<'_>) -> Result<ExitAction, VmError> {
    let regs = &vcpu.vcpu.regs;
    let ecx = regs.rcx as u32;
    let data = (regs.rax & 0xffff_ffff) | (regs.rdx << 32);
    if vcpu.cpl()? != 0 {
        vcpu.inject_gp()?;
        return Ok(ExitAction::Resume);
    }
    if vcpu.guest_wrmsr(ecx, data)? {
        vcpu.skip_emulated_instruction()?;
    } else {
        vcpu.inject_gp()?;
    }
    Ok(ExitAction::Resume)
}

fn handle_interrupt_window(vcpu: &mut ActiveVcpu<'_>) -> Result<ExitAction, VmError> {
    // The guest accepts interrupts again; the next entry injects.
    vcpu.vmcs.clear_bits(
        Field::ProcessorBasedVmexecControls,
        VmcsProcBasedVmexecCtl::INTRWINEXIT.bits() as u64,
    )?;
    Ok(ExitAction::Resume)
}

fn handle_halt(vcpu: &mut ActiveVcpu<'_>) -> Result<ExitAction, VmError> {
    vcpu.skip_emulated_instruction()?;
    if !vcpu.vcpu.irq.is_empty() {
        let resume = match vcpu.vm.config.halt_policy {
            HaltPolicy::ResumeIfDeliverable => vcpu.vmcs.read(Field::GuestRflags)? & RFLAGS_IF != 0,
            HaltPolicy::ResumeIfPending => true,
        };
        if resume {
            return Ok(ExitAction::Resume);
        }
    }
    stats::inc(&vcpu.vm.stats.halt_exits);
    Ok(ExitAction::Report(VmExit::Hlt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::VmConfig,
        emulate::testing::Step,
        hw::sim::{SimExit, SCRIPT_EXHAUSTED},
        memory::{MemoryRegion, SlotFlags},
        mode::CR0_PG,
        msr::{MSR_EFER, MSR_LSTAR},
        run::{RunRequest, RunResult},
        vm::testing::{machine, machine_on, region, TestVm},
    };
    use core::sync::atomic::Ordering;

    const GP_INFO: u64 = 0x8000_0b0d;
    const PF_INFO: u64 = 0x8000_0b0e;
    const MMIO_BASE: u64 = 0xd000_0000;

    fn run(t: &TestVm) -> RunResult {
        t.vm.run(&RunRequest::default()).unwrap()
    }

    fn reported(exit: VmExit, instruction_length: u32) -> RunResult {
        RunResult::Exit {
            exit,
            instruction_length,
        }
    }

    fn exhausted() -> RunResult {
        reported(
            VmExit::Unknown {
                hardware_exit_reason: SCRIPT_EXHAUSTED,
            },
            0,
        )
    }

    fn reason(r: BasicExitReason) -> u32 {
        r as u32
    }

    fn rip(t: &TestVm) -> u64 {
        t.vm.get_regs(0).unwrap().rip
    }

    /// Leave real mode through the register interface with `rflags`.
    fn protected(t: &TestVm, rflags: u64) {
        let mut sregs = t.vm.get_sregs(0).unwrap();
        sregs.cr0 = 0x11;
        t.vm.set_sregs(0, &sregs).unwrap();
        let mut regs = t.vm.get_regs(0).unwrap();
        regs.rflags = rflags;
        t.vm.set_regs(0, &regs).unwrap();
    }

    fn proc_controls(t: &TestVm) -> u64 {
        t.vm
            .with_vcpu(0, |vcpu| vcpu.vmcs().read(Field::ProcessorBasedVmexecControls))
            .unwrap()
    }

    #[test]
    fn cpuid_is_reported_and_skipped_on_request() {
        let t = machine();
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::Cpuid),
            &[(Field::VmexitInstructionLength, 2)],
        ));
        assert_eq!(run(&t), reported(VmExit::Cpuid, 2));
        assert_eq!(rip(&t), 0xfff0);

        let res = t
            .vm
            .run(&RunRequest {
                emulated: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(res, exhausted());
        assert_eq!(rip(&t), 0xfff2);

        let entries = t.hw.entries();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].resume);
        assert!(entries[1].resume);
        assert_eq!(t.vm.stats().snapshot().exits, 2);
    }

    #[test]
    fn port_io_reports_value_and_direction() {
        let t = machine();
        t.hw.push_exit(SimExit::exit_with(
            reason(BasicExitReason::IoInstruction),
            &[
                (Field::VmexitQualification, 0x3f8 << 16),
                (Field::VmexitInstructionLength, 1),
            ],
            |regs| regs.rax = 0x41,
        ));
        let out = IoRequest {
            direction: IoDirection::Out,
            size: 1,
            string: false,
            string_down: false,
            rep: false,
            port: 0x3f8,
            count: 1,
            address: 0,
            value: 0x41,
        };
        assert_eq!(run(&t), reported(VmExit::Io(out), 1));

        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::IoInstruction),
            &[
                (Field::VmexitQualification, (0x60 << 16) | 8 | 3),
                (Field::VmexitInstructionLength, 1),
            ],
        ));
        match run(&t) {
            RunResult::Exit {
                exit: VmExit::Io(io), ..
            } => {
                assert_eq!(io.direction, IoDirection::In);
                assert_eq!(io.size, 4);
                assert_eq!(io.port, 0x60);
                assert_eq!(io.count, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(t.vm.stats().snapshot().io_exits, 2);
    }

    /// Map the reset code segment with `code` at f000:fff0 and exit on a
    /// `rep outsb` to port 0x80.
    fn string_io(t: &TestVm, code: &[u8], rcx: u64) -> RunResult {
        let mut image = vec![0u8; 0x1_0000];
        image[0xfff0..0xfff0 + code.len()].copy_from_slice(code);
        t.vm
            .set_memory_region(&MemoryRegion {
                slot: 1,
                guest_phys_addr: 0xf_0000,
                memory_size: 0x1_0000,
                flags: SlotFlags::empty(),
                init_data: Some(&image),
            })
            .unwrap();
        t.hw.push_exit(SimExit::exit_with(
            reason(BasicExitReason::IoInstruction),
            &[
                (Field::VmexitQualification, (0x80 << 16) | 32 | 16),
                (Field::VmexitInstructionLength, code.len() as u64),
                (Field::GuestLinearAddr, 0x1234),
            ],
            move |regs| regs.rcx = rcx,
        ));
        run(t)
    }

    fn rep_outsb(count: u64, instruction_length: u32) -> RunResult {
        reported(
            VmExit::Io(IoRequest {
                direction: IoDirection::Out,
                size: 1,
                string: true,
                string_down: false,
                rep: true,
                port: 0x80,
                count,
                address: 0x1234,
                value: 0,
            }),
            instruction_length,
        )
    }

    #[test]
    fn string_io_count_follows_address_size() {
        // addr32 rep outsb
        let t = machine();
        assert_eq!(string_io(&t, &[0x67, 0xf3, 0x6e], 0x1_0000_0005), rep_outsb(5, 3));

        // rep outsb
        let t = machine();
        assert_eq!(string_io(&t, &[0xf3, 0x6e], 0x3_0007), rep_outsb(7, 2));
    }

    #[test]
    fn undecodable_string_io_resumes() {
        let t = machine();
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::IoInstruction),
            &[
                (Field::VmexitQualification, (0x80 << 16) | 16),
                (Field::VmexitInstructionLength, 1),
            ],
        ));
        // Nothing backs the code segment.
        assert_eq!(run(&t), exhausted());
        assert_eq!(t.vm.stats().snapshot().io_exits, 1);
    }

    #[test]
    fn halt_with_masked_interrupt_is_reported() {
        let t = machine();
        t.vm.request_interrupt(0, 0x20).unwrap();
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::Hlt),
            &[(Field::VmexitInstructionLength, 1)],
        ));
        assert_eq!(run(&t), reported(VmExit::Hlt, 1));
        assert_eq!(rip(&t), 0xfff1);
        assert_eq!(t.vm.stats().snapshot().halt_exits, 1);
        let window = VmcsProcBasedVmexecCtl::INTRWINEXIT.bits() as u64;
        assert_eq!(proc_controls(&t) & window, window);
        assert!(t.vm.get_sregs(0).unwrap().pending_int);
    }

    #[test]
    fn halt_resumes_on_pending_interrupt_when_configured() {
        let t = machine_on(1, VmConfig {
            halt_policy: HaltPolicy::ResumeIfPending,
            ..Default::default()
        });
        t.vm.create_vcpu(0).unwrap();
        t.vm.request_interrupt(0, 0x20).unwrap();
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::Hlt),
            &[(Field::VmexitInstructionLength, 1)],
        ));
        assert_eq!(run(&t), exhausted());
        assert_eq!(rip(&t), 0xfff1);
        assert_eq!(t.vm.stats().snapshot().halt_exits, 0);
    }

    #[test]
    fn rdmsr_splits_value_into_rax_rdx() {
        let t = machine_on(1, VmConfig::default());
        t.hw.set_msr(MSR_LSTAR, 0x1122_3344_5566_7788);
        t.vm.create_vcpu(0).unwrap();
        t.hw.push_exit(SimExit::exit_with(
            reason(BasicExitReason::Rdmsr),
            &[(Field::VmexitInstructionLength, 2)],
            |regs| regs.rcx = MSR_LSTAR as u64,
        ));
        assert_eq!(run(&t), exhausted());
        let regs = t.vm.get_regs(0).unwrap();
        assert_eq!(regs.rax, 0x5566_7788);
        assert_eq!(regs.rdx, 0x1122_3344);
        assert_eq!(regs.rip, 0xfff2);
    }

    #[test]
    fn rdmsr_of_unknown_msr_faults() {
        let t = machine();
        t.hw.push_exit(SimExit::exit_with(
            reason(BasicExitReason::Rdmsr),
            &[(Field::VmexitInstructionLength, 2)],
            |regs| regs.rcx = 0x1234,
        ));
        assert_eq!(run(&t), exhausted());
        assert_eq!(t.hw.entries()[1].entry_info, GP_INFO);
        assert_eq!(rip(&t), 0xfff0);
    }

    #[test]
    fn wrmsr_with_reserved_efer_bit_faults() {
        let t = machine();
        t.hw.push_exit(SimExit::exit_with(
            reason(BasicExitReason::Wrmsr),
            &[(Field::VmexitInstructionLength, 2)],
            |regs| {
                regs.rcx = MSR_EFER as u64;
                regs.rax = 1 << 1;
            },
        ));
        assert_eq!(run(&t), exhausted());
        assert_eq!(t.hw.entries()[1].entry_info, GP_INFO);
        assert_eq!(rip(&t), 0xfff0);
    }

    #[test]
    fn wrmsr_updates_guest_value() {
        let t = machine();
        t.hw.push_exit(SimExit::exit_with(
            reason(BasicExitReason::Wrmsr),
            &[(Field::VmexitInstructionLength, 2)],
            |regs| {
                regs.rcx = MSR_LSTAR as u64;
                regs.rax = 0x9abc_def0;
                regs.rdx = 0x1;
            },
        ));
        assert_eq!(run(&t), exhausted());
        assert_eq!(rip(&t), 0xfff2);
        let lstar = t.vm.with_vcpu(0, |vcpu| vcpu.guest_rdmsr(MSR_LSTAR)).unwrap();
        assert_eq!(lstar, Some(0x1_9abc_def0));
    }

    #[test]
    fn msr_access_from_user_mode_faults() {
        let t = machine();
        let user_cs = (Field::GuestCsSelector, 3);
        t.hw.push_exit(SimExit::exit_with(
            reason(BasicExitReason::Rdmsr),
            &[(Field::VmexitInstructionLength, 2), user_cs],
            |regs| {
                regs.rcx = MSR_LSTAR as u64;
                regs.rax = 0x1111;
                regs.rdx = 0x2222;
            },
        ));
        assert_eq!(run(&t), exhausted());
        assert_eq!(t.hw.entries()[1].entry_info, GP_INFO);
        let regs = t.vm.get_regs(0).unwrap();
        assert_eq!((regs.rax, regs.rdx, regs.rip), (0x1111, 0x2222, 0xfff0));

        t.hw.push_exit(SimExit::exit_with(
            reason(BasicExitReason::Wrmsr),
            &[(Field::VmexitInstructionLength, 2), user_cs],
            |regs| {
                regs.rcx = MSR_LSTAR as u64;
                regs.rax = 0x9abc_def0;
                regs.rdx = 0x1;
            },
        ));
        assert_eq!(run(&t), exhausted());
        assert_eq!(t.hw.entries()[3].entry_info, GP_INFO);
        assert_eq!(rip(&t), 0xfff0);
        let lstar = t.vm.with_vcpu(0, |vcpu| vcpu.guest_rdmsr(MSR_LSTAR)).unwrap();
        assert_eq!(lstar, Some(0));
    }

    #[test]
    fn mov_cr_exits_are_resolved() {
        let t = machine();
        let len = (Field::VmexitInstructionLength, 3);
        // mov cr8, rcx
        t.hw.push_exit(SimExit::exit_with(
            reason(BasicExitReason::MovCr),
            &[(Field::VmexitQualification, 8 | (1 << 8)), len],
            |regs| regs.rcx = 3,
        ));
        // mov cr3, rbx
        t.hw.push_exit(SimExit::exit_with(
            reason(BasicExitReason::MovCr),
            &[(Field::VmexitQualification, 3 | (3 << 8)), len],
            |regs| regs.rbx = 0x5000,
        ));
        // mov rdx, cr3
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::MovCr),
            &[(Field::VmexitQualification, 3 | (1 << 4) | (2 << 8)), len],
        ));
        let new_cr3 = t.mmu.new_cr3.load(Ordering::Relaxed);
        assert_eq!(run(&t), exhausted());

        let sregs = t.vm.get_sregs(0).unwrap();
        assert_eq!(sregs.cr8, 3);
        assert_eq!(sregs.cr3, 0x5000);
        assert_eq!(t.mmu.new_cr3.load(Ordering::Relaxed), new_cr3 + 1);
        let regs = t.vm.get_regs(0).unwrap();
        assert_eq!(regs.rdx, 0x5000);
        assert_eq!(regs.rip, 0xfff0 + 9);
    }

    #[test]
    fn faulting_mov_to_cr0_is_not_retired() {
        let t = machine();
        t.hw.push_exit(SimExit::exit_with(
            reason(BasicExitReason::MovCr),
            &[(Field::VmexitQualification, 0), (Field::VmexitInstructionLength, 3)],
            |regs| regs.rax = CR0_PG,
        ));
        assert_eq!(run(&t), exhausted());
        assert_eq!(t.hw.entries()[1].entry_info, GP_INFO);
        assert_eq!(rip(&t), 0xfff0);
    }

    #[test]
    fn lmsw_enters_protected_mode() {
        let t = machine();
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::MovCr),
            &[
                (Field::VmexitQualification, (1 << 16) | (3 << 4)),
                (Field::VmexitInstructionLength, 3),
            ],
        ));
        assert_eq!(run(&t), exhausted());
        assert_eq!(rip(&t), 0xfff3);
        t.vm
            .with_vcpu(0, |vcpu| {
                assert!(!vcpu.in_real_mode());
                assert_eq!(vcpu.guest_cr0()? & 1, 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn mov_to_cr2_is_unknown() {
        let t = machine();
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::MovCr),
            &[(Field::VmexitQualification, 2), (Field::VmexitInstructionLength, 3)],
        ));
        assert_eq!(
            run(&t),
            reported(
                VmExit::Unknown {
                    hardware_exit_reason: 0x1c
                },
                3
            )
        );
    }

    #[test]
    fn debug_register_reads_have_fixed_values() {
        let t = machine();
        // mov rcx, dr6
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::MovDr),
            &[(Field::VmexitQualification, 6 | 16 | (1 << 8)), (Field::VmexitInstructionLength, 3)],
        ));
        // mov rdx, dr7
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::MovDr),
            &[(Field::VmexitQualification, 7 | 16 | (2 << 8)), (Field::VmexitInstructionLength, 3)],
        ));
        // mov dr0, rax
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::MovDr),
            &[(Field::VmexitQualification, 0), (Field::VmexitInstructionLength, 3)],
        ));
        assert_eq!(run(&t), exhausted());
        let regs = t.vm.get_regs(0).unwrap();
        assert_eq!(regs.rcx, 0xffff_0ff0);
        assert_eq!(regs.rdx, 0x400);
        assert_eq!(regs.rip, 0xfff0 + 9);
    }

    #[test]
    fn invlpg_invalidates_shadow_page() {
        let t = machine();
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::Invlpg),
            &[(Field::VmexitQualification, 0x1000), (Field::VmexitInstructionLength, 3)],
        ));
        assert_eq!(run(&t), exhausted());
        assert_eq!(t.mmu.invalidated.load(Ordering::Relaxed), 1);
        assert_eq!(t.vm.stats().snapshot().invlpg, 1);
        assert_eq!(rip(&t), 0xfff3);
    }

    #[test]
    fn external_interrupt_and_nmi_resume() {
        let t = machine();
        t.hw.push_exit(SimExit::exit(reason(BasicExitReason::ExternalInt), &[]));
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::ExceptionOrNmi),
            &[(Field::VmexitInterruptionInfo, 0x8000_0202)],
        ));
        assert_eq!(run(&t), exhausted());
        assert_eq!(t.vm.stats().snapshot().irq_exits, 1);
        assert_eq!(t.hw.nmis(), 1);
    }

    #[test]
    fn unresolved_exceptions_are_reported() {
        let t = machine();
        // #UD
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::ExceptionOrNmi),
            &[(Field::VmexitInterruptionInfo, 0x8000_0306)],
        ));
        assert_eq!(
            run(&t),
            reported(
                VmExit::Exception {
                    vector: 6,
                    error_code: 0
                },
                0
            )
        );

        // #GP with a selector error code is not emulated.
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::ExceptionOrNmi),
            &[
                (Field::VmexitInterruptionInfo, GP_INFO),
                (Field::VmexitInterruptionErrCode, 0x10),
            ],
        ));
        assert_eq!(
            run(&t),
            reported(
                VmExit::Exception {
                    vector: 13,
                    error_code: 0x10
                },
                0
            )
        );

        // #DB
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::ExceptionOrNmi),
            &[(Field::VmexitInterruptionInfo, 0x8000_0301)],
        ));
        assert_eq!(run(&t), reported(VmExit::Debug, 0));
    }

    #[test]
    fn real_mode_gp_is_emulated() {
        let t = machine();
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::ExceptionOrNmi),
            &[(Field::VmexitInterruptionInfo, GP_INFO)],
        ));
        t.emulator.push(Step::Load {
            addr: 0x100_0000,
            len: 2,
            insn_len: 2,
        });
        assert_eq!(run(&t), exhausted());
        assert_eq!(rip(&t), 0xfff2);
    }

    #[test]
    fn real_mode_stack_fault_is_reported() {
        let t = machine();
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::ExceptionOrNmi),
            &[(Field::VmexitInterruptionInfo, 0x8000_0b0c)],
        ));
        assert_eq!(
            run(&t),
            reported(
                VmExit::Exception {
                    vector: 12,
                    error_code: 0,
                },
                0,
            )
        );
        assert_eq!(rip(&t), 0xfff0);
    }

    #[test]
    fn page_fault_on_backed_memory_is_fixed() {
        let t = machine();
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::ExceptionOrNmi),
            &[
                (Field::VmexitInterruptionInfo, PF_INFO),
                (Field::VmexitInterruptionErrCode, 2),
                (Field::VmexitQualification, 0x100_0000),
            ],
        ));
        assert_eq!(run(&t), exhausted());
        assert_eq!(t.vm.stats().snapshot().pf_fixed, 1);
        assert_eq!(t.mmu.faults.load(Ordering::Relaxed), 1);
    }

    fn mmio_fault(t: &TestVm) {
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::ExceptionOrNmi),
            &[
                (Field::VmexitInterruptionInfo, PF_INFO),
                (Field::VmexitInterruptionErrCode, 4),
                (Field::VmexitQualification, MMIO_BASE),
            ],
        ));
    }

    #[test]
    fn mmio_read_completes_on_next_run() {
        let t = machine();
        mmio_fault(&t);
        t.emulator.push(Step::Load {
            addr: MMIO_BASE,
            len: 4,
            insn_len: 3,
        });
        let res = run(&t);
        assert_eq!(
            res,
            reported(
                VmExit::Mmio(MmioRequest {
                    phys_addr: MMIO_BASE,
                    data: [0; 8],
                    len: 4,
                    is_write: false,
                }),
                0
            )
        );
        assert_eq!(rip(&t), 0xfff0);

        // The guest faults again and the emulator takes the completion.
        mmio_fault(&t);
        t.emulator.push(Step::Load {
            addr: MMIO_BASE,
            len: 4,
            insn_len: 3,
        });
        let res = t
            .vm
            .run(&RunRequest {
                mmio_completion: Some([0x78, 0x56, 0x34, 0x12, 0xaa, 0xbb, 0xcc, 0xdd]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(res, exhausted());
        let regs = t.vm.get_regs(0).unwrap();
        assert_eq!(regs.rax, 0x1234_5678);
        assert_eq!(regs.rip, 0xfff3);
        assert_eq!(t.vm.stats().snapshot().mmio_exits, 1);
    }

    #[test]
    fn mmio_write_is_reported_after_commit() {
        let t = machine();
        let mut regs = t.vm.get_regs(0).unwrap();
        regs.rax = 0xcafe_babe;
        t.vm.set_regs(0, &regs).unwrap();
        mmio_fault(&t);
        t.emulator.push(Step::Store {
            addr: MMIO_BASE + 8,
            len: 4,
            insn_len: 3,
        });
        let res = run(&t);
        assert_eq!(
            res,
            reported(
                VmExit::Mmio(MmioRequest {
                    phys_addr: MMIO_BASE + 8,
                    data: [0xbe, 0xba, 0xfe, 0xca, 0, 0, 0, 0],
                    len: 4,
                    is_write: true,
                }),
                0
            )
        );
        assert_eq!(rip(&t), 0xfff3);
        assert_eq!(t.vm.stats().snapshot().mmio_exits, 1);
    }

    #[test]
    fn failed_emulation_reports_the_fault() {
        let t = machine();
        mmio_fault(&t);
        t.emulator.push(Step::Fail);
        assert_eq!(
            run(&t),
            reported(
                VmExit::Exception {
                    vector: 14,
                    error_code: 4
                },
                0
            )
        );
    }

    #[test]
    fn interrupted_delivery_is_requeued() {
        let t = machine();
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::ExceptionOrNmi),
            &[
                (Field::VmexitInterruptionInfo, 0x8000_0306),
                (Field::IdtVectoringInfo, 0x8000_0030),
            ],
        ));
        assert!(matches!(
            run(&t),
            RunResult::Exit {
                exit: VmExit::Exception { vector: 6, .. },
                ..
            }
        ));
        assert!(t.vm.get_sregs(0).unwrap().pending_int);
    }

    #[test]
    fn vectoring_info_on_other_exits_is_tolerated() {
        let t = machine();
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::Cpuid),
            &[(Field::IdtVectoringInfo, 0x8000_0030), (Field::VmexitInstructionLength, 2)],
        ));
        assert_eq!(run(&t), reported(VmExit::Cpuid, 2));
    }

    #[test]
    fn interrupt_is_injected_in_protected_mode() {
        let t = machine();
        protected(&t, 0x202);
        t.vm.request_interrupt(0, 0x30).unwrap();
        t.hw.push_exit(SimExit::exit(reason(BasicExitReason::Cpuid), &[]));
        assert_eq!(run(&t), reported(VmExit::Cpuid, 0));
        assert_eq!(t.hw.entries()[0].entry_info, 0x8000_0030);
        assert!(!t.vm.get_sregs(0).unwrap().pending_int);
    }

    #[test]
    fn closed_window_waits_for_interrupt_window_exit() {
        let t = machine();
        protected(&t, 0x2);
        t.vm.request_interrupt(0, 0x30).unwrap();
        // The guest executes sti.
        t.hw.push_exit(SimExit::exit(
            reason(BasicExitReason::InterruptWindow),
            &[(Field::GuestRflags, 0x202)],
        ));
        t.hw.push_exit(SimExit::exit(reason(BasicExitReason::Cpuid), &[]));
        assert_eq!(run(&t), reported(VmExit::Cpuid, 0));

        let entries = t.hw.entries();
        assert_eq!(entries[0].entry_info, 0);
        assert_eq!(entries[1].entry_info, 0x8000_0030);
        let window = VmcsProcBasedVmexecCtl::INTRWINEXIT.bits() as u64;
        assert_eq!(proc_controls(&t) & window, 0);
    }

    #[test]
    fn real_mode_interrupt_goes_through_ivt() {
        let t = machine();
        t.vm.set_memory_region(&region(1, 0, 0x1_0000)).unwrap();
        // ivt[0x20] = 2000:1234
        t.vm.memory().write(0x20 * 4, &[0x34, 0x12, 0x00, 0x20]);
        let mut regs = t.vm.get_regs(0).unwrap();
        regs.rsp = 0x8000;
        regs.rflags |= RFLAGS_IF;
        t.vm.set_regs(0, &regs).unwrap();
        t.vm.request_interrupt(0, 0x20).unwrap();
        t.hw.push_exit(SimExit::exit(reason(BasicExitReason::Cpuid), &[]));
        assert_eq!(run(&t), reported(VmExit::Cpuid, 0));

        assert_eq!(t.hw.entries()[0].entry_info, 0);
        let regs = t.vm.get_regs(0).unwrap();
        assert_eq!(regs.rip, 0x1234);
        assert_eq!(regs.rsp, 0x7ffa);
        assert_eq!(regs.rflags & RFLAGS_IF, 0);
        let sregs = t.vm.get_sregs(0).unwrap();
        assert_eq!(sregs.cs.selector, 0x2000);
        assert_eq!(sregs.cs.base, 0x2_0000);

        // ip, cs, flags
        let mut frame = [0u8; 6];
        t.vm.memory().read(0x7ffa, &mut frame);
        assert_eq!(frame, [0xf0, 0xff, 0x00, 0xf0, 0x02, 0x32]);
    }

    #[test]
    fn out_of_range_interrupt_is_rejected() {
        let t = machine();
        assert!(matches!(
            t.vm.request_interrupt(0, 256),
            Err(VmError::InvalidInterrupt(256))
        ));
    }

    #[test]
    fn unhandled_exits_are_unknown() {
        let t = machine();
        t.hw.push_exit(SimExit::exit(reason(BasicExitReason::Rdtsc), &[]));
        assert_eq!(
            run(&t),
            reported(
                VmExit::Unknown {
                    hardware_exit_reason: 0x10
                },
                0
            )
        );
        t.hw.push_exit(SimExit::exit(0x8000_0021, &[]));
        assert_eq!(
            run(&t),
            reported(
                VmExit::Unknown {
                    hardware_exit_reason: 0x8000_0021
                },
                0
            )
        );
    }
}
