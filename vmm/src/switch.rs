//! World switch and the run loop.
//!
//! The hardware saves and loads most of the state on entry and exit. What it
//! does not cover is swapped here by hand: FPU/SSE state, the MSRs kept out
//! of the automatic lists, and the host fs/gs segments.
use crate::{
    mode::{RFLAGS_RF, RFLAGS_TF},
    run::{RunRequest, RunResult},
    stats,
    vcpu::ActiveVcpu,
    vm_control::EntryInterruptionInfo,
    vmcs::{instruction_error, Field, InstructionError},
    vmexits::ExitAction,
    VmError,
};

/// Outcome of one guest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldSwitch {
    /// The guest ran and exited.
    Exited,
    /// The hardware refused the entry.
    EntryFailed(InstructionError),
}

impl ActiveVcpu<'_> {
    /// Enter the guest once and come back on the next exit.
    pub(crate) fn world_switch(&mut self) -> WorldSwitch {
        let hw = self.hw();
        let vcpu = &mut *self.vcpu;
        hw.fx_save(&mut vcpu.host_fx);
        // SAFETY: guest_fx holds an FXSAVE image, the MSR areas describe
        // this vcpu, and the vmcs is current on this core with host fields
        // refreshed on activation.
        let result = unsafe {
            hw.fx_restore(&vcpu.guest_fx);
            vcpu.msrs.enter_guest(hw);
            let result = hw.enter_guest(&mut vcpu.regs, vcpu.launched);
            vcpu.msrs.leave_guest(hw);
            hw.fx_save(&mut vcpu.guest_fx);
            hw.fx_restore(&vcpu.host_fx);
            result
        };
        match result {
            Ok(()) => WorldSwitch::Exited,
            Err(fail) => WorldSwitch::EntryFailed(instruction_error(hw, fail)),
        }
    }

    /// Run the guest until an exit needs the supervisor.
    pub fn run(&mut self, req: &RunRequest) -> Result<RunResult, VmError> {
        if req.emulated {
            self.skip_emulated_instruction()?;
        }
        if let Some(data) = req.mmio_completion {
            self.vcpu.mmio.complete(data);
        }
        self.vcpu.mmio.needed = false;

        let vm = self.vm;
        let vmcs = self.vmcs;
        loop {
            let hw = self.hw();
            let segs = hw.save_host_segments();
            // A selector with RPL or TI set fails the host-state checks:
            // load null and restore the real one by hand after the exit.
            let reload = (segs.fs_selector | segs.gs_selector) & 7 != 0;
            vmcs.write(Field::HostFsSelector, if reload { 0 } else { segs.fs_selector as u64 })?;
            vmcs.write(Field::HostGsSelector, if reload { 0 } else { segs.gs_selector as u64 })?;
            vmcs.write(Field::HostFsBase, segs.fs_base)?;
            vmcs.write(Field::HostGsBase, segs.gs_base)?;

            let valid = EntryInterruptionInfo::VALID.bits() as u64;
            if !self.vcpu.irq.is_empty() && vmcs.read(Field::VmentryInterruptionInfo)? & valid == 0 {
                self.try_inject()?;
            }
            if self.vcpu.debug.singlestep {
                vmcs.set_bits(Field::GuestRflags, RFLAGS_TF | RFLAGS_RF)?;
            }

            let switched = self.world_switch();
            stats::inc(&vm.stats.exits);
            if reload {
                // SAFETY: restores the state saved above on this core.
                unsafe { hw.restore_host_segments(&segs) };
            }
            if let WorldSwitch::EntryFailed(error) = switched {
                log::error!("vcpu #{}: vm entry failed: {:?}", self.vcpu.index, error);
                return Ok(RunResult::EntryFailure(error));
            }
            self.vcpu.launched = true;

            match self.handle_exit()? {
                ExitAction::Resume => continue,
                ExitAction::Report(exit) => {
                    return Ok(RunResult::Exit {
                        exit,
                        instruction_length: vmcs.read(Field::VmexitInstructionLength)? as u32,
                    });
                }
            }
        }
    }
}
