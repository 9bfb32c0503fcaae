//! A software model of the VMX hardware for unit tests.
//!
//! Each test thread plays one physical core (see [`SimVmx::set_core`]). VMCS
//! contents are kept per region, guest entries pop scripted exits from a
//! queue and record what the hardware would have seen.
use super::{FxArea, GuestRegisters, HostSegments, HostState, VmFail, Vmx};
use crate::{vm_control, vmcs::Field};
use std::{
    cell::Cell,
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Mutex,
};

thread_local! {
    static CORE: Cell<usize> = Cell::new(0);
}

/// Exit reason the model reports once the script runs dry.
pub const SCRIPT_EXHAUSTED: u32 = 0x37;

/// Time-stamp counter of the model.
pub const TSC: u64 = 1_000_000;

/// Read-only fields that each exit rewrites.
const EXIT_INFORMATION: [Field; 7] = [
    Field::VmexitQualification,
    Field::VmexitInterruptionInfo,
    Field::VmexitInterruptionErrCode,
    Field::IdtVectoringInfo,
    Field::IdtVectoringErrCode,
    Field::VmexitInstructionLength,
    Field::GuestLinearAddr,
];

/// What the next guest entry does.
pub enum SimExit {
    /// The guest runs and exits with `reason` after `fields` are written to
    /// the VMCS and `regs` updates the registers.
    Exit {
        reason: u32,
        fields: Vec<(Field, u64)>,
        regs: Option<Box<dyn FnOnce(&mut GuestRegisters) + Send>>,
    },
    /// The entry fails with VMfailValid and this instruction error.
    Fail(u32),
}

impl SimExit {
    /// An exit with some fields set.
    pub fn exit(reason: u32, fields: &[(Field, u64)]) -> Self {
        SimExit::Exit {
            reason,
            fields: fields.to_vec(),
            regs: None,
        }
    }

    /// An exit that also changes guest registers.
    pub fn exit_with(
        reason: u32,
        fields: &[(Field, u64)],
        regs: impl FnOnce(&mut GuestRegisters) + Send + 'static,
    ) -> Self {
        SimExit::Exit {
            reason,
            fields: fields.to_vec(),
            regs: Some(Box::new(regs)),
        }
    }
}

/// A guest entry seen by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimEntry {
    pub core: usize,
    pub pa: u64,
    pub resume: bool,
    /// VM-entry interruption information at the time of the entry.
    pub entry_info: u64,
    pub rflags: u64,
}

#[derive(Default)]
struct State {
    current: Vec<Option<u64>>,
    launched: BTreeSet<u64>,
    fields: BTreeMap<u64, BTreeMap<Field, u64>>,
    msrs: BTreeMap<u32, u64>,
    exits: VecDeque<SimExit>,
    entries: Vec<SimEntry>,
    nmis: usize,
}

/// The model.
pub struct SimVmx {
    nr_cores: usize,
    state: Mutex<State>,
}

impl SimVmx {
    pub fn new(nr_cores: usize) -> Self {
        let mut msrs = BTreeMap::new();
        msrs.insert(vm_control::IA32_VMX_BASIC, (0x1000u64 << 32) | 0x12);
        for msr in [
            vm_control::IA32_VMX_PINBASED_CTLS,
            vm_control::IA32_VMX_PROC_BASED_CTLS,
            vm_control::IA32_VMX_EXIT_CTLS,
            vm_control::IA32_VMX_ENTRY_CTLS,
        ] {
            msrs.insert(msr, 0xffff_ffff_0000_0000);
        }
        Self {
            nr_cores,
            state: Mutex::new(State {
                current: vec![None; nr_cores],
                msrs,
                ..Default::default()
            }),
        }
    }

    /// Make the calling thread play `core`.
    pub fn set_core(core: usize) {
        CORE.with(|c| c.set(core));
    }

    /// Region current on `core`.
    pub fn current(&self, core: usize) -> Option<u64> {
        self.state.lock().unwrap().current[core]
    }

    /// Field of the region at `pa`.
    pub fn field(&self, pa: u64, field: Field) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .fields
            .get(&pa)
            .and_then(|f| f.get(&field))
            .copied()
            .unwrap_or(0)
    }

    /// Field of the region current on the calling core.
    pub fn current_field(&self, field: Field) -> u64 {
        let pa = self.current(self.core_id()).expect("no current vmcs");
        self.field(pa, field)
    }

    pub fn set_msr(&self, msr: u32, value: u64) {
        self.state.lock().unwrap().msrs.insert(msr, value);
    }

    pub fn msr(&self, msr: u32) -> u64 {
        self.rdmsr(msr)
    }

    /// Queue the outcome of a future guest entry.
    pub fn push_exit(&self, exit: SimExit) {
        self.state.lock().unwrap().exits.push_back(exit);
    }

    /// Guest entries so far.
    pub fn entries(&self) -> Vec<SimEntry> {
        self.state.lock().unwrap().entries.clone()
    }

    /// NMIs reflected to the host.
    pub fn nmis(&self) -> usize {
        self.state.lock().unwrap().nmis
    }

    fn set_instruction_error(state: &mut State, pa: u64, error: u32) {
        state
            .fields
            .entry(pa)
            .or_default()
            .insert(Field::InstructionError, error as u64);
    }
}

impl Vmx for SimVmx {
    fn core_id(&self) -> usize {
        CORE.with(|c| c.get())
    }

    fn nr_cores(&self) -> usize {
        self.nr_cores
    }

    fn virt_to_phys(&self, va: usize) -> u64 {
        va as u64
    }

    fn vmclear(&self, pa: u64) -> Result<(), VmFail> {
        let core = self.core_id();
        let mut state = self.state.lock().unwrap();
        state.launched.remove(&pa);
        if state.current[core] == Some(pa) {
            state.current[core] = None;
        }
        Ok(())
    }

    fn vmptrld(&self, pa: u64) -> Result<(), VmFail> {
        let core = self.core_id();
        let mut state = self.state.lock().unwrap();
        state.current[core] = Some(pa);
        state.fields.entry(pa).or_default();
        Ok(())
    }

    fn vmread(&self, field: Field) -> Result<u64, VmFail> {
        let core = self.core_id();
        let state = self.state.lock().unwrap();
        let pa = state.current[core].ok_or(VmFail::Invalid)?;
        Ok(state.fields[&pa].get(&field).copied().unwrap_or(0))
    }

    fn vmwrite(&self, field: Field, value: u64) -> Result<(), VmFail> {
        let core = self.core_id();
        let mut state = self.state.lock().unwrap();
        let pa = state.current[core].ok_or(VmFail::Invalid)?;
        state.fields.entry(pa).or_default().insert(field, value);
        Ok(())
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        self.state.lock().unwrap().msrs.get(&msr).copied().unwrap_or(0)
    }

    unsafe fn wrmsr(&self, msr: u32, value: u64) {
        self.set_msr(msr, value);
    }

    fn rdtsc(&self) -> u64 {
        TSC
    }

    fn host_state(&self) -> HostState {
        let core = self.core_id() as u64;
        HostState {
            cr0: 0x8005_0033,
            cr3: 0x20_0000,
            cr4: 0x2020,
            cs_selector: 0x8,
            ds_selector: 0x10,
            es_selector: 0x10,
            ss_selector: 0x10,
            tr_selector: 0x28,
            tr_base: 0xffff_8000_0010_0000 + core * 0x1000,
            gdtr_base: 0xffff_8000_0020_0000 + core * 0x1000,
            idtr_base: 0xffff_8000_0030_0000,
            sysenter_cs: 0x8,
            sysenter_esp: 0xffff_8000_0040_0000 + core * 0x1000,
            sysenter_eip: 0xffff_8000_0050_0000,
            exit_rip: 0xffff_8000_0060_0000,
        }
    }

    fn save_host_segments(&self) -> HostSegments {
        HostSegments {
            fs_selector: 0,
            gs_selector: 0,
            fs_base: 0x7000_0000,
            gs_base: 0xffff_8000_0070_0000,
        }
    }

    unsafe fn restore_host_segments(&self, _seg: &HostSegments) {}

    fn fx_save(&self, _area: &mut FxArea) {}

    unsafe fn fx_restore(&self, _area: &FxArea) {}

    unsafe fn enter_guest(&self, regs: &mut GuestRegisters, resume: bool) -> Result<(), VmFail> {
        let core = self.core_id();
        let mut state = self.state.lock().unwrap();
        let pa = state.current[core].ok_or(VmFail::Invalid)?;
        let launched = state.launched.contains(&pa);
        if resume != launched {
            let error = if resume { 5 } else { 4 };
            Self::set_instruction_error(&mut state, pa, error);
            return Err(VmFail::Valid);
        }
        let fields = state.fields.entry(pa).or_default();
        let entry_info = fields.get(&Field::VmentryInterruptionInfo).copied().unwrap_or(0);
        let rflags = fields.get(&Field::GuestRflags).copied().unwrap_or(0);
        // Delivered events do not stay pending.
        fields.insert(Field::VmentryInterruptionInfo, entry_info & !(1 << 31));
        state.entries.push(SimEntry {
            core,
            pa,
            resume,
            entry_info,
            rflags,
        });
        match state.exits.pop_front() {
            Some(SimExit::Fail(error)) => {
                Self::set_instruction_error(&mut state, pa, error);
                Err(VmFail::Valid)
            }
            Some(SimExit::Exit {
                reason,
                fields: updates,
                regs: update,
            }) => {
                state.launched.insert(pa);
                let fields = state.fields.entry(pa).or_default();
                for f in EXIT_INFORMATION {
                    fields.remove(&f);
                }
                fields.insert(Field::VmexitReason, reason as u64);
                for (f, v) in updates {
                    fields.insert(f, v);
                }
                if let Some(update) = update {
                    update(regs);
                }
                Ok(())
            }
            None => {
                state.launched.insert(pa);
                let fields = state.fields.entry(pa).or_default();
                for f in EXIT_INFORMATION {
                    fields.remove(&f);
                }
                fields.insert(Field::VmexitReason, SCRIPT_EXHAUSTED as u64);
                Ok(())
            }
        }
    }

    fn reflect_nmi(&self) {
        self.state.lock().unwrap().nmis += 1;
    }

    fn notify_core(&self, _core: usize) {}
}
