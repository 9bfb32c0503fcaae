//! Boundary between the monitor and the virtualization hardware.
//!
//! Every privileged operation the monitor performs (VMX instructions, MSR
//! accesses, FPU state switching and the guest entry itself) goes through the
//! [`Vmx`] trait. [`native::NativeVmx`] executes the real instructions on the
//! current core.
use crate::vmcs::Field;

#[cfg(target_arch = "x86_64")]
pub mod native;
#[cfg(test)]
pub mod sim;

/// A failed VMX instruction.
///
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, 30.2 CONVENTIONS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmFail {
    /// VMfailInvalid: there is no current VMCS (RFLAGS.CF = 1).
    Invalid,
    /// VMfailValid: the error number is in the VM-instruction error field (RFLAGS.ZF = 1).
    Valid,
}

/// Host state the VMCS host-state area is loaded from.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cs_selector: u16,
    pub ds_selector: u16,
    pub es_selector: u16,
    pub ss_selector: u16,
    pub tr_selector: u16,
    /// Base of this core's task-state segment.
    pub tr_base: u64,
    /// Base of this core's global descriptor table.
    pub gdtr_base: u64,
    pub idtr_base: u64,
    pub sysenter_cs: u32,
    /// This core's sysenter stack pointer.
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    /// Address the hardware jumps to on VM exit.
    pub exit_rip: u64,
}

/// Host segment state that the hardware does not restore on VM exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostSegments {
    pub fs_selector: u16,
    pub gs_selector: u16,
    pub fs_base: u64,
    pub gs_base: u64,
}

/// FXSAVE image.
#[repr(C, align(16))]
#[derive(Clone)]
pub struct FxArea(pub [u8; 512]);

impl FxArea {
    /// An image with the FPU reset state: FCW = 0x37f, MXCSR = 0x1f80.
    pub fn reset() -> Self {
        let mut area = Self([0; 512]);
        area.0[0..2].copy_from_slice(&0x37fu16.to_le_bytes());
        area.0[24..28].copy_from_slice(&0x1f80u32.to_le_bytes());
        area
    }

    /// MXCSR stored in the image.
    pub fn mxcsr(&self) -> u32 {
        u32::from_le_bytes([self.0[24], self.0[25], self.0[26], self.0[27]])
    }
}

/// General purpose registers of the guest that are not held in the VMCS.
///
/// `rsp` is only a snapshot: the VMCS is authoritative while the vcpu is
/// resident. The layout is shared with the world-switch assembly.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub cr2: u64,
}

impl GuestRegisters {
    /// Get the register by its encoding in exit qualifications.
    pub fn get(&self, index: u8) -> u64 {
        match index & 0xf {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            _ => self.r15,
        }
    }

    /// Set the register by its encoding in exit qualifications.
    pub fn set(&mut self, index: u8, v: u64) {
        let reg = match index & 0xf {
            0 => &mut self.rax,
            1 => &mut self.rcx,
            2 => &mut self.rdx,
            3 => &mut self.rbx,
            4 => &mut self.rsp,
            5 => &mut self.rbp,
            6 => &mut self.rsi,
            7 => &mut self.rdi,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            _ => &mut self.r15,
        };
        *reg = v;
    }
}

/// Virtualization hardware of the host.
///
/// Methods act on the physical core the caller runs on.
pub trait Vmx: Send + Sync {
    /// Id of the current physical core.
    fn core_id(&self) -> usize;
    /// Number of physical cores.
    fn nr_cores(&self) -> usize;
    /// Translate a host virtual address to a host physical address.
    fn virt_to_phys(&self, va: usize) -> u64;

    /// VMCLEAR the region at `pa`.
    fn vmclear(&self, pa: u64) -> Result<(), VmFail>;
    /// VMPTRLD the region at `pa`.
    fn vmptrld(&self, pa: u64) -> Result<(), VmFail>;
    /// VMREAD from the current VMCS.
    fn vmread(&self, field: Field) -> Result<u64, VmFail>;
    /// VMWRITE to the current VMCS.
    fn vmwrite(&self, field: Field, value: u64) -> Result<(), VmFail>;

    /// Read a model specific register.
    fn rdmsr(&self, msr: u32) -> u64;
    /// Write a model specific register.
    ///
    /// # Safety
    /// The caller must restore any host MSR it clobbers before the host uses it.
    unsafe fn wrmsr(&self, msr: u32, value: u64);
    /// Read the time-stamp counter.
    fn rdtsc(&self) -> u64;

    /// Host state of the current core.
    fn host_state(&self) -> HostState;
    /// Save the fs/gs state.
    fn save_host_segments(&self) -> HostSegments;
    /// Restore the fs/gs state saved by [`Vmx::save_host_segments`].
    ///
    /// # Safety
    /// `seg` must be the state saved on this core before the guest entry.
    unsafe fn restore_host_segments(&self, seg: &HostSegments);
    /// FXSAVE into `area`.
    fn fx_save(&self, area: &mut FxArea);
    /// FXRSTOR from `area`.
    ///
    /// # Safety
    /// `area` must hold a valid FXSAVE image.
    unsafe fn fx_restore(&self, area: &FxArea);

    /// Enter the guest with VMLAUNCH, or VMRESUME if `resume`, and come back
    /// on the next VM exit.
    ///
    /// # Safety
    /// The VMCS of the vcpu that owns `regs` must be current on this core and
    /// its host-state area must describe this core.
    unsafe fn enter_guest(&self, regs: &mut GuestRegisters, resume: bool) -> Result<(), VmFail>;

    /// Deliver an NMI that arrived while the guest ran to the host handler.
    fn reflect_nmi(&self);

    /// Interrupt `core` so that it services its eviction mailbox.
    fn notify_core(&self, core: usize);
}
