//! VMX instructions executed on the current core.
use super::{FxArea, GuestRegisters, HostSegments, HostState, VmFail, Vmx};
use crate::vmcs::Field;
use core::arch::{asm, global_asm};

// Guest entry and exit.
//
// `vmm_vmx_enter(regs, resume)` saves the callee-saved registers and the
// `regs` pointer on the host stack, points HOST_RSP at them, loads the guest
// registers and executes VMLAUNCH or VMRESUME. A failed entry falls through
// and returns 1 (VMfailInvalid) or 2 (VMfailValid).
//
// On VM exit the hardware jumps to `vmm_vmx_exit` with the saved stack, which
// stores the guest registers back into `regs` and returns 0 to the caller of
// `vmm_vmx_enter`.
global_asm!(
    ".global vmm_vmx_enter",
    "vmm_vmx_enter:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "push rdi",
    "mov rax, 0x6c14", // HostRsp.
    "vmwrite rax, rsp",
    "jna 3f",
    "mov rax, 0x6c16", // HostRip.
    "lea rdx, [rip + vmm_vmx_exit]",
    "vmwrite rax, rdx",
    "jna 3f",
    "mov rax, [rdi + 0x80]",
    "mov cr2, rax",
    "mov rax, [rdi]",
    "mov rcx, [rdi + 0x08]",
    "mov rdx, [rdi + 0x10]",
    "mov rbx, [rdi + 0x18]",
    "mov rbp, [rdi + 0x28]",
    "mov r8, [rdi + 0x40]",
    "mov r9, [rdi + 0x48]",
    "mov r10, [rdi + 0x50]",
    "mov r11, [rdi + 0x58]",
    "mov r12, [rdi + 0x60]",
    "mov r13, [rdi + 0x68]",
    "mov r14, [rdi + 0x70]",
    "mov r15, [rdi + 0x78]",
    "test rsi, rsi",
    "mov rsi, [rdi + 0x30]",
    "mov rdi, [rdi + 0x38]",
    "jnz 2f",
    "vmlaunch",
    "jmp 3f",
    "2:",
    "vmresume",
    "3:",
    "mov eax, 2",
    "jnc 4f",
    "mov eax, 1",
    "4:",
    "pop rdi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    "",
    ".global vmm_vmx_exit",
    "vmm_vmx_exit:",
    "push rdi",
    "mov rdi, [rsp + 8]",
    "mov [rdi], rax",
    "mov [rdi + 0x08], rcx",
    "mov [rdi + 0x10], rdx",
    "mov [rdi + 0x18], rbx",
    "mov [rdi + 0x28], rbp",
    "mov [rdi + 0x30], rsi",
    "mov [rdi + 0x40], r8",
    "mov [rdi + 0x48], r9",
    "mov [rdi + 0x50], r10",
    "mov [rdi + 0x58], r11",
    "mov [rdi + 0x60], r12",
    "mov [rdi + 0x68], r13",
    "mov [rdi + 0x70], r14",
    "mov [rdi + 0x78], r15",
    "pop rax",
    "mov [rdi + 0x38], rax",
    "mov rax, cr2",
    "mov [rdi + 0x80], rax",
    "pop rdi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "xor eax, eax",
    "ret",
);

extern "C" {
    fn vmm_vmx_enter(regs: *mut GuestRegisters, resume: u64) -> u64;
    fn vmm_vmx_exit();
}

const MSR_FS_BASE: u32 = 0xc000_0100;
const MSR_GS_BASE: u32 = 0xc000_0101;
const MSR_IA32_SYSENTER_CS: u32 = 0x174;
const MSR_IA32_SYSENTER_ESP: u32 = 0x175;
const MSR_IA32_SYSENTER_EIP: u32 = 0x176;

/// Services of the host kernel the native backend relies on.
pub trait HostKernel: Send + Sync {
    /// Id of the current core.
    fn core_id(&self) -> usize;
    /// Number of cores.
    fn nr_cores(&self) -> usize;
    /// Translate a kernel virtual address to a physical address.
    fn virt_to_phys(&self, va: usize) -> u64;
    /// Send the eviction interrupt to `core`. Its handler must call
    /// [`crate::Vm::service_evictions`].
    fn send_eviction_ipi(&self, core: usize);
}

/// [`Vmx`] backed by the real instructions.
///
/// The current core must be in VMX root operation.
pub struct NativeVmx<K: HostKernel> {
    kernel: K,
}

impl<K: HostKernel> NativeVmx<K> {
    /// Create the backend over the host kernel services.
    pub fn new(kernel: K) -> Self {
        Self { kernel }
    }
}

#[inline]
fn status(cf: u8, zf: u8) -> Result<(), VmFail> {
    match (cf, zf) {
        (0, 0) => Ok(()),
        (0, _) => Err(VmFail::Valid),
        _ => Err(VmFail::Invalid),
    }
}

#[repr(C, packed)]
#[derive(Default)]
struct DescriptorTableRegister {
    limit: u16,
    base: u64,
}

impl<K: HostKernel> NativeVmx<K> {
    fn gdtr() -> DescriptorTableRegister {
        let mut dtr = DescriptorTableRegister::default();
        unsafe { asm!("sgdt [{}]", in(reg) &mut dtr, options(nostack)) };
        dtr
    }

    fn idtr() -> DescriptorTableRegister {
        let mut dtr = DescriptorTableRegister::default();
        unsafe { asm!("sidt [{}]", in(reg) &mut dtr, options(nostack)) };
        dtr
    }

    // Base of the 16-byte TSS descriptor referenced by TR.
    fn tr_base(gdt_base: u64, tr: u16) -> u64 {
        let desc = (gdt_base + (tr & !7) as u64) as *const u64;
        let (lo, hi) = unsafe { (desc.read_unaligned(), desc.add(1).read_unaligned()) };
        ((lo >> 16) & 0xff_ffff) | (((lo >> 56) & 0xff) << 24) | ((hi & 0xffff_ffff) << 32)
    }
}

macro_rules! read_selector {
    ($seg: literal) => {{
        let v: u16;
        unsafe { asm!(concat!("mov {0:x}, ", $seg), out(reg) v, options(nomem, nostack)) };
        v
    }};
}

impl<K: HostKernel> Vmx for NativeVmx<K> {
    fn core_id(&self) -> usize {
        self.kernel.core_id()
    }

    fn nr_cores(&self) -> usize {
        self.kernel.nr_cores()
    }

    fn virt_to_phys(&self, va: usize) -> u64 {
        self.kernel.virt_to_phys(va)
    }

    fn vmclear(&self, pa: u64) -> Result<(), VmFail> {
        let (cf, zf): (u8, u8);
        unsafe {
            asm!(
                "vmclear [{}]",
                "setc {}",
                "setz {}",
                in(reg) &pa,
                out(reg_byte) cf,
                out(reg_byte) zf,
                options(nostack)
            );
        }
        status(cf, zf)
    }

    fn vmptrld(&self, pa: u64) -> Result<(), VmFail> {
        let (cf, zf): (u8, u8);
        unsafe {
            asm!(
                "vmptrld [{}]",
                "setc {}",
                "setz {}",
                in(reg) &pa,
                out(reg_byte) cf,
                out(reg_byte) zf,
                options(nostack)
            );
        }
        status(cf, zf)
    }

    fn vmread(&self, field: Field) -> Result<u64, VmFail> {
        let (cf, zf): (u8, u8);
        let v: u64;
        unsafe {
            asm!(
                "vmread {}, {}",
                "setc {}",
                "setz {}",
                out(reg) v,
                in(reg) field as u64,
                out(reg_byte) cf,
                out(reg_byte) zf,
                options(nostack)
            );
        }
        status(cf, zf).map(|_| v)
    }

    fn vmwrite(&self, field: Field, value: u64) -> Result<(), VmFail> {
        let (cf, zf): (u8, u8);
        unsafe {
            asm!(
                "vmwrite {}, {}",
                "setc {}",
                "setz {}",
                in(reg) field as u64,
                in(reg) value,
                out(reg_byte) cf,
                out(reg_byte) zf,
                options(nostack)
            );
        }
        status(cf, zf)
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        let (hi, lo): (u32, u32);
        unsafe {
            asm!("rdmsr", out("edx") hi, out("eax") lo, in("ecx") msr, options(nomem, nostack));
        }
        ((hi as u64) << 32) | (lo as u64)
    }

    unsafe fn wrmsr(&self, msr: u32, value: u64) {
        asm!(
            "wrmsr",
            in("edx") (value >> 32) as u32,
            in("eax") value as u32,
            in("ecx") msr,
            options(nomem, nostack)
        );
    }

    fn rdtsc(&self) -> u64 {
        let (hi, lo): (u32, u32);
        unsafe { asm!("rdtsc", out("edx") hi, out("eax") lo, options(nomem, nostack)) };
        ((hi as u64) << 32) | (lo as u64)
    }

    fn host_state(&self) -> HostState {
        let (cr0, cr3, cr4): (u64, u64, u64);
        unsafe {
            asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack));
            asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack));
            asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack));
        }
        let tr: u16;
        unsafe { asm!("str {0:x}", out(reg) tr, options(nomem, nostack)) };
        let gdtr = Self::gdtr();
        let gdt_base = gdtr.base;
        let idt_base = Self::idtr().base;
        HostState {
            cr0,
            cr3,
            cr4,
            cs_selector: read_selector!("cs"),
            ds_selector: read_selector!("ds"),
            es_selector: read_selector!("es"),
            ss_selector: read_selector!("ss"),
            tr_selector: tr,
            tr_base: Self::tr_base(gdt_base, tr),
            gdtr_base: gdt_base,
            idtr_base: idt_base,
            // The selector lives in the high half of the MSR.
            sysenter_cs: (self.rdmsr(MSR_IA32_SYSENTER_CS) >> 32) as u32,
            sysenter_esp: self.rdmsr(MSR_IA32_SYSENTER_ESP),
            sysenter_eip: self.rdmsr(MSR_IA32_SYSENTER_EIP),
            exit_rip: vmm_vmx_exit as usize as u64,
        }
    }

    fn save_host_segments(&self) -> HostSegments {
        HostSegments {
            fs_selector: read_selector!("fs"),
            gs_selector: read_selector!("gs"),
            fs_base: self.rdmsr(MSR_FS_BASE),
            gs_base: self.rdmsr(MSR_GS_BASE),
        }
    }

    unsafe fn restore_host_segments(&self, seg: &HostSegments) {
        asm!("mov fs, {0:x}", in(reg) seg.fs_selector, options(nomem, nostack));
        asm!("mov gs, {0:x}", in(reg) seg.gs_selector, options(nomem, nostack));
        self.wrmsr(MSR_FS_BASE, seg.fs_base);
        self.wrmsr(MSR_GS_BASE, seg.gs_base);
    }

    fn fx_save(&self, area: &mut FxArea) {
        unsafe { asm!("fxsave64 [{}]", in(reg) area.0.as_mut_ptr(), options(nostack)) };
    }

    unsafe fn fx_restore(&self, area: &FxArea) {
        asm!("fxrstor64 [{}]", in(reg) area.0.as_ptr(), options(nostack));
    }

    unsafe fn enter_guest(&self, regs: &mut GuestRegisters, resume: bool) -> Result<(), VmFail> {
        match vmm_vmx_enter(regs, resume as u64) {
            0 => Ok(()),
            1 => Err(VmFail::Invalid),
            _ => Err(VmFail::Valid),
        }
    }

    fn reflect_nmi(&self) {
        unsafe { asm!("int 2", options(nomem)) };
    }

    fn notify_core(&self, core: usize) {
        self.kernel.send_eviction_ipi(core)
    }
}
