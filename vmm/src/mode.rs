//! Guest operating modes and control registers.
//!
//! Hardware cannot run real-mode code natively, so real mode is emulated in
//! virtual-8086 mode on top of a synthetic TSS in the last pages of slot 0.
//! Some CR0/CR4 bits are owned by the monitor: the guest reads the value of
//! the read shadow for them, while the guest field holds what hardware runs
//! with.
//!
//! Invalid values written by the guest never fail the call. They inject a
//! general protection fault instead.
use crate::{
    memory::Memory,
    msr::{EFER_LMA, EFER_LME, MSR_EFER},
    vcpu::ActiveVcpu,
    vm_control::{EntryInterruptionInfo, VmcsEntryCtl},
    vmcs::{Field, Segment},
    VmError, PAGE_SIZE,
};

pub const CR0_PE: u64 = 1 << 0;
pub const CR0_NE: u64 = 1 << 5;
pub const CR0_WP: u64 = 1 << 16;
pub const CR0_NW: u64 = 1 << 29;
pub const CR0_CD: u64 = 1 << 30;
pub const CR0_PG: u64 = 1 << 31;

pub const CR4_VME: u64 = 1 << 0;
pub const CR4_PSE: u64 = 1 << 4;
pub const CR4_PAE: u64 = 1 << 5;
pub const CR4_PGE: u64 = 1 << 7;
pub const CR4_VMXE: u64 = 1 << 13;

pub const RFLAGS_TF: u64 = 1 << 8;
pub const RFLAGS_IF: u64 = 1 << 9;
pub const RFLAGS_DF: u64 = 1 << 10;
pub const RFLAGS_IOPL: u64 = 3 << 12;
pub const RFLAGS_RF: u64 = 1 << 16;
pub const RFLAGS_VM: u64 = 1 << 17;
pub const RFLAGS_AC: u64 = 1 << 18;
const IOPL_SHIFT: u64 = 12;

pub const DB_VECTOR: u32 = 1;
pub const GP_VECTOR: u32 = 13;
pub const PF_VECTOR: u32 = 14;

/// CR0 bits owned by the monitor.
pub const GUEST_CR0_MASK: u64 = CR0_PG | CR0_PE | CR0_WP | CR0_NE;
/// CR0 bits hardware always runs with.
pub const VM_CR0_ALWAYS_ON: u64 = GUEST_CR0_MASK;
/// CR4 bits owned by the monitor.
pub const GUEST_CR4_MASK: u64 = CR4_PSE | CR4_PAE | CR4_PGE | CR4_VMXE | CR4_VME;
pub const PMODE_VM_CR4_ALWAYS_ON: u64 = CR4_VMXE | CR4_PAE;
pub const RMODE_VM_CR4_ALWAYS_ON: u64 = CR4_VMXE | CR4_PAE | CR4_VME;

const CR0_RESERVED_BITS: u64 = 0xffff_ffff_1ffa_ffc0;
const LMSW_GUEST_MASK: u64 = 0x0e;
const CR4_RESERVED_BITS: u64 = !((1 << 11) - 1);
const CR8_RESERVED_BITS: u64 = !0xf;
const CR3_RESERVED_BITS: u64 = 0x07;
const CR3_L_MODE_RESERVED_BITS: u64 = !((1 << 40) - 1) | 0x0fe7;
const PDPTE_RESERVED_BITS: u64 = 0xffff_fff0_0000_01e6;

const AR_TYPE_MASK: u32 = 0x0f;
const AR_TYPE_BUSY_64_TSS: u32 = 11;
const SELECTOR_RPL_MASK: u64 = 3;

const TSS_BASE_SIZE: usize = 0x68;
const TSS_IOPB_SIZE: usize = 65536 / 8;
const TSS_REDIRECTION_SIZE: usize = 256 / 8;
/// Size of the real-mode TSS: base, redirection map, I/O bitmap and the
/// terminating byte.
pub const RMODE_TSS_SIZE: usize = TSS_BASE_SIZE + TSS_REDIRECTION_SIZE + TSS_IOPB_SIZE + 1;

/// Initialize the real-mode TSS at `base`, which spans three pages.
pub fn init_rmode_tss(memory: &Memory, base: u64) -> Result<(), VmError> {
    let zero = [0u8; PAGE_SIZE];
    for page in 0..3 {
        if memory.write(base + (page * PAGE_SIZE) as u64, &zero) != PAGE_SIZE {
            return Err(VmError::NoRealModeTss);
        }
    }
    // I/O map base.
    let iomap = (TSS_BASE_SIZE + TSS_REDIRECTION_SIZE) as u16;
    memory.write(base + 0x66, &iomap.to_le_bytes());
    // The I/O bitmap ends with an all-ones byte.
    memory.write(base + (RMODE_TSS_SIZE - 1) as u64, &[0xff]);
    Ok(())
}

impl ActiveVcpu<'_> {
    /// CR0 as the guest sees it.
    pub fn guest_cr0(&self) -> Result<u64, VmError> {
        let vmcs = self.vmcs;
        Ok((vmcs.read(Field::Cr0ReadShadow)? & GUEST_CR0_MASK) | (vmcs.read(Field::GuestCr0)? & !GUEST_CR0_MASK))
    }

    /// CR4 as the guest sees it.
    pub fn guest_cr4(&self) -> Result<u64, VmError> {
        let vmcs = self.vmcs;
        Ok((vmcs.read(Field::Cr4ReadShadow)? & GUEST_CR4_MASK) | (vmcs.read(Field::GuestCr4)? & !GUEST_CR4_MASK))
    }

    pub fn is_long_mode(&self) -> Result<bool, VmError> {
        Ok(self.vmcs.read(Field::VmentryControls)? & VmcsEntryCtl::IA32E_MODE_GUEST.bits() as u64 != 0)
    }

    pub fn is_paging(&self) -> Result<bool, VmError> {
        Ok(self.guest_cr0()? & CR0_PG != 0)
    }

    pub fn is_pae(&self) -> Result<bool, VmError> {
        Ok(self.guest_cr4()? & CR4_PAE != 0)
    }

    /// Current privilege level.
    pub fn cpl(&self) -> Result<u8, VmError> {
        Ok((self.vmcs.read(Field::GuestCsSelector)? & SELECTOR_RPL_MASK) as u8)
    }

    /// CS.L and CS.D/B.
    pub(crate) fn cs_db_l_bits(&self) -> Result<(bool, bool), VmError> {
        let ar = self.vmcs.read(Field::GuestCsAccessRights)?;
        Ok((ar & (1 << 14) != 0, ar & (1 << 13) != 0))
    }

    pub fn in_real_mode(&self) -> bool {
        self.vcpu.rmode.active
    }

    /// Inject a general protection fault with error code 0.
    pub fn inject_gp(&mut self) -> Result<(), VmError> {
        let vmcs = self.vmcs;
        vmcs.write(Field::VmentryExceptionErrCode, 0)?;
        let info = EntryInterruptionInfo::HARDWARE_EXCEPTION
            | EntryInterruptionInfo::DELIVER_ERROR_CODE
            | EntryInterruptionInfo::VALID;
        vmcs.write(Field::VmentryInterruptionInfo, GP_VECTOR as u64 | info.bits() as u64)
    }

    /// Real mode intercepts every exception.
    pub(crate) fn update_exception_bitmap(&mut self) -> Result<(), VmError> {
        let bitmap = if self.vcpu.rmode.active {
            !0u32
        } else {
            let mut bitmap = (1 << PF_VECTOR) | self.vm.config.exception_bitmap;
            if self.vcpu.debug.enabled {
                bitmap |= 1 << DB_VECTOR;
            }
            bitmap
        };
        self.vmcs.write(Field::ExceptionBitmap, bitmap as u64)
    }

    /// Leave emulated real mode.
    pub fn enter_pmode(&mut self) -> Result<(), VmError> {
        let vmcs = self.vmcs;
        let rmode = self.vcpu.rmode;
        self.vcpu.rmode.active = false;

        vmcs.write(Field::GuestTrBase, rmode.tr_base)?;
        vmcs.write(Field::GuestTrLimit, rmode.tr_limit as u64)?;
        vmcs.write(Field::GuestTrAccessRights, rmode.tr_ar as u64)?;

        let flags = vmcs.read(Field::GuestRflags)? & !(RFLAGS_IOPL | RFLAGS_VM);
        vmcs.write(Field::GuestRflags, flags | (rmode.save_iopl << IOPL_SHIFT))?;

        // VME goes back to what the guest asked for.
        let cr4 = (vmcs.read(Field::GuestCr4)? & !CR4_VME) | (vmcs.read(Field::Cr4ReadShadow)? & CR4_VME);
        vmcs.write(Field::GuestCr4, cr4)?;

        self.update_exception_bitmap()?;

        for seg in Segment::DATA {
            vmcs.write_segment(seg, 0, 0, 0xffff, 0x93)?;
        }
        vmcs.write(
            Field::GuestCsSelector,
            vmcs.read(Field::GuestCsSelector)? & !SELECTOR_RPL_MASK,
        )?;
        vmcs.write(Field::GuestCsAccessRights, 0x9b)?;
        log::debug!("vcpu #{}: enter protected mode", self.vcpu.index);
        Ok(())
    }

    /// Enter emulated real mode.
    pub fn enter_rmode(&mut self) -> Result<(), VmError> {
        let vmcs = self.vmcs;
        let tss_base = self.vm.memory.rmode_tss_base().ok_or(VmError::NoRealModeTss)?;
        let rmode = &mut self.vcpu.rmode;
        rmode.active = true;

        rmode.tr_base = vmcs.read(Field::GuestTrBase)?;
        rmode.tr_limit = vmcs.read(Field::GuestTrLimit)? as u32;
        rmode.tr_ar = vmcs.read(Field::GuestTrAccessRights)? as u32;
        vmcs.write(Field::GuestTrBase, tss_base)?;
        vmcs.write(Field::GuestTrLimit, (RMODE_TSS_SIZE - 1) as u64)?;
        vmcs.write(Field::GuestTrAccessRights, 0x8b)?;

        let flags = vmcs.read(Field::GuestRflags)?;
        rmode.save_iopl = (flags & RFLAGS_IOPL) >> IOPL_SHIFT;
        vmcs.write(Field::GuestRflags, flags | RFLAGS_IOPL | RFLAGS_VM)?;

        vmcs.set_bits(Field::GuestCr4, CR4_VME)?;
        self.update_exception_bitmap()?;

        // Virtual-8086 mode wants base == selector << 4 on every segment.
        vmcs.write(Field::GuestCsAccessRights, 0xf3)?;
        vmcs.write(Field::GuestCsSelector, vmcs.read(Field::GuestCsBase)? >> 4)?;
        for seg in [Segment::Es, Segment::Ds, Segment::Ss, Segment::Gs, Segment::Fs] {
            let (sel, base, limit, ar) = seg.fields();
            vmcs.write(sel, vmcs.read(base)? >> 4)?;
            vmcs.write(limit, 0xffff)?;
            vmcs.write(ar, 0xf3)?;
        }
        log::debug!("vcpu #{}: enter real mode", self.vcpu.index);
        Ok(())
    }

    /// Activate IA-32e mode.
    pub fn enter_lmode(&mut self) -> Result<(), VmError> {
        let vmcs = self.vmcs;
        let tr_ar = vmcs.read(Field::GuestTrAccessRights)? as u32;
        if tr_ar & AR_TYPE_MASK != AR_TYPE_BUSY_64_TSS {
            log::debug!("enter_lmode: tss fixup");
            vmcs.write(
                Field::GuestTrAccessRights,
                ((tr_ar & !AR_TYPE_MASK) | AR_TYPE_BUSY_64_TSS) as u64,
            )?;
        }
        self.vcpu.shadow_efer |= EFER_LMA;
        let efer = self.vcpu.msrs.guest(MSR_EFER).unwrap_or(0);
        self.vcpu.msrs.set_guest(MSR_EFER, efer | EFER_LMA | EFER_LME);
        vmcs.set_bits(Field::VmentryControls, VmcsEntryCtl::IA32E_MODE_GUEST.bits() as u64)?;
        log::debug!("vcpu #{}: enter long mode", self.vcpu.index);
        Ok(())
    }

    /// Deactivate IA-32e mode.
    pub fn exit_lmode(&mut self) -> Result<(), VmError> {
        self.vcpu.shadow_efer &= !EFER_LMA;
        self.vmcs
            .clear_bits(Field::VmentryControls, VmcsEntryCtl::IA32E_MODE_GUEST.bits() as u64)?;
        log::debug!("vcpu #{}: exit long mode", self.vcpu.index);
        Ok(())
    }

    /// Load CR0 without validation, switching modes as PE and PG change.
    pub(crate) fn load_cr0(&mut self, cr0: u64) -> Result<(), VmError> {
        if self.vcpu.rmode.active && cr0 & CR0_PE != 0 {
            self.enter_pmode()?;
        }
        if !self.vcpu.rmode.active && cr0 & CR0_PE == 0 {
            self.enter_rmode()?;
        }
        if self.vcpu.shadow_efer & EFER_LME != 0 {
            let paging = self.is_paging()?;
            if !paging && cr0 & CR0_PG != 0 {
                self.enter_lmode()?;
            }
            if paging && cr0 & CR0_PG == 0 {
                self.exit_lmode()?;
            }
        }
        self.vmcs.write(Field::Cr0ReadShadow, cr0)?;
        self.vmcs.write(Field::GuestCr0, cr0 | VM_CR0_ALWAYS_ON)
    }

    /// Load CR4 without validation.
    pub(crate) fn load_cr4(&mut self, cr4: u64) -> Result<(), VmError> {
        let always_on = if self.vcpu.rmode.active {
            RMODE_VM_CR4_ALWAYS_ON
        } else {
            PMODE_VM_CR4_ALWAYS_ON
        };
        self.vmcs.write(Field::Cr4ReadShadow, cr4)?;
        self.vmcs.write(Field::GuestCr4, cr4 | always_on)
    }

    /// Load EFER without validation. Hardware sees LME only with LMA.
    pub(crate) fn load_efer(&mut self, efer: u64) {
        self.vcpu.shadow_efer = efer;
        let hw_efer = if efer & EFER_LMA != 0 {
            efer
        } else {
            efer & !EFER_LME
        };
        self.vcpu.msrs.set_guest(MSR_EFER, hw_efer);
        let entry = VmcsEntryCtl::IA32E_MODE_GUEST.bits() as u64;
        let r = if efer & EFER_LMA != 0 {
            self.vmcs.set_bits(Field::VmentryControls, entry)
        } else {
            self.vmcs.clear_bits(Field::VmentryControls, entry)
        };
        if let Err(e) = r {
            log::error!("vcpu #{}: failed to update entry controls: {:?}", self.vcpu.index, e);
        }
    }

    /// Whether any present page-directory-pointer entry of the PAE table at
    /// `cr3` has reserved bits set. A table outside guest memory counts as
    /// invalid.
    fn pdptrs_have_reserved_bits_set(&self, cr3: u64) -> bool {
        let mut pdpt = [0u8; 32];
        if self.vm.memory.read(cr3 & !0x1f, &mut pdpt) != pdpt.len() {
            return true;
        }
        pdpt.chunks_exact(8)
            .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .any(|pdpte| pdpte & 1 != 0 && pdpte & PDPTE_RESERVED_BITS != 0)
    }

    /// Validated guest write of CR0.
    pub fn set_cr0(&mut self, cr0: u64) -> Result<(), VmError> {
        if cr0 & CR0_RESERVED_BITS != 0 {
            log::debug!("set_cr0: 0x{:x} #GP, reserved bits", cr0);
            return self.inject_gp();
        }
        if cr0 & CR0_NW != 0 && cr0 & CR0_CD == 0 {
            log::debug!("set_cr0: #GP, CD == 0 && NW == 1");
            return self.inject_gp();
        }
        if cr0 & CR0_PG != 0 && cr0 & CR0_PE == 0 {
            log::debug!("set_cr0: #GP, set PG flag and a clear PE flag");
            return self.inject_gp();
        }
        if !self.is_paging()? && cr0 & CR0_PG != 0 {
            if self.vcpu.shadow_efer & EFER_LME != 0 {
                if !self.is_pae()? {
                    log::debug!("set_cr0: #GP, start paging in long mode while PAE is disabled");
                    return self.inject_gp();
                }
                if self.cs_db_l_bits()?.1 {
                    log::debug!("set_cr0: #GP, start paging in long mode while CS.L == 1");
                    return self.inject_gp();
                }
            } else if self.is_pae()? && self.pdptrs_have_reserved_bits_set(self.vcpu.cr3) {
                log::debug!("set_cr0: #GP, pdptrs reserved bits");
                return self.inject_gp();
            }
        }
        self.load_cr0(cr0)?;
        self.reset_mmu()
    }

    /// LMSW: only the low four bits of CR0 change.
    pub fn lmsw(&mut self, msw: u64) -> Result<(), VmError> {
        let vmcs = self.vmcs;
        let cr0 = self.guest_cr0()?;
        if msw & CR0_PE != 0 && cr0 & CR0_PE == 0 {
            self.enter_pmode()?;
            vmcs.write(Field::Cr0ReadShadow, cr0 | CR0_PE)?;
        }
        let guest = vmcs.read(Field::GuestCr0)?;
        vmcs.write(
            Field::GuestCr0,
            (guest & !LMSW_GUEST_MASK) | (msw & LMSW_GUEST_MASK),
        )
    }

    /// Validated guest write of CR4.
    pub fn set_cr4(&mut self, cr4: u64) -> Result<(), VmError> {
        if cr4 & CR4_RESERVED_BITS != 0 {
            log::debug!("set_cr4: 0x{:x} #GP, reserved bits", cr4);
            return self.inject_gp();
        }
        if self.is_long_mode()? {
            if cr4 & CR4_PAE == 0 {
                log::debug!("set_cr4: #GP, clearing PAE while in long mode");
                return self.inject_gp();
            }
        } else if self.is_paging()?
            && !self.is_pae()?
            && cr4 & CR4_PAE != 0
            && self.pdptrs_have_reserved_bits_set(self.vcpu.cr3)
        {
            log::debug!("set_cr4: #GP, pdptrs reserved bits");
            return self.inject_gp();
        }
        if cr4 & CR4_VMXE != 0 {
            log::debug!("set_cr4: #GP, setting VMXE");
            return self.inject_gp();
        }
        self.load_cr4(cr4)?;
        self.reset_mmu()
    }

    /// Validated guest write of CR3.
    pub fn set_cr3(&mut self, cr3: u64) -> Result<(), VmError> {
        if self.is_long_mode()? {
            if cr3 & CR3_L_MODE_RESERVED_BITS != 0 {
                log::debug!("set_cr3: #GP, reserved bits");
                return self.inject_gp();
            }
        } else {
            if cr3 & CR3_RESERVED_BITS != 0 {
                log::debug!("set_cr3: #GP, reserved bits");
                return self.inject_gp();
            }
            if self.is_paging()? && self.is_pae()? && self.pdptrs_have_reserved_bits_set(cr3) {
                log::debug!("set_cr3: #GP, pdptrs reserved bits");
                return self.inject_gp();
            }
        }
        self.vcpu.cr3 = cr3;
        let ctx = self.mmu_context()?;
        self.vcpu.mmu.new_cr3(&ctx);
        Ok(())
    }

    /// Validated guest write of CR8.
    pub fn set_cr8(&mut self, cr8: u64) -> Result<(), VmError> {
        if cr8 & CR8_RESERVED_BITS != 0 {
            log::debug!("set_cr8: #GP, reserved bits 0x{:x}", cr8);
            return self.inject_gp();
        }
        self.vcpu.cr8 = cr8;
        Ok(())
    }
}
