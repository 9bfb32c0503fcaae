//! Model specific registers of the guest.
//!
//! A vcpu keeps its own value of a few MSRs that the host also uses. Most of
//! them are switched by hardware through the VM-entry MSR-load and VM-exit
//! MSR-store/load areas. MSRs that cannot be switched that way are marked as
//! excluded from bulk load and are swapped by hand around the world switch.
use crate::{
    hw::Vmx,
    vcpu::ActiveVcpu,
    vmcs::Field,
    VmError,
};
use alloc::{collections::BTreeMap, vec::Vec};

pub const MSR_EFER: u32 = 0xc000_0080;
pub const MSR_STAR: u32 = 0xc000_0081;
pub const MSR_LSTAR: u32 = 0xc000_0082;
pub const MSR_CSTAR: u32 = 0xc000_0083;
pub const MSR_SYSCALL_MASK: u32 = 0xc000_0084;
pub const MSR_FS_BASE: u32 = 0xc000_0100;
pub const MSR_GS_BASE: u32 = 0xc000_0101;
pub const MSR_KERNEL_GS_BASE: u32 = 0xc000_0102;
pub const MSR_IA32_TIME_STAMP_COUNTER: u32 = 0x10;
pub const MSR_IA32_APICBASE: u32 = 0x1b;
pub const MSR_IA32_UCODE_WRITE: u32 = 0x79;
pub const MSR_IA32_UCODE_REV: u32 = 0x8b;
pub const MSR_IA32_SYSENTER_CS: u32 = 0x174;
pub const MSR_IA32_SYSENTER_ESP: u32 = 0x175;
pub const MSR_IA32_SYSENTER_EIP: u32 = 0x176;
pub const MSR_IA32_MCG_CAP: u32 = 0x179;
pub const MSR_IA32_MCG_STATUS: u32 = 0x17a;
pub const MSR_IA32_MC0_CTL: u32 = 0x400;
pub const MSR_IA32_MC0_STATUS: u32 = 0x401;
pub const MSR_IA32_MC0_MISC: u32 = 0x403;

pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;
const EFER_RESERVED_BITS: u64 = 0xffff_ffff_ffff_f2fe;

/// Guest MSRs of a vcpu, in this order, with whether hardware switches them.
const GUEST_MSRS: [(u32, bool); 5] = [
    (MSR_SYSCALL_MASK, false),
    (MSR_LSTAR, false),
    (MSR_CSTAR, true),
    (MSR_KERNEL_GS_BASE, true),
    (MSR_EFER, true),
];

/// One entry of a VM-entry/VM-exit MSR area.
///
/// See Table 24-12. Format of an MSR Entry.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsrEntry {
    pub index: u32,
    pub reserved: u32,
    pub value: u64,
}

/// A guest MSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsrSlot {
    /// Value the guest sees.
    pub guest: u64,
    /// Value of the host, saved before each entry.
    pub host: u64,
    /// Hardware switches this MSR through the MSR areas.
    pub bulk_load: bool,
}

/// The guest MSRs of a vcpu keyed by MSR number.
pub struct MsrList {
    slots: BTreeMap<u32, MsrSlot>,
    guest_area: Vec<MsrEntry>,
    host_area: Vec<MsrEntry>,
}

impl MsrList {
    /// Build the list, reading the host values. Guest values start equal to
    /// them.
    pub fn new(hw: &dyn Vmx) -> Self {
        let slots: BTreeMap<u32, MsrSlot> = GUEST_MSRS
            .iter()
            .map(|&(index, bulk_load)| {
                let host = hw.rdmsr(index);
                (
                    index,
                    MsrSlot {
                        guest: host,
                        host,
                        bulk_load,
                    },
                )
            })
            .collect();
        let area: Vec<MsrEntry> = slots
            .iter()
            .filter(|(_, slot)| slot.bulk_load)
            .map(|(&index, slot)| MsrEntry {
                index,
                reserved: 0,
                value: slot.guest,
            })
            .collect();
        Self {
            slots,
            guest_area: area.clone(),
            host_area: area,
        }
    }

    /// The entry of `index`.
    pub fn get(&self, index: u32) -> Option<&MsrSlot> {
        self.slots.get(&index)
    }

    /// Guest value of `index`.
    pub fn guest(&self, index: u32) -> Option<u64> {
        self.slots.get(&index).map(|slot| slot.guest)
    }

    /// Set the guest value of a listed MSR. Returns false if not listed.
    pub fn set_guest(&mut self, index: u32, value: u64) -> bool {
        match self.slots.get_mut(&index) {
            Some(slot) => {
                slot.guest = value;
                true
            }
            None => false,
        }
    }

    /// Point the VMCS at the MSR areas.
    pub fn install(&self, vmcs: &crate::vmcs::ActiveVmcs<'_>) -> Result<(), VmError> {
        let hw = vmcs.hw();
        let guest = hw.virt_to_phys(self.guest_area.as_ptr() as usize);
        let host = hw.virt_to_phys(self.host_area.as_ptr() as usize);
        let count = self.guest_area.len() as u64;
        vmcs.write(Field::VmentryMsrLoadAddr, guest)?;
        vmcs.write(Field::VmexitMsrStoreAddr, guest)?;
        vmcs.write(Field::VmexitMsrLoadAddr, host)?;
        vmcs.write(Field::VmexitMsrStoreCount, count)?;
        vmcs.write(Field::VmexitMsrLoadCount, count)?;
        vmcs.write(Field::VmentryMsrLoadCount, count)
    }

    /// Save the host values, load the excluded guest values and fill the
    /// areas. Called right before entering the guest.
    ///
    /// # Safety
    /// [`MsrList::leave_guest`] must run before the host uses the MSRs.
    pub unsafe fn enter_guest(&mut self, hw: &dyn Vmx) {
        for (&index, slot) in self.slots.iter_mut() {
            slot.host = hw.rdmsr(index);
            if !slot.bulk_load {
                hw.wrmsr(index, slot.guest);
            }
        }
        for (guest, host) in self.guest_area.iter_mut().zip(self.host_area.iter_mut()) {
            if let Some(slot) = self.slots.get(&guest.index) {
                guest.value = slot.guest;
                host.value = slot.host;
            }
        }
    }

    /// Collect the guest values stored by hardware and the excluded guest
    /// values, and restore the excluded host values.
    ///
    /// # Safety
    /// Must follow [`MsrList::enter_guest`] on the same core.
    pub unsafe fn leave_guest(&mut self, hw: &dyn Vmx) {
        for entry in self.guest_area.iter() {
            if let Some(slot) = self.slots.get_mut(&entry.index) {
                slot.guest = entry.value;
            }
        }
        for (&index, slot) in self.slots.iter_mut().filter(|(_, slot)| !slot.bulk_load) {
            slot.guest = hw.rdmsr(index);
            hw.wrmsr(index, slot.host);
        }
    }
}

fn reads_as_zero(index: u32) -> bool {
    matches!(
        index,
        MSR_IA32_MC0_CTL
            | MSR_IA32_MCG_STATUS
            | MSR_IA32_MCG_CAP
            | MSR_IA32_MC0_MISC
            | 0x407
            | 0x40b
            | 0x40f
            | 0x413
            | MSR_IA32_UCODE_REV
            | 0xfe
            | 0x200..=0x2ff
    )
}

impl ActiveVcpu<'_> {
    /// RDMSR on behalf of the guest. `None` if the guest must take a #GP.
    pub fn guest_rdmsr(&mut self, index: u32) -> Result<Option<u64>, VmError> {
        let vmcs = self.vmcs;
        Ok(Some(match index {
            MSR_FS_BASE => vmcs.read(Field::GuestFsBase)?,
            MSR_GS_BASE => vmcs.read(Field::GuestGsBase)?,
            MSR_IA32_SYSENTER_CS => vmcs.read(Field::GuestIa32SysenterCsMsr)?,
            MSR_IA32_SYSENTER_EIP => vmcs.read(Field::GuestIa32SysenterEipMsr)?,
            MSR_IA32_SYSENTER_ESP => vmcs.read(Field::GuestIa32SysenterEspMsr)?,
            _ if reads_as_zero(index) => 0,
            MSR_IA32_APICBASE => self.vcpu.apic_base,
            _ => match self.vcpu.msrs.guest(index) {
                Some(v) => v,
                None => {
                    log::warn!("vcpu #{}: unhandled rdmsr 0x{:x}", self.vcpu.index, index);
                    return Ok(None);
                }
            },
        }))
    }

    /// WRMSR on behalf of the guest. Returns false if the guest must take a
    /// #GP.
    pub fn guest_wrmsr(&mut self, index: u32, data: u64) -> Result<bool, VmError> {
        let vmcs = self.vmcs;
        match index {
            MSR_FS_BASE => vmcs.write(Field::GuestFsBase, data)?,
            MSR_GS_BASE => vmcs.write(Field::GuestGsBase, data)?,
            MSR_IA32_SYSENTER_CS => vmcs.write(Field::GuestIa32SysenterCsMsr, data as u32 as u64)?,
            MSR_IA32_SYSENTER_EIP => vmcs.write(Field::GuestIa32SysenterEipMsr, data)?,
            MSR_IA32_SYSENTER_ESP => vmcs.write(Field::GuestIa32SysenterEspMsr, data)?,
            MSR_EFER => return self.set_efer(data),
            MSR_IA32_MC0_STATUS => log::debug!("vcpu #{}: MC0_STATUS 0x{:x} ignored", self.vcpu.index, data),
            MSR_IA32_TIME_STAMP_COUNTER => {
                let tsc = vmcs.hw().rdtsc();
                vmcs.write(Field::TscOffset, data.wrapping_sub(tsc))?;
            }
            MSR_IA32_UCODE_REV | MSR_IA32_UCODE_WRITE | 0x200..=0x2ff => (),
            MSR_IA32_APICBASE => self.vcpu.apic_base = data,
            _ => {
                if !self.vcpu.msrs.set_guest(index, data) {
                    log::warn!("vcpu #{}: unhandled wrmsr 0x{:x}", self.vcpu.index, index);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Validated guest write of EFER. Returns false if the guest must take a
    /// #GP.
    pub fn set_efer(&mut self, efer: u64) -> Result<bool, VmError> {
        if efer & EFER_RESERVED_BITS != 0 {
            log::debug!("set_efer: 0x{:x} #GP, reserved bits", efer);
            return Ok(false);
        }
        if self.is_paging()? && (self.vcpu.shadow_efer & EFER_LME) != (efer & EFER_LME) {
            log::debug!("set_efer: #GP, change LME while paging");
            return Ok(false);
        }
        let efer = (efer & !EFER_LMA) | (self.vcpu.shadow_efer & EFER_LMA);
        self.vcpu.shadow_efer = efer;
        let hw_efer = if efer & EFER_LMA == 0 { efer & !EFER_LME } else { efer };
        self.vcpu.msrs.set_guest(MSR_EFER, hw_efer);
        Ok(true)
    }
}
