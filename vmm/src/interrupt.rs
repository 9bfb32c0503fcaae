//! Interrupt injector.
//!
//! Pending external interrupts are kept in a 256-bit bitmap with a summary
//! word marking the non-empty 64-bit groups. The lowest vector is delivered
//! first.
use crate::{
    mode::{RFLAGS_AC, RFLAGS_IF, RFLAGS_TF},
    vcpu::ActiveVcpu,
    vm_control::{EntryInterruptionInfo, Interruptibility, VmcsProcBasedVmexecCtl},
    vmcs::Field,
    VmError,
};

/// Pending interrupt vectors of a vcpu.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PendingInterrupts {
    summary: u64,
    pending: [u64; 4],
}

impl PendingInterrupts {
    /// Queue `vector`.
    pub fn request(&mut self, vector: u8) {
        let (word, bit) = (vector as usize / 64, vector % 64);
        self.pending[word] |= 1 << bit;
        self.summary |= 1 << word;
    }

    /// Take the lowest queued vector.
    pub fn pop_lowest(&mut self) -> Option<u8> {
        if self.summary == 0 {
            return None;
        }
        let word = self.summary.trailing_zeros() as usize;
        let bit = self.pending[word].trailing_zeros();
        self.pending[word] &= !(1 << bit);
        if self.pending[word] == 0 {
            self.summary &= !(1 << word);
        }
        Some((word as u32 * 64 + bit) as u8)
    }

    pub fn is_pending(&self, vector: u8) -> bool {
        self.pending[vector as usize / 64] & (1 << (vector % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.summary == 0
    }
}

impl ActiveVcpu<'_> {
    /// Queue an external interrupt.
    pub fn request_interrupt(&mut self, irq: u32) -> Result<(), VmError> {
        let vector = u8::try_from(irq).map_err(|_| VmError::InvalidInterrupt(irq))?;
        self.vcpu.irq.request(vector);
        Ok(())
    }

    /// Deliver the lowest pending vector if the guest accepts interrupts,
    /// otherwise ask for an exit as soon as it does.
    pub(crate) fn try_inject(&mut self) -> Result<(), VmError> {
        let vmcs = self.vmcs;
        let rflags = vmcs.read(Field::GuestRflags)?;
        let blocking = (Interruptibility::STI | Interruptibility::MOV_SS).bits() as u64;
        let window_open =
            rflags & RFLAGS_IF != 0 && vmcs.read(Field::GuestInterruptibilityState)? & blocking == 0;
        if window_open {
            if let Some(irq) = self.vcpu.irq.pop_lowest() {
                if self.vcpu.rmode.active {
                    self.inject_rmode_irq(irq)?;
                } else {
                    vmcs.write(
                        Field::VmentryInterruptionInfo,
                        irq as u64 | EntryInterruptionInfo::VALID.bits() as u64,
                    )?;
                }
                log::trace!("vcpu #{}: inject irq {}", self.vcpu.index, irq);
            }
        }
        let window = VmcsProcBasedVmexecCtl::INTRWINEXIT.bits() as u64;
        if !window_open && !self.vcpu.irq.is_empty() {
            vmcs.set_bits(Field::ProcessorBasedVmexecControls, window)?;
        }
        Ok(())
    }

    /// Deliver `irq` to a real-mode guest through its interrupt vector table.
    fn inject_rmode_irq(&mut self, irq: u8) -> Result<(), VmError> {
        let vmcs = self.vmcs;
        let rsp = vmcs.read(Field::GuestRsp)?;
        let sp = rsp as u16;
        let ss_base = vmcs.read(Field::GuestSsBase)?;
        let ss_limit = vmcs.read(Field::GuestSsLimit)? as u32;
        if sp as u32 > ss_limit || sp < 6 {
            log::warn!(
                "vcpu #{}: real-mode stack fault, sp 0x{:x} ss_limit 0x{:x}",
                self.vcpu.index,
                sp,
                ss_limit
            );
            return Ok(());
        }

        let mut ent = [0u8; 4];
        if !self.read_guest(irq as u64 * 4, &mut ent)? {
            log::warn!("vcpu #{}: ivt entry {} is unmapped", self.vcpu.index, irq);
            return Ok(());
        }
        let ip = u16::from_le_bytes([ent[0], ent[1]]);
        let cs = u16::from_le_bytes([ent[2], ent[3]]);

        let flags = vmcs.read(Field::GuestRflags)?;
        let old_cs = (vmcs.read(Field::GuestCsBase)? >> 4) as u16;
        let old_ip = vmcs.read(Field::GuestRip)? as u16;

        let pushed = self.write_guest(ss_base + sp as u64 - 2, &(flags as u16).to_le_bytes())?
            && self.write_guest(ss_base + sp as u64 - 4, &old_cs.to_le_bytes())?
            && self.write_guest(ss_base + sp as u64 - 6, &old_ip.to_le_bytes())?;
        if !pushed {
            log::warn!("vcpu #{}: real-mode stack is unmapped", self.vcpu.index);
            return Ok(());
        }

        vmcs.write(Field::GuestRflags, flags & !(RFLAGS_IF | RFLAGS_AC | RFLAGS_TF))?;
        vmcs.write(Field::GuestCsSelector, cs as u64)?;
        vmcs.write(Field::GuestCsBase, (cs as u64) << 4)?;
        vmcs.write(Field::GuestRip, ip as u64)?;
        vmcs.write(Field::GuestRsp, (rsp & !0xffff) | (sp - 6) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_vector_first() {
        let mut irq = PendingInterrupts::default();
        irq.request(200);
        irq.request(33);
        irq.request(70);
        irq.request(32);
        assert_eq!(irq.pop_lowest(), Some(32));
        assert_eq!(irq.pop_lowest(), Some(33));
        assert_eq!(irq.pop_lowest(), Some(70));
        assert!(!irq.is_empty());
        assert_eq!(irq.pop_lowest(), Some(200));
        assert!(irq.is_empty());
        assert_eq!(irq.pop_lowest(), None);
    }

    #[test]
    fn requests_are_idempotent() {
        let mut irq = PendingInterrupts::default();
        irq.request(255);
        irq.request(255);
        assert!(irq.is_pending(255));
        assert_eq!(irq.pop_lowest(), Some(255));
        assert!(irq.is_empty());
    }
}
