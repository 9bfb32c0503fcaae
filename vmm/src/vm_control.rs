//! Flags and MSRs for VMX capabilities.

/// MSR - IA32_VMX_BASIC
pub const IA32_VMX_BASIC: u32 = 0x480;
/// MSR - IA32_VMX_PINBASED_CTLS.
pub const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
/// MSR - IA32_VMX_PROCBASED_CTLS.
pub const IA32_VMX_PROC_BASED_CTLS: u32 = 0x482;
/// MSR - IA32_VMX_EXIT_CTLS.
pub const IA32_VMX_EXIT_CTLS: u32 = 0x483;
/// MSR - IA32_VMX_ENTRY_CTLS.
pub const IA32_VMX_ENTRY_CTLS: u32 = 0x484;

/// Combine the `desired` controls with a VMX capability MSR.
///
/// The low 32 bits of a capability MSR are the allowed 0-settings (a bit set
/// there must be 1), the high 32 bits are the allowed 1-settings (a bit clear
/// there must be 0). See Appendix A.3.
#[inline]
pub const fn adjust_controls(capability: u64, desired: u32) -> u32 {
    let (must_be_one, may_be_one) = (capability as u32, (capability >> 32) as u32);
    (desired | must_be_one) & may_be_one
}

bitflags::bitflags! {
    /// Table 24-5. Definitions of Pin-Based VM-Execution Controls.
    pub struct VmcsPinBasedVmexecCtl: u32 {
        /// If this control is 1, external interrupts cause VM exits.
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        /// If this control is 1, non-maskable interrupts (NMIs) cause VM exits.
        const NMI_EXITING = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Table 24-6. Definitions of Primary Processor-Based VM-Execution Controls.
    pub struct VmcsProcBasedVmexecCtl: u32 {
        /// If this control is 1, a VM exit occurs at the beginning of any instruction if RFLAGS.IF = 1 and
        /// there are no other blocking of interrupts (see Section 24.4.2).
        const INTRWINEXIT = 1 << 2;
        /// RDTSC and RDTSCP return a value modified by the TSC offset field.
        const USETSCOFF = 1 << 3;
        /// This control determines whether executions of HLT cause VM exits.
        const HLT_EXITING = 1 << 7;
        /// This determines whether executions of INVLPG cause VM exits.
        const INVLPGEXIT = 1 << 9;
        /// This control determines whether executions of MOV to CR8 cause VM exits.
        const CR8LOADEXIT = 1 << 19;
        /// This control determines whether executions of MOV from CR8 cause VM exits.
        const CR8STOREEXIT = 1 << 20;
        /// This control determines whether executions of MOV DR cause VM exits.
        const MOVDREXIT = 1 << 23;
        /// This control determines whether executions of I/O instructions
        /// (IN, INS/INSB/INSW/INSD, OUT, and OUTS/OUTSB/OUTSW/OUTSD) cause VM exits.
        const UNCONDIOEXIT = 1 << 24;
    }
}

bitflags::bitflags! {
    /// Table 24-15. Definitions of VM-Entry Controls.
    pub struct VmcsEntryCtl: u32 {
        /// Its value is loaded into IA32_EFER.LMA as part of VM entry.
        const IA32E_MODE_GUEST = 1 << 9;
    }
}

bitflags::bitflags! {
    /// Table 24-13. Definitions of Primary VM-Exit Controls.
    pub struct VmcsExitCtl: u32 {
        /// Whether the logical processor is in 64-bit mode after the next VM exit.
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
    }
}

bitflags::bitflags! {
    /// Table 24-16. Format of the VM-Entry Interruption-Information Field.
    ///
    /// The vector lives in bits 7:0 and is not part of these flags.
    pub struct EntryInterruptionInfo: u32 {
        /// Interruption type: hardware exception.
        const HARDWARE_EXCEPTION = 3 << 8;
        /// Deliver the error code.
        const DELIVER_ERROR_CODE = 1 << 11;
        /// Valid.
        const VALID = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Table 24-3. Format of Interruptibility State.
    pub struct Interruptibility: u32 {
        /// Blocking by STI.
        const STI = 1 << 0;
        /// Blocking by MOV SS.
        const MOV_SS = 1 << 1;
    }
}
