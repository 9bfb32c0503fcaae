//! Virtual-Machine Control State (VMCS) related apis.
use crate::{
    hw::{VmFail, Vmx},
    memory::HostPages,
    vm_control::IA32_VMX_BASIC,
    VmError, PAGE_SIZE,
};
use num_enum::{FromPrimitive, TryFromPrimitive};

/// Size and revision of the VMCS regions of this processor.
///
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, Appendix A.1 BASIC VMX INFORMATION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmcsDescriptor {
    /// Bytes 12:0 of the region that software must allocate.
    pub size: usize,
    /// Bits 30:0: VMCS revision identifier.
    pub revision_id: u32,
}

impl VmcsDescriptor {
    /// Read IA32_VMX_BASIC once.
    pub fn probe(hw: &dyn Vmx) -> Self {
        let basic = hw.rdmsr(IA32_VMX_BASIC);
        Self {
            size: ((basic >> 32) & 0x1fff) as usize,
            revision_id: basic as u32 & 0x7fff_ffff,
        }
    }
}

/// A VMCS region in host memory.
///
/// The region is exclusively owned by one vcpu. Whether it is current on a
/// core is a property of the core; see [`crate::percpu::CoreArena`].
///
/// ## Details
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, 24.2 FORMAT OF THE VMCS REGION.
pub struct VmcsRegion {
    pages: HostPages,
    pa: u64,
}

impl VmcsRegion {
    /// Allocate a zeroed region tagged with the revision identifier.
    pub fn allocate(desc: &VmcsDescriptor, hw: &dyn Vmx) -> Result<Self, VmError> {
        let npages = (desc.size.max(8) + PAGE_SIZE - 1) / PAGE_SIZE;
        let pages = HostPages::zeroed(npages)?;
        pages.write(0, &desc.revision_id.to_le_bytes());
        let pa = hw.virt_to_phys(pages.as_ptr() as usize);
        Ok(Self { pages, pa })
    }

    /// Physical address of the region. It also identifies the region.
    #[inline]
    pub fn pa(&self) -> u64 {
        self.pa
    }

    /// Revision identifier stored in the region.
    pub fn revision_id(&self) -> u32 {
        let mut b = [0; 4];
        self.pages.read(0, &mut b);
        u32::from_le_bytes(b)
    }

    /// VMCLEAR this region on the current core.
    pub fn clear(&self, hw: &dyn Vmx) -> Result<(), VmError> {
        hw.vmclear(self.pa)
            .map_err(|e| VmError::VmxOperationError(instruction_error(hw, e)))
    }
}

/// Possible errors for vm-related instructions.
///
/// # Details
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, Table 30-1. VM-Instruction Error Numbers.
#[derive(Debug, Eq, PartialEq, Clone, Copy, FromPrimitive)]
#[repr(u32)]
pub enum InstructionError {
    /// VMCALL executed in VMX root operation
    VmcallInVmxRoot = 1,
    /// VMCLEAR with invalid physical address
    VmclearWithInvalidAddr = 2,
    /// VMCLEAR with VMXON pointer
    VmclearWithVmxon = 3,
    /// VMLAUNCH with non-clear VMCS
    VmlaunchWithNonclearVmcs = 4,
    /// VMRESUME with non-launched VMCS
    VmresumeWithNonlaunchedVmcs = 5,
    /// VMRESUME after VMXOFF
    VmresumeAfterVmxoff = 6,
    /// VM entry with invalid control field(s)
    InvalidControlFields = 7,
    /// VM entry with invalid host-state field(s)
    InvalidHostState = 8,
    /// VMPTRLD with invalid physical address
    VmptrldWithInvalidAddr = 9,
    /// VMPTRLD with VMXON pointer
    VmptrldWithVmxon = 10,
    /// VMPTRLD with incorrect VMCS revision identifier
    VmptrldWithIncorrectRevId = 11,
    /// VMREAD/VMWRITE from/to unsupported VMCS component
    UnsupportedVmcsField = 12,
    /// VMWRITE to read-only VMCS component
    WriteToRoField = 13,
    /// VMXON executed in VMX root operation
    VmxonInVmxRoot = 15,
    /// VM entry with invalid executive-VMCS pointer
    EntryWithInvalidExecVmcs = 16,
    /// VM entry with non-launched executive VMCS
    EntryWithNonlaunchedExecVmcs = 17,
    /// VM entry with executive-VMCS pointer not VMXON pointer
    EntryWithExecVmcsNotVmxon = 18,
    /// VMCALL with non-clear VMCS
    VmcallWithNonclearVmcs = 19,
    /// VMCALL with invalid VM-exit control fields
    VmcallWithInvalidExitControls = 20,
    /// VMCALL with incorrect MSEG revision identifier
    VmcallWithIncorrectMsegRevId = 22,
    /// VMXOFF under dual-monitor treatment of SMIs and SMM
    VmxoffUnderDualMonitor = 23,
    /// VMCALL with invalid SMM-monitor features
    VmcallWithInvalidSmmMonitor = 24,
    /// VM entry with invalid VM-execution control fields in executive VMCS
    EntryWithInvalidExecControls = 25,
    /// VM entry with events blocked by MOV SS.
    EntryWithEventBlockedByMovss = 26,
    /// Invalid operand to INVEPT/INVVPID.
    InvalidOperandToInveptInvvpid = 28,
    /// The instruction failed without a current VMCS.
    NoCurrentVmcs = 0x1_0000,
    /// Unknown error.
    #[num_enum(default)]
    Unknown = 0,
}

/// Resolve the reason of a failed VMX instruction.
pub(crate) fn instruction_error(hw: &dyn Vmx, fail: VmFail) -> InstructionError {
    match fail {
        VmFail::Invalid => InstructionError::NoCurrentVmcs,
        VmFail::Valid => hw
            .vmread(Field::InstructionError)
            .map(|v| InstructionError::from(v as u32))
            .unwrap_or(InstructionError::Unknown),
    }
}

/// Vmcs field.
#[allow(missing_docs)]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Field {
    // 16bit fields
    GuestEsSelector = 0x0000_0800,
    GuestCsSelector = 0x0000_0802,
    GuestSsSelector = 0x0000_0804,
    GuestDsSelector = 0x0000_0806,
    GuestFsSelector = 0x0000_0808,
    GuestGsSelector = 0x0000_080A,
    GuestLdtrSelector = 0x0000_080C,
    GuestTrSelector = 0x0000_080E,
    HostEsSelector = 0x0000_0C00,
    HostCsSelector = 0x0000_0C02,
    HostSsSelector = 0x0000_0C04,
    HostDsSelector = 0x0000_0C06,
    HostFsSelector = 0x0000_0C08,
    HostGsSelector = 0x0000_0C0A,
    HostTrSelector = 0x0000_0C0C,
    // 64bit fields
    IoBitmapA = 0x0000_2000,
    IoBitmapB = 0x0000_2002,
    VmexitMsrStoreAddr = 0x0000_2006,
    VmexitMsrLoadAddr = 0x0000_2008,
    VmentryMsrLoadAddr = 0x0000_200A,
    TscOffset = 0x0000_2010,
    VirtualApicPageAddr = 0x0000_2012,
    GuestLinkPointer = 0x0000_2800,
    // 32bit fields
    PinBasedExecControls = 0x0000_4000,
    ProcessorBasedVmexecControls = 0x0000_4002,
    ExceptionBitmap = 0x0000_4004,
    PageFaultErrCodeMask = 0x0000_4006,
    PageFaultErrCodeMatch = 0x0000_4008,
    Cr3TargetCount = 0x0000_400A,
    VmexitControls = 0x0000_400C,
    VmexitMsrStoreCount = 0x0000_400E,
    VmexitMsrLoadCount = 0x0000_4010,
    VmentryControls = 0x0000_4012,
    VmentryMsrLoadCount = 0x0000_4014,
    VmentryInterruptionInfo = 0x0000_4016,
    VmentryExceptionErrCode = 0x0000_4018,
    TprThreshold = 0x0000_401C,
    InstructionError = 0x0000_4400,
    VmexitReason = 0x0000_4402,
    VmexitInterruptionInfo = 0x0000_4404,
    VmexitInterruptionErrCode = 0x0000_4406,
    IdtVectoringInfo = 0x0000_4408,
    IdtVectoringErrCode = 0x0000_440A,
    VmexitInstructionLength = 0x0000_440C,
    GuestEsLimit = 0x0000_4800,
    GuestCsLimit = 0x0000_4802,
    GuestSsLimit = 0x0000_4804,
    GuestDsLimit = 0x0000_4806,
    GuestFsLimit = 0x0000_4808,
    GuestGsLimit = 0x0000_480A,
    GuestLdtrLimit = 0x0000_480C,
    GuestTrLimit = 0x0000_480E,
    GuestGdtrLimit = 0x0000_4810,
    GuestIdtrLimit = 0x0000_4812,
    GuestEsAccessRights = 0x0000_4814,
    GuestCsAccessRights = 0x0000_4816,
    GuestSsAccessRights = 0x0000_4818,
    GuestDsAccessRights = 0x0000_481A,
    GuestFsAccessRights = 0x0000_481C,
    GuestGsAccessRights = 0x0000_481E,
    GuestLdtrAccessRights = 0x0000_4820,
    GuestTrAccessRights = 0x0000_4822,
    GuestInterruptibilityState = 0x0000_4824,
    GuestActivityState = 0x0000_4826,
    GuestIa32SysenterCsMsr = 0x0000_482A,
    HostIa32SysenterCsMsr = 0x0000_4C00,
    // natural-width fields
    Cr0GuestHostMask = 0x0000_6000,
    Cr4GuestHostMask = 0x0000_6002,
    Cr0ReadShadow = 0x0000_6004,
    Cr4ReadShadow = 0x0000_6006,
    VmexitQualification = 0x0000_6400,
    GuestLinearAddr = 0x0000_640A,
    GuestCr0 = 0x0000_6800,
    GuestCr3 = 0x0000_6802,
    GuestCr4 = 0x0000_6804,
    GuestEsBase = 0x0000_6806,
    GuestCsBase = 0x0000_6808,
    GuestSsBase = 0x0000_680A,
    GuestDsBase = 0x0000_680C,
    GuestFsBase = 0x0000_680E,
    GuestGsBase = 0x0000_6810,
    GuestLdtrBase = 0x0000_6812,
    GuestTrBase = 0x0000_6814,
    GuestGdtrBase = 0x0000_6816,
    GuestIdtrBase = 0x0000_6818,
    GuestDr7 = 0x0000_681A,
    GuestRsp = 0x0000_681C,
    GuestRip = 0x0000_681E,
    GuestRflags = 0x0000_6820,
    GuestPendingDbgExceptions = 0x0000_6822,
    GuestIa32SysenterEspMsr = 0x0000_6824,
    GuestIa32SysenterEipMsr = 0x0000_6826,
    HostCr0 = 0x0000_6C00,
    HostCr3 = 0x0000_6C02,
    HostCr4 = 0x0000_6C04,
    HostFsBase = 0x0000_6C06,
    HostGsBase = 0x0000_6C08,
    HostTrBase = 0x0000_6C0A,
    HostGdtrBase = 0x0000_6C0C,
    HostIdtrBase = 0x0000_6C0E,
    HostIa32SysenterEspMsr = 0x0000_6C10,
    HostIa32SysenterEipMsr = 0x0000_6C12,
    HostRsp = 0x0000_6C14,
    HostRip = 0x0000_6C16,
}

/// Guest segment registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    Ldtr,
    Tr,
}

impl Segment {
    /// Data segments that real mode rewrites.
    pub const DATA: [Segment; 5] = [Segment::Ss, Segment::Es, Segment::Ds, Segment::Gs, Segment::Fs];

    /// Fields of (selector, base, limit, access rights).
    pub const fn fields(self) -> (Field, Field, Field, Field) {
        match self {
            Segment::Es => (
                Field::GuestEsSelector,
                Field::GuestEsBase,
                Field::GuestEsLimit,
                Field::GuestEsAccessRights,
            ),
            Segment::Cs => (
                Field::GuestCsSelector,
                Field::GuestCsBase,
                Field::GuestCsLimit,
                Field::GuestCsAccessRights,
            ),
            Segment::Ss => (
                Field::GuestSsSelector,
                Field::GuestSsBase,
                Field::GuestSsLimit,
                Field::GuestSsAccessRights,
            ),
            Segment::Ds => (
                Field::GuestDsSelector,
                Field::GuestDsBase,
                Field::GuestDsLimit,
                Field::GuestDsAccessRights,
            ),
            Segment::Fs => (
                Field::GuestFsSelector,
                Field::GuestFsBase,
                Field::GuestFsLimit,
                Field::GuestFsAccessRights,
            ),
            Segment::Gs => (
                Field::GuestGsSelector,
                Field::GuestGsBase,
                Field::GuestGsLimit,
                Field::GuestGsAccessRights,
            ),
            Segment::Ldtr => (
                Field::GuestLdtrSelector,
                Field::GuestLdtrBase,
                Field::GuestLdtrLimit,
                Field::GuestLdtrAccessRights,
            ),
            Segment::Tr => (
                Field::GuestTrSelector,
                Field::GuestTrBase,
                Field::GuestTrLimit,
                Field::GuestTrAccessRights,
            ),
        }
    }
}

/// The VMCS that is current on this core.
///
/// Obtained from a loaded vcpu; the borrow ties the accessor to the load.
#[derive(Clone, Copy)]
pub struct ActiveVmcs<'a> {
    hw: &'a dyn Vmx,
}

impl<'a> ActiveVmcs<'a> {
    pub(crate) fn new(hw: &'a dyn Vmx) -> Self {
        Self { hw }
    }

    /// The hardware this vmcs lives on.
    #[inline]
    pub fn hw(&self) -> &'a dyn Vmx {
        self.hw
    }

    /// Write to the vmcs field of the activated vmcs.
    pub fn write(&self, field: Field, v: u64) -> Result<(), VmError> {
        self.hw
            .vmwrite(field, v)
            .map_err(|e| VmError::VmxOperationError(instruction_error(self.hw, e)))
    }

    /// Read from the vmcs field of the activated vmcs.
    pub fn read(&self, field: Field) -> Result<u64, VmError> {
        self.hw
            .vmread(field)
            .map_err(|e| VmError::VmxOperationError(instruction_error(self.hw, e)))
    }

    /// Set `bits` of a control field.
    pub fn set_bits(&self, field: Field, bits: u64) -> Result<(), VmError> {
        self.write(field, self.read(field)? | bits)
    }

    /// Clear `bits` of a control field.
    pub fn clear_bits(&self, field: Field, bits: u64) -> Result<(), VmError> {
        self.write(field, self.read(field)? & !bits)
    }

    /// Resolve the exit reason of the activated vmcs.
    pub fn exit_reason(&self) -> Result<ExitReason, VmError> {
        Ok(ExitReason::from_raw(self.read(Field::VmexitReason)? as u32))
    }

    /// Write the four fields of a segment.
    pub fn write_segment(&self, seg: Segment, selector: u16, base: u64, limit: u32, ar: u32) -> Result<(), VmError> {
        let (sel_f, base_f, limit_f, ar_f) = seg.fields();
        self.write(sel_f, selector as u64)?;
        self.write(base_f, base)?;
        self.write(limit_f, limit as u64)?;
        self.write(ar_f, ar as u64)
    }
}

/// Possible list of basic vmexit reasons.
///
/// See Table C-1. Basic Exit Reasons for details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum BasicExitReason {
    ExceptionOrNmi = 0x0,
    ExternalInt = 0x1,
    TripleFault = 0x2,
    InitSignal = 0x3,
    StartupIpi = 0x4,
    IoSmi = 0x5,
    OtherSmi = 0x6,
    InterruptWindow = 0x7,
    NmiWindow = 0x8,
    TaskSwitch = 0x9,
    Cpuid = 0xA,
    Getsec = 0xB,
    Hlt = 0xC,
    Invd = 0xD,
    Invlpg = 0xE,
    Rdpmc = 0xF,
    Rdtsc = 0x10,
    Rsm = 0x11,
    Vmcall = 0x12,
    Vmclear = 0x13,
    Vmlaunch = 0x14,
    Vmptrld = 0x15,
    Vmptrst = 0x16,
    Vmread = 0x17,
    Vmresume = 0x18,
    Vmwrite = 0x19,
    Vmxoff = 0x1A,
    Vmxon = 0x1B,
    MovCr = 0x1C,
    MovDr = 0x1D,
    IoInstruction = 0x1E,
    Rdmsr = 0x1F,
    Wrmsr = 0x20,
    EntfailGuestState = 0x21,
    EntfailMsrLoading = 0x22,
    Mwait = 0x24,
    Mtf = 0x25,
    Monitor = 0x27,
    Pause = 0x28,
    EntfailMachineChk = 0x29,
    TprBelowThreshold = 0x2B,
}

/// A vmexit reason as reported in the exit-reason field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReason {
    /// Bits 15:0.
    pub basic: u16,
    /// Bit 29: the exit was from VMX root operation.
    pub from_root: bool,
    /// Bit 31: VM-entry failure.
    pub entry_failure: bool,
}

impl ExitReason {
    /// Decode the exit-reason field.
    pub const fn from_raw(raw: u32) -> Self {
        Self {
            basic: raw as u16,
            from_root: raw & (1 << 29) != 0,
            entry_failure: raw & (1 << 31) != 0,
        }
    }

    /// get basic exit reason of the exit reason.
    pub fn get_basic_reason(&self) -> Option<BasicExitReason> {
        BasicExitReason::try_from(self.basic).ok()
    }
}

/// Interruption type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum InterruptionType {
    /// External interrupt.
    ExternalInt = 0,
    /// Non-maskable interrupt.
    Nmi = 2,
    /// Hardware exception.
    HardwareException = 3,
    /// Software interrupt.
    SoftwareInt = 4,
    /// Privileged software exception.
    PrivSoftwareException = 5,
    /// Software exception.
    SoftwareException = 6,
    /// Other event.
    #[num_enum(default)]
    Other = 7,
}

/// Interruption information of vectored events.
///
/// See Table 24-17. Format of the VM-Exit Interruption-Information Field, and
/// Table 24-18. Format of the IDT-Vectoring Information Field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptionInfo(pub u32);

impl InterruptionInfo {
    /// Vector of interrupt or exception: BIT 7~0
    #[inline]
    pub fn vector(&self) -> u8 {
        self.0 as u8
    }
    /// Interruption type: BIT 10~8
    #[inline]
    pub fn kind(&self) -> InterruptionType {
        InterruptionType::from(((self.0 >> 8) & 7) as u8)
    }
    /// Error code is valid: BIT 11.
    #[inline]
    pub fn error_code_valid(&self) -> bool {
        self.0 & (1 << 11) != 0
    }
    /// Valid: BIT 31.
    #[inline]
    pub fn valid(&self) -> bool {
        self.0 & (1 << 31) != 0
    }
    /// A valid hardware exception with vector #PF.
    pub fn is_page_fault(&self) -> bool {
        self.valid() && self.kind() == InterruptionType::HardwareException && self.vector() == 14
    }
    /// A valid external interrupt.
    pub fn is_external_interrupt(&self) -> bool {
        self.valid() && self.kind() == InterruptionType::ExternalInt
    }
}
