//! Messages exchanged with the supervisor on each run.
use crate::vmcs::InstructionError;

/// A request to run a vcpu.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunRequest {
    /// Index of the vcpu.
    pub vcpu: usize,
    /// The supervisor emulated the instruction of the previous exit; skip it
    /// before entering.
    pub emulated: bool,
    /// Completion of the MMIO read reported by the previous exit.
    pub mmio_completion: Option<[u8; 8]>,
}

/// Direction of a port I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    In,
    Out,
}

/// A port I/O the supervisor must perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRequest {
    pub direction: IoDirection,
    /// Access size in bytes.
    pub size: u8,
    /// INS/OUTS.
    pub string: bool,
    /// RFLAGS.DF is set: string accesses walk downwards.
    pub string_down: bool,
    /// REP prefix.
    pub rep: bool,
    pub port: u16,
    /// Repeat count of a string instruction, 1 otherwise.
    pub count: u64,
    /// Guest linear address of a string instruction.
    pub address: u64,
    /// RAX for non-string accesses.
    pub value: u64,
}

/// An access to guest memory that no slot backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioRequest {
    pub phys_addr: u64,
    /// Data of a write.
    pub data: [u8; 8],
    pub len: usize,
    pub is_write: bool,
}

/// Why the guest stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExit {
    /// No handler for the exit reason.
    Unknown { hardware_exit_reason: u32 },
    /// A guest exception the monitor did not resolve.
    Exception { vector: u8, error_code: u32 },
    Io(IoRequest),
    Cpuid,
    /// A debug trap of guest debugging.
    Debug,
    Hlt,
    Mmio(MmioRequest),
}

/// Result of [`crate::Vm::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    /// The guest exited and the supervisor must act.
    Exit {
        exit: VmExit,
        /// Length of the instruction that caused the exit.
        instruction_length: u32,
    },
    /// The hardware refused to enter the guest.
    EntryFailure(InstructionError),
}
