//! Machine configuration.
use crate::MAX_VCPUS;

/// What a HLT exit does when an interrupt is already queued.
///
/// HLT always retires the instruction first. The policy only decides whether
/// the guest resumes at once or the halt is reported to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HaltPolicy {
    /// Resume only if a queued interrupt can be delivered right away, that is
    /// the guest has RFLAGS.IF set. Otherwise report the halt.
    #[default]
    ResumeIfDeliverable,
    /// Resume whenever an interrupt is queued, even with RFLAGS.IF clear. The
    /// guest spins through HLT until it unmasks interrupts.
    ResumeIfPending,
}

/// The slot-0 region installed when the first vcpu is created on an empty
/// slot 0. The real-mode TSS lives in its last three pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultRegion {
    /// Guest physical base.
    pub base: u64,
    /// Size in bytes.
    pub size: u64,
}

impl Default for DefaultRegion {
    fn default() -> Self {
        Self {
            base: 0x100_0000,
            size: 0x1_0000,
        }
    }
}

/// Configuration of a [`crate::Vm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of vcpu slots, at most [`MAX_VCPUS`].
    pub max_vcpus: usize,
    /// Region for slot 0 when it is still empty at vcpu creation.
    pub default_region: DefaultRegion,
    /// HLT exit handling.
    pub halt_policy: HaltPolicy,
    /// Extra exception vectors intercepted outside real mode.
    pub exception_bitmap: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_vcpus: 1,
            default_region: DefaultRegion::default(),
            halt_policy: HaltPolicy::default(),
            exception_bitmap: 0,
        }
    }
}

impl VmConfig {
    pub(crate) fn normalized(mut self) -> Self {
        self.max_vcpus = self.max_vcpus.clamp(1, MAX_VCPUS);
        self
    }
}
