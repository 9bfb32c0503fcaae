//! A VT-x virtual machine monitor core.
//!
//! This crate is the layer between a host kernel and the raw virtualization
//! hardware. It owns the per-vcpu Virtual-Machine Control State (VMCS),
//! performs the world switch into and out of the guest, and interprets every
//! VM exit the hardware hands back: either resolving it transparently or
//! reporting it to a host-side supervisor through a [`RunResult`].
//!
//! ## Components
//! From the leaves up:
//!
//! - [`vmcs`]: allocation of revision-tagged VMCS regions, field encodings and
//!   the accessor of the VMCS that is current on this core.
//! - [`mode`]: guest operating-mode transitions (real, protected and long mode)
//!   and validated control-register writes.
//! - [`vcpu`]: vcpu creation, loading onto a physical core, unloading and
//!   destruction. The per-core "currently loaded VMCS" state lives in
//!   [`percpu`].
//! - [`memory`]: guest physical memory slots, dirty logging and the race-free
//!   reconfiguration protocol.
//! - [`switch`]: the world switch and the run loop.
//! - [`vmexits`]: the table-driven exit dispatcher.
//! - [`interrupt`]: pending-interrupt bookkeeping and injection.
//!
//! The shadow-paging subsystem and the instruction emulator are external
//! collaborators, described by the [`mmu::Mmu`] and [`emulate::Emulator`]
//! traits. All privileged instructions go through the [`hw::Vmx`] trait.
//!
//! ## Control flow
//! A supervisor builds a [`Vm`] with [`VmBuilder`], registers memory with
//! [`Vm::set_memory_region`], creates vcpus with [`Vm::create_vcpu`], and then
//! repeatedly calls [`Vm::run`]. Every call either returns a [`RunResult`]
//! describing why the guest stopped, or a [`VmError`] when the host or the
//! hardware is in an inconsistent state.
//!
//! ## Errors
//! Faults caused by the guest, such as invalid control-register values or
//! unknown MSRs, never surface as [`VmError`]. They are turned into a general
//! protection fault injected into the guest.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod emulate;
pub mod hw;
pub mod interrupt;
pub mod memory;
pub mod mmu;
pub mod mode;
pub mod msr;
pub mod percpu;
pub mod run;
pub mod stats;
pub mod switch;
pub mod vcpu;
pub mod vm;
pub mod vm_control;
pub mod vmcs;
pub mod vmexits;

pub use config::{HaltPolicy, VmConfig};
pub use run::{RunRequest, RunResult};
pub use vm::{Gpa, Gva, Vm, VmBuilder};

use alloc::boxed::Box;
use vmcs::InstructionError;

/// Upper bound of the vcpus that a machine can hold.
pub const MAX_VCPUS: usize = 4;
/// Number of guest memory slots of a machine.
pub const MEMORY_SLOTS: usize = 4;
/// Size of a page.
pub const PAGE_SIZE: usize = 0x1000;
/// Shift of a page.
pub const PAGE_SHIFT: usize = 12;

/// Possible errors of the virtual machine monitor.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// A VMX instruction failed.
    #[error("vmx instruction failed: {0:?}")]
    VmxOperationError(InstructionError),
    /// Host memory is exhausted.
    #[error("out of memory")]
    OutOfMemory,
    /// The vcpu index is out of range.
    #[error("vcpu #{0} is out of range")]
    InvalidVcpu(usize),
    /// The vcpu already exists.
    #[error("vcpu #{0} already exists")]
    VcpuExists(usize),
    /// The vcpu is not created yet.
    #[error("vcpu #{0} is not created")]
    VcpuNotCreated(usize),
    /// The slot index is out of range.
    #[error("memory slot #{0} is out of range")]
    InvalidSlot(usize),
    /// Address or size is not page-aligned.
    #[error("0x{0:x} is not page-aligned")]
    Unaligned(u64),
    /// `base + size` overflows.
    #[error("region 0x{base:x}+0x{size:x} overflows")]
    AddressOverflow {
        /// Guest physical base.
        base: u64,
        /// Size in bytes.
        size: u64,
    },
    /// The slot is populated with a different page count.
    #[error("memory slot #{slot} has {old} pages, cannot resize to {new}")]
    SlotResize {
        /// Slot index.
        slot: usize,
        /// Current page count.
        old: usize,
        /// Requested page count.
        new: usize,
    },
    /// The region overlaps another slot.
    #[error("memory slot #{slot} overlaps slot #{other}")]
    SlotOverlap {
        /// Slot index.
        slot: usize,
        /// The overlapped slot.
        other: usize,
    },
    /// Memory configuration is pinned by a dirty-log retrieval.
    #[error("memory configuration is busy")]
    Busy,
    /// The slot does not track dirty pages.
    #[error("memory slot #{0} does not log dirty pages")]
    NoDirtyLog(usize),
    /// The interrupt vector is out of range.
    #[error("interrupt {0} is out of range")]
    InvalidInterrupt(u32),
    /// The shadow-paging collaborator failed.
    #[error("mmu error: {0:?}")]
    Mmu(Box<dyn core::fmt::Debug + Send + Sync>),
    /// Slot 0 is too small to hold the real-mode TSS.
    #[error("slot 0 cannot hold the real-mode tss")]
    NoRealModeTss,
    /// The instruction at the guest rip cannot be decoded.
    #[error("failed to decode instruction")]
    FailedToDecodeInstruction,
}
