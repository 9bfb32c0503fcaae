//! Interface to the shadow-paging subsystem.
//!
//! Each vcpu owns one [`Mmu`], created by the factory given to
//! [`crate::VmBuilder::new`]. The engine calls it to translate guest virtual
//! addresses, to resolve guest page faults, and whenever the guest changes
//! its address space or the memory configuration changes.
use crate::{
    memory::Memory,
    stats::Stats,
    vm::{Gpa, Gva},
    vmcs::ActiveVmcs,
    VmError,
};
use alloc::boxed::Box;

/// Paging mode of the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// CR0.PG clear.
    None,
    /// 32-bit paging.
    Legacy,
    /// PAE paging.
    Pae,
    /// 4-level paging.
    Long,
}

/// What the MMU sees of the vcpu on each call.
pub struct MmuContext<'a> {
    /// The VMCS of the vcpu, current on this core. GUEST_CR3 holds the
    /// shadow root.
    pub vmcs: ActiveVmcs<'a>,
    /// Guest memory.
    pub memory: &'a Memory,
    /// Counters to update (`pf_fixed`, `pf_guest`, `tlb_flush`).
    pub stats: &'a Stats,
    /// The guest's own CR3.
    pub cr3: u64,
    /// The guest's paging mode.
    pub paging: PagingMode,
}

/// Outcome of a guest page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFault {
    /// The shadow tables were fixed or the fault was reflected to the guest.
    Fixed,
    /// The access must be emulated (typically MMIO).
    Emulate,
}

/// Shadow-paging subsystem of a vcpu.
pub trait Mmu: Send {
    /// Translate a guest virtual address. `None` if unmapped.
    fn gva_to_gpa(&mut self, ctx: &MmuContext<'_>, gva: Gva) -> Option<Gpa>;
    /// Service a guest page fault at `gva`.
    fn page_fault(&mut self, ctx: &MmuContext<'_>, gva: Gva, error_code: u32) -> Result<PageFault, VmError>;
    /// Drop the translation of `gva`.
    fn inval_page(&mut self, ctx: &MmuContext<'_>, gva: Gva);
    /// The guest loaded a new CR3.
    fn new_cr3(&mut self, ctx: &MmuContext<'_>);
    /// Throw away every cached translation and rebuild for the current
    /// paging mode.
    fn reset_context(&mut self, ctx: &MmuContext<'_>) -> Result<(), VmError>;
    /// Write-protect the frames of `slot` so that dirty logging sees new
    /// writes.
    fn slot_remove_write_access(&mut self, _ctx: &MmuContext<'_>, _slot: usize) {}
}

/// Creates the [`Mmu`] of the vcpu at the given index.
pub type MmuFactory = dyn Fn(usize) -> Result<Box<dyn Mmu>, VmError> + Send + Sync;

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    /// Calls observed by an [`IdentityMmu`].
    #[derive(Default)]
    pub struct MmuLog {
        pub resets: AtomicUsize,
        pub new_cr3: AtomicUsize,
        pub invalidated: AtomicUsize,
        pub faults: AtomicUsize,
    }

    /// Maps every guest virtual address onto the same guest physical
    /// address. Faults on addresses with a slot are fixed, others emulated.
    pub struct IdentityMmu {
        pub log: Arc<MmuLog>,
    }

    impl Mmu for IdentityMmu {
        fn gva_to_gpa(&mut self, _ctx: &MmuContext<'_>, gva: Gva) -> Option<Gpa> {
            Gpa::new(gva.as_u64())
        }

        fn page_fault(&mut self, ctx: &MmuContext<'_>, gva: Gva, _error_code: u32) -> Result<PageFault, VmError> {
            self.log.faults.fetch_add(1, Ordering::Relaxed);
            let gfn = Gpa::new(gva.as_u64()).map(Gpa::gfn).unwrap_or(u64::MAX);
            match ctx.memory.gfn_to_memslot(gfn) {
                Some(_) => {
                    crate::stats::inc(&ctx.stats.pf_fixed);
                    Ok(PageFault::Fixed)
                }
                None => Ok(PageFault::Emulate),
            }
        }

        fn inval_page(&mut self, _ctx: &MmuContext<'_>, _gva: Gva) {
            self.log.invalidated.fetch_add(1, Ordering::Relaxed);
        }

        fn new_cr3(&mut self, _ctx: &MmuContext<'_>) {
            self.log.new_cr3.fetch_add(1, Ordering::Relaxed);
        }

        fn reset_context(&mut self, _ctx: &MmuContext<'_>) -> Result<(), VmError> {
            self.log.resets.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    /// A factory handing out [`IdentityMmu`]s that share `log`.
    pub fn identity(log: Arc<MmuLog>) -> Box<MmuFactory> {
        Box::new(move |_| {
            Ok(Box::new(IdentityMmu { log: log.clone() }) as Box<dyn Mmu>)
        })
    }
}
