//! Per-core "currently loaded VMCS" state.
//!
//! Each physical core owns one [`CoreSlot`]. The loaded pointer of a slot is
//! only written by its own core. Other cores never touch it: they post an
//! [`Eviction`] to the core's mailbox, interrupt it with
//! [`Vmx::notify_core`], and wait on the completion flag of the message.
use crate::hw::Vmx;
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use crossbeam_queue::SegQueue;
use crossbeam_utils::Backoff;

/// A request to drop a VMCS from a core.
pub struct Eviction {
    /// Physical address of the region.
    pub pa: u64,
    /// VMCLEAR the region. Set when the region is bound to the target core.
    pub clear: bool,
    done: Arc<AtomicBool>,
}

/// State of a physical core.
#[derive(Default)]
pub struct CoreSlot {
    current: AtomicU64,
    mailbox: SegQueue<Eviction>,
}

/// Arena of per-core slots, indexed by core id.
///
/// Machines that run on the same cores must share one arena.
pub struct CoreArena {
    cores: Vec<CoreSlot>,
}

impl CoreArena {
    /// Create the arena for `nr_cores` cores.
    pub fn new(nr_cores: usize) -> Self {
        Self {
            cores: (0..nr_cores.max(1)).map(|_| CoreSlot::default()).collect(),
        }
    }

    /// Number of cores of the arena.
    pub fn nr_cores(&self) -> usize {
        self.cores.len()
    }

    /// The VMCS that is current on `core`, if any.
    pub fn current(&self, core: usize) -> Option<u64> {
        match self.cores.get(core)?.current.load(Ordering::Acquire) {
            0 => None,
            pa => Some(pa),
        }
    }

    /// Record `pa` as current on the calling core.
    pub(crate) fn set_current(&self, hw: &dyn Vmx, pa: u64) {
        if let Some(slot) = self.cores.get(hw.core_id()) {
            slot.current.store(pa, Ordering::Release);
        }
    }

    /// Number of cores on which `pa` is current.
    pub fn resident_count(&self, pa: u64) -> usize {
        self.cores
            .iter()
            .filter(|slot| slot.current.load(Ordering::Acquire) == pa)
            .count()
    }

    /// Drop the region at `pa` from `core` and wait until it is gone.
    ///
    /// The calling core is handled in place.
    pub(crate) fn evict(&self, hw: &dyn Vmx, core: usize, pa: u64, clear: bool) {
        let Some(slot) = self.cores.get(core) else {
            return;
        };
        if core == hw.core_id() {
            Self::drop_region(hw, slot, pa, clear);
            return;
        }
        let done = Arc::new(AtomicBool::new(false));
        slot.mailbox.push(Eviction {
            pa,
            clear,
            done: done.clone(),
        });
        log::trace!("evict vmcs 0x{:x} from core #{}", pa, core);
        hw.notify_core(core);
        // The target may be waiting on us in turn.
        let backoff = Backoff::new();
        while !done.load(Ordering::Acquire) {
            self.service(hw);
            backoff.snooze();
        }
    }

    /// Serve the evictions posted to the calling core.
    ///
    /// Called from the handler of the interrupt sent by [`Vmx::notify_core`].
    pub fn service(&self, hw: &dyn Vmx) {
        let Some(slot) = self.cores.get(hw.core_id()) else {
            return;
        };
        while let Some(eviction) = slot.mailbox.pop() {
            Self::drop_region(hw, slot, eviction.pa, eviction.clear);
            eviction.done.store(true, Ordering::Release);
        }
    }

    fn drop_region(hw: &dyn Vmx, slot: &CoreSlot, pa: u64, clear: bool) {
        if clear && hw.vmclear(pa).is_err() {
            log::error!("core #{}: vmclear of 0x{:x} failed", hw.core_id(), pa);
        }
        let _ = slot
            .current
            .compare_exchange(pa, 0, Ordering::AcqRel, Ordering::Acquire);
    }
}
