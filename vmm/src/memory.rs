//! Guest physical memory.
//!
//! A machine has [`MEMORY_SLOTS`] slots. Each populated slot maps a range of
//! guest frames onto host pages and optionally tracks written frames in a
//! dirty bitmap.
//!
//! Reconfiguration never holds the machine lock across page allocation.
//! Instead, every installed change bumps a configuration version; a writer
//! that finds the version moved between validation and installation throws
//! its allocation away and starts over.
use crate::{stats::Stats, VmError, MEMORY_SLOTS, PAGE_SHIFT, PAGE_SIZE};
use alloc::{
    alloc::{alloc_zeroed, dealloc, Layout},
    sync::Arc,
    vec::Vec,
};
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};
use spin::Mutex;

/// Zeroed, page-aligned host memory.
pub struct HostPages {
    ptr: NonNull<u8>,
    npages: usize,
}

// The pages are plain memory; accesses go through raw pointers.
unsafe impl Send for HostPages {}
unsafe impl Sync for HostPages {}

impl HostPages {
    /// Allocate `npages` zeroed pages.
    pub fn zeroed(npages: usize) -> Result<Self, VmError> {
        let layout = Self::layout(npages)?;
        NonNull::new(unsafe { alloc_zeroed(layout) })
            .map(|ptr| Self { ptr, npages })
            .ok_or(VmError::OutOfMemory)
    }

    fn layout(npages: usize) -> Result<Layout, VmError> {
        npages
            .max(1)
            .checked_mul(PAGE_SIZE)
            .and_then(|size| Layout::from_size_align(size, PAGE_SIZE).ok())
            .ok_or(VmError::OutOfMemory)
    }

    /// Start of the pages.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.npages.max(1) * PAGE_SIZE
    }

    /// Copy out `buf.len()` bytes at `offset`. Returns false if out of bounds.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> bool {
        match offset.checked_add(buf.len()) {
            Some(end) if end <= self.len() => {
                unsafe {
                    core::ptr::copy_nonoverlapping(self.as_ptr().add(offset), buf.as_mut_ptr(), buf.len())
                };
                true
            }
            _ => false,
        }
    }

    /// Copy `data` in at `offset`. Returns false if out of bounds.
    pub fn write(&self, offset: usize, data: &[u8]) -> bool {
        match offset.checked_add(data.len()) {
            Some(end) if end <= self.len() => {
                unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(offset), data.len()) };
                true
            }
            _ => false,
        }
    }

    /// Fill the pages with zero.
    pub fn zero(&self) {
        unsafe { core::ptr::write_bytes(self.as_ptr(), 0, self.len()) }
    }
}

impl Drop for HostPages {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.npages) {
            unsafe { dealloc(self.ptr.as_ptr(), layout) }
        }
    }
}

bitflags::bitflags! {
    /// Flags of a memory slot.
    #[derive(Default)]
    pub struct SlotFlags: u32 {
        /// Track written frames.
        const LOG_DIRTY_PAGES = 1 << 0;
    }
}

/// Dirty bitmap of a slot, one bit per frame.
pub struct DirtyBitmap {
    words: Vec<AtomicU64>,
    npages: usize,
}

impl DirtyBitmap {
    fn new(npages: usize) -> Self {
        Self {
            words: (0..(npages + 63) / 64).map(|_| AtomicU64::new(0)).collect(),
            npages,
        }
    }

    /// Mark the frame at `rel_gfn` within the slot.
    ///
    /// Reads before setting so that an already dirty frame costs no write.
    pub fn mark(&self, rel_gfn: usize) {
        if rel_gfn >= self.npages {
            return;
        }
        let (word, bit) = (&self.words[rel_gfn / 64], 1u64 << (rel_gfn % 64));
        if word.load(Ordering::Relaxed) & bit == 0 {
            word.fetch_or(bit, Ordering::Relaxed);
        }
    }

    /// Whether the frame at `rel_gfn` is dirty.
    pub fn is_dirty(&self, rel_gfn: usize) -> bool {
        self.words
            .get(rel_gfn / 64)
            .map(|w| w.load(Ordering::Relaxed) & (1 << (rel_gfn % 64)) != 0)
            .unwrap_or(false)
    }

    /// Copy the bitmap out.
    pub fn snapshot(&self) -> Vec<u64> {
        self.words.iter().map(|w| w.load(Ordering::Relaxed)).collect()
    }

    fn clear(&self) {
        self.words.iter().for_each(|w| w.store(0, Ordering::Relaxed));
    }
}

/// A populated memory slot.
#[derive(Clone)]
pub struct MemorySlot {
    /// First guest frame.
    pub base_gfn: u64,
    /// Number of frames.
    pub npages: usize,
    /// Flags.
    pub flags: SlotFlags,
    pages: Arc<Vec<HostPages>>,
    dirty: Option<Arc<DirtyBitmap>>,
}

impl MemorySlot {
    /// Whether `gfn` falls in this slot.
    #[inline]
    pub fn contains(&self, gfn: u64) -> bool {
        gfn >= self.base_gfn && gfn < self.base_gfn + self.npages as u64
    }

    /// Backing page of `gfn`.
    pub fn page(&self, gfn: u64) -> Option<&HostPages> {
        gfn.checked_sub(self.base_gfn)
            .and_then(|rel| self.pages.get(rel as usize))
    }

    /// The dirty bitmap, if the slot logs dirty pages.
    pub fn dirty_bitmap(&self) -> Option<&DirtyBitmap> {
        self.dirty.as_deref()
    }

    /// Mark `gfn` dirty if the slot logs dirty pages.
    pub fn mark_dirty(&self, gfn: u64) {
        if let (Some(dirty), true) = (self.dirty.as_ref(), self.contains(gfn)) {
            dirty.mark((gfn - self.base_gfn) as usize);
        }
    }

    fn overlaps(&self, base_gfn: u64, npages: usize) -> bool {
        !(base_gfn + npages as u64 <= self.base_gfn || base_gfn >= self.base_gfn + self.npages as u64)
    }
}

/// A region to install into a slot.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion<'a> {
    /// Slot index.
    pub slot: usize,
    /// Guest physical base, page-aligned.
    pub guest_phys_addr: u64,
    /// Size in bytes, page-aligned. Zero removes the slot.
    pub memory_size: u64,
    /// Flags.
    pub flags: SlotFlags,
    /// Initial contents, copied page by page into fresh pages.
    pub init_data: Option<&'a [u8]>,
}

/// A populated slot as reported to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    /// Slot index.
    pub slot: usize,
    /// First guest frame.
    pub base_gfn: u64,
    /// Number of frames.
    pub npages: usize,
    /// Flags.
    pub flags: SlotFlags,
}

struct MemoryMap {
    slots: [Option<MemorySlot>; MEMORY_SLOTS],
    nmemslots: usize,
    version: u64,
    busy: usize,
}

/// The slot table of a machine with its configuration version and busy count.
pub struct Memory {
    inner: Mutex<MemoryMap>,
}

impl Default for Memory {
    fn default() -> Self {
        Self {
            inner: Mutex::new(MemoryMap {
                slots: Default::default(),
                nmemslots: 0,
                version: 0,
                busy: 0,
            }),
        }
    }
}

/// Holds the busy count of a [`Memory`] until dropped.
pub(crate) struct BusyGuard<'a>(&'a Memory);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.inner.lock().busy -= 1;
    }
}

impl Memory {
    /// Current configuration version.
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Install `region`. See [`Memory::set_region_with`].
    pub fn set_region(&self, region: &MemoryRegion<'_>, stats: &Stats) -> Result<(), VmError> {
        self.set_region_with(region, stats, || ())
    }

    /// Install `region`, calling `allocated` each time the backing pages of
    /// an attempt are ready and the lock is about to be retaken.
    pub(crate) fn set_region_with(
        &self,
        region: &MemoryRegion<'_>,
        stats: &Stats,
        mut allocated: impl FnMut(),
    ) -> Result<(), VmError> {
        let (base, size) = (region.guest_phys_addr, region.memory_size);
        if size & (PAGE_SIZE as u64 - 1) != 0 {
            return Err(VmError::Unaligned(size));
        }
        if base & (PAGE_SIZE as u64 - 1) != 0 {
            return Err(VmError::Unaligned(base));
        }
        if region.slot >= MEMORY_SLOTS {
            return Err(VmError::InvalidSlot(region.slot));
        }
        if base.checked_add(size).is_none() {
            return Err(VmError::AddressOverflow { base, size });
        }
        let base_gfn = base >> PAGE_SHIFT;
        let npages = (size >> PAGE_SHIFT) as usize;
        let flags = if npages == 0 {
            region.flags - SlotFlags::LOG_DIRTY_PAGES
        } else {
            region.flags
        };

        loop {
            let (version, old) = {
                let map = self.inner.lock();
                let old = map.slots[region.slot].clone();
                if let Some(old) = old.as_ref() {
                    if npages != 0 && old.npages != npages {
                        return Err(VmError::SlotResize {
                            slot: region.slot,
                            old: old.npages,
                            new: npages,
                        });
                    }
                }
                if npages != 0 {
                    if let Some(other) = map.slots.iter().enumerate().position(|(i, s)| {
                        i != region.slot && s.as_ref().map(|s| s.overlaps(base_gfn, npages)).unwrap_or(false)
                    }) {
                        return Err(VmError::SlotOverlap {
                            slot: region.slot,
                            other,
                        });
                    }
                }
                (map.version, old)
            };

            let new = if npages == 0 {
                None
            } else {
                let pages = match old.as_ref() {
                    Some(old) => old.pages.clone(),
                    None => Arc::new(Self::allocate_pages(npages, region.init_data)?),
                };
                let dirty = if flags.contains(SlotFlags::LOG_DIRTY_PAGES) {
                    Some(
                        old.as_ref()
                            .and_then(|old| old.dirty.clone())
                            .unwrap_or_else(|| Arc::new(DirtyBitmap::new(npages))),
                    )
                } else {
                    None
                };
                Some(MemorySlot {
                    base_gfn,
                    npages,
                    flags,
                    pages,
                    dirty,
                })
            };
            allocated();

            let mut map = self.inner.lock();
            if map.version != version {
                drop(map);
                crate::stats::inc(&stats.memslot_retries);
                log::debug!("slot #{}: configuration changed, retrying", region.slot);
                continue;
            }
            if map.busy != 0 {
                return Err(VmError::Busy);
            }
            if region.slot >= map.nmemslots {
                map.nmemslots = region.slot + 1;
            }
            map.slots[region.slot] = new;
            map.version += 1;
            log::debug!(
                "slot #{}: base_gfn 0x{:x} npages {} (version {})",
                region.slot,
                base_gfn,
                npages,
                map.version
            );
            // The old pages are released here, outside the lock.
            drop(map);
            drop(old);
            return Ok(());
        }
    }

    fn allocate_pages(npages: usize, init_data: Option<&[u8]>) -> Result<Vec<HostPages>, VmError> {
        let mut pages = Vec::new();
        pages
            .try_reserve_exact(npages)
            .map_err(|_| VmError::OutOfMemory)?;
        for i in 0..npages {
            let page = HostPages::zeroed(1)?;
            if let Some(chunk) = init_data.and_then(|data| data.chunks(PAGE_SIZE).nth(i)) {
                page.write(0, chunk);
            }
            pages.push(page);
        }
        Ok(pages)
    }

    /// Bump the configuration version without changing the slots.
    #[cfg(test)]
    pub(crate) fn bump_version(&self) {
        self.inner.lock().version += 1;
    }

    /// The slot containing `gfn`.
    ///
    /// The returned slot keeps its pages alive even if it is replaced.
    pub fn gfn_to_memslot(&self, gfn: u64) -> Option<MemorySlot> {
        let map = self.inner.lock();
        map.slots[..map.nmemslots]
            .iter()
            .flatten()
            .find(|slot| slot.contains(gfn))
            .cloned()
    }

    /// The slot at `index`.
    pub fn slot(&self, index: usize) -> Option<MemorySlot> {
        self.inner.lock().slots.get(index).cloned().flatten()
    }

    /// Populated slots.
    pub fn slots(&self) -> Vec<SlotInfo> {
        self.inner
            .lock()
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, s)| {
                s.as_ref().map(|s| SlotInfo {
                    slot,
                    base_gfn: s.base_gfn,
                    npages: s.npages,
                    flags: s.flags,
                })
            })
            .collect()
    }

    /// Mark `gfn` dirty in its slot.
    pub fn mark_page_dirty(&self, gfn: u64) {
        if let Some(slot) = self.gfn_to_memslot(gfn) {
            slot.mark_dirty(gfn);
        }
    }

    /// Pin the configuration: [`Memory::set_region`] fails with
    /// [`VmError::Busy`] until the guard drops.
    pub(crate) fn busy(&self) -> BusyGuard<'_> {
        self.inner.lock().busy += 1;
        BusyGuard(self)
    }

    /// Copy out and clear the dirty bitmap of `slot`.
    ///
    /// Returns the bitmap and whether any frame was dirty.
    pub(crate) fn take_dirty_log(&self, slot: usize) -> Result<(Vec<u64>, bool), VmError> {
        if slot >= MEMORY_SLOTS {
            return Err(VmError::InvalidSlot(slot));
        }
        let memslot = self.slot(slot).ok_or(VmError::NoDirtyLog(slot))?;
        let dirty = memslot.dirty.as_ref().ok_or(VmError::NoDirtyLog(slot))?;
        let log = dirty.snapshot();
        let any = log.iter().any(|w| *w != 0);
        if any {
            dirty.clear();
        }
        Ok((log, any))
    }

    /// Read guest physical memory. Stops at the first frame without a slot
    /// and returns the number of bytes read.
    pub fn read(&self, gpa: u64, buf: &mut [u8]) -> usize {
        let mut done = 0;
        while done < buf.len() {
            let addr = gpa + done as u64;
            let offset = (addr as usize) & (PAGE_SIZE - 1);
            let len = (PAGE_SIZE - offset).min(buf.len() - done);
            let gfn = addr >> PAGE_SHIFT;
            match self.gfn_to_memslot(gfn) {
                Some(slot) => match slot.page(gfn) {
                    Some(page) if page.read(offset, &mut buf[done..done + len]) => done += len,
                    _ => break,
                },
                None => break,
            }
        }
        done
    }

    /// Write guest physical memory and mark the frames dirty. Stops at the
    /// first frame without a slot and returns the number of bytes written.
    pub fn write(&self, gpa: u64, data: &[u8]) -> usize {
        let mut done = 0;
        while done < data.len() {
            let addr = gpa + done as u64;
            let offset = (addr as usize) & (PAGE_SIZE - 1);
            let len = (PAGE_SIZE - offset).min(data.len() - done);
            let gfn = addr >> PAGE_SHIFT;
            match self.gfn_to_memslot(gfn) {
                Some(slot) => match slot.page(gfn) {
                    Some(page) if page.write(offset, &data[done..done + len]) => {
                        slot.mark_dirty(gfn);
                        done += len;
                    }
                    _ => break,
                },
                None => break,
            }
        }
        done
    }

    /// Guest physical base of the real-mode TSS: the last three pages of
    /// slot 0.
    pub fn rmode_tss_base(&self) -> Option<u64> {
        self.slot(0)
            .filter(|slot| slot.npages >= 3)
            .map(|slot| (slot.base_gfn + slot.npages as u64 - 3) << PAGE_SHIFT)
    }
}
