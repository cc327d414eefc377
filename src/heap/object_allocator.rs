use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::object::ObjectHeader;

use super::page::{Page, PageKind};
use super::page_allocator::{AllocFlags, PageAllocator};
use super::AllocError;

/// Thread-local allocation buffer. The owner bump-allocates through a CAS
/// on `top` rather than a plain store, so the collector can force-retire
/// the buffer at mark start by stealing the remaining range without
/// suspending the owner: whichever CAS lands first wins, and the loser
/// falls into the synchronized slow path.
pub struct Tlab {
    top: AtomicUsize,
    end: AtomicUsize,
    desired: AtomicUsize,
}

impl Tlab {
    fn new(min_size: usize) -> Self {
        Self {
            top: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
            desired: AtomicUsize::new(min_size),
        }
    }

    fn alloc(&self, size: usize) -> Option<usize> {
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            if top == 0 || top + size > self.end.load(Ordering::Relaxed) {
                return None;
            }
            match self.top.compare_exchange_weak(
                top,
                top + size,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(top),
                Err(t) => top = t,
            }
        }
    }

    /// Claims whatever the buffer still holds. Used by the owner before a
    /// refill and by the collector when retiring all buffers; the range
    /// must then be backfilled with a filler object.
    fn steal_remainder(&self) -> Option<(usize, usize)> {
        let end = self.end.load(Ordering::Acquire);
        let mut top = self.top.load(Ordering::Acquire);
        loop {
            if top == 0 || top == end {
                return None;
            }
            match self
                .top
                .compare_exchange(top, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Some((top, end - top)),
                Err(t) => top = t,
            }
        }
    }

    /// Only the owner refills, and never concurrently with a collector
    /// retire (refill runs under the phase read lock, retire under the
    /// write lock).
    fn refill(&self, top: usize, end: usize) {
        self.end.store(end, Ordering::Release);
        self.top.store(top, Ordering::Release);
    }
}

/// Per-thread allocation handle handed to clients. Dropping it abandons
/// the buffer; the next collector retire reclaims the remainder.
pub struct AllocContext {
    tlab: Arc<Tlab>,
}

/// Object-level allocation front end: TLAB fast path for small objects,
/// shared CAS-bump pages for medium ones and TLAB refills, one dedicated
/// page per large object. Relocation targets use separate shared pages so
/// a draining worker never competes with mutator bump cursors.
pub struct ObjectAllocator {
    shared_small: AtomicPtr<Page>,
    shared_medium: AtomicPtr<Page>,
    reloc_small: AtomicPtr<Page>,
    reloc_medium: AtomicPtr<Page>,
    tlabs: Mutex<Vec<Arc<Tlab>>>,
    allocated: AtomicUsize,
}

impl ObjectAllocator {
    pub fn new() -> Self {
        Self {
            shared_small: AtomicPtr::new(null_mut()),
            shared_medium: AtomicPtr::new(null_mut()),
            reloc_small: AtomicPtr::new(null_mut()),
            reloc_medium: AtomicPtr::new(null_mut()),
            tlabs: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
        }
    }

    pub fn new_context(&self, pa: &PageAllocator) -> AllocContext {
        let tlab = Arc::new(Tlab::new(pa.options().min_tlab_size));
        self.tlabs.lock().push(tlab.clone());
        AllocContext { tlab }
    }

    /// Object bytes allocated since the last `reset_allocated`, with
    /// relocation undos subtracted.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn reset_allocated(&self) {
        self.allocated.store(0, Ordering::Relaxed);
    }

    fn alloc_in_shared(
        &self,
        pa: &PageAllocator,
        slot: &AtomicPtr<Page>,
        kind: PageKind,
        size: usize,
        flags: AllocFlags,
        cycle: u32,
    ) -> Result<usize, AllocError> {
        loop {
            let current = slot.load(Ordering::Acquire);
            if !current.is_null() {
                if let Some(addr) = unsafe { (*current).alloc_object(size) } {
                    return Ok(addr);
                }
            }

            let page_size = pa.options().page_size_for(kind, size);
            let page = pa.alloc_page(kind, page_size, flags, cycle)?;
            let Some(addr) = (unsafe { (*page).alloc_object(size) }) else {
                pa.undo_alloc_page(page);
                return Err(AllocError::OutOfMemory);
            };

            match slot.compare_exchange(current, page, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(addr),
                Err(_) => {
                    // Another thread installed a fresh page first; retry on
                    // theirs and return ours untouched.
                    unsafe { (*page).undo_alloc_object(addr, size) };
                    pa.undo_alloc_page(page);
                }
            }
        }
    }

    /// Carves a bump range of at least `min` bytes from a small page, for
    /// TLAB refills and for clients managing their own buffers.
    pub fn alloc_tlab(
        &self,
        pa: &PageAllocator,
        min: usize,
        desired: usize,
        cycle: u32,
    ) -> Result<(usize, usize), AllocError> {
        let opts = pa.options();
        debug_assert!(min <= opts.small_object_max);
        let desired = desired.clamp(min, opts.max_tlab_size.max(min));

        loop {
            let current = self.shared_small.load(Ordering::Acquire);
            if !current.is_null() {
                if let Some(range) = unsafe { (*current).alloc_range(min, desired) } {
                    return Ok(range);
                }
            }

            let page = pa.alloc_page(
                PageKind::Small,
                opts.small_page_size,
                AllocFlags::default(),
                cycle,
            )?;
            let Some(range) = (unsafe { (*page).alloc_range(min, desired) }) else {
                pa.undo_alloc_page(page);
                return Err(AllocError::OutOfMemory);
            };

            match self
                .shared_small
                .compare_exchange(current, page, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(range),
                Err(_) => {
                    unsafe { (*page).undo_alloc_object(range.0, range.1) };
                    pa.undo_alloc_page(page);
                }
            }
        }
    }

    fn refill_and_alloc(
        &self,
        pa: &PageAllocator,
        ctx: &AllocContext,
        size: usize,
        cycle: u32,
    ) -> Result<usize, AllocError> {
        if let Some((start, len)) = ctx.tlab.steal_remainder() {
            unsafe { ObjectHeader::fill_dead(start, len) };
        }

        let opts = pa.options();
        let desired = ctx.tlab.desired.load(Ordering::Relaxed);
        let (start, len) = self.alloc_tlab(pa, size, desired.max(size), cycle)?;

        // Grow towards max on every refill; an allocation-heavy thread
        // converges on large buffers quickly.
        ctx.tlab
            .desired
            .store((desired * 2).min(opts.max_tlab_size), Ordering::Relaxed);
        ctx.tlab.refill(start + size, start + len);
        Ok(start)
    }

    /// Mutator object allocation. `size` is the granule-rounded total
    /// object size; the caller installs the header.
    pub fn alloc_object(
        &self,
        pa: &PageAllocator,
        ctx: &AllocContext,
        size: usize,
        cycle: u32,
    ) -> Result<usize, AllocError> {
        let opts = pa.options();
        let addr = if size <= opts.small_object_max {
            match ctx.tlab.alloc(size) {
                Some(addr) => addr,
                None => self.refill_and_alloc(pa, ctx, size, cycle)?,
            }
        } else if size <= opts.medium_object_max && opts.medium_page_size != 0 {
            self.alloc_in_shared(
                pa,
                &self.shared_medium,
                PageKind::Medium,
                size,
                AllocFlags::default(),
                cycle,
            )?
        } else {
            self.alloc_large(pa, size, AllocFlags::default(), cycle)?
        };
        self.allocated.fetch_add(size, Ordering::Relaxed);
        Ok(addr)
    }

    fn alloc_large(
        &self,
        pa: &PageAllocator,
        size: usize,
        flags: AllocFlags,
        cycle: u32,
    ) -> Result<usize, AllocError> {
        let page_size = pa.options().page_size_for(PageKind::Large, size);
        let page = pa.alloc_page(PageKind::Large, page_size, flags, cycle)?;
        let Some(addr) = (unsafe { (*page).alloc_object(size) }) else {
            pa.undo_alloc_page(page);
            return Err(AllocError::OutOfMemory);
        };
        Ok(addr)
    }

    /// Allocation of a relocation target copy. Never requests a recursive
    /// cycle; capacity exhaustion here makes the caller fall back to
    /// in-place survival.
    pub fn alloc_for_relocation(
        &self,
        pa: &PageAllocator,
        size: usize,
        cycle: u32,
    ) -> Result<usize, AllocError> {
        let opts = pa.options();
        let flags = AllocFlags {
            non_blocking: false,
            relocation: true,
        };
        let addr = if size <= opts.small_object_max {
            self.alloc_in_shared(pa, &self.reloc_small, PageKind::Small, size, flags, cycle)?
        } else if size <= opts.medium_object_max && opts.medium_page_size != 0 {
            self.alloc_in_shared(pa, &self.reloc_medium, PageKind::Medium, size, flags, cycle)?
        } else {
            self.alloc_large(pa, size, flags, cycle)?
        };
        self.allocated.fetch_add(size, Ordering::Relaxed);
        Ok(addr)
    }

    /// Releases a relocation copy that lost the forwarding race. If it is
    /// no longer the top-most allocation the space is abandoned under a
    /// filler and reclaimed with the page.
    pub fn undo_alloc_for_relocation(&self, pa: &PageAllocator, addr: usize, size: usize) {
        let page = pa.table().get(addr);
        debug_assert!(!page.is_null());
        unsafe {
            if !(*page).undo_alloc_object(addr, size) {
                ObjectHeader::fill_dead(addr, size);
            }
        }
        self.allocated.fetch_sub(size, Ordering::Relaxed);
    }

    /// Force-retires every thread-local buffer and detaches the shared
    /// bump pages. Runs inside the mark-start pause so that everything
    /// allocated afterwards lands on pages stamped with the new cycle.
    pub fn retire_all(&self) {
        let mut tlabs = self.tlabs.lock();
        for tlab in tlabs.iter() {
            if let Some((start, len)) = tlab.steal_remainder() {
                unsafe { ObjectHeader::fill_dead(start, len) };
            }
        }
        // Contexts whose owner dropped the handle are done for good.
        tlabs.retain(|t| Arc::strong_count(t) > 1);

        self.shared_small.store(null_mut(), Ordering::Release);
        self.shared_medium.store(null_mut(), Ordering::Release);
        self.reloc_small.store(null_mut(), Ordering::Release);
        self.reloc_medium.store(null_mut(), Ordering::Release);
    }
}

impl Default for ObjectAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::page::{setup_sizes, HeapArguments};
    use crate::heap::GRANULE;

    fn fixture() -> (PageAllocator, ObjectAllocator) {
        let opts = setup_sizes(&HeapArguments {
            max_capacity: 1024 * 1024,
            small_page_size: 64 * 1024,
            min_tlab_size: 256,
            max_tlab_size: 1024,
            enable_controller: false,
            ..Default::default()
        });
        (PageAllocator::new(opts), ObjectAllocator::new())
    }

    #[test]
    fn tlab_fast_path_is_contiguous() {
        let (pa, oa) = fixture();
        let ctx = oa.new_context(&pa);

        let a = oa.alloc_object(&pa, &ctx, 64, 0).unwrap();
        let b = oa.alloc_object(&pa, &ctx, 32, 0).unwrap();
        assert_eq!(b, a + 64);
        assert_eq!(oa.allocated(), 96);

        // Both came out of a single small page.
        assert_eq!(pa.table().get(a), pa.table().get(b));
        assert_eq!(unsafe { (*pa.table().get(a)).kind() }, PageKind::Small);
    }

    #[test]
    fn size_classes_route_to_page_kinds() {
        let (pa, oa) = fixture();
        let ctx = oa.new_context(&pa);
        let opts = *pa.options();

        let medium = oa
            .alloc_object(&pa, &ctx, opts.small_object_max + GRANULE, 0)
            .unwrap();
        assert_eq!(unsafe { (*pa.table().get(medium)).kind() }, PageKind::Medium);

        let large = oa
            .alloc_object(&pa, &ctx, opts.medium_object_max + GRANULE, 0)
            .unwrap();
        let large_page = pa.table().get(large);
        assert_eq!(unsafe { (*large_page).kind() }, PageKind::Large);
        assert_eq!(large, unsafe { (*large_page).start() });
    }

    #[test]
    fn retire_backfills_remainder_with_filler() {
        let (pa, oa) = fixture();
        let ctx = oa.new_context(&pa);

        let size = ObjectHeader::object_size(16, 0);
        let addr = oa.alloc_object(&pa, &ctx, size, 0).unwrap();
        unsafe { ObjectHeader::initialize(addr, size, 0) };

        oa.retire_all();

        let page = pa.table().get(addr);
        let mut seen = vec![];
        unsafe { (*page).for_each_object(|a| seen.push(a)) };
        assert_eq!(seen, vec![addr]);

        // The buffer was stolen; the owner's next allocation refills.
        let next = oa.alloc_object(&pa, &ctx, size, 1).unwrap();
        assert_ne!(next, addr + size);
    }

    #[test]
    fn relocation_undo_is_not_double_counted() {
        let (pa, oa) = fixture();
        let size = ObjectHeader::object_size(32, 0);

        let addr = oa.alloc_for_relocation(&pa, size, 1).unwrap();
        assert_eq!(oa.allocated(), size);
        oa.undo_alloc_for_relocation(&pa, addr, size);
        assert_eq!(oa.allocated(), 0);

        // Top-most undo really gave the space back.
        let again = oa.alloc_for_relocation(&pa, size, 1).unwrap();
        assert_eq!(again, addr);
    }

    #[test]
    fn relocation_and_mutator_pages_are_separate() {
        let (pa, oa) = fixture();
        let ctx = oa.new_context(&pa);
        let size = ObjectHeader::object_size(32, 0);

        let mutator = oa.alloc_object(&pa, &ctx, size, 0).unwrap();
        let reloc = oa.alloc_for_relocation(&pa, size, 0).unwrap();
        assert_ne!(pa.table().get(mutator), pa.table().get(reloc));
    }
}
