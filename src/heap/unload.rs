use parking_lot::Mutex;

use super::page_table::PageTable;

struct Record {
    anchor: usize,
    teardown: Box<dyn FnOnce() + Send>,
}

/// Teardown of metadata tied to heap objects (class data, JIT stubs and
/// the like in the embedder). Each record is anchored to an object; once
/// a cycle proves the anchor unreachable the teardown callback runs.
/// Decisions are made strictly after mark end, so neither the marker nor
/// the relocator can still hold a view of the anchored object.
pub struct Unloader {
    records: Mutex<Vec<Record>>,
}

impl Unloader {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, anchor: usize, teardown: impl FnOnce() + Send + 'static) {
        debug_assert!(anchor != 0);
        self.records.lock().push(Record {
            anchor,
            teardown: Box::new(teardown),
        });
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn is_strongly_live(table: &PageTable, cycle: u32, addr: usize) -> bool {
        let page = table.get(addr);
        if page.is_null() {
            return false;
        }
        let page = unsafe { &*page };
        if page.seqnum() == cycle {
            return true;
        }
        let live_map = page.live_map();
        live_map.is_current(cycle) && live_map.is_strongly_live(page.granule_index(addr))
    }

    /// Runs teardown for every record whose anchor died in `cycle`.
    /// Anchors are kept current across relocations by `heal`, so liveness
    /// is read off the page straight away.
    pub fn unload(&self, table: &PageTable, cycle: u32) {
        let dead = {
            let mut records = self.records.lock();
            let mut dead = Vec::new();
            let mut i = 0;
            while i < records.len() {
                if Self::is_strongly_live(table, cycle, records[i].anchor) {
                    i += 1;
                } else {
                    dead.push(records.swap_remove(i));
                }
            }
            dead
        };

        if !dead.is_empty() {
            log::debug!(target: "gc", "Unloading {} dead metadata records", dead.len());
        }
        // Callbacks run outside the lock; a teardown may register again.
        for record in dead {
            (record.teardown)();
        }
    }

    /// Re-anchors every surviving record to its relocated address. Runs
    /// inside the relocate-start pause, after `unload` dropped the dead
    /// records for the cycle.
    pub fn heal(&self, mut relocate: impl FnMut(usize) -> usize) {
        let mut records = self.records.lock();
        for record in records.iter_mut() {
            record.anchor = relocate(record.anchor);
        }
    }
}

impl Default for Unloader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::page::{setup_sizes, HeapArguments, PageKind};
    use crate::heap::page_allocator::{AllocFlags, PageAllocator};
    use crate::object::ObjectHeader;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fixture() -> (PageAllocator, usize, usize) {
        let opts = setup_sizes(&HeapArguments {
            max_capacity: 256 * 1024,
            small_page_size: 64 * 1024,
            enable_controller: false,
            ..Default::default()
        });
        let pa = PageAllocator::new(opts);

        let page = pa
            .alloc_page(PageKind::Small, opts.page_granule, AllocFlags::default(), 0)
            .unwrap();
        let size = ObjectHeader::object_size(16, 0);
        let a = unsafe { (*page).alloc_object(size).unwrap() };
        let b = unsafe { (*page).alloc_object(size).unwrap() };
        unsafe {
            ObjectHeader::initialize(a, size, 0);
            ObjectHeader::initialize(b, size, 0);
        }
        (pa, a, b)
    }

    fn mark_only(pa: &PageAllocator, addr: usize, cycle: u32) {
        for p in pa.pages() {
            unsafe { (*p).live_map().reset_for(cycle) };
        }
        let page = unsafe { &*pa.table().get(addr) };
        page.live_map().mark(page.granule_index(addr), false);
    }

    #[test]
    fn unloads_only_dead_anchors() {
        let (pa, live, dead) = fixture();

        let unloader = Unloader::new();
        let torn_down = Arc::new(AtomicUsize::new(0));
        for anchor in [live, dead] {
            let counter = torn_down.clone();
            unloader.register(anchor, move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        mark_only(&pa, live, 1);
        unloader.unload(pa.table(), 1);
        assert_eq!(torn_down.load(Ordering::Relaxed), 1);
        assert_eq!(unloader.len(), 1);

        // The survivor dies next cycle.
        for p in pa.pages() {
            unsafe { (*p).live_map().reset_for(2) };
        }
        unloader.unload(pa.table(), 2);
        assert_eq!(torn_down.load(Ordering::Relaxed), 2);
        assert!(unloader.is_empty());
    }

    #[test]
    fn healed_anchor_is_tracked_at_its_new_address() {
        let (pa, old, moved) = fixture();

        let unloader = Unloader::new();
        let torn_down = Arc::new(AtomicUsize::new(0));
        let counter = torn_down.clone();
        unloader.register(old, move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        unloader.heal(|addr| if addr == old { moved } else { addr });

        // Only the new address is live; the record must survive on it.
        mark_only(&pa, moved, 1);
        unloader.unload(pa.table(), 1);
        assert_eq!(torn_down.load(Ordering::Relaxed), 0);
        assert_eq!(unloader.len(), 1);

        // Liveness at the old address no longer keeps the record.
        mark_only(&pa, old, 2);
        unloader.unload(pa.table(), 2);
        assert_eq!(torn_down.load(Ordering::Relaxed), 1);
        assert!(unloader.is_empty());
    }
}
