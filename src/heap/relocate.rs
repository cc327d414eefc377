use std::sync::atomic::{AtomicUsize, Ordering};

use crate::object;

use super::forwarding::{ForwardingIndex, ForwardingTable, RelocationState};
use super::object_allocator::ObjectAllocator;
use super::page_allocator::PageAllocator;
use super::relocation_set::RelocationSet;
use super::worker::Workers;

/// Everything a relocating caller needs, whether a GC worker draining a
/// page or a mutator healing through the read barrier.
#[derive(Clone, Copy)]
pub struct RelocateContext<'a> {
    pub pa: &'a PageAllocator,
    pub oa: &'a ObjectAllocator,
    pub forwardings: &'a ForwardingIndex,
    pub cycle: u32,
}

/// Relocates the object at `from`, or returns the already-installed
/// target. Idempotent and safe to race: the copy is made first, then the
/// forwarding entry is claimed; a loser releases its copy and adopts the
/// winner. When no target can be allocated even after stalling, the
/// object survives in place and is forwarded to itself.
pub fn relocate_object(ctx: &RelocateContext, table: &ForwardingTable, from: usize) -> usize {
    if let Some(to) = table.get(from) {
        return to;
    }

    let size = unsafe { object::header(from).size() };
    match ctx.oa.alloc_for_relocation(ctx.pa, size, ctx.cycle) {
        Ok(to) => {
            unsafe {
                std::ptr::copy_nonoverlapping(from as *const u8, to as *mut u8, size);
            }
            let winner = table.insert(from, to);
            if winner != to {
                ctx.oa.undo_alloc_for_relocation(ctx.pa, to, size);
            }
            winner
        }
        Err(_) => {
            log::warn!(
                target: "gc",
                "Relocation target allocation failed; {:#x} survives in place",
                from
            );
            let winner = table.insert(from, from);
            if winner == from {
                table.mark_in_place();
            }
            winner
        }
    }
}

/// Barrier-side resolution: if `addr` sits on a page selected for
/// relocation, force its relocation now; otherwise it is already stable.
pub fn relocate_or_remap(ctx: &RelocateContext, addr: usize) -> usize {
    let table = ctx.forwardings.get(addr);
    if table.is_null() {
        addr
    } else {
        relocate_object(ctx, unsafe { &*table }, addr)
    }
}

/// Drains one selected page: relocates every live object, then frees the
/// page unless something survived in place.
fn drain_page(ctx: &RelocateContext, table: &ForwardingTable) {
    table.set_state(RelocationState::InRelocation);
    let page_ptr = table.page();
    let page = unsafe { &*page_ptr };

    // Marked granules are exactly the live object starts.
    page.live_map().iter_live(|granule| {
        relocate_object(ctx, table, page.start() + granule * crate::heap::GRANULE);
    });
    table.set_state(RelocationState::Drained);

    if table.is_in_place() {
        // Residual garbage stays until a later cycle re-selects the page.
        log::debug!(target: "gc", "Page {:#x} kept: in-place survivors", page.start());
        return;
    }
    ctx.pa.free_page(page_ptr, true);
    table.set_state(RelocationState::Freed);
}

/// Drains the whole relocation set on the worker pool; pages are claimed
/// through a shared cursor so the workers load-balance themselves.
pub fn relocate_all(ctx: &RelocateContext, set: &RelocationSet, workers: &Workers) {
    if set.is_empty() {
        return;
    }

    let cursor = AtomicUsize::new(0);
    workers.scoped(|scope| {
        for _ in 0..workers.active() {
            let cursor = &cursor;
            scope.execute(move || loop {
                let index = cursor.fetch_add(1, Ordering::Relaxed);
                let Some(table) = set.tables().get(index) else {
                    break;
                };
                drain_page(ctx, table);
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::page::{setup_sizes, HeapArguments, Page, PageKind};
    use crate::heap::page_allocator::AllocFlags;
    use crate::heap::relocation_set;
    use crate::object::ObjectHeader;

    struct Fixture {
        pa: PageAllocator,
        oa: ObjectAllocator,
        forwardings: ForwardingIndex,
    }

    impl Fixture {
        fn new(max_pages: usize) -> Self {
            let opts = setup_sizes(&HeapArguments {
                max_capacity: max_pages * 64 * 1024,
                soft_max_capacity: 64 * 1024,
                small_page_size: 64 * 1024,
                alloc_stall_retries: 1,
                alloc_stall_timeout_ms: 1,
                enable_controller: false,
                ..Default::default()
            });
            let pa = PageAllocator::new(opts);
            let forwardings = ForwardingIndex::new(pa.base(), pa.span(), opts.page_granule_shift);
            Self {
                pa,
                oa: ObjectAllocator::new(),
                forwardings,
            }
        }

        fn ctx(&self, cycle: u32) -> RelocateContext<'_> {
            RelocateContext {
                pa: &self.pa,
                oa: &self.oa,
                forwardings: &self.forwardings,
                cycle,
            }
        }

        fn sparse_page(&self, live_objects: usize, cycle: u32) -> (*mut Page, Vec<usize>) {
            let page = self
                .pa
                .alloc_page(
                    PageKind::Small,
                    self.pa.options().page_granule,
                    AllocFlags::default(),
                    0,
                )
                .unwrap();
            let size = ObjectHeader::object_size(48, 0);
            let mut live = Vec::new();
            unsafe {
                (*page).live_map().reset_for(cycle);
                for i in 0..live_objects * 2 {
                    let addr = (*page).alloc_object(size).unwrap();
                    ObjectHeader::initialize(addr, size, 0);
                    // Every other object survives.
                    if i % 2 == 0 {
                        let lm = (*page).live_map();
                        lm.mark((*page).granule_index(addr), false);
                        lm.inc_live(size);
                        live.push(addr);
                    }
                }
            }
            (page, live)
        }
    }

    #[test]
    fn drain_forwards_every_live_object_and_frees_page() {
        let f = Fixture::new(8);
        let (page, live) = f.sparse_page(8, 1);
        let set = relocation_set::select(&f.pa, &f.forwardings, 1);
        assert_eq!(set.len(), 1);

        let workers = Workers::new(2);
        let reclaimed_before = f.pa.reclaimed();
        relocate_all(&f.ctx(1), &set, &workers);

        let table = &set.tables()[0];
        assert_eq!(table.state(), RelocationState::Freed);
        assert!(!f.pa.pages().contains(&page));
        assert!(f.pa.reclaimed() > reclaimed_before);

        // Forwarding totality: every live object has exactly one entry,
        // pointing into a currently allocated page.
        for from in live {
            let to = table.get(from).expect("live object left unforwarded");
            assert_ne!(to, from);
            assert!(!f.pa.table().get(to).is_null());
            assert_eq!(unsafe { object::header(to).size() }, ObjectHeader::object_size(48, 0));
        }
    }

    #[test]
    fn racing_relocators_agree_on_one_winner() {
        let f = Fixture::new(8);
        let (_, live) = f.sparse_page(1, 1);
        let from = live[0];
        let set = relocation_set::select(&f.pa, &f.forwardings, 1);
        let table = &set.tables()[0];
        let size = ObjectHeader::object_size(48, 0);

        let ctx = f.ctx(1);
        let results: Vec<usize> = std::thread::scope(|s| {
            (0..4)
                .map(|_| s.spawn(|| relocate_object(&ctx, table, from)))
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect()
        });

        let winner = table.get(from).unwrap();
        assert!(results.iter().all(|&r| r == winner));
        // Losers gave their copies back: net allocation is one object.
        assert_eq!(f.oa.allocated(), size);
    }

    #[test]
    fn exhausted_heap_forwards_in_place() {
        let f = Fixture::new(1);
        let (page, live) = f.sparse_page(1, 1);
        // The heap's only page is the source; no room for a target.
        let set = relocation_set::select(&f.pa, &f.forwardings, 1);
        assert_eq!(set.len(), 1);

        let workers = Workers::new(1);
        relocate_all(&f.ctx(1), &set, &workers);

        let table = &set.tables()[0];
        assert_eq!(table.state(), RelocationState::Drained);
        assert!(table.is_in_place());
        assert_eq!(table.get(live[0]), Some(live[0]));
        // The page survives with its in-place objects.
        assert!(f.pa.pages().contains(&page));
    }

    #[test]
    fn relocate_or_remap_ignores_unselected_pages() {
        let f = Fixture::new(8);
        let (_, live) = f.sparse_page(1, 1);
        let ctx = f.ctx(1);
        // Nothing selected yet: address maps to itself.
        assert_eq!(relocate_or_remap(&ctx, live[0]), live[0]);
    }
}
