use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use super::page_table::PageTable;
use super::shared_vars::SharedFlag;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReferenceKind {
    Weak,
    Soft,
    /// Cleared like Weak, but never resurrects its referent and is only
    /// enqueued once the referent is fully unreachable.
    Phantom,
    /// Keeps its referent finalizable-reachable for one extra cycle so a
    /// finalizer can run against it.
    Final,
}

struct Entry {
    kind: ReferenceKind,
    referent: AtomicUsize,
    enqueued: SharedFlag,
}

/// Client handle to a registered non-strong reference.
pub struct Reference {
    entry: Arc<Entry>,
}

impl Reference {
    pub fn kind(&self) -> ReferenceKind {
        self.entry.kind
    }

    /// Current referent address, or `None` once cleared. The address is
    /// re-pointed at the relocated copy inside the relocate-start pause, so
    /// it is never left behind by a compacting cycle.
    pub fn get(&self) -> Option<usize> {
        match self.entry.referent.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    pub fn is_enqueued(&self) -> bool {
        self.entry.enqueued.is_set()
    }
}

/// Handle to a weak global root slot: a root the marker does not trace
/// through, cleared when its target dies.
pub struct WeakRoot {
    slot: Arc<AtomicUsize>,
}

impl WeakRoot {
    pub fn get(&self) -> Option<usize> {
        match self.slot.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }
}

/// Discovers and processes non-strong references. Registered references
/// are not traced through during marking; which ones act as roots anyway
/// is decided at mark start (soft referents under a no-clear policy are
/// marked strongly, final referents finalizably). After mark end the
/// processing pass clears dead referents and hands the affected references
/// to the client through a pending queue.
pub struct ReferenceProcessor {
    registry: Mutex<Vec<Arc<Entry>>>,
    weak_roots: Mutex<Vec<Arc<AtomicUsize>>>,
    pending: SegQueue<Reference>,
    soft_clear: SharedFlag,
}

impl ReferenceProcessor {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Vec::new()),
            weak_roots: Mutex::new(Vec::new()),
            pending: SegQueue::new(),
            soft_clear: SharedFlag::new(),
        }
    }

    pub fn register(&self, kind: ReferenceKind, referent: usize) -> Reference {
        debug_assert!(referent != 0);
        let entry = Arc::new(Entry {
            kind,
            referent: AtomicUsize::new(referent),
            enqueued: SharedFlag::new(),
        });
        self.registry.lock().push(entry.clone());
        Reference { entry }
    }

    pub fn register_weak_root(&self, target: usize) -> WeakRoot {
        debug_assert!(target != 0);
        let slot = Arc::new(AtomicUsize::new(target));
        self.weak_roots.lock().push(slot.clone());
        WeakRoot { slot }
    }

    /// `clear = true` makes the next cycle treat soft references like weak
    /// ones; set under memory pressure.
    pub fn set_soft_reference_policy(&self, clear: bool) {
        self.soft_clear.set_cond(clear);
    }

    /// Root contribution at mark start: `(address, finalizable)` pairs the
    /// marker must still reach despite the referents not being traced.
    pub fn collect_roots(&self, mut f: impl FnMut(usize, bool)) {
        let registry = self.registry.lock();
        for entry in registry.iter() {
            if entry.enqueued.is_set() {
                continue;
            }
            let referent = entry.referent.load(Ordering::Acquire);
            if referent == 0 {
                continue;
            }
            match entry.kind {
                ReferenceKind::Soft if self.soft_clear.is_unset() => f(referent, false),
                ReferenceKind::Final => f(referent, true),
                _ => {}
            }
        }
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

    /// Clears dead referents and weak roots. Runs concurrently, strictly
    /// after `mark_end` reported no outstanding work and before the next
    /// cycle's root scan. Tracked addresses are kept current by `heal`, so
    /// liveness is read off the page straight away.
    pub fn process(&self, table: &PageTable, cycle: u32) {
        let registry = self.registry.lock();
        for entry in registry.iter() {
            if entry.enqueued.is_set() {
                continue;
            }
            let referent = entry.referent.load(Ordering::Acquire);
            if referent == 0 {
                continue;
            }
            if Self::is_strongly_live(table, cycle, referent) {
                continue;
            }

            entry.enqueued.set();
            match entry.kind {
                // The finalizable mark kept the object itself alive; the
                // client finalizer still needs the address.
                ReferenceKind::Final => {}
                _ => entry.referent.store(0, Ordering::Release),
            }
            self.pending.push(Reference {
                entry: entry.clone(),
            });
        }
        drop(registry);

        let weak_roots = self.weak_roots.lock();
        for slot in weak_roots.iter() {
            let target = slot.load(Ordering::Acquire);
            if target != 0 && !Self::is_strongly_live(table, cycle, target) {
                slot.store(0, Ordering::Release);
            }
        }
    }

    /// Re-points every tracked referent and weak root at its relocated
    /// copy. Runs inside the relocate-start pause, after processing proved
    /// every remaining address live, so client handles stay valid while
    /// relocation drains concurrently.
    pub fn heal(&self, mut relocate: impl FnMut(usize) -> usize) {
        let registry = self.registry.lock();
        for entry in registry.iter() {
            let referent = entry.referent.load(Ordering::Acquire);
            if referent != 0 {
                entry.referent.store(relocate(referent), Ordering::Release);
            }
        }
        drop(registry);

        let weak_roots = self.weak_roots.lock();
        for slot in weak_roots.iter() {
            let target = slot.load(Ordering::Acquire);
            if target != 0 {
                slot.store(relocate(target), Ordering::Release);
            }
        }
    }

    /// Prunes dropped handles from the registry. Enqueued entries stay
    /// while their handle lives so `heal` keeps the delivered address
    /// valid; they no longer contribute roots or get processed.
    pub fn finish(&self) {
        self.registry.lock().retain(|e| Arc::strong_count(e) > 1);
        self.weak_roots
            .lock()
            .retain(|s| Arc::strong_count(s) > 1 && s.load(Ordering::Acquire) != 0);
    }

    /// Next reference cleared or finalized by the last processing pass.
    pub fn poll(&self) -> Option<Reference> {
        self.pending.pop()
    }
}

impl Default for ReferenceProcessor {
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

    struct Fixture {
        pa: PageAllocator,
    }

    impl Fixture {
        fn new() -> Self {
            let opts = setup_sizes(&HeapArguments {
                max_capacity: 256 * 1024,
                small_page_size: 64 * 1024,
                enable_controller: false,
                ..Default::default()
            });
            Self {
                pa: PageAllocator::new(opts),
            }
        }

        fn object(&self) -> usize {
            let page = self
                .pa
                .alloc_page(
                    PageKind::Small,
                    self.pa.options().page_granule,
                    AllocFlags::default(),
                    0,
                )
                .unwrap();
            let size = ObjectHeader::object_size(16, 0);
            let addr = unsafe { (*page).alloc_object(size).unwrap() };
            unsafe { ObjectHeader::initialize(addr, size, 0) };
            addr
        }

        fn mark(&self, addr: usize, cycle: u32, finalizable: bool) {
            let page = unsafe { &*self.pa.table().get(addr) };
            let lm = page.live_map();
            lm.reset_for(cycle);
            lm.mark(page.granule_index(addr), finalizable);
        }

        fn commit_livemaps(&self, cycle: u32) {
            for page in self.pa.pages() {
                unsafe { (*page).live_map().reset_for(cycle) };
            }
        }
    }

    #[test]
    fn weak_reference_clears_when_dead() {
        let f = Fixture::new();
        let live = f.object();
        let dead = f.object();

        let proc_ = ReferenceProcessor::new();
        let kept = proc_.register(ReferenceKind::Weak, live);
        let cleared = proc_.register(ReferenceKind::Weak, dead);

        f.commit_livemaps(1);
        f.mark(live, 1, false);
        proc_.process(f.pa.table(), 1);

        assert_eq!(kept.get(), Some(live));
        assert_eq!(cleared.get(), None);
        assert!(cleared.is_enqueued());
        assert!(proc_.poll().is_some());
        assert!(proc_.poll().is_none());
    }

    #[test]
    fn soft_policy_controls_root_contribution() {
        let f = Fixture::new();
        let referent = f.object();
        let proc_ = ReferenceProcessor::new();
        let _soft = proc_.register(ReferenceKind::Soft, referent);

        let mut roots = vec![];
        proc_.collect_roots(|addr, finalizable| roots.push((addr, finalizable)));
        assert_eq!(roots, vec![(referent, false)]);

        proc_.set_soft_reference_policy(true);
        roots.clear();
        proc_.collect_roots(|addr, finalizable| roots.push((addr, finalizable)));
        assert!(roots.is_empty());
    }

    #[test]
    fn final_reference_keeps_referent_address() {
        let f = Fixture::new();
        let referent = f.object();
        let proc_ = ReferenceProcessor::new();
        let final_ref = proc_.register(ReferenceKind::Final, referent);

        let mut roots = vec![];
        proc_.collect_roots(|addr, finalizable| roots.push((addr, finalizable)));
        assert_eq!(roots, vec![(referent, true)]);

        // Finalizably marked only: dead for clearing purposes, but the
        // finalizer still gets the address.
        f.commit_livemaps(1);
        f.mark(referent, 1, true);
        proc_.process(f.pa.table(), 1);

        assert!(final_ref.is_enqueued());
        assert_eq!(final_ref.get(), Some(referent));

        // Once enqueued it no longer contributes a root.
        roots.clear();
        proc_.collect_roots(|addr, finalizable| roots.push((addr, finalizable)));
        assert!(roots.is_empty());

        proc_.finish();
    }

    #[test]
    fn heal_repoints_referents_and_weak_roots() {
        let f = Fixture::new();
        let before = f.object();
        let after = f.object();

        let proc_ = ReferenceProcessor::new();
        let reference = proc_.register(ReferenceKind::Weak, before);
        let root = proc_.register_weak_root(before);

        proc_.heal(|addr| if addr == before { after } else { addr });
        assert_eq!(reference.get(), Some(after));
        assert_eq!(root.get(), Some(after));
    }

    #[test]
    fn weak_root_clears_in_same_pass() {
        let f = Fixture::new();
        let live = f.object();
        let dead = f.object();

        let proc_ = ReferenceProcessor::new();
        let kept = proc_.register_weak_root(live);
        let cleared = proc_.register_weak_root(dead);

        f.commit_livemaps(1);
        f.mark(live, 1, false);
        proc_.process(f.pa.table(), 1);

        assert_eq!(kept.get(), Some(live));
        assert_eq!(cleared.get(), None);
    }
}
