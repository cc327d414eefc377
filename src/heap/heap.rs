use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use atomic::Atomic;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use crate::object::{self, ObjectHeader};

use super::address::{self, ColorEpoch};
use super::controller::Controller;
use super::forwarding::{remap, ForwardingIndex, RelocationState};
use super::mark::{MarkContext, Marker, MarkingTask, Terminator};
use super::object_allocator::{AllocContext, ObjectAllocator};
use super::page::{setup_sizes, HeapArguments, HeapOptions, Page};
use super::page_allocator::PageAllocator;
use super::reference_processor::{Reference, ReferenceKind, ReferenceProcessor, WeakRoot};
use super::relocate::{relocate_all, relocate_or_remap, RelocateContext};
use super::relocation_set::{self, RelocationSet};
use super::unload::Unloader;
use super::worker::Workers;
use super::{AllocError, ConcurrentPhase, GcPhase, PausePhase};

/// Handle to a registered strong global root slot. The slot participates
/// in every root scan; reads go through the load barrier like any heap
/// slot. Dropping the handle retires the root at the next mark start.
pub struct Root {
    slot: Arc<AtomicUsize>,
}

impl Root {
    pub fn get(&self, heap: &Heap) -> usize {
        heap.load_ref(&self.slot)
    }

    pub fn set(&self, heap: &Heap, value: usize) {
        heap.store_ref(&self.slot, value);
    }
}

/// Visitor for `object_iterate`.
pub trait ObjectClosure {
    fn do_object(&mut self, addr: usize);
    fn do_referent(&mut self, _holder: usize, _referent: usize) {}
}

/// The heap facade: owns every subsystem and sequences the cycle state
/// machine. There is no global instance; embedders hold an `Arc<Heap>`
/// and hand out `AllocContext`s to their mutator threads.
///
/// Synchronous pauses are modeled with a phase `RwLock`: the two bounded
/// pause points (`mark_start`, `relocate_start`) take the write side,
/// while mutator slow paths (allocation, iteration) hold the read side.
/// The barrier fast paths are deliberately lock-free; a reference healed
/// with a color that goes stale a moment later is indistinguishable from
/// one loaded just before the flip, and re-heals on its next load.
pub struct Heap {
    options: HeapOptions,
    page_allocator: PageAllocator,
    object_allocator: ObjectAllocator,
    forwardings: ForwardingIndex,
    epoch: ColorEpoch,
    marker: Marker,
    reference_processor: ReferenceProcessor,
    unloader: Unloader,
    workers: Workers,
    phase_lock: RwLock<()>,
    phase: Atomic<GcPhase>,
    cycle: AtomicU32,
    cycle_lock: Mutex<()>,
    roots: Mutex<Vec<Arc<AtomicUsize>>>,
    relocation_set: Mutex<RelocationSet>,
    /// The previous cycle's set, kept one more cycle so a barrier that
    /// read a table pointer just before selection can finish with it.
    retired_set: Mutex<RelocationSet>,
    controller: OnceCell<Controller>,
}

impl Heap {
    pub fn new(args: HeapArguments) -> Arc<Heap> {
        let options = setup_sizes(&args);
        let page_allocator = PageAllocator::new(options);
        let forwardings = ForwardingIndex::new(
            page_allocator.base(),
            page_allocator.span(),
            options.page_granule_shift,
        );
        let workers = Workers::new(options.parallel_gc_threads);
        let marker = Marker::new(workers.total());

        let heap = Arc::new(Heap {
            options,
            page_allocator,
            object_allocator: ObjectAllocator::new(),
            forwardings,
            epoch: ColorEpoch::new(),
            marker,
            reference_processor: ReferenceProcessor::new(),
            unloader: Unloader::new(),
            workers,
            phase_lock: RwLock::new(()),
            phase: Atomic::new(GcPhase::Idle),
            cycle: AtomicU32::new(0),
            cycle_lock: Mutex::new(()),
            roots: Mutex::new(Vec::new()),
            relocation_set: Mutex::new(RelocationSet::empty()),
            retired_set: Mutex::new(RelocationSet::empty()),
            controller: OnceCell::new(),
        });

        if options.enable_controller {
            let _ = heap.controller.set(Controller::spawn(&heap));
        }
        heap
    }

    pub fn options(&self) -> &HeapOptions {
        &self.options
    }

    pub fn page_allocator(&self) -> &PageAllocator {
        &self.page_allocator
    }

    pub fn workers(&self) -> &Workers {
        &self.workers
    }

    pub fn phase(&self) -> GcPhase {
        self.phase.load(atomic::Ordering::Acquire)
    }

    pub fn cycle(&self) -> u32 {
        self.cycle.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Allocation

    pub fn new_context(&self) -> AllocContext {
        self.object_allocator.new_context(&self.page_allocator)
    }

    /// Allocates and initializes an object with `refs` reference slots and
    /// `body` payload bytes. Returns the untagged object address.
    pub fn alloc_object(
        &self,
        ctx: &AllocContext,
        body: usize,
        refs: usize,
    ) -> Result<usize, AllocError> {
        let size = ObjectHeader::object_size(body, refs);

        // Held across initialization so a pause never observes an
        // allocated-but-headerless range.
        let _phase = self.phase_lock.read();
        let addr =
            self.object_allocator
                .alloc_object(&self.page_allocator, ctx, size, self.cycle())?;
        unsafe { ObjectHeader::initialize(addr, size, refs) };

        if let Some(controller) = self.controller.get() {
            controller.notify_heap_changed();
        }
        Ok(addr)
    }

    /// Carves a raw thread-local buffer of at least `size` bytes for
    /// clients that manage their own bump pointers. The caller must keep
    /// the range linearly parseable (filler headers over unused tails).
    pub fn alloc_tlab(&self, size: usize) -> Result<(usize, usize), AllocError> {
        let _phase = self.phase_lock.read();
        self.object_allocator
            .alloc_tlab(&self.page_allocator, size, size, self.cycle())
    }

    // ------------------------------------------------------------------
    // Barriers

    /// The mandatory read barrier: loads a reference from `slot`,
    /// resolving and self-healing it if its color is stale. Returns the
    /// stable untagged address (0 for null).
    pub fn load_ref(&self, slot: &AtomicUsize) -> usize {
        let value = slot.load(Ordering::Acquire);
        let addr = address::untag(value);
        if addr == 0 || self.epoch.is_good(value) {
            return addr;
        }
        self.barrier_slow(slot, value)
    }

    #[cold]
    fn barrier_slow(&self, slot: &AtomicUsize, value: usize) -> usize {
        let addr = address::untag(value);

        let stable = if self.epoch.is_mark_epoch() {
            // Stale during marking: a mark-colored reference may still
            // point at last cycle's copy and is translated; a reference
            // wearing REMAPPED was already translated and must not be fed
            // back through the leftover tables, whose ranges may since
            // have been recycled. Either way the target gets marked.
            let target = if address::needs_remap(value) {
                remap(&self.forwardings, addr)
            } else {
                addr
            };
            let ctx = self.mark_context();
            if Marker::try_mark(&ctx, target, false) {
                self.marker.inject(target, false);
            }
            target
        } else {
            // Stale outside marking: relocation may be in progress; force
            // it for this object rather than wait for the drain.
            relocate_or_remap(&self.relocate_context(), addr)
        };

        let healed = self.epoch.tag_good(stable);
        if value != healed {
            let _ = slot.compare_exchange(value, healed, Ordering::AcqRel, Ordering::Relaxed);
        }
        stable
    }

    /// The write barrier: publishes `value` (untagged, 0 for null) into
    /// `slot` wearing the good color. During marking the stored value is
    /// also kept alive, so a reference hidden from the trace by mutation
    /// is still found; this is what restarts the termination consensus
    /// when a mutator races the final drain.
    ///
    /// `value` must be currently valid: obtained from an allocation, a
    /// barriered load or a handle since the last `relocate_start`. An
    /// address carried naked across a relocation dangles (the backing
    /// memory is returned to the OS); `Root`, `Reference` and `WeakRoot`
    /// handles exist for retention across cycles.
    pub fn store_ref(&self, slot: &AtomicUsize, value: usize) {
        if value != 0 && self.epoch.is_mark_epoch() {
            self.keep_alive(value);
        }
        let tagged = if value == 0 {
            0
        } else {
            self.epoch.tag_good(value)
        };
        slot.store(tagged, Ordering::Release);
    }

    /// Prevents the object at `addr` from being collected by the cycle in
    /// progress, for paths that hold a naked address across publication.
    /// `addr` must be currently valid, as for `store_ref`.
    pub fn keep_alive(&self, addr: usize) {
        if !self.epoch.is_mark_epoch() {
            return;
        }
        let ctx = self.mark_context();
        if Marker::try_mark(&ctx, addr, false) {
            self.marker.inject(addr, false);
        }
    }

    /// Translate-only counterpart of the read barrier, for passive
    /// callers that must not trigger relocation.
    pub fn remap_object(&self, addr: usize) -> usize {
        remap(&self.forwardings, addr)
    }

    // ------------------------------------------------------------------
    // Roots and non-strong references

    pub fn register_root(&self, addr: usize) -> Root {
        let slot = Arc::new(AtomicUsize::new(if addr == 0 {
            0
        } else {
            self.epoch.tag_good(addr)
        }));
        self.roots.lock().push(slot.clone());
        Root { slot }
    }

    pub fn register_reference(&self, kind: ReferenceKind, referent: usize) -> Reference {
        self.reference_processor.register(kind, referent)
    }

    pub fn register_weak_root(&self, target: usize) -> WeakRoot {
        self.reference_processor.register_weak_root(target)
    }

    pub fn register_unload(&self, anchor: usize, teardown: impl FnOnce() + Send + 'static) {
        self.unloader.register(anchor, teardown);
    }

    /// Next reference cleared or made finalizable by the last cycle.
    pub fn poll_cleared_reference(&self) -> Option<Reference> {
        self.reference_processor.poll()
    }

    pub fn set_soft_reference_policy(&self, clear: bool) {
        self.reference_processor.set_soft_reference_policy(clear);
    }

    pub fn set_boost_worker_threads(&self, boost: bool) {
        self.workers.set_boost(boost);
    }

    // ------------------------------------------------------------------
    // Cycle state machine. The stepwise operations are driven by one
    // thread at a time (the controller, or a test); `collect` runs them
    // all. A cycle is never abandoned once `relocate_start` has run.

    fn mark_context(&self) -> MarkContext<'_> {
        MarkContext {
            table: self.page_allocator.table(),
            forwardings: &self.forwardings,
            epoch: &self.epoch,
            cycle: self.cycle(),
        }
    }

    fn relocate_context(&self) -> RelocateContext<'_> {
        RelocateContext {
            pa: &self.page_allocator,
            oa: &self.object_allocator,
            forwardings: &self.forwardings,
            cycle: self.cycle(),
        }
    }

    /// Pause: flips the mark color, retires allocation buffers and seeds
    /// the marker with the roots.
    pub fn mark_start(&self) {
        let _pause = self.phase_lock.write();
        let cycle = self.cycle.fetch_add(1, Ordering::AcqRel) + 1;
        let _timing = PausePhase::new(cycle as usize, "Mark Start");

        self.phase.store(GcPhase::MarkStart, atomic::Ordering::Release);
        self.epoch.flip_to_marked(cycle);
        self.object_allocator.retire_all();
        self.object_allocator.reset_allocated();

        let ctx = self.mark_context();
        let mut roots = self.roots.lock();
        roots.retain(|slot| Arc::strong_count(slot) > 1);
        for slot in roots.iter() {
            let value = slot.load(Ordering::Acquire);
            let addr = address::untag(value);
            if addr == 0 {
                continue;
            }
            let target = if address::needs_remap(value) {
                remap(&self.forwardings, addr)
            } else {
                addr
            };
            slot.store(self.epoch.tag_good(target), Ordering::Release);
            if Marker::try_mark(&ctx, target, false) {
                self.marker.inject(target, false);
            }
        }
        drop(roots);

        // Referent addresses were re-pointed inside the last relocate
        // pause, so they are current as they stand.
        self.reference_processor.collect_roots(|addr, finalizable| {
            if Marker::try_mark(&ctx, addr, finalizable) {
                self.marker.inject(addr, finalizable);
            }
        });

        self.phase.store(GcPhase::Marking, atomic::Ordering::Release);
    }

    /// Concurrent: drains the mark queues on the worker pool.
    pub fn mark(&self) {
        let cycle = self.cycle();
        let _timing = ConcurrentPhase::new(cycle as usize, "Mark");

        let nworkers = self.workers.active();
        let terminator = Terminator::new(nworkers);
        let ctx = self.mark_context();
        let queues = self.marker.queues();

        self.workers.scoped(|scope| {
            for task_id in 0..nworkers {
                let terminator = &terminator;
                let ctx = ctx;
                scope.execute(move || {
                    MarkingTask::new(task_id, terminator, queues, ctx).run();
                });
            }
        });
    }

    /// Pause: returns true when barrier activity left mark work behind,
    /// in which case the caller must run another `mark` pass.
    pub fn mark_end(&self) -> bool {
        let _pause = self.phase_lock.write();
        let _timing = PausePhase::new(self.cycle() as usize, "Mark End");

        if self.marker.has_pending_work() {
            return true;
        }
        self.phase.store(GcPhase::MarkEnd, atomic::Ordering::Release);
        false
    }

    /// Valid after `mark_end` returned false for the current cycle.
    pub fn is_object_live(&self, addr: usize) -> bool {
        self.object_liveness(addr, false)
    }

    pub fn is_object_strongly_live(&self, addr: usize) -> bool {
        self.object_liveness(addr, true)
    }

    fn object_liveness(&self, addr: usize, strong: bool) -> bool {
        let page = self.page_allocator.table().get(addr);
        if page.is_null() {
            return false;
        }
        let page = unsafe { &*page };
        if page.seqnum() == self.cycle() {
            return true;
        }
        let live_map = page.live_map();
        if !live_map.is_current(self.cycle()) {
            return false;
        }
        let granule = page.granule_index(addr);
        if strong {
            live_map.is_strongly_live(granule)
        } else {
            live_map.is_live(granule)
        }
    }

    /// Concurrent: clears dead weak/soft/phantom referents, enqueues
    /// final references, runs metadata unloading.
    pub fn process_non_strong_references(&self) {
        let cycle = self.cycle();
        let _timing = ConcurrentPhase::new(cycle as usize, "Process Non-Strong References");
        self.reference_processor
            .process(self.page_allocator.table(), cycle);
        self.unloader.unload(self.page_allocator.table(), cycle);
    }

    pub fn finish_non_strong_references(&self) {
        self.reference_processor.finish();
    }

    /// Concurrent: frees empty pages and builds this cycle's relocation
    /// set from the committed mark statistics.
    pub fn select_relocation_set(&self) {
        let cycle = self.cycle();
        let _timing = ConcurrentPhase::new(cycle as usize, "Select Relocation Set");
        self.phase.store(GcPhase::Selecting, atomic::Ordering::Release);

        let set = relocation_set::select(&self.page_allocator, &self.forwardings, cycle);
        let old = std::mem::replace(&mut *self.relocation_set.lock(), set);
        *self.retired_set.lock() = old;
    }

    /// Pause: flips to the remapped color and eagerly fixes the roots so
    /// mutators resume against stable root addresses.
    pub fn relocate_start(&self) {
        let _pause = self.phase_lock.write();
        let _timing = PausePhase::new(self.cycle() as usize, "Relocate Start");
        self.phase
            .store(GcPhase::RelocateStart, atomic::Ordering::Release);
        self.epoch.flip_to_remapped();

        let ctx = self.relocate_context();
        let roots = self.roots.lock();
        for slot in roots.iter() {
            let value = slot.load(Ordering::Acquire);
            let addr = address::untag(value);
            if addr == 0 {
                continue;
            }
            let target = relocate_or_remap(&ctx, addr);
            slot.store(self.epoch.tag_good(target), Ordering::Release);
        }
        drop(roots);

        // Non-strong referents, weak roots and unload anchors hold naked
        // addresses; re-point the live ones here so client handles stay
        // valid while the drain runs concurrently. A dead referent still
        // held by an enqueued reference keeps its old address.
        self.reference_processor
            .heal(|addr| self.relocate_live(&ctx, addr));
        self.unloader.heal(|addr| self.relocate_live(&ctx, addr));

        self.phase
            .store(GcPhase::Relocating, atomic::Ordering::Release);
    }

    fn relocate_live(&self, ctx: &RelocateContext<'_>, addr: usize) -> usize {
        if self.is_object_live(addr) {
            relocate_or_remap(ctx, addr)
        } else {
            addr
        }
    }

    /// Concurrent: drains the relocation set on the worker pool.
    pub fn relocate(&self) {
        let cycle = self.cycle();
        let _timing = ConcurrentPhase::new(cycle as usize, "Relocate");

        let ctx = self.relocate_context();
        let set = self.relocation_set.lock();
        relocate_all(&ctx, &set, &self.workers);
        drop(set);

        self.phase.store(GcPhase::Idle, atomic::Ordering::Release);
    }

    /// Runs one full collection cycle.
    pub fn collect(&self) {
        let _serialized = self.cycle_lock.lock();
        let start = std::time::Instant::now();

        self.mark_start();
        loop {
            self.mark();
            if !self.mark_end() {
                break;
            }
        }
        self.process_non_strong_references();
        self.finish_non_strong_references();
        self.select_relocation_set();
        self.relocate_start();
        self.relocate();

        log::info!(
            target: "gc",
            "GC({}) Garbage Collection {:.3}ms ({} used)",
            self.cycle(),
            start.elapsed().as_micros() as f64 / 1000.0,
            crate::base::formatted_size(self.used())
        );
    }

    /// Requests a cycle; blocks until it completes.
    pub fn request_gc(&self) {
        match self.controller.get() {
            Some(controller) => controller.request_gc(),
            None => self.collect(),
        }
    }

    // ------------------------------------------------------------------
    // Metrics

    pub fn used(&self) -> usize {
        self.page_allocator.used()
    }

    pub fn capacity(&self) -> usize {
        self.page_allocator.max_capacity()
    }

    pub fn max_capacity(&self) -> usize {
        self.page_allocator.max_capacity()
    }

    pub fn soft_max_capacity(&self) -> usize {
        self.page_allocator.soft_max_capacity()
    }

    /// Object bytes allocated since the current cycle's mark start.
    pub fn allocated(&self) -> usize {
        self.object_allocator.allocated()
    }

    /// Total bytes recovered by collection since the heap was built.
    pub fn reclaimed(&self) -> usize {
        self.page_allocator.reclaimed()
    }

    // ------------------------------------------------------------------
    // Iteration and diagnostics

    /// Visits every object in the heap. Must not run concurrently with a
    /// relocation of the visited pages; callers synchronize externally
    /// (the read lock here only excludes the pauses).
    pub fn object_iterate(&self, cl: &mut dyn ObjectClosure, visit_referents: bool) {
        let _phase = self.phase_lock.read();
        for page in self.page_allocator.pages() {
            let page = unsafe { &*page };
            unsafe {
                page.for_each_object(|addr| {
                    cl.do_object(addr);
                    if visit_referents {
                        let header = object::header(addr);
                        for i in 0..header.ref_count() {
                            let referent = self.load_ref(header.ref_slot(i));
                            if referent != 0 {
                                cl.do_referent(addr, referent);
                            }
                        }
                    }
                });
            }
        }
    }

    pub fn pages_do(&self, mut f: impl FnMut(&Page)) {
        for page in self.page_allocator.pages() {
            f(unsafe { &*page });
        }
    }

    /// Validates page table, forwarding and object consistency, and
    /// panics on corruption. Suspends mutator slow paths for the
    /// duration; diagnostic use only.
    pub fn verify(&self) {
        let _pause = self.phase_lock.write();
        let table = self.page_allocator.table();
        let mut objects = 0usize;

        for page_ptr in self.page_allocator.pages() {
            let page = unsafe { &*page_ptr };
            assert_eq!(
                table.get(page.start()),
                page_ptr,
                "page table does not cover page start"
            );
            assert_eq!(
                table.get(page.end() - 1),
                page_ptr,
                "page table does not cover page end"
            );

            unsafe {
                page.for_each_object(|addr| {
                    objects += 1;
                    let header = object::header(addr);
                    assert!(
                        addr + header.size() <= page.end(),
                        "object {:#x} overruns its page",
                        addr
                    );
                    for i in 0..header.ref_count() {
                        let value = header.ref_slot(i).load(Ordering::Acquire);
                        let referent = address::untag(value);
                        if referent == 0 {
                            continue;
                        }
                        let target = if address::needs_remap(value) {
                            remap(&self.forwardings, referent)
                        } else {
                            referent
                        };
                        assert!(
                            !table.get(target).is_null(),
                            "reference {:#x} in {:#x} resolves outside any allocated page",
                            referent,
                            addr
                        );
                    }
                });
            }
        }

        let set = self.relocation_set.lock();
        for fwd in set.tables().iter() {
            fwd.entries_do(|from, to| {
                assert!(
                    to == from || !table.get(to).is_null(),
                    "forwarding entry {:#x} -> {:#x} targets a freed page",
                    from,
                    to
                );
            });

            // In-place survivors: the page is still allocated, and every
            // live object on it must have been forwarded.
            if fwd.state() == RelocationState::Drained && fwd.is_in_place() {
                let page = unsafe { &*fwd.page() };
                let live_map = page.live_map();
                unsafe {
                    page.for_each_object(|addr| {
                        if live_map.is_live(page.granule_index(addr)) {
                            assert!(
                                fwd.get(addr).is_some(),
                                "live object {:#x} unforwarded on drained page",
                                addr
                            );
                        }
                    });
                }
            }
        }
        drop(set);

        log::debug!(target: "gc", "Verified {} objects", objects);
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.get() {
            controller.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::GRANULE;

    fn test_heap(pages: usize) -> Arc<Heap> {
        let _ = env_logger::builder().is_test(true).try_init();
        Heap::new(HeapArguments {
            max_capacity: pages * 64 * 1024,
            soft_max_capacity: 64 * 1024,
            small_page_size: 64 * 1024,
            alloc_stall_retries: 1,
            alloc_stall_timeout_ms: 1,
            parallel_gc_threads: 2,
            enable_controller: false,
            ..Default::default()
        })
    }

    unsafe fn write_payload(addr: usize, value: u64) {
        let header = object::header(addr);
        (header.payload() as *mut u64).write(value);
    }

    unsafe fn read_payload(addr: usize) -> u64 {
        (object::header(addr).payload() as *const u64).read()
    }

    #[test]
    fn full_cycle_reclaims_garbage_and_preserves_survivors() {
        let heap = test_heap(16);
        let ctx = heap.new_context();

        let mut roots = Vec::new();
        for i in 0..1000u64 {
            let addr = heap.alloc_object(&ctx, 16, 0).unwrap();
            unsafe { write_payload(addr, i) };
            // Every 10th object survives.
            if i % 10 == 0 {
                roots.push((heap.register_root(addr), i));
            }
        }

        heap.collect();

        assert!(heap.reclaimed() > 0);
        for (root, expected) in &roots {
            let addr = root.get(&heap);
            assert!(addr != 0);
            // The remapped address resolves to a live page and the
            // contents came along.
            assert!(!heap.page_allocator().table().get(addr).is_null());
            assert_eq!(unsafe { read_payload(addr) }, *expected);
        }
        heap.verify();
    }

    #[test]
    fn stale_references_self_heal_after_relocation() {
        let heap = test_heap(16);
        let ctx = heap.new_context();

        let holder = heap.alloc_object(&ctx, 8, 1).unwrap();
        let target = heap.alloc_object(&ctx, 8, 0).unwrap();
        unsafe { write_payload(target, 77) };

        let holder_root = heap.register_root(holder);
        let slot = unsafe { object::header(holder).ref_slot(0) };
        heap.store_ref(slot, target);

        // Pad the pages with garbage so they are worth compacting.
        for _ in 0..500 {
            heap.alloc_object(&ctx, 64, 0).unwrap();
        }

        heap.collect();

        let healed_holder = holder_root.get(&heap);
        let slot = unsafe { object::header(healed_holder).ref_slot(0) };
        let healed_target = heap.load_ref(slot);
        assert_eq!(unsafe { read_payload(healed_target) }, 77);

        // A second load takes the fast path on the healed color.
        let raw = slot.load(Ordering::Acquire);
        assert!(heap.epoch.is_good(raw));
        assert_eq!(heap.load_ref(slot), healed_target);
    }

    #[test]
    fn references_into_recycled_ranges_stay_stable() {
        let heap = test_heap(4);
        let ctx = heap.new_context();

        let survivor = heap.alloc_object(&ctx, 8, 0).unwrap();
        unsafe { write_payload(survivor, 77) };
        let survivor_root = heap.register_root(survivor);

        // Compacts the survivor away; its old page range returns to the
        // pool while the cycle's forwarding tables stay installed.
        heap.collect();

        // The next allocations reuse the freed range, putting a fresh
        // object at the survivor's old address.
        let fresh = heap.alloc_object(&ctx, 8, 0).unwrap();
        let holder = heap.alloc_object(&ctx, 8, 1).unwrap();
        unsafe { write_payload(fresh, 99) };
        let holder_root = heap.register_root(holder);
        let slot = unsafe { object::header(holder).ref_slot(0) };
        heap.store_ref(slot, fresh);

        // The next mark must take the already-translated reference at
        // face value, not route it through the leftover tables.
        heap.collect();

        let holder = holder_root.get(&heap);
        let slot = unsafe { object::header(holder).ref_slot(0) };
        assert_eq!(unsafe { read_payload(heap.load_ref(slot)) }, 99);
        assert_eq!(unsafe { read_payload(survivor_root.get(&heap)) }, 77);
        heap.verify();
    }

    #[test]
    fn over_capacity_allocation_fails_cleanly() {
        let heap = test_heap(2);
        let ctx = heap.new_context();

        let mut err = None;
        for _ in 0..=(heap.max_capacity() / (4 * 1024)) {
            if let Err(e) = heap.alloc_object(&ctx, 4 * 1024 - 64, 0) {
                err = Some(e);
                break;
            }
        }
        assert_eq!(err, Some(AllocError::OutOfMemory));

        // The heap stays consistent: a cycle frees the garbage and
        // allocation recovers.
        heap.collect();
        assert!(heap.alloc_object(&ctx, 4 * 1024 - 64, 0).is_ok());
        assert!(heap.used() <= heap.max_capacity());
    }

    #[test]
    fn mutation_after_local_termination_restarts_marking() {
        let heap = test_heap(16);
        let ctx = heap.new_context();

        let holder = heap.alloc_object(&ctx, 8, 1).unwrap();
        let hidden = heap.alloc_object(&ctx, 8, 0).unwrap();
        unsafe { write_payload(hidden, 42) };
        let root = heap.register_root(holder);

        heap.mark_start();
        heap.mark();

        // The workers drained their queues; a mutator now publishes a
        // reference to an object nothing else reaches.
        let slot = unsafe { object::header(holder).ref_slot(0) };
        heap.store_ref(slot, hidden);

        assert!(heap.mark_end(), "store during marking must force a re-mark");
        heap.mark();
        assert!(!heap.mark_end());
        assert!(heap.is_object_strongly_live(hidden));

        heap.process_non_strong_references();
        heap.finish_non_strong_references();
        heap.select_relocation_set();
        heap.relocate_start();
        heap.relocate();

        // Both objects survived compaction, reachable through the root.
        let holder = root.get(&heap);
        let slot = unsafe { object::header(holder).ref_slot(0) };
        assert_eq!(unsafe { read_payload(heap.load_ref(slot)) }, 42);
    }

    #[test]
    fn capacity_invariant_holds_through_cycles() {
        let heap = test_heap(4);
        let ctx = heap.new_context();

        for round in 0..3 {
            for _ in 0..200 {
                if heap.alloc_object(&ctx, 48, 0).is_err() {
                    break;
                }
                assert!(heap.used() <= heap.max_capacity());
            }
            heap.collect();
            assert!(heap.used() <= heap.max_capacity(), "round {}", round);
        }
    }

    #[test]
    fn weak_reference_lifecycle_through_cycle() {
        let heap = test_heap(16);
        let ctx = heap.new_context();

        let kept_addr = heap.alloc_object(&ctx, 8, 0).unwrap();
        let dropped_addr = heap.alloc_object(&ctx, 8, 0).unwrap();
        let kept_root = heap.register_root(kept_addr);

        let kept = heap.register_reference(ReferenceKind::Weak, kept_addr);
        let cleared = heap.register_reference(ReferenceKind::Weak, dropped_addr);

        heap.collect();

        // The surviving referent was compacted away from its old page; the
        // handle must follow it to an address the page table resolves.
        let kept_now = kept.get().expect("live referent kept");
        assert!(!heap.page_allocator().table().get(kept_now).is_null());
        assert_eq!(kept_now, kept_root.get(&heap));

        assert_eq!(cleared.get(), None);
        let pending = heap.poll_cleared_reference().expect("cleared ref enqueued");
        assert!(pending.is_enqueued());
    }

    #[test]
    fn allocation_during_marking_is_implicitly_live() {
        let heap = test_heap(16);
        let ctx = heap.new_context();

        heap.mark_start();
        let born = heap.alloc_object(&ctx, 8, 0).unwrap();
        assert!(heap.is_object_live(born));
        heap.mark();
        assert!(!heap.mark_end());
        heap.process_non_strong_references();
        heap.finish_non_strong_references();
        heap.select_relocation_set();
        heap.relocate_start();
        heap.relocate();

        // Still addressable: its page was never a relocation candidate.
        assert!(!heap.page_allocator().table().get(born).is_null());
    }

    #[test]
    fn object_iterate_sees_survivors_and_referents() {
        let heap = test_heap(16);
        let ctx = heap.new_context();

        let holder = heap.alloc_object(&ctx, 8, 1).unwrap();
        let target = heap.alloc_object(&ctx, 8, 0).unwrap();
        let _root = heap.register_root(holder);
        unsafe {
            heap.store_ref(object::header(holder).ref_slot(0), target);
        }
        heap.collect();

        struct Count {
            objects: usize,
            referents: usize,
        }
        impl ObjectClosure for Count {
            fn do_object(&mut self, _addr: usize) {
                self.objects += 1;
            }
            fn do_referent(&mut self, _holder: usize, _referent: usize) {
                self.referents += 1;
            }
        }
        let mut count = Count {
            objects: 0,
            referents: 0,
        };
        heap.object_iterate(&mut count, true);
        assert_eq!(count.objects, 2);
        assert_eq!(count.referents, 1);
    }

    #[test]
    fn alloc_tlab_returns_granule_aligned_range() {
        let heap = test_heap(4);
        let (start, len) = heap.alloc_tlab(512).unwrap();
        assert!(len >= 512);
        assert_eq!(start % GRANULE, 0);
        unsafe { ObjectHeader::fill_dead(start, len) };
        heap.verify();
    }
}
