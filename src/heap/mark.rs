use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::object;

use super::address::{self, ColorEpoch};
use super::forwarding::{remap, ForwardingIndex};
use super::page_table::PageTable;

/// Termination consensus for the marking workers. A worker that runs out
/// of work decrements the counter; if anyone finds work afterwards the
/// counter is re-incremented and the would-be terminator resumes. Marking
/// is over only when the counter reaches zero with no resurrection.
pub struct Terminator {
    const_nworkers: usize,
    nworkers: AtomicUsize,
}

impl Terminator {
    pub fn new(number_workers: usize) -> Terminator {
        Terminator {
            const_nworkers: number_workers,
            nworkers: AtomicUsize::new(number_workers),
        }
    }

    pub fn try_terminate(&self) -> bool {
        if self.const_nworkers == 1 {
            return true;
        }

        if self.decrease_workers() {
            return true;
        }

        thread::sleep(Duration::from_micros(1));
        self.zero_or_increase_workers()
    }

    fn decrease_workers(&self) -> bool {
        self.nworkers.fetch_sub(1, Ordering::Relaxed) == 1
    }

    fn zero_or_increase_workers(&self) -> bool {
        let mut nworkers = self.nworkers.load(Ordering::Relaxed);

        loop {
            if nworkers == 0 {
                return true;
            }

            match self.nworkers.compare_exchange(
                nworkers,
                nworkers + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    // Someone still has work; this worker un-terminates.
                    return false;
                }
                Err(prev) => nworkers = prev,
            }
        }
    }
}

/// A mark task is an untagged, granule-aligned object address with the
/// traversal strength in bit zero.
const FINALIZABLE_TASK: usize = 1;

#[inline]
fn encode_task(addr: usize, finalizable: bool) -> usize {
    addr | finalizable as usize
}

#[inline]
fn decode_task(task: usize) -> (usize, bool) {
    (task & !FINALIZABLE_TASK, task & FINALIZABLE_TASK != 0)
}

pub struct MarkQueueSet {
    workers: Vec<Worker<usize>>,
    stealers: Vec<Stealer<usize>>,
    injector: Injector<usize>,
}

// `worker(i)` is only ever popped by task `i`; everyone else goes through
// the stealers or the injector, which are thread-safe.
unsafe impl Send for MarkQueueSet {}
unsafe impl Sync for MarkQueueSet {}

impl MarkQueueSet {
    pub fn new(nworkers: usize) -> MarkQueueSet {
        let mut workers = Vec::with_capacity(nworkers);
        let mut stealers = Vec::with_capacity(nworkers);

        for _ in 0..nworkers {
            let w = Worker::new_lifo();
            stealers.push(w.stealer());
            workers.push(w);
        }

        MarkQueueSet {
            workers,
            stealers,
            injector: Injector::new(),
        }
    }

    pub fn worker(&self, id: usize) -> &Worker<usize> {
        &self.workers[id]
    }

    pub fn stealers(&self) -> &[Stealer<usize>] {
        &self.stealers
    }

    pub fn nworkers(&self) -> usize {
        self.workers.len()
    }

    pub fn injector(&self) -> &Injector<usize> {
        &self.injector
    }

    pub fn is_drained(&self) -> bool {
        self.injector.is_empty() && self.stealers.iter().all(|s| s.is_empty())
    }
}

/// Everything a marking worker needs to classify and mark a reference.
#[derive(Clone, Copy)]
pub struct MarkContext<'a> {
    pub table: &'a PageTable,
    pub forwardings: &'a ForwardingIndex,
    pub epoch: &'a ColorEpoch,
    pub cycle: u32,
}

pub struct Marker {
    queues: MarkQueueSet,
}

impl Marker {
    pub fn new(nworkers: usize) -> Self {
        Self {
            queues: MarkQueueSet::new(nworkers),
        }
    }

    pub fn queues(&self) -> &MarkQueueSet {
        &self.queues
    }

    /// Feeds a root or barrier-discovered reference to the workers.
    pub fn inject(&self, addr: usize, finalizable: bool) {
        debug_assert!(addr != 0);
        self.queues.injector().push(encode_task(addr, finalizable));
    }

    /// True when barrier activity left work behind after the workers
    /// terminated; `mark_end` then schedules another pass.
    pub fn has_pending_work(&self) -> bool {
        !self.queues.is_drained()
    }

    /// Marks the object at `addr` for the current cycle. Returns true when
    /// the object still needs scanning: first mark, or an upgrade from
    /// finalizable to strong reachability that must now propagate strength.
    pub fn try_mark(ctx: &MarkContext, addr: usize, finalizable: bool) -> bool {
        let page = ctx.table.get(addr);
        if page.is_null() {
            log::error!(target: "gc", "Marked reference {:#x} outside any allocated page", addr);
            panic!("heap corruption: reference outside any allocated page");
        }

        let page = unsafe { &*page };
        if page.seqnum() == ctx.cycle {
            // Allocated during this cycle: born live, contents kept visible
            // by the store barrier, nothing to scan.
            return false;
        }

        let live_map = page.live_map();
        live_map.reset_for(ctx.cycle);
        let result = live_map.mark(page.granule_index(addr), finalizable);
        if result.newly_live {
            live_map.inc_live(unsafe { object::header(addr).size() });
        }
        result.newly_live || result.newly_strong
    }
}

pub struct MarkingTask<'a> {
    task_id: usize,
    local: Segment,
    terminator: &'a Terminator,
    queues: &'a MarkQueueSet,
    ctx: MarkContext<'a>,
    marked: usize,
}

impl<'a> MarkingTask<'a> {
    pub fn new(
        task_id: usize,
        terminator: &'a Terminator,
        queues: &'a MarkQueueSet,
        ctx: MarkContext<'a>,
    ) -> MarkingTask<'a> {
        MarkingTask {
            task_id,
            local: Segment::new(),
            terminator,
            queues,
            ctx,
            marked: 0,
        }
    }

    fn pop(&mut self) -> Option<usize> {
        self.pop_local()
            .or_else(|| self.pop_worker())
            .or_else(|| self.pop_global())
            .or_else(|| self.steal())
    }

    fn pop_local(&mut self) -> Option<usize> {
        self.local.pop()
    }

    fn pop_worker(&mut self) -> Option<usize> {
        self.queues.worker(self.task_id).pop()
    }

    fn worker(&self) -> &Worker<usize> {
        self.queues.worker(self.task_id)
    }

    fn pop_global(&mut self) -> Option<usize> {
        loop {
            match self.queues.injector().steal_batch_and_pop(self.worker()) {
                Steal::Empty => return None,
                Steal::Success(task) => return Some(task),
                Steal::Retry => continue,
            }
        }
    }

    fn steal(&self) -> Option<usize> {
        let stealers = self.queues.stealers();
        if stealers.len() == 1 {
            return None;
        }

        let mut rng = thread_rng();
        let range = Uniform::new(0, stealers.len());

        for _ in 0..2 * stealers.len() {
            let mut stealer_id = self.task_id;
            while stealer_id == self.task_id {
                stealer_id = range.sample(&mut rng);
            }

            loop {
                match stealers[stealer_id].steal_batch_and_pop(self.worker()) {
                    Steal::Empty => break,
                    Steal::Success(task) => return Some(task),
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    fn push(&mut self, task: usize) {
        if self.local.has_capacity() {
            self.local.push(task);
            self.defensive_push();
        } else {
            self.worker().push(task);
        }
    }

    // Periodically spill half the local segment to the injector so idle
    // workers have something to steal.
    fn defensive_push(&mut self) {
        self.marked += 1;

        if self.marked > 256 {
            if self.local.len() > 4 {
                let target_len = self.local.len() / 2;
                while self.local.len() > target_len {
                    let task = self.local.pop().expect("should be non-empty");
                    self.queues.injector().push(task);
                }
            }
            self.marked = 0;
        }
    }

    pub fn run(&mut self) {
        loop {
            let task = if let Some(task) = self.pop() {
                task
            } else if self.terminator.try_terminate() {
                break;
            } else {
                continue;
            };

            let (addr, finalizable) = decode_task(task);
            self.scan_object(addr, finalizable);
        }
    }

    fn mark_and_push(&mut self, addr: usize, finalizable: bool) {
        if Marker::try_mark(&self.ctx, addr, finalizable) {
            self.push(encode_task(addr, finalizable));
        }
    }

    /// Visits every reference slot of the object at `addr`: remap stale
    /// marked-color references through the previous cycle's forwarding
    /// tables, self-heal the slot to the good color, and mark the referent.
    fn scan_object(&mut self, addr: usize, finalizable: bool) {
        let header = unsafe { object::header(addr) };
        for i in 0..header.ref_count() {
            let slot = unsafe { header.ref_slot(i) };
            let value = slot.load(Ordering::Acquire);
            if address::untag(value) == 0 {
                continue;
            }

            let target = if self.ctx.epoch.is_good(value) || !address::needs_remap(value) {
                address::untag(value)
            } else {
                remap(self.ctx.forwardings, address::untag(value))
            };

            if !finalizable {
                let healed = self.ctx.epoch.tag_good(target);
                if value != healed {
                    // Losing the race is fine: the winner wrote either the
                    // same healed value or a newer mutator store, which the
                    // store barrier keeps alive on its own.
                    let _ = slot.compare_exchange(
                        value,
                        healed,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    );
                }
            }

            self.mark_and_push(target, finalizable);
        }
    }
}

const SEGMENT_SIZE: usize = 64;

struct Segment {
    data: Vec<usize>,
}

impl Segment {
    fn new() -> Segment {
        Segment {
            data: Vec::with_capacity(SEGMENT_SIZE),
        }
    }

    fn has_capacity(&self) -> bool {
        self.data.len() < SEGMENT_SIZE
    }

    fn push(&mut self, task: usize) {
        debug_assert!(self.has_capacity());
        self.data.push(task);
    }

    fn pop(&mut self) -> Option<usize> {
        self.data.pop()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}
