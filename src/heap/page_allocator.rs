use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::base::formatted_size;
use crate::base::virtual_memory::VirtualMemory;
use crate::sync::monitor::Monitor;

use super::page::{HeapOptions, Page, PageKind};
use super::page_table::PageTable;
use super::shared_vars::SharedFlag;
use super::AllocError;

#[derive(Clone, Copy, Default)]
pub struct AllocFlags {
    /// Fail immediately instead of stalling when capacity is exhausted.
    pub non_blocking: bool,
    /// Relocation-target allocation: may stall, but never requests a new
    /// cycle (a cycle is already running and a recursive one cannot help).
    pub relocation: bool,
}

struct FreeRange {
    start: usize,
    size: usize,
}

struct Inner {
    free: Vec<FreeRange>,
    /// Page headers of freed pages, kept alive so a stale `*mut Page` read
    /// from the page table never dangles.
    recycled: Vec<Box<Page>>,
    live: Vec<*mut Page>,
}

/// Owns the reserved heap span, the free-range pool and the page table,
/// and is the single point of truth for capacity. Allocation requests that
/// find no room stall on a monitor until a page is freed, then escalate to
/// out-of-memory after a bounded number of timed retries.
pub struct PageAllocator {
    options: HeapOptions,
    memory: VirtualMemory,
    table: PageTable,
    inner: Mutex<Inner>,
    stall: Monitor<()>,
    cycle_request: SharedFlag,
    cycle_waker: OnceCell<Arc<Monitor<()>>>,
    used: AtomicUsize,
    reclaimed: AtomicUsize,
}

impl PageAllocator {
    pub fn new(options: HeapOptions) -> Self {
        let memory = VirtualMemory::reserve_aligned(options.max_capacity, options.page_granule)
            .expect("failed to reserve heap address space");
        let table = PageTable::new(memory.start(), memory.size(), options.page_granule_shift);
        log::info!(
            target: "gc",
            "Reserved heap span {:p}..{:p} ({})",
            memory.start() as *const u8,
            memory.end() as *const u8,
            formatted_size(memory.size())
        );

        let free = vec![FreeRange {
            start: memory.start(),
            size: memory.size(),
        }];

        Self {
            options,
            memory,
            table,
            inner: Mutex::new(Inner {
                free,
                recycled: Vec::new(),
                live: Vec::new(),
            }),
            stall: Monitor::new(()),
            cycle_request: SharedFlag::new(),
            cycle_waker: OnceCell::new(),
            used: AtomicUsize::new(0),
            reclaimed: AtomicUsize::new(0),
        }
    }

    pub fn options(&self) -> &HeapOptions {
        &self.options
    }

    pub fn table(&self) -> &PageTable {
        &self.table
    }

    pub fn base(&self) -> usize {
        self.memory.start()
    }

    pub fn span(&self) -> usize {
        self.memory.size()
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn max_capacity(&self) -> usize {
        self.options.max_capacity
    }

    pub fn soft_max_capacity(&self) -> usize {
        self.options.soft_max_capacity
    }

    pub fn reclaimed(&self) -> usize {
        self.reclaimed.load(Ordering::Relaxed)
    }

    /// Registers the monitor the controller sleeps on, so stalled
    /// allocations can wake it to start a cycle.
    pub fn set_cycle_waker(&self, waker: Arc<Monitor<()>>) {
        let _ = self.cycle_waker.set(waker);
    }

    /// Consumes a pending stall-driven cycle request.
    pub fn poll_cycle_request(&self) -> bool {
        self.cycle_request.try_unset()
    }

    fn request_cycle(&self) {
        self.cycle_request.set();
        if let Some(waker) = self.cycle_waker.get() {
            waker.lock().notify_all();
        }
    }

    fn try_alloc(&self, kind: PageKind, size: usize, seqnum: u32) -> Option<*mut Page> {
        let mut inner = self.inner.lock();

        if self.used() + size > self.options.max_capacity {
            return None;
        }

        // First fit at small-page granularity keeps the pool simple; pages
        // are few and uniform enough that fragmentation stays bounded.
        let pos = inner.free.iter().position(|r| r.size >= size)?;
        let start = inner.free[pos].start;
        if inner.free[pos].size == size {
            inner.free.remove(pos);
        } else {
            inner.free[pos].start += size;
            inner.free[pos].size -= size;
        }

        let page = match inner.recycled.pop() {
            Some(mut page) => {
                page.reset(start, size, kind, seqnum);
                Box::into_raw(page)
            }
            None => Box::into_raw(Page::new(start, size, kind, seqnum)),
        };
        inner.live.push(page);
        self.table.insert(page);
        self.used.fetch_add(size, Ordering::Relaxed);

        log::trace!(
            target: "gc-alloc",
            "Allocated {:?} page {:x}..{:x} ({})",
            kind,
            start,
            start + size,
            formatted_size(size)
        );
        Some(page)
    }

    /// Allocates a page of `size` bytes (a multiple of the page granule).
    /// Blocks when capacity is exhausted unless `flags.non_blocking`.
    pub fn alloc_page(
        &self,
        kind: PageKind,
        size: usize,
        flags: AllocFlags,
        seqnum: u32,
    ) -> Result<*mut Page, AllocError> {
        debug_assert!(size % self.options.page_granule == 0);

        let mut retries = 0;
        let mut reclaimed_at_wait = self.reclaimed();
        loop {
            if let Some(page) = self.try_alloc(kind, size, seqnum) {
                return Ok(page);
            }

            if flags.non_blocking {
                return Err(AllocError::OutOfMemory);
            }
            if !flags.relocation {
                self.request_cycle();
            }

            // Stall. Re-check under the monitor so a free that landed
            // between the failed attempt and the wait is not missed.
            let mut guard = self.stall.lock();
            if let Some(page) = self.try_alloc(kind, size, seqnum) {
                return Ok(page);
            }
            log::debug!(
                target: "gc-alloc",
                "Allocation stall: {:?} page of {} (used {} of {})",
                kind,
                formatted_size(size),
                formatted_size(self.used()),
                formatted_size(self.options.max_capacity)
            );
            let timed_out =
                guard.wait_for(Duration::from_millis(self.options.alloc_stall_timeout_ms));
            if timed_out {
                // A cycle that reclaimed anything since the last wait
                // restarts the budget; only fruitless waits escalate.
                let reclaimed = self.reclaimed();
                if reclaimed != reclaimed_at_wait {
                    reclaimed_at_wait = reclaimed;
                    retries = 0;
                    continue;
                }
                retries += 1;
                if retries > self.options.alloc_stall_retries {
                    log::error!(
                        target: "gc",
                        "Out of memory: {:?} page of {} after {} stalled retries",
                        kind,
                        formatted_size(size),
                        retries - 1
                    );
                    return Err(AllocError::OutOfMemory);
                }
            }
        }
    }

    fn release(&self, page: *mut Page, reclaimed: bool) {
        let (start, size) = unsafe { ((*page).start(), (*page).end() - (*page).start()) };

        let mut inner = self.inner.lock();
        self.table.remove(page);
        let pos = inner
            .live
            .iter()
            .position(|&p| p == page)
            .expect("freeing a page the allocator does not own");
        inner.live.swap_remove(pos);

        // Coalesce with adjacent free ranges.
        let at = inner
            .free
            .partition_point(|r| r.start < start);
        let merge_prev = at > 0 && inner.free[at - 1].start + inner.free[at - 1].size == start;
        let merge_next = at < inner.free.len() && start + size == inner.free[at].start;
        match (merge_prev, merge_next) {
            (true, true) => {
                inner.free[at - 1].size += size + inner.free[at].size;
                inner.free.remove(at);
            }
            (true, false) => inner.free[at - 1].size += size,
            (false, true) => {
                inner.free[at].start = start;
                inner.free[at].size += size;
            }
            (false, false) => inner.free.insert(at, FreeRange { start, size }),
        }

        inner.recycled.push(unsafe { Box::from_raw(page) });
        self.memory.release(start, size);
        self.used.fetch_sub(size, Ordering::Relaxed);
        if reclaimed {
            self.reclaimed.fetch_add(size, Ordering::Relaxed);
        }
        drop(inner);

        // Unblock any stalled allocation.
        self.stall.lock().notify_all();
    }

    /// Returns a page whose allocation turned out to be unnecessary before
    /// any object was published in it.
    pub fn undo_alloc_page(&self, page: *mut Page) {
        debug_assert!(unsafe { (*page).used() } == 0);
        self.release(page, false);
    }

    /// Frees a page whose contents are dead or fully relocated.
    /// `reclaimed` marks bytes recovered by collection rather than undone.
    pub fn free_page(&self, page: *mut Page, reclaimed: bool) {
        self.release(page, reclaimed);
    }

    /// Snapshot of all currently allocated pages.
    pub fn pages(&self) -> Vec<*mut Page> {
        self.inner.lock().live.clone()
    }
}

unsafe impl Send for PageAllocator {}
unsafe impl Sync for PageAllocator {}

impl Drop for PageAllocator {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for &page in inner.live.iter() {
            drop(unsafe { Box::from_raw(page) });
        }
        inner.live.clear();
    }
}
