use core::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::base::{formatted_size, is_power_of_two};
use crate::object;

use super::live_map::LiveMap;
use super::{align_up, is_aligned, GRANULE};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum PageKind {
    Small,
    Medium,
    Large,
}

/// A page is the unit of allocation and reclamation: one contiguous range
/// carved out of the reserved heap span, always a multiple of the small-page
/// granule and granule-aligned, so the page table can index it by address.
///
/// Objects are bump-allocated from `start` towards `end`; the page stays
/// linearly parseable because retired allocation buffers are backfilled with
/// filler headers. `seqnum` stamps the cycle in which the page was handed
/// out — a page born during marking only contains objects allocated after
/// the mark start and is implicitly fully live for that cycle.
pub struct Page {
    start: usize,
    size: usize,
    kind: PageKind,
    top: AtomicUsize,
    seqnum: AtomicU32,
    live_map: LiveMap,
}

impl Page {
    pub fn new(start: usize, size: usize, kind: PageKind, seqnum: u32) -> Box<Page> {
        debug_assert!(is_aligned(start, GRANULE) && is_aligned(size, GRANULE));
        Box::new(Page {
            start,
            size,
            kind,
            top: AtomicUsize::new(start),
            seqnum: AtomicU32::new(seqnum),
            live_map: LiveMap::new(size / GRANULE),
        })
    }

    /// Reinitializes a recycled page header for a new range. Only the page
    /// allocator calls this, while it holds the page exclusively.
    pub fn reset(&mut self, start: usize, size: usize, kind: PageKind, seqnum: u32) {
        debug_assert!(is_aligned(start, GRANULE) && is_aligned(size, GRANULE));
        if size / GRANULE != self.size / GRANULE {
            self.live_map = LiveMap::new(size / GRANULE);
        }
        self.start = start;
        self.size = size;
        self.kind = kind;
        self.top.store(start, Ordering::Release);
        self.seqnum.store(seqnum, Ordering::Release);
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }

    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    pub fn seqnum(&self) -> u32 {
        self.seqnum.load(Ordering::Acquire)
    }

    pub fn is_in(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn used(&self) -> usize {
        self.top() - self.start
    }

    pub fn remaining(&self) -> usize {
        self.end() - self.top()
    }

    /// Granule index of `addr` within this page; the key used by the
    /// livemap and the forwarding table.
    pub fn granule_index(&self, addr: usize) -> usize {
        debug_assert!(self.is_in(addr));
        (addr - self.start) / GRANULE
    }

    pub fn live_map(&self) -> &LiveMap {
        &self.live_map
    }

    /// Garbage estimate once the livemap is committed for `cycle`.
    /// Pages allocated in `cycle` hold no provable garbage.
    pub fn garbage(&self, cycle: u32) -> usize {
        if self.seqnum() == cycle || !self.live_map.is_current(cycle) {
            0
        } else {
            self.size - self.live_map.live_bytes()
        }
    }

    /// Bumps `top` by `size`, or fails if the page is exhausted.
    pub fn alloc_object(&self, size: usize) -> Option<usize> {
        debug_assert!(is_aligned(size, GRANULE));
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            let new_top = top + size;
            if new_top > self.end() {
                return None;
            }
            match self
                .top
                .compare_exchange_weak(top, new_top, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Some(top),
                Err(t) => top = t,
            }
        }
    }

    /// Releases the allocation at `addr` if it is still the most recent one.
    /// Returns false when a later allocation already moved `top`; the space
    /// is then abandoned and reclaimed with the page.
    pub fn undo_alloc_object(&self, addr: usize, size: usize) -> bool {
        self.top
            .compare_exchange(addr + size, addr, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Carves a bump range of at least `min` bytes, preferring `desired`.
    /// Shrinks to whatever is left when the page is nearly full.
    pub fn alloc_range(&self, min: usize, desired: usize) -> Option<(usize, usize)> {
        debug_assert!(min <= desired);
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            let available = self.end() - top;
            if available < min {
                return None;
            }
            let take = desired.min(available);
            match self.top.compare_exchange_weak(
                top,
                top + take,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some((top, take)),
                Err(t) => top = t,
            }
        }
    }

    /// Visits every non-filler object allocated so far, in address order.
    ///
    /// # Safety
    ///
    /// Every allocated range below `top` must hold an initialized object or
    /// filler header, and no relocation may drain this page concurrently.
    pub unsafe fn for_each_object(&self, mut f: impl FnMut(usize)) {
        let top = self.top();
        let mut addr = self.start;
        while addr < top {
            let header = object::header(addr);
            if !header.is_filler() {
                f(addr);
            }
            addr += header.size();
        }
    }
}

unsafe impl Send for Page {}
unsafe impl Sync for Page {}

pub struct HeapArguments {
    /// Hard capacity bound, enforced by the page allocator.
    pub max_capacity: usize,
    /// Soft target; exceeding it triggers a cycle and widens the
    /// relocation-set reclaim goal. Zero means "same as max".
    pub soft_max_capacity: usize,
    pub min_capacity: usize,
    /// Small-page granule. Must be a power of two; every page size and
    /// address is a multiple of it.
    pub small_page_size: usize,
    /// Zero derives 16x the small page size, capped to an eighth of the
    /// heap; below two small pages the medium class is disabled.
    pub medium_page_size: usize,
    pub min_tlab_size: usize,
    pub max_tlab_size: usize,
    /// Zero means one thread per CPU.
    pub parallel_gc_threads: usize,
    /// Percent of capacity in use that makes the controller start a cycle.
    pub allocation_threshold: usize,
    /// Percent of garbage below which a page is not worth compacting.
    pub fragmentation_limit: usize,
    pub alloc_stall_retries: usize,
    pub alloc_stall_timeout_ms: u64,
    pub control_interval_min: u64,
    pub control_interval_max: u64,
    pub control_interval_adjust_period: u64,
    /// Spawn the background control thread. Tests drive cycles manually.
    pub enable_controller: bool,
}

impl Default for HeapArguments {
    fn default() -> Self {
        Self {
            max_capacity: 256 * 1024 * 1024,
            soft_max_capacity: 0,
            min_capacity: 0,
            small_page_size: 2 * 1024 * 1024,
            medium_page_size: 0,
            min_tlab_size: 2 * 1024,
            max_tlab_size: 256 * 1024,
            parallel_gc_threads: 0,
            allocation_threshold: 75,
            fragmentation_limit: 25,
            alloc_stall_retries: 3,
            alloc_stall_timeout_ms: 10,
            control_interval_min: 1,
            control_interval_max: 512,
            control_interval_adjust_period: 1000,
            enable_controller: true,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HeapOptions {
    pub min_capacity: usize,
    pub max_capacity: usize,
    pub soft_max_capacity: usize,
    pub page_granule: usize,
    pub page_granule_shift: usize,
    pub small_page_size: usize,
    pub medium_page_size: usize,
    pub small_object_max: usize,
    pub medium_object_max: usize,
    pub min_tlab_size: usize,
    pub max_tlab_size: usize,
    pub parallel_gc_threads: usize,
    pub allocation_threshold: usize,
    pub fragmentation_limit: usize,
    pub alloc_stall_retries: usize,
    pub alloc_stall_timeout_ms: u64,
    pub control_interval_min: u64,
    pub control_interval_max: u64,
    pub control_interval_adjust_period: u64,
    pub enable_controller: bool,
}

impl HeapOptions {
    pub const fn granules(&self, size: usize) -> usize {
        (size + self.page_granule - 1) >> self.page_granule_shift
    }

    pub fn kind_for(&self, object_size: usize) -> PageKind {
        if object_size <= self.small_object_max {
            PageKind::Small
        } else if object_size <= self.medium_object_max {
            PageKind::Medium
        } else {
            PageKind::Large
        }
    }

    /// Page size to request for an object of `object_size` in `kind`.
    pub fn page_size_for(&self, kind: PageKind, object_size: usize) -> usize {
        match kind {
            PageKind::Small => self.small_page_size,
            PageKind::Medium => self.medium_page_size,
            PageKind::Large => align_up(object_size, self.page_granule),
        }
    }
}

impl fmt::Display for HeapOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapOptions")
            .field("max_capacity", &formatted_size(self.max_capacity))
            .field("soft_max_capacity", &formatted_size(self.soft_max_capacity))
            .field("small_page_size", &formatted_size(self.small_page_size))
            .field("medium_page_size", &formatted_size(self.medium_page_size))
            .field("small_object_max", &formatted_size(self.small_object_max))
            .field("medium_object_max", &formatted_size(self.medium_object_max))
            .field("max_tlab_size", &formatted_size(self.max_tlab_size))
            .field("parallel_gc_threads", &self.parallel_gc_threads)
            .finish()
    }
}

pub fn setup_sizes(args: &HeapArguments) -> HeapOptions {
    assert!(
        is_power_of_two(args.small_page_size) && args.small_page_size >= 4 * GRANULE,
        "small page size must be a power of two"
    );

    let granule = args.small_page_size;
    let max_capacity = align_up(args.max_capacity.max(granule), granule);
    let soft_max_capacity = if args.soft_max_capacity == 0 {
        max_capacity
    } else {
        align_up(args.soft_max_capacity, granule).min(max_capacity)
    };
    let min_capacity = align_up(args.min_capacity.max(granule), granule).min(max_capacity);

    let mut medium_page_size = if args.medium_page_size == 0 {
        (granule * 16).min(max_capacity / 8)
    } else {
        align_up(args.medium_page_size, granule)
    };
    if medium_page_size < granule * 2 {
        // Heap too small for a medium class; medium-sized objects get
        // their own large pages instead.
        medium_page_size = 0;
    }

    let small_object_max = granule / 8;
    let medium_object_max = if medium_page_size == 0 {
        small_object_max
    } else {
        medium_page_size / 8
    };

    let max_tlab_size = args
        .max_tlab_size
        .min(small_object_max)
        .max(args.min_tlab_size)
        .max(GRANULE);
    let min_tlab_size = args.min_tlab_size.clamp(GRANULE, max_tlab_size);

    let parallel_gc_threads = if args.parallel_gc_threads == 0 {
        num_cpus::get()
    } else {
        args.parallel_gc_threads
    };

    let opts = HeapOptions {
        min_capacity,
        max_capacity,
        soft_max_capacity,
        page_granule: granule,
        page_granule_shift: granule.trailing_zeros() as usize,
        small_page_size: granule,
        medium_page_size,
        small_object_max,
        medium_object_max,
        min_tlab_size,
        max_tlab_size,
        parallel_gc_threads,
        allocation_threshold: args.allocation_threshold.clamp(1, 100),
        fragmentation_limit: args.fragmentation_limit.min(100),
        alloc_stall_retries: args.alloc_stall_retries,
        alloc_stall_timeout_ms: args.alloc_stall_timeout_ms,
        control_interval_min: args.control_interval_min.max(1),
        control_interval_max: args.control_interval_max.max(args.control_interval_min),
        control_interval_adjust_period: args.control_interval_adjust_period.max(1),
        enable_controller: args.enable_controller,
    };

    log::info!(target: "gc", "Heap sizes setup complete");
    log::info!(target: "gc", "- Max capacity: {}", formatted_size(opts.max_capacity));
    log::info!(target: "gc", "- Soft max capacity: {}", formatted_size(opts.soft_max_capacity));
    log::info!(target: "gc", "- Small page size: {}", formatted_size(opts.small_page_size));
    log::info!(target: "gc", "- Medium page size: {}", formatted_size(opts.medium_page_size));
    log::info!(target: "gc", "- Max TLAB size: {}", formatted_size(opts.max_tlab_size));
    log::info!(target: "gc", "- Parallel GC threads: {}", opts.parallel_gc_threads);

    opts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectHeader;

    fn small_options() -> HeapOptions {
        setup_sizes(&HeapArguments {
            max_capacity: 4 * 1024 * 1024,
            small_page_size: 64 * 1024,
            ..Default::default()
        })
    }

    #[test]
    fn setup_sizes_derives_classes() {
        let opts = small_options();
        assert_eq!(opts.page_granule, 64 * 1024);
        assert_eq!(opts.small_object_max, 8 * 1024);
        assert!(opts.medium_page_size >= 2 * opts.page_granule);
        assert_eq!(opts.medium_object_max, opts.medium_page_size / 8);
        assert!(opts.max_tlab_size <= opts.small_object_max);

        assert_eq!(opts.kind_for(128), PageKind::Small);
        assert_eq!(opts.kind_for(opts.small_object_max + 1), PageKind::Medium);
        assert_eq!(opts.kind_for(opts.medium_object_max + 1), PageKind::Large);
        assert_eq!(
            opts.page_size_for(PageKind::Large, opts.page_granule + 1),
            2 * opts.page_granule
        );
    }

    #[test]
    fn tiny_heap_disables_medium_class() {
        let opts = setup_sizes(&HeapArguments {
            max_capacity: 256 * 1024,
            small_page_size: 64 * 1024,
            ..Default::default()
        });
        assert_eq!(opts.medium_page_size, 0);
        assert_eq!(opts.medium_object_max, opts.small_object_max);
        assert_eq!(opts.kind_for(opts.small_object_max + 1), PageKind::Large);
    }

    #[test]
    fn alloc_and_undo() {
        let page = Page::new(0x100000, 4096, PageKind::Small, 1);
        let a = page.alloc_object(64).unwrap();
        let b = page.alloc_object(32).unwrap();
        assert_eq!(a, 0x100000);
        assert_eq!(b, 0x100040);
        assert_eq!(page.used(), 96);

        // a is not the most recent allocation, undo must refuse.
        assert!(!page.undo_alloc_object(a, 64));
        assert!(page.undo_alloc_object(b, 32));
        assert_eq!(page.used(), 64);

        assert!(page.alloc_object(8192).is_none());
    }

    #[test]
    fn alloc_range_shrinks_to_fit() {
        let page = Page::new(0x100000, 256, PageKind::Small, 1);
        let (_, got) = page.alloc_range(64, 192).unwrap();
        assert_eq!(got, 192);
        let (_, got) = page.alloc_range(32, 192).unwrap();
        assert_eq!(got, 64);
        assert!(page.alloc_range(32, 64).is_none());
    }

    #[test]
    fn linear_walk_skips_fillers() {
        let mut backing = vec![0u8; 1024 + GRANULE];
        let start = crate::base::round_up(backing.as_mut_ptr() as usize, GRANULE);
        let page = Page::new(start, 1024, PageKind::Small, 1);

        let a = page.alloc_object(64).unwrap();
        let gap = page.alloc_object(32).unwrap();
        let b = page.alloc_object(48).unwrap();
        unsafe {
            ObjectHeader::initialize(a, 64, 1);
            ObjectHeader::fill_dead(gap, 32);
            ObjectHeader::initialize(b, 48, 0);
        }

        let mut seen = vec![];
        unsafe { page.for_each_object(|addr| seen.push(addr)) };
        assert_eq!(seen, vec![a, b]);
    }
}
