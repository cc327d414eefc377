use std::time::Instant;

pub mod address;
pub mod controller;
pub mod forwarding;
pub mod heap;
pub mod live_map;
pub mod mark;
pub mod object_allocator;
pub mod page;
pub mod page_allocator;
pub mod page_table;
pub mod reference_processor;
pub mod relocate;
pub mod relocation_set;
pub mod shared_vars;
pub mod unload;
pub mod worker;

/// Object alignment and the unit of livemap/forwarding indexing. Sixteen
/// bytes keeps the low four bits of every object address free for color
/// metadata.
pub const GRANULE: usize = 16;

#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    align_down(addr.wrapping_add(align).wrapping_sub(1), align)
}

#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

/// Allocation failure surfaced to the caller. The heap itself stays
/// consistent; later allocations may succeed once capacity is freed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocError {
    OutOfMemory,
}

impl std::fmt::Display for AllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for AllocError {}

/// Phase of the collection cycle, owned by the heap facade. A cycle cannot
/// be abandoned once `RelocateStart` has run.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum GcPhase {
    Idle,
    MarkStart,
    Marking,
    MarkEnd,
    Selecting,
    RelocateStart,
    Relocating,
}

pub struct ConcurrentPhase {
    name: &'static str,
    gc_id: usize,
    start: Instant,
}

pub struct PausePhase {
    name: &'static str,
    gc_id: usize,
    start: Instant,
}

impl ConcurrentPhase {
    pub fn new(gc_id: usize, name: &'static str) -> Self {
        Self {
            name,
            gc_id,
            start: Instant::now(),
        }
    }
}

impl Drop for ConcurrentPhase {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        log::info!(target: "gc", "GC({}) Concurrent {} {:.3}ms", self.gc_id, self.name, elapsed.as_micros() as f64 / 1000.0);
    }
}

impl PausePhase {
    pub fn new(gc_id: usize, name: &'static str) -> Self {
        Self {
            name,
            gc_id,
            start: Instant::now(),
        }
    }
}

impl Drop for PausePhase {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        log::info!(target: "gc", "GC({}) Pause {} {:.3}ms", self.gc_id, self.name, elapsed.as_micros() as f64 / 1000.0);
    }
}
