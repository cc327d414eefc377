use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use atomic::Atomic;

use super::page::Page;
use super::shared_vars::SharedFlag;
use super::GRANULE;

/// Relocation progress of one selected page.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum RelocationState {
    Pending,
    InRelocation,
    Drained,
    Freed,
}

/// Old-offset to new-address map for one page under relocation. One slot
/// per granule of the page's allocated prefix; slots are write-once under a
/// claim-or-adopt CAS, so racing relocators agree on a single winner per
/// object and losers discard their copy.
pub struct ForwardingTable {
    page: *mut Page,
    page_start: usize,
    entries: Box<[AtomicUsize]>,
    state: Atomic<RelocationState>,
    /// Set when any object survived in place; the source page then cannot
    /// be freed after draining.
    in_place: SharedFlag,
    live_bytes: usize,
}

impl ForwardingTable {
    /// Builds a table sized to the page's allocated prefix. The caller
    /// guarantees `page` outlives the table.
    pub fn new(page: *mut Page) -> Box<ForwardingTable> {
        let (start, used, live) = unsafe {
            let p = &*page;
            (p.start(), p.used(), p.live_map().live_bytes())
        };
        Box::new(ForwardingTable {
            page,
            page_start: start,
            entries: (0..used / GRANULE).map(|_| AtomicUsize::new(0)).collect(),
            state: Atomic::new(RelocationState::Pending),
            in_place: SharedFlag::new(),
            live_bytes: live,
        })
    }

    pub fn page(&self) -> *mut Page {
        self.page
    }

    pub fn page_start(&self) -> usize {
        self.page_start
    }

    /// Live bytes snapshot taken at selection; the expected copy cost.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    pub fn state(&self) -> RelocationState {
        self.state.load(atomic::Ordering::Acquire)
    }

    pub fn set_state(&self, state: RelocationState) {
        self.state.store(state, atomic::Ordering::Release);
    }

    pub fn mark_in_place(&self) {
        self.in_place.set();
    }

    pub fn is_in_place(&self) -> bool {
        self.in_place.is_set()
    }

    #[inline]
    fn slot(&self, from: usize) -> &AtomicUsize {
        let index = (from - self.page_start) / GRANULE;
        &self.entries[index]
    }

    /// Forwarded address of the object at `from`, if already relocated.
    #[inline]
    pub fn get(&self, from: usize) -> Option<usize> {
        match self.slot(from).load(Ordering::Acquire) {
            0 => None,
            to => Some(to),
        }
    }

    /// Visits every installed entry as `(from, to)` address pairs.
    pub fn entries_do(&self, mut f: impl FnMut(usize, usize)) {
        for (i, slot) in self.entries.iter().enumerate() {
            let to = slot.load(Ordering::Acquire);
            if to != 0 {
                f(self.page_start + i * GRANULE, to);
            }
        }
    }

    /// Installs `from -> to`. Returns the winning target address, which is
    /// `to` exactly when this caller claimed the slot.
    pub fn insert(&self, from: usize, to: usize) -> usize {
        debug_assert!(to != 0);
        match self
            .slot(from)
            .compare_exchange(0, to, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => to,
            Err(winner) => winner,
        }
    }
}

unsafe impl Send for ForwardingTable {}
unsafe impl Sync for ForwardingTable {}

/// Address-indexed view over the active cycle's forwarding tables, the same
/// shape as the page table, so mutator barriers translate a stale reference
/// with two atomic loads. Tables stay installed until the next cycle's
/// selection replaces them; any reference still wearing the old color heals
/// through here during the next mark.
pub struct ForwardingIndex {
    base: usize,
    shift: usize,
    slots: Box<[AtomicPtr<ForwardingTable>]>,
}

impl ForwardingIndex {
    pub fn new(base: usize, span: usize, granule_shift: usize) -> Self {
        let count = span >> granule_shift;
        Self {
            base,
            shift: granule_shift,
            slots: (0..count).map(|_| AtomicPtr::new(null_mut())).collect(),
        }
    }

    #[inline]
    fn slot_of(&self, addr: usize) -> Option<usize> {
        if addr < self.base {
            return None;
        }
        let index = (addr - self.base) >> self.shift;
        (index < self.slots.len()).then_some(index)
    }

    /// Forwarding table covering `addr`, or null when its page was not
    /// selected for relocation.
    #[inline]
    pub fn get(&self, addr: usize) -> *mut ForwardingTable {
        match self.slot_of(addr) {
            Some(i) => self.slots[i].load(Ordering::Acquire),
            None => null_mut(),
        }
    }

    pub fn install(&self, table: *mut ForwardingTable) {
        let (start, end) = unsafe {
            let page = &*(*table).page();
            (page.start(), page.end())
        };
        let first = self.slot_of(start).expect("page outside reserve");
        let last = self.slot_of(end - 1).expect("page outside reserve");
        for slot in &self.slots[first..=last] {
            slot.store(table, Ordering::Release);
        }
    }

    /// Drops every installed table reference. Called at selection time,
    /// before the new cycle's tables go in.
    pub fn clear(&self) {
        for slot in self.slots.iter() {
            slot.store(null_mut(), Ordering::Release);
        }
    }
}

/// Translates `addr` through the installed tables without forcing a
/// relocation. Addresses on unselected pages, and selected objects not yet
/// forwarded, map to themselves.
#[inline]
pub fn remap(index: &ForwardingIndex, addr: usize) -> usize {
    let table = index.get(addr);
    if table.is_null() {
        return addr;
    }
    unsafe { (*table).get(addr).unwrap_or(addr) }
}
