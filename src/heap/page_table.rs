use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, Ordering};

use super::page::Page;

/// Address-to-page index over the reserved heap span, one slot per
/// small-page granule. Lookups are single atomic loads and never block;
/// insert/remove cover every granule a page spans and are serialized by the
/// page allocator, which is the only mutator of the table.
pub struct PageTable {
    base: usize,
    shift: usize,
    slots: Box<[AtomicPtr<Page>]>,
}

impl PageTable {
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

    /// Page covering `addr`, or null for addresses outside any allocated
    /// page.
    #[inline]
    pub fn get(&self, addr: usize) -> *mut Page {
        match self.slot_of(addr) {
            Some(i) => self.slots[i].load(Ordering::Acquire),
            None => null_mut(),
        }
    }

    pub fn insert(&self, page: *mut Page) {
        let (start, end) = unsafe { ((*page).start(), (*page).end()) };
        let first = self.slot_of(start).expect("page outside reserve");
        let last = self.slot_of(end - 1).expect("page outside reserve");
        for slot in &self.slots[first..=last] {
            slot.store(page, Ordering::Release);
        }
    }

    pub fn remove(&self, page: *mut Page) {
        let (start, end) = unsafe { ((*page).start(), (*page).end()) };
        let first = self.slot_of(start).expect("page outside reserve");
        let last = self.slot_of(end - 1).expect("page outside reserve");
        for slot in &self.slots[first..=last] {
            debug_assert_eq!(slot.load(Ordering::Relaxed), page);
            slot.store(null_mut(), Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::page::PageKind;

    #[test]
    fn insert_covers_every_granule() {
        const GRANULE: usize = 4096;
        let table = PageTable::new(0x100000, 16 * GRANULE, 12);

        let small = Page::new(0x100000, GRANULE, PageKind::Small, 0);
        let large = Page::new(0x100000 + GRANULE, 3 * GRANULE, PageKind::Large, 0);
        let small_ptr = Box::into_raw(small);
        let large_ptr = Box::into_raw(large);

        table.insert(small_ptr);
        table.insert(large_ptr);

        assert_eq!(table.get(0x100000), small_ptr);
        assert_eq!(table.get(0x100000 + GRANULE - 1), small_ptr);
        assert_eq!(table.get(0x100000 + GRANULE), large_ptr);
        assert_eq!(table.get(0x100000 + 3 * GRANULE + 100), large_ptr);
        assert!(table.get(0x100000 + 4 * GRANULE).is_null());
        assert!(table.get(0x1000).is_null());
        assert!(table.get(usize::MAX).is_null());

        table.remove(large_ptr);
        assert!(table.get(0x100000 + 2 * GRANULE).is_null());
        assert_eq!(table.get(0x100000), small_ptr);

        unsafe {
            drop(Box::from_raw(small_ptr));
            drop(Box::from_raw(large_ptr));
        }
    }
}
