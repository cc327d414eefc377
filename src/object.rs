use std::mem::size_of;
use std::sync::atomic::AtomicUsize;

use crate::heap::GRANULE;

/// Header word at the start of every heap object. The layout after the
/// header is `ref_count` reference slots (one word each, holding colored
/// references) followed by raw payload bytes. Keeping the reference slots
/// in a header-described prefix is what lets the marker and the relocator
/// trace objects without a per-type vtable.
#[repr(C)]
pub struct ObjectHeader {
    size: u32,
    ref_count: u32,
}

/// `ref_count` value reserved for filler objects: dead ranges written over
/// retired TLAB tails and abandoned relocation copies so pages stay
/// linearly parseable.
const FILLER: u32 = u32::MAX;

impl ObjectHeader {
    pub const SIZE: usize = size_of::<ObjectHeader>();

    /// Total object size for a payload of `body` bytes and `refs` reference
    /// slots, rounded up to the heap granule.
    pub const fn object_size(body: usize, refs: usize) -> usize {
        let raw = Self::SIZE + refs * size_of::<usize>() + body;
        (raw + GRANULE - 1) & !(GRANULE - 1)
    }

    /// Writes a header at `addr` and zeroes the reference slots.
    ///
    /// # Safety
    ///
    /// `addr` must be granule-aligned and point at `size` writable bytes.
    pub unsafe fn initialize(addr: usize, size: usize, refs: usize) {
        debug_assert!(addr % GRANULE == 0);
        debug_assert!(size >= Self::object_size(0, refs));

        let header = addr as *mut ObjectHeader;
        header.write(ObjectHeader {
            size: size as u32,
            ref_count: refs as u32,
        });

        let slots = (addr + Self::SIZE) as *mut usize;
        for i in 0..refs {
            slots.add(i).write(0);
        }
    }

    /// Writes a filler header covering `[addr, addr + size)`.
    ///
    /// # Safety
    ///
    /// Same as `initialize`; the covered range must hold no live object.
    pub unsafe fn fill_dead(addr: usize, size: usize) {
        debug_assert!(size >= Self::SIZE && size % GRANULE == 0);
        let header = addr as *mut ObjectHeader;
        header.write(ObjectHeader {
            size: size as u32,
            ref_count: FILLER,
        });
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn ref_count(&self) -> usize {
        if self.is_filler() {
            0
        } else {
            self.ref_count as usize
        }
    }

    pub fn is_filler(&self) -> bool {
        self.ref_count == FILLER
    }

    /// # Safety
    ///
    /// `i < self.ref_count()` and the object memory must outlive the
    /// returned borrow.
    pub unsafe fn ref_slot(&self, i: usize) -> &AtomicUsize {
        debug_assert!(i < self.ref_count());
        let base = (self as *const ObjectHeader as usize) + Self::SIZE;
        &*((base + i * size_of::<usize>()) as *const AtomicUsize)
    }

    /// Address of the payload area, after header and reference slots.
    pub fn payload(&self) -> usize {
        self as *const ObjectHeader as usize + Self::SIZE + self.ref_count() * size_of::<usize>()
    }
}

/// # Safety
///
/// `addr` must point at an initialized object header.
pub unsafe fn header<'a>(addr: usize) -> &'a ObjectHeader {
    &*(addr as *const ObjectHeader)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_size_is_granule_aligned() {
        assert_eq!(ObjectHeader::object_size(0, 0), GRANULE);
        assert_eq!(ObjectHeader::object_size(1, 0), GRANULE);
        assert_eq!(ObjectHeader::object_size(8, 1), 32);
        assert!(ObjectHeader::object_size(100, 3) % GRANULE == 0);
    }

    #[test]
    fn initialize_and_read_back() {
        let mut backing = vec![0u8; 64];
        let addr = crate::base::round_up(backing.as_mut_ptr() as usize, GRANULE);

        unsafe {
            ObjectHeader::initialize(addr, 48, 2);
            let h = header(addr);
            assert_eq!(h.size(), 48);
            assert_eq!(h.ref_count(), 2);
            assert!(!h.is_filler());
            assert_eq!(
                h.ref_slot(1).load(std::sync::atomic::Ordering::Relaxed),
                0
            );

            ObjectHeader::fill_dead(addr, 48);
            assert!(header(addr).is_filler());
            assert_eq!(header(addr).ref_count(), 0);
        }
    }
}
