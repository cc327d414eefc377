//! Colored references.
//!
//! Every reference stored in a heap slot is an object address with a small
//! color packed into the low bits (objects are granule-aligned, so the low
//! four bits are always free). The color records which cycle epoch last
//! proved the reference valid:
//!
//! - `MARKED0` / `MARKED1`: validated by marking in an even / odd cycle.
//! - `REMAPPED`: validated against the relocation of the last cycle.
//! - `FINALIZABLE`: reachable only through a finalizable reference.
//!
//! Exactly one of the three epoch bits is "good" at any time. The good bit
//! alternates between the marked bits at `mark_start` and switches to
//! `REMAPPED` at `relocate_start`; a reference wearing anything else is
//! stale and must be healed through the read barrier before use.

use std::sync::atomic::{AtomicUsize, Ordering};

pub const MARKED0: usize = 0b0001;
pub const MARKED1: usize = 0b0010;
pub const REMAPPED: usize = 0b0100;
pub const FINALIZABLE: usize = 0b1000;

const EPOCH_MASK: usize = MARKED0 | MARKED1 | REMAPPED;
const COLOR_MASK: usize = EPOCH_MASK | FINALIZABLE;

#[inline(always)]
pub const fn untag(r: usize) -> usize {
    r & !COLOR_MASK
}

#[inline(always)]
pub const fn color(r: usize) -> usize {
    r & COLOR_MASK
}

#[inline(always)]
pub const fn tag(addr: usize, color: usize) -> usize {
    debug_assert!(addr & COLOR_MASK == 0);
    addr | color
}

#[inline(always)]
pub const fn is_finalizable(r: usize) -> bool {
    r & FINALIZABLE != 0
}

/// True when a stale reference may still need translation through the
/// previous cycle's forwarding tables. Only a reference wearing a marked
/// color can predate the last relocation; a `REMAPPED`-colored reference was
/// already translated, and the leftover tables must not be applied to it —
/// the ranges they cover may since have been recycled for new pages.
#[inline(always)]
pub const fn needs_remap(r: usize) -> bool {
    r & REMAPPED == 0
}

/// The heap-wide color epoch. Flipped only inside the two synchronous
/// pause points.
pub struct ColorEpoch {
    good: AtomicUsize,
}

impl ColorEpoch {
    pub fn new() -> Self {
        // Before the first cycle nothing has ever been relocated, so every
        // reference is trivially remapped.
        Self {
            good: AtomicUsize::new(REMAPPED),
        }
    }

    pub fn good_color(&self) -> usize {
        self.good.load(Ordering::Acquire)
    }

    /// True while the good color is one of the marked epochs, i.e. between
    /// `mark_start` and `relocate_start`.
    pub fn is_mark_epoch(&self) -> bool {
        self.good_color() & (MARKED0 | MARKED1) != 0
    }

    #[inline(always)]
    pub fn is_good(&self, r: usize) -> bool {
        r & EPOCH_MASK == self.good_color()
    }

    #[inline(always)]
    pub fn tag_good(&self, addr: usize) -> usize {
        tag(addr, self.good_color())
    }

    pub fn flip_to_marked(&self, cycle: u32) {
        let bit = if cycle & 1 == 0 { MARKED0 } else { MARKED1 };
        self.good.store(bit, Ordering::Release);
    }

    pub fn flip_to_remapped(&self) {
        self.good.store(REMAPPED, Ordering::Release);
    }
}

impl Default for ColorEpoch {
    fn default() -> Self {
        Self::new()
    }
}
