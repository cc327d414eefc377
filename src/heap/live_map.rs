use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Per-page mark state: two bits per granule. The low bit of each pair
/// records liveness (reachable at all, possibly only through a finalizable
/// reference), the high bit strong reachability. The map is reset lazily:
/// the first marker that touches a page in a new cycle clears it, so idle
/// pages cost nothing at mark start.
pub struct LiveMap {
    seqnum: AtomicU32,
    reset_lock: Mutex<()>,
    live_objects: AtomicUsize,
    live_bytes: AtomicUsize,
    bits: Box<[AtomicU64]>,
}

const BITS_PER_GRANULE: usize = 2;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MarkResult {
    /// First time any marker reached this object in the current cycle.
    pub newly_live: bool,
    /// First time it was reached through a strong path.
    pub newly_strong: bool,
}

impl LiveMap {
    pub fn new(granules: usize) -> Self {
        let words = (granules * BITS_PER_GRANULE + 63) / 64;
        Self {
            seqnum: AtomicU32::new(0),
            reset_lock: Mutex::new(()),
            live_objects: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
            bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Whether the map holds committed results for `cycle`.
    pub fn is_current(&self, cycle: u32) -> bool {
        self.seqnum.load(Ordering::Acquire) == cycle
    }

    /// Clears the map for `cycle` if it still holds an older cycle's bits.
    pub fn reset_for(&self, cycle: u32) {
        if self.is_current(cycle) {
            return;
        }

        let _guard = self.reset_lock.lock();
        if self.is_current(cycle) {
            return;
        }

        for w in self.bits.iter() {
            w.store(0, Ordering::Relaxed);
        }
        self.live_objects.store(0, Ordering::Relaxed);
        self.live_bytes.store(0, Ordering::Relaxed);
        self.seqnum.store(cycle, Ordering::Release);
    }

    #[inline]
    fn index(granule: usize) -> (usize, u32) {
        let bit = granule * BITS_PER_GRANULE;
        (bit / 64, (bit % 64) as u32)
    }

    /// Marks the object starting at `granule`. Idempotent; racing markers
    /// all observe a consistent first-marker outcome through the returned
    /// flags.
    pub fn mark(&self, granule: usize, finalizable: bool) -> MarkResult {
        let (word, shift) = Self::index(granule);
        let live = 1u64 << shift;
        let strong = 1u64 << (shift + 1);

        let mask = if finalizable { live } else { live | strong };
        let old = self.bits[word].fetch_or(mask, Ordering::AcqRel);

        MarkResult {
            newly_live: old & live == 0,
            newly_strong: !finalizable && old & strong == 0,
        }
    }

    pub fn is_live(&self, granule: usize) -> bool {
        let (word, shift) = Self::index(granule);
        self.bits[word].load(Ordering::Acquire) & (1 << shift) != 0
    }

    pub fn is_strongly_live(&self, granule: usize) -> bool {
        let (word, shift) = Self::index(granule);
        self.bits[word].load(Ordering::Acquire) & (1 << (shift + 1)) != 0
    }

    /// Account one newly live object. Called exactly once per object, by
    /// whichever marker won the `newly_live` race.
    pub fn inc_live(&self, bytes: usize) {
        self.live_objects.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn live_objects(&self) -> usize {
        self.live_objects.load(Ordering::Relaxed)
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Visits every live granule index in ascending order.
    pub fn iter_live(&self, mut f: impl FnMut(usize)) {
        for (w, word) in self.bits.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                if bit % BITS_PER_GRANULE == 0 {
                    f((w * 64 + bit) / BITS_PER_GRANULE);
                }
                bits &= bits - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_is_idempotent() {
        let map = LiveMap::new(64);
        map.reset_for(1);

        let first = map.mark(3, false);
        assert!(first.newly_live && first.newly_strong);

        let second = map.mark(3, false);
        assert!(!second.newly_live && !second.newly_strong);

        assert!(map.is_live(3));
        assert!(map.is_strongly_live(3));
        assert!(!map.is_live(2));
    }

    #[test]
    fn finalizable_then_strong() {
        let map = LiveMap::new(64);
        map.reset_for(1);

        let weak = map.mark(5, true);
        assert!(weak.newly_live && !weak.newly_strong);
        assert!(map.is_live(5));
        assert!(!map.is_strongly_live(5));

        let strong = map.mark(5, false);
        assert!(!strong.newly_live && strong.newly_strong);
        assert!(map.is_strongly_live(5));
    }

    #[test]
    fn reset_clears_previous_cycle() {
        let map = LiveMap::new(64);
        map.reset_for(1);
        map.mark(0, false);
        map.inc_live(32);
        assert!(map.is_current(1));

        map.reset_for(2);
        assert!(!map.is_live(0));
        assert_eq!(map.live_objects(), 0);
        assert_eq!(map.live_bytes(), 0);
    }

    #[test]
    fn iter_live_visits_marked_granules() {
        let map = LiveMap::new(256);
        map.reset_for(1);
        for g in [0usize, 31, 32, 200] {
            map.mark(g, false);
        }

        let mut seen = vec![];
        map.iter_live(|g| seen.push(g));
        assert_eq!(seen, vec![0, 31, 32, 200]);
    }
}
