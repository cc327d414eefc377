use std::sync::atomic::{AtomicU8, Ordering};

pub type SharedValue = AtomicU8;

/// One-byte flag shared between mutators, GC workers and the controller.
pub struct SharedFlag(SharedValue);

impl SharedFlag {
    pub const fn new() -> Self {
        Self(SharedValue::new(0))
    }

    pub fn set(&self) {
        self.0.store(1, Ordering::Release);
    }

    pub fn unset(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire) == 1
    }

    pub fn is_unset(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }

    pub fn set_cond(&self, c: bool) {
        if c {
            self.set();
        } else {
            self.unset();
        }
    }

    pub fn try_set(&self) -> bool {
        self.0
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn try_unset(&self) -> bool {
        self.0
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

impl Default for SharedFlag {
    fn default() -> Self {
        Self::new()
    }
}
