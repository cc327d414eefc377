use std::ops::{Deref, DerefMut};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Mutex + condvar in one place, HotSpot-monitor style. Allocation stalls
/// and the controller's trigger loop both wait on one of these.
pub struct Monitor<T> {
    mutex: Mutex<T>,
    cv: Condvar,
}

impl<T> Monitor<T> {
    pub const fn new(val: T) -> Self {
        Self {
            mutex: Mutex::new(val),
            cv: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MonitorGuard<'_, T> {
        MonitorGuard {
            guard: self.mutex.lock(),
            cv: &self.cv,
        }
    }

    pub fn notify_one(&self) -> bool {
        self.cv.notify_one()
    }

    pub fn notify_all(&self) -> usize {
        self.cv.notify_all()
    }
}

pub struct MonitorGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    cv: &'a Condvar,
}

impl<'a, T> MonitorGuard<'a, T> {
    pub fn wait(&mut self) {
        self.cv.wait(&mut self.guard);
    }

    /// Returns true if the wait timed out without a notification.
    pub fn wait_for(&mut self, timeout: Duration) -> bool {
        self.cv.wait_for(&mut self.guard, timeout).timed_out()
    }

    pub fn notify_all(&self) -> usize {
        self.cv.notify_all()
    }
}

impl<'a, T> Deref for MonitorGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for MonitorGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
