use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::sync::monitor::Monitor;

use super::heap::Heap;
use super::shared_vars::SharedFlag;

struct State {
    should_terminate: AtomicBool,
    gc_requested: SharedFlag,
    heap_changed: SharedFlag,
    completed: AtomicUsize,
    /// The controller sleeps here; allocation stalls and explicit requests
    /// notify it to re-evaluate immediately.
    wake: Arc<Monitor<()>>,
    gc_waiters: Monitor<()>,
}

/// Background control thread. Wakes up on an adaptive interval (or when
/// poked by a stalled allocation), decides whether a cycle is warranted,
/// and drives the heap through one. Holds only a weak heap handle so the
/// heap can be dropped while the controller is asleep.
pub struct Controller {
    state: Arc<State>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    pub fn spawn(heap: &Arc<Heap>) -> Controller {
        let state = Arc::new(State {
            should_terminate: AtomicBool::new(false),
            gc_requested: SharedFlag::new(),
            heap_changed: SharedFlag::new(),
            completed: AtomicUsize::new(0),
            wake: Arc::new(Monitor::new(())),
            gc_waiters: Monitor::new(()),
        });
        heap.page_allocator().set_cycle_waker(state.wake.clone());

        let weak = Arc::downgrade(heap);
        let run_state = state.clone();
        let handle = std::thread::spawn(move || run(weak, run_state));

        Controller {
            state,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Nudges the adaptive sleep back to its minimum; called on allocation
    /// activity so heuristics re-evaluate fresh conditions sooner.
    pub fn notify_heap_changed(&self) {
        if self.state.heap_changed.is_unset() {
            self.state.heap_changed.set();
        }
    }

    /// Requests a cycle and blocks until one started after this call has
    /// completed.
    pub fn request_gc(&self) {
        let mut waiters = self.state.gc_waiters.lock();
        let target = self.state.completed.load(Ordering::Acquire) + 1;
        self.state.gc_requested.set();
        self.state.wake.lock().notify_all();

        while self.state.completed.load(Ordering::Acquire) < target {
            waiters.wait();
        }
    }

    pub fn stop(&self) {
        self.state.should_terminate.store(true, Ordering::Release);
        self.state.wake.lock().notify_all();
        if let Some(handle) = self.handle.lock().take() {
            // The controller thread itself may drop the last heap handle;
            // it cannot join itself.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(heap: Weak<Heap>, state: Arc<State>) {
    let mut sleep;
    let (interval_min, interval_max, adjust_period) = match heap.upgrade() {
        Some(heap) => {
            let opts = heap.options();
            (
                opts.control_interval_min,
                opts.control_interval_max,
                opts.control_interval_adjust_period,
            )
        }
        None => return,
    };
    sleep = interval_min;
    let mut last_sleep_adjust = Instant::now();

    while !state.should_terminate.load(Ordering::Acquire) {
        let Some(heap) = heap.upgrade() else { break };

        let stall_pending = heap.page_allocator().poll_cycle_request();
        let explicit = state.gc_requested.is_set();

        let trigger = if stall_pending {
            Some("Allocation stall")
        } else if explicit {
            Some("Explicit request")
        } else if heap.used() > heap.soft_max_capacity() {
            Some("Soft capacity limit")
        } else if heap.used() * 100 >= heap.options().allocation_threshold * heap.max_capacity() {
            Some("Allocation threshold")
        } else {
            None
        };

        if let Some(trigger) = trigger {
            log::info!(target: "gc", "Trigger: {}", trigger);
            heap.collect();

            state.completed.fetch_add(1, Ordering::Release);
            if explicit {
                state.gc_requested.unset();
            }
            state.gc_waiters.lock().notify_all();
            sleep = interval_min;
        }
        drop(heap);

        // Back off exponentially while idle, snap back on activity.
        let now = Instant::now();
        if state.heap_changed.try_unset() {
            sleep = interval_min;
        } else if (now - last_sleep_adjust).as_millis() as u64 > adjust_period {
            sleep = interval_max.min(sleep * 2);
            last_sleep_adjust = now;
        }

        let mut guard = state.wake.lock();
        if !state.should_terminate.load(Ordering::Acquire)
            && state.gc_requested.is_unset()
        {
            guard.wait_for(Duration::from_millis(sleep));
        }
    }

    log::debug!(target: "gc", "Controller thread terminated");
}
