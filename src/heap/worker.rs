use scoped_thread_pool::Pool;

use super::shared_vars::SharedFlag;

/// The GC worker pool. The pool is sized once at heap construction;
/// `set_boost` widens the number of workers a concurrent phase employs from
/// the unboosted half to the full pool, trading mutator throughput for GC
/// latency mid-cycle.
pub struct Workers {
    pool: Pool,
    total: usize,
    boosted: SharedFlag,
}

impl Workers {
    pub fn new(total: usize) -> Self {
        let total = total.max(1);
        Self {
            pool: Pool::new(total),
            total,
            boosted: SharedFlag::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Worker count for concurrent phases, honoring the boost flag.
    pub fn active(&self) -> usize {
        if self.boosted.is_set() {
            self.total
        } else {
            (self.total / 2).max(1)
        }
    }

    pub fn set_boost(&self, boost: bool) {
        self.boosted.set_cond(boost);
    }

    pub fn is_boosted(&self) -> bool {
        self.boosted.is_set()
    }

    /// Runs `f` with a scope that can spawn worker tasks; blocks until all
    /// spawned tasks finish.
    pub fn scoped<'scope, F, R>(&self, f: F) -> R
    where
        F: FnOnce(&scoped_thread_pool::Scope<'scope>) -> R,
    {
        self.pool.scoped(f)
    }
}
