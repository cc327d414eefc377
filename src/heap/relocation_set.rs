use crate::base::formatted_size;

use super::forwarding::{ForwardingIndex, ForwardingTable, RelocationState};
use super::page::PageKind;
use super::page_allocator::PageAllocator;

/// The pages chosen for compaction this cycle, immutable once built. Each
/// selected page carries a pre-sized forwarding table, installed in the
/// forwarding index for barrier access. The set (and with it the tables)
/// is kept until the next cycle's selection, so references healed late
/// still find their forwarding entries.
pub struct RelocationSet {
    tables: Vec<Box<ForwardingTable>>,
    expected_reclaim: usize,
}

impl RelocationSet {
    pub fn empty() -> Self {
        Self {
            tables: Vec::new(),
            expected_reclaim: 0,
        }
    }

    pub fn tables(&self) -> &[Box<ForwardingTable>] {
        &self.tables
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn expected_reclaim(&self) -> usize {
        self.expected_reclaim
    }
}

/// Builds the relocation set from the committed mark statistics of
/// `cycle`. Pages proven fully garbage are freed on the spot, whatever
/// their size class. The rest are ranked by garbage ratio and picked
/// greedily while they stay above the profitability threshold and the
/// reclaim target is unmet. Large pages are never compacted; an empty
/// selection is a valid outcome.
pub fn select(pa: &PageAllocator, forwardings: &ForwardingIndex, cycle: u32) -> RelocationSet {
    let opts = *pa.options();

    // Entries of the previous cycle are fully healed by now (marking
    // remapped every live reference); drop them before the new tables go
    // in.
    forwardings.clear();

    let mut candidates = Vec::new();
    let mut freed_empty = 0usize;

    for page_ptr in pa.pages() {
        let page = unsafe { &*page_ptr };
        if page.seqnum() == cycle {
            // Born during this cycle's marking; everything in it is live.
            continue;
        }

        let live_map = page.live_map();
        let live_bytes = if live_map.is_current(cycle) {
            live_map.live_bytes()
        } else {
            // The marker never reached an object here.
            0
        };

        if live_bytes == 0 {
            freed_empty += page.size();
            pa.free_page(page_ptr, true);
            continue;
        }
        if page.kind() == PageKind::Large {
            continue;
        }
        candidates.push((page_ptr, page.size() - live_bytes));
    }

    candidates.sort_by(|a, b| b.1.cmp(&a.1));

    // Aim at getting back under the soft limit, and always at least one
    // page's worth, so steady fragmentation cannot accumulate unchecked.
    let reclaim_target = pa
        .used()
        .saturating_sub(opts.soft_max_capacity)
        .max(opts.page_granule);

    let mut tables = Vec::new();
    let mut expected_reclaim = 0usize;
    for (page_ptr, garbage) in candidates {
        if expected_reclaim >= reclaim_target {
            break;
        }
        let size = unsafe { (*page_ptr).size() };
        if garbage * 100 <= size * opts.fragmentation_limit {
            // Ranked descending; everything after this is worse.
            break;
        }
        let table = ForwardingTable::new(page_ptr);
        table.set_state(RelocationState::Pending);
        forwardings.install(&*table as *const ForwardingTable as *mut ForwardingTable);
        expected_reclaim += garbage;
        tables.push(table);
    }

    log::info!(
        target: "gc",
        "Relocation set: {} pages, expecting {} (freed {} empty)",
        tables.len(),
        formatted_size(expected_reclaim),
        formatted_size(freed_empty)
    );

    RelocationSet {
        tables,
        expected_reclaim,
    }
}
