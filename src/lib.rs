//! A concurrent mark-relocate heap.
//!
//! The heap traces and compacts memory while mutator threads keep running;
//! the only synchronous points are two bounded bookkeeping pauses at mark
//! start and relocate start. References are colored: the low bits of every
//! heap reference carry an epoch tag, and any reference observed with a
//! stale tag is healed in place by the read barrier before use.
//!
//! The entry point is [`heap::heap::Heap`]; mutators allocate through an
//! [`heap::object_allocator::AllocContext`] and touch reference slots only
//! through `Heap::load_ref` / `Heap::store_ref`.

pub mod base;
pub mod heap;
pub mod object;
pub mod sync;

pub use base::formatted_size;
pub use heap::heap::Heap;
pub use heap::page::{HeapArguments, HeapOptions};
pub use heap::AllocError;
