//! A user-space dynamic memory allocator over a single growable contiguous
//! region, built on boundary-tagged blocks and a size-segregated free-list
//! index.
//!
//! The heap is reserved from the operating system once and then grows
//! monotonically through the reservation. Every block carries its size and
//! allocation state in a header word and a matching footer word, which is
//! what makes constant-time coalescing with both physical neighbors
//! possible:
//!
//! ```text
//!          +--------+-----------------+--------+
//!          | header |     payload     | footer |
//!          +--------+-----------------+--------+
//!                   ^
//!            pointer handed to the caller
//! ```
//!
//! Freed blocks are merged eagerly with free neighbors and tracked in a
//! bucket index partitioned by size class, each bucket sorted by ascending
//! size. See [`Heap`] for the allocate / free / resize surface.
//!
//! The allocator assumes a single logical owner. There is no locking; a
//! caller that shares a [`Heap`] across threads must serialize access
//! itself.

mod block;
mod freelist;
mod heap;
mod kernel;
mod utils;

pub use block::{ALIGNMENT, MIN_BLOCK_SIZE};
pub use freelist::{BUCKET_SPAN, NUM_BUCKETS};
pub use heap::{CHUNK_SIZE, DEFAULT_CAPACITY, Heap, HeapError, MAX_CAPACITY};
