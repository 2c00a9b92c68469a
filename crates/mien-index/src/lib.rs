//! mien-index — In-memory nearest-neighbor index over face embeddings.
//!
//! A flat (brute-force) squared-L2 index with a parallel identity mapping,
//! mirroring the durable embedding catalogue. The index is a disposable
//! cache: it is append-only for the lifetime of the process and is purged
//! of stale entries only by a full [`rebuild`].

pub mod flat;
pub mod rebuild;

pub use flat::{FlatIndex, IndexError, SearchHits, NO_POSITION};
pub use rebuild::{rebuild, Rebuild};
