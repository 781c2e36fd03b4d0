//! Retrieval index: artifact chunking, vector search, and the
//! content-addressed cache that keeps indices in sync with their artifacts.

pub mod ann;
pub mod cache;
pub mod chunk;

pub use ann::{SearchHit, VectorIndex};
pub use cache::{IndexCacheError, IndexOutcome, RetrievalIndexCache};
pub use chunk::{Chunk, ChunkError};
