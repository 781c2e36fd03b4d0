//! Cross-cutting application constants.

/// Currency code used when detection yields anything but a valid ISO 4217 code.
pub const FALLBACK_CURRENCY: &str = "USD";

/// Location assumed when a request omits one.
pub const DEFAULT_LOCATION: &str = "USA";

/// Dimensionality of embeddings produced by the default embedder.
pub const DEFAULT_EMBEDDING_DIM: usize = 768;

/// Characters per retrieval chunk.
pub const DEFAULT_CHUNK_SIZE_CHARS: usize = 1000;

/// Characters carried over between consecutive chunks.
pub const DEFAULT_CHUNK_OVERLAP_CHARS: usize = 150;

/// Chunks returned by a similarity search unless the caller asks otherwise.
pub const DEFAULT_TOP_K: usize = 10;
