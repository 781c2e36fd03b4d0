//! Content-addressed cache of retrieval indices.
//!
//! An index is derived from one artifact and validated by a fingerprint of
//! the artifact bytes. The hot path serves a loaded index without touching
//! storage; a miss reloads the persisted index when its fingerprint still
//! matches, and rebuilds it from scratch otherwise. Concurrent builds of
//! the same key are serialized; distinct keys build in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use bincode::config;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::index::ann::{SearchHit, VectorIndex};
use crate::index::chunk::{chunk_records, parse_artifact, Chunk, ChunkError};
use crate::services::embed::{EmbedClient, EmbedError, EmbedTask};
use crate::services::object_store::{
    fingerprint_marker_key, index_blob_key, ObjectStore, ObjectStoreError,
};

/// Chunks embedded per request while rebuilding.
const EMBED_BATCH: usize = 32;

type CacheKey = (String, String);

#[derive(Debug, Error)]
pub enum IndexCacheError {
    #[error(transparent)]
    Objects(#[from] ObjectStoreError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Embed(#[from] EmbedError),
    #[error("index serialization failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),
}

/// What a cache lookup produced.
#[derive(Debug, Clone)]
pub enum IndexOutcome {
    Ready(Arc<VectorIndex>),
    /// The artifact is missing or holds nothing indexable.
    NoContent,
}

/// In-process cache over persisted retrieval indices.
#[derive(bon::Builder)]
pub struct RetrievalIndexCache {
    objects: Arc<dyn ObjectStore>,
    embed: Arc<dyn EmbedClient>,
    dim: usize,
    chunk_size_chars: usize,
    chunk_overlap_chars: usize,
    /// Loaded indices kept in process; 0 keeps every index.
    #[builder(default = 0)]
    cache_capacity: usize,
    #[builder(skip)]
    loaded: RwLock<HashMap<CacheKey, Arc<VectorIndex>>>,
    #[builder(skip)]
    building: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl RetrievalIndexCache {
    /// Return the index for an artifact, reloading or rebuilding as needed.
    pub async fn get_or_build(
        &self,
        user_id: &str,
        artifact_key: &str,
    ) -> Result<IndexOutcome, IndexCacheError> {
        debug_assert!(!user_id.is_empty());
        let key: CacheKey = (user_id.to_string(), artifact_key.to_string());

        // Hot path: a loaded index is trusted without a fingerprint check.
        if let Some(index) = self.loaded.read().await.get(&key) {
            return Ok(IndexOutcome::Ready(Arc::clone(index)));
        }

        let build_lock = {
            let mut building = self.building.lock().await;
            Arc::clone(building.entry(key.clone()).or_default())
        };
        let outcome = {
            let _guard = build_lock.lock().await;
            self.load_or_build(&key, user_id, artifact_key).await
        };
        drop(build_lock);

        // Retire the per-key mutex once nobody is waiting on it, so the map
        // holds entries only for builds in flight.
        let mut building = self.building.lock().await;
        if building.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            building.remove(&key);
        }
        outcome
    }

    async fn load_or_build(
        &self,
        key: &CacheKey,
        user_id: &str,
        artifact_key: &str,
    ) -> Result<IndexOutcome, IndexCacheError> {
        // A concurrent builder may have finished while this one waited.
        if let Some(index) = self.loaded.read().await.get(key) {
            return Ok(IndexOutcome::Ready(Arc::clone(index)));
        }

        let bytes = match self.objects.download(artifact_key).await {
            Ok(bytes) => bytes,
            Err(ObjectStoreError::NotFound(_)) => return Ok(IndexOutcome::NoContent),
            Err(err) => return Err(err.into()),
        };
        if bytes.is_empty() {
            return Ok(IndexOutcome::NoContent);
        }
        let records = parse_artifact(&bytes)?;
        if records.is_empty() {
            return Ok(IndexOutcome::NoContent);
        }

        let fingerprint = blake3::hash(&bytes).to_hex().to_string();
        if let Some(index) = self.try_reload(user_id, artifact_key, &fingerprint).await {
            self.store(key.clone(), Arc::clone(&index)).await;
            return Ok(IndexOutcome::Ready(index));
        }

        let chunks = chunk_records(&records, self.chunk_size_chars, self.chunk_overlap_chars);
        let index = Arc::new(self.rebuild(chunks).await);
        self.persist(user_id, artifact_key, &fingerprint, &index)
            .await?;
        self.store(key.clone(), Arc::clone(&index)).await;
        info!(user_id, artifact_key, vectors = index.len(), "retrieval index rebuilt");
        Ok(IndexOutcome::Ready(index))
    }

    /// Embed a query and return the best-matching chunks, or `None` when
    /// the artifact holds nothing indexable.
    pub async fn search(
        &self,
        user_id: &str,
        artifact_key: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Option<Vec<SearchHit>>, IndexCacheError> {
        let index = match self.get_or_build(user_id, artifact_key).await? {
            IndexOutcome::Ready(index) => index,
            IndexOutcome::NoContent => return Ok(None),
        };
        if index.is_empty() {
            return Ok(Some(Vec::new()));
        }
        let vectors = self.embed.embed_batch(&[query], EmbedTask::Query).await?;
        let Some(query_vector) = vectors.into_iter().next() else {
            return Err(IndexCacheError::Embed(EmbedError::message(
                "query embedding came back empty",
            )));
        };
        if query_vector.len() != self.dim {
            return Err(IndexCacheError::Embed(EmbedError::message(format!(
                "expected query embedding dimension {}, got {}",
                self.dim,
                query_vector.len()
            ))));
        }
        Ok(Some(index.search(&query_vector, top_k)))
    }

    /// Drop the in-process copy so the next lookup revalidates storage.
    pub async fn invalidate(&self, user_id: &str, artifact_key: &str) {
        let key: CacheKey = (user_id.to_string(), artifact_key.to_string());
        if self.loaded.write().await.remove(&key).is_some() {
            debug!(user_id, artifact_key, "loaded index invalidated");
        }
    }

    /// Reload the persisted index if its fingerprint marker matches the
    /// current artifact bytes. Any failure falls back to a rebuild.
    async fn try_reload(
        &self,
        user_id: &str,
        artifact_key: &str,
        fingerprint: &str,
    ) -> Option<Arc<VectorIndex>> {
        let marker_key = fingerprint_marker_key(user_id, artifact_key);
        let stored = match self.objects.download(&marker_key).await {
            Ok(bytes) => String::from_utf8(bytes).ok()?,
            Err(ObjectStoreError::NotFound(_)) => return None,
            Err(err) => {
                warn!(user_id, artifact_key, error = %err, "fingerprint marker unreadable");
                return None;
            }
        };
        if stored.trim() != fingerprint {
            debug!(user_id, artifact_key, "artifact changed since the index was built");
            return None;
        }

        let blob_key = index_blob_key(user_id, artifact_key);
        let blob = match self.objects.download(&blob_key).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(user_id, artifact_key, error = %err, "persisted index unreadable");
                return None;
            }
        };
        match bincode::serde::decode_from_slice::<VectorIndex, _>(&blob, config::standard()) {
            Ok((index, _)) if index.dim() == self.dim => Some(Arc::new(index)),
            Ok(_) => {
                warn!(user_id, artifact_key, "persisted index has a stale dimension");
                None
            }
            Err(err) => {
                warn!(user_id, artifact_key, error = %err, "persisted index corrupt");
                None
            }
        }
    }

    /// Embed every chunk in bounded batches and assemble the index. A batch
    /// whose embedding fails is skipped, leaving a partial index.
    async fn rebuild(&self, chunks: Vec<Chunk>) -> VectorIndex {
        let batches: Vec<Vec<Chunk>> = chunks
            .chunks(EMBED_BATCH)
            .map(<[Chunk]>::to_vec)
            .collect();

        let futures = batches.into_iter().map(|batch| {
            let embed = Arc::clone(&self.embed);
            async move {
                let texts: Vec<&str> = batch.iter().map(|chunk| chunk.text.as_str()).collect();
                match embed.embed_batch(&texts, EmbedTask::Document).await {
                    Ok(vectors) => Some((batch, vectors)),
                    Err(err) => {
                        warn!(error = %err, batch_len = batch.len(), "embedding batch skipped");
                        None
                    }
                }
            }
        });

        let mut index = VectorIndex::new(self.dim);
        for outcome in join_all(futures).await.into_iter().flatten() {
            let (batch, vectors) = outcome;
            for (chunk, vector) in batch.into_iter().zip(vectors.into_iter()) {
                if vector.len() != self.dim {
                    warn!(expected = self.dim, got = vector.len(), "vector skipped");
                    continue;
                }
                index.insert(vector, chunk);
            }
        }
        index
    }

    async fn persist(
        &self,
        user_id: &str,
        artifact_key: &str,
        fingerprint: &str,
        index: &VectorIndex,
    ) -> Result<(), IndexCacheError> {
        let blob = bincode::serde::encode_to_vec(index, config::standard())?;
        self.objects
            .upload(&index_blob_key(user_id, artifact_key), &blob)
            .await?;
        // Marker last: a crash in between leaves a stale marker pointing at
        // the old fingerprint, which forces a rebuild on the next miss.
        self.objects
            .upload(
                &fingerprint_marker_key(user_id, artifact_key),
                fingerprint.as_bytes(),
            )
            .await?;
        Ok(())
    }

    async fn store(&self, key: CacheKey, index: Arc<VectorIndex>) {
        let mut loaded = self.loaded.write().await;
        if self.cache_capacity > 0 && loaded.len() >= self.cache_capacity {
            if let Some(evicted) = loaded.keys().next().cloned() {
                loaded.remove(&evicted);
                debug!(user_id = evicted.0, artifact_key = evicted.1, "index evicted");
            }
        }
        loaded.insert(key, index);
    }
}
