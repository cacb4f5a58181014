//! Retrieval memory: per-user, vector-indexed store of content and feedback.

pub mod embedding;
pub mod vector_store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::locks::UserLocks;
use crate::settings::MemoryConfig;

pub use embedding::{Embedder, HashEmbedder};
use vector_store::VectorStore;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MemoryError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("user id cannot be empty")]
    EmptyUserId,

    #[error("vector contains non-finite values")]
    NonFiniteVector,

    #[error("embedding failed: {0}")]
    Embedding(String),
}

/// Stable BLAKE3 hex digest used as the content key.
pub fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

/// One stored item, unique per `(user_id, content_hash)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub user_id: String,
    pub content_hash: String,
    pub embedding: Vec<f32>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn new(
        user_id: impl Into<String>,
        content_hash: impl Into<String>,
        embedding: Vec<f32>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            content_hash: content_hash.into(),
            embedding,
            metadata,
            created_at: Utc::now(),
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub users: usize,
    pub records: usize,
    pub upserts: u64,
    pub queries: u64,
    pub embedder: String,
    pub embedding_dim: usize,
}

pub struct RetrievalMemory {
    config: MemoryConfig,
    store: VectorStore,
    embedder: Arc<dyn Embedder>,
    locks: Arc<UserLocks>,
    upserts: AtomicU64,
    queries: AtomicU64,
}

impl std::fmt::Debug for RetrievalMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalMemory")
            .field("config", &self.config)
            .field("embedder", &self.embedder.name())
            .finish()
    }
}

impl RetrievalMemory {
    pub fn new(config: MemoryConfig, embedder: Arc<dyn Embedder>, locks: Arc<UserLocks>) -> Self {
        let store = VectorStore::new(config.max_records_per_user);
        Self {
            config,
            store,
            embedder,
            locks,
            upserts: AtomicU64::new(0),
            queries: AtomicU64::new(0),
        }
    }

    /// Memory backed by the bundled [`HashEmbedder`].
    pub fn with_hash_embedder(config: MemoryConfig, locks: Arc<UserLocks>) -> Self {
        let embedder = Arc::new(HashEmbedder::new(config.embedding_dim));
        Self::new(config, embedder, locks)
    }

    pub fn embedding_dim(&self) -> usize {
        self.config.embedding_dim
    }

    fn check_vector(&self, vector: &[f32]) -> Result<(), MemoryError> {
        if vector.len() != self.config.embedding_dim {
            return Err(MemoryError::DimensionMismatch {
                expected: self.config.embedding_dim,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(MemoryError::NonFiniteVector);
        }
        Ok(())
    }

    /// Idempotent insert. A record whose `(user_id, content_hash)` is already
    /// stored is left untouched.
    #[instrument(skip(self, record), fields(user_id = %record.user_id, content_hash = %record.content_hash))]
    pub async fn upsert(&self, record: MemoryRecord) -> Result<UpsertOutcome, MemoryError> {
        if record.user_id.is_empty() {
            return Err(MemoryError::EmptyUserId);
        }
        self.check_vector(&record.embedding)?;

        let _guard = self.locks.lock(&record.user_id).await;
        self.upserts.fetch_add(1, Ordering::Relaxed);
        if self.store.insert_if_absent(record) {
            Ok(UpsertOutcome::Inserted)
        } else {
            debug!("Memory record already present");
            Ok(UpsertOutcome::Unchanged)
        }
    }

    /// Up to `k` of `user_id`'s records by descending cosine similarity.
    pub fn query(
        &self,
        user_id: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredRecord>, MemoryError> {
        self.check_vector(vector)?;
        self.queries.fetch_add(1, Ordering::Relaxed);
        Ok(self.store.search(user_id, vector, k))
    }

    /// Embed `text` and store it under its content hash.
    pub async fn remember(
        &self,
        user_id: &str,
        text: &str,
        metadata: Map<String, Value>,
    ) -> Result<(String, UpsertOutcome), MemoryError> {
        let hash = content_hash(text);
        let embedding = self.embedder.embed(text).await?;
        let outcome = self
            .upsert(MemoryRecord::new(user_id, hash.clone(), embedding, metadata))
            .await?;
        Ok((hash, outcome))
    }

    /// Embed `text` and return the closest records; `k` defaults to the
    /// configured `default_k`.
    pub async fn recall(
        &self,
        user_id: &str,
        text: &str,
        k: Option<usize>,
    ) -> Result<Vec<ScoredRecord>, MemoryError> {
        let embedding = self.embedder.embed(text).await?;
        self.query(user_id, &embedding, k.unwrap_or(self.config.default_k))
    }

    pub fn len(&self, user_id: &str) -> usize {
        self.store.len(user_id)
    }

    pub fn contains(&self, user_id: &str, content_hash: &str) -> bool {
        self.store.contains(user_id, content_hash)
    }

    /// Up to `limit` of a user's records whose `kind` metadata equals `kind`,
    /// newest first.
    pub fn records_of_kind(&self, user_id: &str, kind: &str, limit: usize) -> Vec<MemoryRecord> {
        let mut records = self.store.filter(user_id, |r| {
            r.metadata.get("kind").and_then(Value::as_str) == Some(kind)
        });
        records.truncate(limit);
        records
    }

    /// Newest record of a user whose metadata `key` equals `value`.
    pub fn find_by_meta(&self, user_id: &str, key: &str, value: &str) -> Option<MemoryRecord> {
        self.store
            .filter(user_id, |r| r.metadata.get(key).and_then(Value::as_str) == Some(value))
            .into_iter()
            .next()
    }

    /// Remove everything stored for a user.
    pub async fn clear_user(&self, user_id: &str) -> usize {
        let _guard = self.locks.lock(user_id).await;
        self.store.remove_user(user_id)
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            users: self.store.users(),
            records: self.store.total(),
            upserts: self.upserts.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            embedder: self.embedder.name().to_string(),
            embedding_dim: self.config.embedding_dim,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memory(dim: usize) -> RetrievalMemory {
        let config = MemoryConfig {
            embedding_dim: dim,
            default_k: 2,
            max_records_per_user: 100,
        };
        RetrievalMemory::with_hash_embedder(config, Arc::new(UserLocks::new()))
    }

    #[tokio::test]
    async fn test_double_upsert_stores_one_record() {
        let memory = memory(3);
        let record = MemoryRecord::new("u1", "h1", vec![1.0, 0.0, 0.0], Map::new());
        assert_eq!(memory.upsert(record.clone()).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(memory.upsert(record).await.unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(memory.len("u1"), 1);
        assert_eq!(memory.stats().records, 1);
    }

    #[tokio::test]
    async fn test_query_is_scoped_and_ordered() {
        let memory = memory(3);
        let vectors = [
            ("a", vec![1.0, 0.0, 0.0]),
            ("b", vec![0.9, 0.1, 0.0]),
            ("c", vec![0.0, 1.0, 0.0]),
            ("d", vec![0.5, 0.5, 0.0]),
        ];
        for (hash, v) in vectors {
            memory
                .upsert(MemoryRecord::new("u1", hash, v, Map::new()))
                .await
                .unwrap();
        }
        memory
            .upsert(MemoryRecord::new("u2", "z", vec![1.0, 0.0, 0.0], Map::new()))
            .await
            .unwrap();

        let hits = memory.query("u1", &[1.0, 0.0, 0.0], 3).unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.record.user_id == "u1"));
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(hits[0].record.content_hash, "a");

        assert!(memory.query("nobody", &[1.0, 0.0, 0.0], 3).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dimension_and_user_validation() {
        let memory = memory(3);
        let err = memory
            .upsert(MemoryRecord::new("u1", "h", vec![1.0], Map::new()))
            .await
            .unwrap_err();
        assert_eq!(err, MemoryError::DimensionMismatch { expected: 3, actual: 1 });
        assert!(memory.query("u1", &[1.0, 0.0], 1).is_err());
        assert_eq!(
            memory
                .upsert(MemoryRecord::new("", "h", vec![0.0; 3], Map::new()))
                .await
                .unwrap_err(),
            MemoryError::EmptyUserId
        );
        assert_eq!(
            memory
                .upsert(MemoryRecord::new("u1", "h", vec![f32::NAN, 0.0, 0.0], Map::new()))
                .await
                .unwrap_err(),
            MemoryError::NonFiniteVector
        );
    }

    #[tokio::test]
    async fn test_remember_recall_and_clear() {
        let memory = memory(64);
        let mut meta = Map::new();
        meta.insert("kind".to_string(), json!("article"));
        let (hash, outcome) = memory
            .remember("u1", "rust borrow checker deep dive", meta.clone())
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert_eq!(hash, content_hash("rust borrow checker deep dive"));
        let (_, again) = memory
            .remember("u1", "rust borrow checker deep dive", meta)
            .await
            .unwrap();
        assert_eq!(again, UpsertOutcome::Unchanged);
        memory
            .remember("u1", "central bank interest rates", Map::new())
            .await
            .unwrap();

        let hits = memory.recall("u1", "borrow checker", None).await.unwrap();
        assert_eq!(hits[0].record.content_hash, hash);
        assert_eq!(hits[0].record.metadata["kind"], "article");

        assert_eq!(memory.clear_user("u1").await, 2);
        assert_eq!(memory.len("u1"), 0);
    }

    #[tokio::test]
    async fn test_records_of_kind_newest_first() {
        let memory = memory(3);
        let now = Utc::now();
        for (i, kind) in ["digest", "article", "digest", "digest"].iter().enumerate() {
            let mut meta = Map::new();
            meta.insert("kind".to_string(), json!(kind));
            meta.insert("content_id".to_string(), json!(format!("c{}", i)));
            let record = MemoryRecord::new("u1", format!("h{}", i), vec![1.0, 0.0, 0.0], meta)
                .with_created_at(now + chrono::Duration::seconds(i as i64));
            memory.upsert(record).await.unwrap();
        }

        let digests = memory.records_of_kind("u1", "digest", 2);
        let ids: Vec<&str> = digests
            .iter()
            .map(|r| r.metadata["content_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["c3", "c2"]);
        assert!(memory.records_of_kind("u2", "digest", 5).is_empty());

        let found = memory.find_by_meta("u1", "content_id", "c1").unwrap();
        assert_eq!(found.metadata["kind"], "article");
        assert!(memory.find_by_meta("u1", "content_id", "missing").is_none());
    }
}
