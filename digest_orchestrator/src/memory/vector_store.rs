//! Per-user in-memory vector store with brute-force cosine search.

use dashmap::DashMap;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

use super::{MemoryRecord, ScoredRecord};

/// Calculate cosine similarity between two vectors. Zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}

/// Records sharded by user id, keyed by content hash within a user.
#[derive(Debug)]
pub struct VectorStore {
    capacity_per_user: usize,
    shards: DashMap<String, HashMap<String, MemoryRecord>>,
}

impl VectorStore {
    pub fn new(capacity_per_user: usize) -> Self {
        Self {
            capacity_per_user: capacity_per_user.max(1),
            shards: DashMap::new(),
        }
    }

    /// Insert unless `(user_id, content_hash)` already exists. Evicts the
    /// user's oldest record when at capacity. Returns whether it inserted.
    pub fn insert_if_absent(&self, record: MemoryRecord) -> bool {
        let mut shard = self.shards.entry(record.user_id.clone()).or_default();
        if shard.contains_key(&record.content_hash) {
            return false;
        }

        if shard.len() >= self.capacity_per_user {
            let oldest = shard
                .values()
                .min_by(|a, b| a.created_at.cmp(&b.created_at))
                .map(|r| r.content_hash.clone());
            if let Some(hash) = oldest {
                debug!("Evicting oldest memory record {} for user {}", hash, record.user_id);
                shard.remove(&hash);
            }
        }

        shard.insert(record.content_hash.clone(), record);
        true
    }

    /// Top `k` records of `user_id` by cosine similarity, most recent first on ties.
    pub fn search(&self, user_id: &str, query: &[f32], k: usize) -> Vec<ScoredRecord> {
        if k == 0 {
            return Vec::new();
        }
        let Some(shard) = self.shards.get(user_id) else {
            return Vec::new();
        };

        let mut scored: Vec<(&MemoryRecord, f32)> = shard
            .par_iter()
            .map(|(_, record)| (record, cosine_similarity(query, &record.embedding)))
            .collect();

        scored.sort_by(|(ra, sa), (rb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| rb.created_at.cmp(&ra.created_at))
                .then_with(|| ra.content_hash.cmp(&rb.content_hash))
        });

        scored
            .into_iter()
            .take(k)
            .map(|(record, score)| ScoredRecord {
                record: record.clone(),
                score,
            })
            .collect()
    }

    pub fn contains(&self, user_id: &str, content_hash: &str) -> bool {
        self.shards
            .get(user_id)
            .map(|shard| shard.contains_key(content_hash))
            .unwrap_or(false)
    }

    pub fn len(&self, user_id: &str) -> usize {
        self.shards.get(user_id).map(|shard| shard.len()).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.shards.iter().map(|shard| shard.len()).sum()
    }

    pub fn users(&self) -> usize {
        self.shards.len()
    }

    /// A user's records matching `predicate`, newest first.
    pub fn filter<F>(&self, user_id: &str, predicate: F) -> Vec<MemoryRecord>
    where
        F: Fn(&MemoryRecord) -> bool,
    {
        let Some(shard) = self.shards.get(user_id) else {
            return Vec::new();
        };
        let mut records: Vec<MemoryRecord> =
            shard.values().filter(|r| predicate(r)).cloned().collect();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.content_hash.cmp(&b.content_hash))
        });
        records
    }

    /// Drop every record of a user, returning how many were removed.
    pub fn remove_user(&self, user_id: &str) -> usize {
        self.shards
            .remove(user_id)
            .map(|(_, shard)| shard.len())
            .unwrap_or(0)
    }
}
