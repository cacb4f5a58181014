//! Text to vector conversion for the retrieval memory.

use async_trait::async_trait;

use super::MemoryError;

/// Turns text into a fixed-dimension embedding.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;
    fn dimension(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;
}

/// Deterministic hashed bag-of-words embedder.
///
/// Each lowercase token is hashed with BLAKE3 into a signed bucket; the
/// resulting vector is L2-normalized. Texts sharing vocabulary land close
/// together, which is all the offline pipeline needs.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| token.len() > 1)
        {
            let token = token.to_lowercase();
            let hash = blake3::hash(token.as_bytes());
            let bytes = hash.as_bytes();
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&bytes[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dim as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in vector.iter_mut() {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        "hash-bow"
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        Ok(self.embed_sync(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::vector_store::cosine_similarity;

    #[test]
    fn test_embedding_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(32);
        let a = embedder.embed_sync("Rust async runtimes");
        let b = embedder.embed_sync("rust ASYNC runtimes");
        assert_eq!(a, b);
        let norm = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_vocabulary_scores_higher() {
        let embedder = HashEmbedder::new(64);
        let query = embedder.embed_sync("rust compiler release");
        let close = embedder.embed_sync("new rust compiler release notes");
        let far = embedder.embed_sync("quarterly earnings for retail banks");
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedder = HashEmbedder::new(8);
        assert!(embedder.embed_sync("").iter().all(|x| *x == 0.0));
    }
}
