//! In-process embedding producer.
//!
//! A deterministic feature-hashing encoder: every token (and adjacent token
//! pair) hashes into a signed bucket of the output vector, which is then
//! L2-normalized. Not a learned model, but stable, dimension-exact and
//! dependency-free, which is what the local provider mode promises.

use async_trait::async_trait;
use xxhash_rust::xxh64::xxh64;

use crate::search::tokenizer::tokenize;

use super::{EmbedError, Embedder};

pub struct LocalEmbedder {
    model: String,
    dimension: usize,
}

impl LocalEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            model: format!("nornic-hash-{dimension}"),
            dimension,
        }
    }

    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = xxh64(feature.as_bytes(), 0x5eed);
        let bucket = (hash % self.dimension as u64) as usize;
        let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Err(EmbedError::BadInput("no indexable tokens".into()));
        }
        let mut vector = vec![0.0f32; self.dimension];
        for token in &tokens {
            self.accumulate(&mut vector, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.accumulate(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        Ok(vector)
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embeddings_are_deterministic_and_normalized() {
        let embedder = LocalEmbedder::new(64);
        let a = embedder.embed("graph database engine").await.unwrap();
        let b = embedder.embed("graph database engine").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn related_texts_score_closer_than_unrelated() {
        let embedder = LocalEmbedder::new(256);
        let base = embedder.embed("user authentication login").await.unwrap();
        let related = embedder.embed("login user session").await.unwrap();
        let unrelated = embedder.embed("volcanic basalt geology").await.unwrap();
        let sim = |a: &[f32], b: &[f32]| crate::search::vector::cosine(a, b);
        assert!(sim(&base, &related) > sim(&base, &unrelated));
    }

    #[tokio::test]
    async fn empty_text_is_bad_input() {
        let embedder = LocalEmbedder::new(16);
        assert!(matches!(
            embedder.embed("  ").await,
            Err(EmbedError::BadInput(_))
        ));
    }
}
