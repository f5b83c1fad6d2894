//! Embedding collaborators
//!
//! The service only needs `embed(text) -> vector`. Real deployments plug in a
//! model-backed [`Embedder`]; [`HashingEmbedder`] is a deterministic lexical
//! stand-in for tests and cache pre-warming.

use async_trait::async_trait;

use crate::error::{Error, Result};

/// FNV-1a offset basis (64-bit)
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a prime (64-bit)
const FNV_PRIME: u64 = 0x0100_0000_01b3;

const MIN_TOKEN_LEN: usize = 2;

/// Turns trimmed context into an embedding
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimension(&self) -> usize;
}

/// Bag-of-words embedder: each token hashes to one signed dimension
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::Config("embedding dimension must be positive".to_string()));
        }
        Ok(Self { dimension })
    }

    /// L2-normalised embedding; all zeros when the text has no tokens
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; self.dimension];
        for token in tokenize(text) {
            let hash = fnv1a(token.as_bytes());
            let index = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 1 { 1.0 } else { -1.0 };
            embedding[index] += sign;
        }
        let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut embedding {
                *v /= norm;
            }
        }
        embedding
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self { dimension: 256 }
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= MIN_TOKEN_LEN)
        .map(str::to_lowercase)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_deterministic_and_normalised() {
        let embedder = HashingEmbedder::new(64).unwrap();
        let a = embedder.embed_sync("Route this request to the cheapest model");
        let b = embedder.embed_sync("Route this request to the cheapest model");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_case_and_punctuation_insensitive() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed_sync("hello, world");
        let b = embedder.embed_sync("HELLO world!");
        assert!((cosine(&a, &b) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedder = HashingEmbedder::default();
        assert!(embedder.embed_sync("a").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(HashingEmbedder::new(0).is_err());
    }

    #[tokio::test]
    async fn test_async_embed_matches_sync() {
        let embedder = HashingEmbedder::new(32).unwrap();
        let text = "summarise the quarterly report";
        assert_eq!(embedder.embed(text).await.unwrap(), embedder.embed_sync(text));
        assert_eq!(embedder.dimension(), 32);
    }
}
