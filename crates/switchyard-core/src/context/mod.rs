//! Context trimming to a token budget
//!
//! Runs before cache lookup and routing so that both see the same trimmed
//! input. Chunks are ordered by `(salience, recency_rank)` descending and
//! taken greedily until the next one would overflow the budget; chunks are
//! never split. When even the first chunk is too large it is returned alone
//! and the result is flagged `truncated_single_chunk`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::hashing::content_hash;

/// Estimate token count for a string
pub fn estimate_tokens(text: &str) -> usize {
    // Rough estimate: 1 token ≈ 4 characters for English text
    text.len().div_ceil(4)
}

/// A unit of context supplied by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextChunk {
    pub id: String,
    pub text: String,
    pub tokens: usize,
    pub salience: f64,
    /// Higher is more recent
    pub recency_rank: u32,
}

impl ContextChunk {
    /// Chunk with tokens estimated from the text
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            id: id.into(),
            tokens: estimate_tokens(&text),
            text,
            salience: 0.0,
            recency_rank: 0,
        }
    }

    pub fn with_salience(mut self, salience: f64) -> Self {
        self.salience = salience;
        self
    }

    pub fn with_recency(mut self, rank: u32) -> Self {
        self.recency_rank = rank;
        self
    }

    /// Override the estimated token count
    pub fn with_tokens(mut self, tokens: usize) -> Self {
        self.tokens = tokens;
        self
    }

    fn salience_key(&self) -> f64 {
        if self.salience.is_finite() {
            self.salience
        } else {
            0.0
        }
    }
}

/// Trimmed context plus an observability report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrimResult {
    /// Selected chunks in selection order
    pub chunks: Vec<ContextChunk>,
    pub total_tokens: usize,
    pub truncated_single_chunk: bool,
    /// Ids of chunks left out
    pub dropped: Vec<String>,
}

impl TrimResult {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Selected texts joined with blank lines
    pub fn text(&self) -> String {
        self.chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Stable hash of the trimmed text
    pub fn context_hash(&self) -> String {
        content_hash(&self.text())
    }
}

/// `[trimmer]` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimmerConfig {
    /// Budget used when a request does not carry one
    pub default_token_budget: usize,
}

impl Default for TrimmerConfig {
    fn default() -> Self {
        Self {
            default_token_budget: 4096,
        }
    }
}

impl TrimmerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_token_budget == 0 {
            return Err(Error::Config(
                "trimmer.default_token_budget must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextTrimmer {
    config: TrimmerConfig,
}

impl ContextTrimmer {
    pub fn new(config: TrimmerConfig) -> Self {
        Self { config }
    }

    pub fn default_budget(&self) -> usize {
        self.config.default_token_budget
    }

    /// Greedy salience-first selection within `token_budget`
    pub fn trim(&self, chunks: &[ContextChunk], token_budget: usize) -> TrimResult {
        if chunks.is_empty() {
            return TrimResult::default();
        }

        let mut order: Vec<&ContextChunk> = chunks.iter().collect();
        // stable sort keeps caller order among exact ties
        order.sort_by(|a, b| salience_order(a, b));

        let mut result = TrimResult::default();
        let mut stopped = false;
        for chunk in order {
            if stopped {
                result.dropped.push(chunk.id.clone());
                continue;
            }
            if result.total_tokens + chunk.tokens <= token_budget {
                result.total_tokens += chunk.tokens;
                result.chunks.push(chunk.clone());
                continue;
            }
            if result.chunks.is_empty() {
                result.total_tokens = chunk.tokens;
                result.chunks.push(chunk.clone());
                result.truncated_single_chunk = true;
            } else {
                result.dropped.push(chunk.id.clone());
            }
            stopped = true;
        }

        debug!(
            kept = result.chunks.len(),
            dropped = result.dropped.len(),
            tokens = result.total_tokens,
            budget = token_budget,
            truncated_single_chunk = result.truncated_single_chunk,
            "Context trimmed"
        );
        result
    }
}

/// Orders chunks the way [`ContextTrimmer::trim`] visits them
pub fn salience_order(a: &ContextChunk, b: &ContextChunk) -> Ordering {
    b.salience_key()
        .total_cmp(&a.salience_key())
        .then_with(|| b.recency_rank.cmp(&a.recency_rank))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, tokens: usize, salience: f64, recency: u32) -> ContextChunk {
        ContextChunk::new(id, format!("text of {}", id))
            .with_tokens(tokens)
            .with_salience(salience)
            .with_recency(recency)
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("test"), 1);
        assert_eq!(estimate_tokens("hello world!"), 3);
    }

    #[test]
    fn test_greedy_by_salience() {
        let trimmer = ContextTrimmer::default();
        let chunks = vec![
            chunk("low", 10, 0.1, 5),
            chunk("high", 40, 0.9, 1),
            chunk("mid", 40, 0.5, 3),
        ];
        let result = trimmer.trim(&chunks, 85);
        let ids: Vec<&str> = result.chunks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid"]);
        assert_eq!(result.total_tokens, 80);
        assert_eq!(result.dropped, vec!["low".to_string()]);
        assert!(!result.truncated_single_chunk);
    }

    #[test]
    fn test_stops_at_first_overflow() {
        // the small trailing chunk would fit but selection stops at the first overflow
        let trimmer = ContextTrimmer::default();
        let chunks = vec![
            chunk("a", 50, 0.9, 0),
            chunk("b", 60, 0.8, 0),
            chunk("c", 5, 0.7, 0),
        ];
        let result = trimmer.trim(&chunks, 100);
        assert_eq!(result.chunks.len(), 1);
        assert_eq!(result.dropped.len(), 2);
    }

    #[test]
    fn test_recency_breaks_ties() {
        let trimmer = ContextTrimmer::default();
        let chunks = vec![chunk("old", 10, 0.5, 1), chunk("new", 10, 0.5, 9)];
        let result = trimmer.trim(&chunks, 10);
        assert_eq!(result.chunks[0].id, "new");
    }

    #[test]
    fn test_oversized_first_chunk_returned_alone() {
        let trimmer = ContextTrimmer::default();
        let chunks = vec![chunk("huge", 500, 0.9, 0), chunk("small", 5, 0.1, 0)];
        let result = trimmer.trim(&chunks, 100);
        assert_eq!(result.chunks.len(), 1);
        assert_eq!(result.chunks[0].id, "huge");
        assert!(result.truncated_single_chunk);
    }

    #[test]
    fn test_empty_input() {
        let result = ContextTrimmer::default().trim(&[], 100);
        assert!(result.is_empty());
        assert!(!result.truncated_single_chunk);
    }

    #[test]
    fn test_context_hash_follows_selection() {
        let trimmer = ContextTrimmer::default();
        let a = trimmer.trim(&[chunk("x", 5, 0.9, 0), chunk("y", 500, 0.1, 0)], 10);
        let b = trimmer.trim(&[chunk("x", 5, 0.9, 0)], 10);
        assert_eq!(a.context_hash(), b.context_hash());
    }
}
