//! Token estimation using tiktoken

use crate::error::{ContextError, Result};
use std::sync::Arc;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Token estimator trait for different tokenization strategies
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in the given text
    fn estimate(&self, text: &str) -> usize;

    /// Estimate tokens for multiple texts
    fn estimate_batch(&self, texts: &[&str]) -> Vec<usize> {
        texts.iter().map(|t| self.estimate(t)).collect()
    }

    /// Name used in logs
    fn name(&self) -> &'static str;
}

/// Tiktoken-based token estimator using cl100k_base (GPT-4, GPT-3.5-turbo)
pub struct TiktokenEstimator {
    bpe: Arc<CoreBPE>,
}

impl TiktokenEstimator {
    /// Create a new tiktoken estimator with cl100k_base encoding
    pub fn new() -> Result<Self> {
        let bpe = cl100k_base().map_err(|e| {
            ContextError::Configuration(format!("failed to load cl100k_base: {}", e))
        })?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    fn name(&self) -> &'static str {
        "tiktoken"
    }
}

/// Word-based token estimator (~1.3 tokens per word)
///
/// Deterministic and dependency free, so it is the default for the engine.
#[derive(Debug, Clone)]
pub struct WordBasedEstimator {
    tokens_per_word: f64,
}

impl WordBasedEstimator {
    pub fn new(tokens_per_word: f64) -> Self {
        Self { tokens_per_word }
    }
}

impl Default for WordBasedEstimator {
    fn default() -> Self {
        Self::new(1.3)
    }
}

impl TokenEstimator for WordBasedEstimator {
    fn estimate(&self, text: &str) -> usize {
        let word_count = text.split_whitespace().count();
        (word_count as f64 * self.tokens_per_word).ceil() as usize
    }

    fn name(&self) -> &'static str {
        "word"
    }
}

/// Build the estimator named in configuration
pub fn estimator_from_name(name: &str) -> Result<Arc<dyn TokenEstimator>> {
    match name {
        "tiktoken" => Ok(Arc::new(TiktokenEstimator::new()?)),
        "word" => Ok(Arc::new(WordBasedEstimator::default())),
        other => Err(ContextError::Configuration(format!(
            "unknown token estimator: {}",
            other
        ))),
    }
}
