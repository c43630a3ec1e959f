//! Stop-condition evaluation.
//!
//! A [`StopCondition`] holds the stop sequences configured for one deployment
//! and answers a single question after every generated token: does the tail of
//! the sequence so far exactly equal one of them?
//!
//! Matching is length-aligned. A stop sequence `[7, 8]` matches `[.., 7, 8]`
//! but never `[.., 7, 8, 9]` or `[.., 8]`.

use crate::{Result, StopSequence, TokenId, tokenizer::Tokenizer};

/// Decides, once per appended token, whether generation must halt.
///
/// Implementations receive the full sequence (prompt prefix included) and must
/// be free of side effects.
pub trait StoppingCriteria: Send + Sync {
    fn should_stop(&self, tokens: &[TokenId]) -> bool;
}

/// Immutable set of stop sequences for one deployment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StopCondition {
    sequences: Vec<StopSequence>,
}

impl StopCondition {
    /// Builds a condition from pre-tokenized stop sequences.
    ///
    /// Empty sequences are dropped: an empty tail is present in every sequence
    /// and would halt generation before the first token.
    pub fn new(sequences: Vec<StopSequence>) -> Self {
        let sequences = sequences.into_iter().filter(|s| !s.is_empty()).collect();
        Self { sequences }
    }

    /// Tokenizes each stop word once, without special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Tokenization`] if any stop word fails to encode.
    pub fn from_words<T>(tokenizer: &T, words: &[String]) -> Result<Self>
    where
        T: Tokenizer + ?Sized,
    {
        let sequences = words
            .iter()
            .map(|word| tokenizer.encode(word, false))
            .collect::<Result<Vec<_>>>()?;

        for (word, seq) in words.iter().zip(&sequences) {
            if seq.is_empty() {
                tracing::warn!("Stop word {word:?} encodes to no tokens and is ignored");
            } else {
                tracing::debug!("Stop word {word:?} -> {seq:?}");
            }
        }

        Ok(Self::new(sequences))
    }

    pub fn sequences(&self) -> &[StopSequence] {
        &self.sequences
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Returns `true` iff some stop sequence is a length-aligned suffix of
    /// `tokens`.
    pub fn matches(&self, tokens: &[TokenId]) -> bool {
        self.sequences.iter().any(|stop| tokens.ends_with(stop))
    }
}

impl StoppingCriteria for StopCondition {
    fn should_stop(&self, tokens: &[TokenId]) -> bool {
        self.matches(tokens)
    }
}
