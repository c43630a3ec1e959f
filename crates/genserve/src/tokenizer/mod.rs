//! Tokenizer collaborators.
//!
//! The pipeline only needs three things from a tokenizer: turn text into a
//! [`TokenSequence`], turn tokens back into text, and name the end-of-sequence
//! token (used as the runtime's padding token).
//!
//! - [`HuggingFaceTokenizer`] wraps a `tokenizer.json` from the `tokenizers`
//!   crate.
//! - [`ByteTokenizer`] is a lossless byte-level tokenizer for the built-in
//!   `echo` model and tests.

mod bytes;
mod huggingface;

pub use bytes::ByteTokenizer;
pub use huggingface::HuggingFaceTokenizer;

use crate::{Result, TokenId, TokenSequence};
use std::sync::Arc;

/// Name that selects [`ByteTokenizer`] in deployment configuration.
pub const BYTE_TOKENIZER: &str = "bytes";

/// Text <-> token conversion.
pub trait Tokenizer: Send + Sync {
    /// Encodes `text`. `add_special_tokens` controls template tokens such as
    /// BOS; special tokens written literally in `text` are always recognised.
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<TokenSequence>;

    fn decode(&self, ids: &[TokenId], skip_special_tokens: bool) -> Result<String>;

    fn eos_token_id(&self) -> Option<TokenId>;
}

impl<T: Tokenizer + ?Sized> Tokenizer for Arc<T> {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<TokenSequence> {
        (**self).encode(text, add_special_tokens)
    }

    fn decode(&self, ids: &[TokenId], skip_special_tokens: bool) -> Result<String> {
        (**self).decode(ids, skip_special_tokens)
    }

    fn eos_token_id(&self) -> Option<TokenId> {
        (**self).eos_token_id()
    }
}

/// Resolves a tokenizer from its configured name or path.
///
/// `"bytes"` selects [`ByteTokenizer`]; anything else is treated as a path to
/// a `tokenizer.json` file or a directory containing one.
///
/// # Errors
///
/// Returns [`crate::Error::Tokenization`] if the file cannot be loaded.
pub fn load_tokenizer(name_or_path: &str) -> Result<Arc<dyn Tokenizer>> {
    if name_or_path == BYTE_TOKENIZER {
        return Ok(Arc::new(ByteTokenizer::new()));
    }
    let tokenizer = HuggingFaceTokenizer::from_path(name_or_path)?;
    Ok(Arc::new(tokenizer))
}
