use super::Tokenizer;
use crate::{Error, Result, TokenId, TokenSequence};
use std::path::Path;
use tokenizers::tokenizer::Tokenizer as HfTokenizer;

/// End-of-sequence spellings tried, in order, when the tokenizer file does not
/// say which special token ends a sequence.
const EOS_CANDIDATES: &[&str] = &[
    "</s>",
    "<|endoftext|>",
    "<|im_end|>",
    "<|eot_id|>",
    "<eos>",
];

/// HuggingFace `tokenizer.json` wrapper.
pub struct HuggingFaceTokenizer {
    inner: HfTokenizer,
    eos_token_id: Option<TokenId>,
}

impl HuggingFaceTokenizer {
    /// Loads a tokenizer from a `tokenizer.json` file or a directory that
    /// contains one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tokenization`] if the file is missing or invalid.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = if path.is_dir() {
            path.join("tokenizer.json")
        } else {
            path.to_path_buf()
        };

        let inner = HfTokenizer::from_file(&file).map_err(|e| {
            Error::tokenization(format!("failed to load {}: {e}", file.display()))
        })?;

        Ok(Self::new(inner))
    }

    pub fn new(inner: HfTokenizer) -> Self {
        let eos_token_id = EOS_CANDIDATES
            .iter()
            .find_map(|candidate| inner.token_to_id(candidate));
        if eos_token_id.is_none() {
            tracing::warn!("Tokenizer has no recognisable end-of-sequence token");
        }
        Self {
            inner,
            eos_token_id,
        }
    }
}

impl Tokenizer for HuggingFaceTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<TokenSequence> {
        self.inner
            .encode(text, add_special_tokens)
            .map(|encoding| encoding.get_ids().to_vec())
            .map_err(|e| Error::tokenization(e.to_string()))
    }

    fn decode(&self, ids: &[TokenId], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| Error::tokenization(e.to_string()))
    }

    fn eos_token_id(&self) -> Option<TokenId> {
        self.eos_token_id
    }
}
