//! Incremental detokenization.
//!
//! Decoding token-by-token would split words and multi-byte characters, so
//! [`IncrementalDecoder`] caches tokens and only releases text that can no
//! longer change:
//!
//! - up to and including the last space of the decoded cache,
//! - everything, once the cache ends in a newline (the cache then resets),
//! - everything, once the cache ends in a CJK ideograph (no spaces between
//!   words in those scripts).
//!
//! An incomplete character decodes to U+FFFD at the tail and is therefore never
//! released early. [`IncrementalDecoder::finish`] flushes the remainder.
//! Empty fragments are never returned, so concatenating fragments always
//! yields strictly growing text.

use crate::{Result, TokenId, tokenizer::Tokenizer};

pub struct IncrementalDecoder<T> {
    tokenizer: T,
    skip_prompt: bool,
    next_is_prompt: bool,
    cache: Vec<TokenId>,
    printed: usize,
}

impl<T: Tokenizer> IncrementalDecoder<T> {
    /// When `skip_prompt` is set, the first batch of tokens pushed (the prompt)
    /// produces no text.
    pub const fn new(tokenizer: T, skip_prompt: bool) -> Self {
        Self {
            tokenizer,
            skip_prompt,
            next_is_prompt: true,
            cache: Vec::new(),
            printed: 0,
        }
    }

    /// Adds tokens and returns the text that became final, if any.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Tokenization`] if the cache cannot be decoded.
    pub fn push(&mut self, tokens: &[TokenId]) -> Result<Option<String>> {
        if core::mem::take(&mut self.next_is_prompt) && self.skip_prompt {
            return Ok(None);
        }

        self.cache.extend_from_slice(tokens);
        let text = self.tokenizer.decode(&self.cache, true)?;
        self.realign(&text);

        let printable = if text.ends_with('\n') {
            let printable = text[self.printed..].to_owned();
            self.cache.clear();
            self.printed = 0;
            printable
        } else if text.chars().next_back().is_some_and(is_cjk) {
            let printable = text[self.printed..].to_owned();
            self.printed = text.len();
            printable
        } else {
            let boundary = text.rfind(' ').map_or(0, |i| i + 1);
            match text.get(self.printed..boundary) {
                Some(printable) if !printable.is_empty() => {
                    self.printed = boundary;
                    printable.to_owned()
                }
                _ => String::new(),
            }
        };

        Ok(non_empty(printable))
    }

    /// Flushes whatever text is still held back.
    pub fn finish(&mut self) -> Result<Option<String>> {
        let text = self.tokenizer.decode(&self.cache, true)?;
        self.realign(&text);
        let printable = text[self.printed..].to_owned();
        self.cache.clear();
        self.printed = 0;
        Ok(non_empty(printable))
    }

    /// Some decoders clean up spacing, so a longer cache can decode to a
    /// shorter string. Moves `printed` back onto a char boundary of `text`.
    fn realign(&mut self, text: &str) {
        let mut at = self.printed.min(text.len());
        while !text.is_char_boundary(at) {
            at -= 1;
        }
        self.printed = at;
    }
}

fn non_empty(text: String) -> Option<String> {
    (!text.is_empty()).then_some(text)
}

/// CJK Unified Ideographs blocks (not Hangul, Hiragana or Katakana, which are
/// written with spaces often enough).
const fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x4E00..=0x9FFF
        | 0x3400..=0x4DBF
        | 0x20000..=0x2A6DF
        | 0x2A700..=0x2B73F
        | 0x2B740..=0x2B81F
        | 0x2B820..=0x2CEAF
        | 0xF900..=0xFAFF
        | 0x2F800..=0x2FA1F)
}
