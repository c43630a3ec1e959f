use super::Tokenizer;
use crate::{Error, Result, TokenId, TokenSequence};

const BOS: &str = "<s>";
const EOS: &str = "</s>";
const PAD: &str = "<pad>";

/// Byte-level tokenizer: ids `0..=255` are raw UTF-8 bytes and the special
/// tokens `<s>`, `</s>` and `<pad>` follow.
///
/// Lossless for any text that does not spell a special token.
#[derive(Clone, Debug, Default)]
pub struct ByteTokenizer {
    add_bos: bool,
}

impl ByteTokenizer {
    pub const BOS_ID: TokenId = 256;
    pub const EOS_ID: TokenId = 257;
    pub const PAD_ID: TokenId = 258;

    pub const fn new() -> Self {
        Self { add_bos: false }
    }

    /// Prepend `<s>` when encoding with special tokens.
    pub const fn with_bos(mut self, add_bos: bool) -> Self {
        self.add_bos = add_bos;
        self
    }

    const fn specials() -> [(&'static str, TokenId); 3] {
        [(BOS, Self::BOS_ID), (EOS, Self::EOS_ID), (PAD, Self::PAD_ID)]
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<TokenSequence> {
        let mut ids = Vec::with_capacity(text.len() + 1);
        if add_special_tokens && self.add_bos {
            ids.push(Self::BOS_ID);
        }

        let mut rest = text;
        'outer: while !rest.is_empty() {
            if rest.starts_with('<') {
                for (literal, id) in Self::specials() {
                    if let Some(tail) = rest.strip_prefix(literal) {
                        ids.push(id);
                        rest = tail;
                        continue 'outer;
                    }
                }
            }
            // Advance by one char so slicing stays on a boundary.
            let ch_len = rest.chars().next().map_or(1, char::len_utf8);
            ids.extend(rest.as_bytes()[..ch_len].iter().map(|&b| TokenId::from(b)));
            rest = &rest[ch_len..];
        }

        Ok(ids)
    }

    fn decode(&self, ids: &[TokenId], skip_special_tokens: bool) -> Result<String> {
        let mut bytes = Vec::with_capacity(ids.len());
        for &id in ids {
            match id {
                0..=255 => bytes.push(id as u8),
                _ => {
                    let (literal, _) = Self::specials()
                        .into_iter()
                        .find(|(_, special)| *special == id)
                        .ok_or_else(|| Error::tokenization(format!("unknown token id {id}")))?;
                    if !skip_special_tokens {
                        bytes.extend_from_slice(literal.as_bytes());
                    }
                }
            }
        }
        // Incomplete multi-byte sequences become U+FFFD, as streaming decoders
        // expect from a partially generated character.
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token_id(&self) -> Option<TokenId> {
        Some(Self::EOS_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_lossless() {
        let tokenizer = ByteTokenizer::new();
        for text in ["", "Hi", "héllo wörld", "日本語 text\n", "a < b > c"] {
            let ids = tokenizer.encode(text, true).unwrap();
            assert_eq!(tokenizer.decode(&ids, true).unwrap(), text);
        }
    }

    #[test]
    fn special_tokens_are_recognised_in_text() {
        let tokenizer = ByteTokenizer::new();
        let ids = tokenizer.encode("a</s>", false).unwrap();
        assert_eq!(ids, vec![b'a' as TokenId, ByteTokenizer::EOS_ID]);
        assert_eq!(tokenizer.decode(&ids, false).unwrap(), "a</s>");
        assert_eq!(tokenizer.decode(&ids, true).unwrap(), "a");
    }

    #[test]
    fn bos_is_only_added_with_special_tokens() {
        let tokenizer = ByteTokenizer::new().with_bos(true);
        assert_eq!(tokenizer.encode("x", true).unwrap()[0], ByteTokenizer::BOS_ID);
        assert_eq!(tokenizer.encode("x", false).unwrap(), vec![b'x' as TokenId]);
    }

    #[test]
    fn unknown_ids_fail() {
        let tokenizer = ByteTokenizer::new();
        assert!(matches!(
            tokenizer.decode(&[1000], true),
            Err(Error::Tokenization { .. })
        ));
    }

    #[test]
    fn partial_character_decodes_to_replacement() {
        let tokenizer = ByteTokenizer::new();
        let ids = tokenizer.encode("é", false).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(tokenizer.decode(&ids[..1], true).unwrap(), "\u{FFFD}");
    }
}
