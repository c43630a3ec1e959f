//! Request body parsing.
//!
//! The body is a JSON array of entries:
//!
//! ```json
//! [{ "text": "Once upon a time", "config": { "max_new_tokens": 32 }, "stream": true }]
//! ```
//!
//! `text` may be a string or a list of strings, `config` is forwarded to the
//! model runtime unchanged, and `stream` defaults to `false`.

use genserve::{Error, GenerationConfig, Result};
use serde::Deserialize;

#[derive(Deserialize)]
struct Entry {
    text: Text,
    #[serde(default)]
    config: Option<GenerationConfig>,
    #[serde(default)]
    stream: Option<bool>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Text {
    One(String),
    Many(Vec<String>),
}

/// One prompt with the options of the entry it came from.
#[derive(Clone, Debug, PartialEq)]
pub struct Prompt {
    pub text: String,
    pub config: GenerationConfig,
}

/// A validated generation request.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerateRequest {
    pub prompts: Vec<Prompt>,
    pub stream: bool,
}

impl GenerateRequest {
    /// Parses and validates a request body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] if the body is not a non-empty array of
    /// entries with `text`, if entries disagree on `stream`, if no prompt is
    /// given, or if a streaming request carries more than one prompt.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let entries: Vec<Entry> = serde_json::from_slice(body)
            .map_err(|e| Error::bad_request(format!("invalid request body: {e}")))?;

        if entries.is_empty() {
            return Err(Error::bad_request("request body must contain at least one entry"));
        }

        let stream = entries[0].stream.unwrap_or(false);
        let mut prompts = Vec::with_capacity(entries.len());

        for entry in entries {
            if entry.stream.unwrap_or(false) != stream {
                return Err(Error::bad_request(
                    "all entries of a request must agree on `stream`",
                ));
            }

            let config = entry.config.unwrap_or_default();
            match entry.text {
                Text::One(text) => prompts.push(Prompt { text, config }),
                Text::Many(texts) => prompts.extend(texts.into_iter().map(|text| Prompt {
                    text,
                    config: config.clone(),
                })),
            }
        }

        if prompts.is_empty() {
            return Err(Error::bad_request("request contains no prompts"));
        }
        if stream && prompts.len() > 1 {
            return Err(Error::bad_request(format!(
                "streaming requests take exactly one prompt, got {}",
                prompts.len()
            )));
        }

        Ok(Self { prompts, stream })
    }
}
