//! Model-runtime collaborator.
//!
//! Next-token prediction is not implemented here. A [`ModelRuntime`] is
//! handed the prompt, the generation parameters, a stopping criterion, and
//! optionally a [`TokenSink`], and is expected to:
//!
//! - consult the stopping criterion once per appended token with the full
//!   sequence so far, halting as soon as it returns `true`,
//! - when streaming, call [`TokenSink::put`] once with the prompt and then
//!   once per new token, and [`TokenSink::end`] exactly once on success,
//! - return the full sequence (prompt prefix included).
//!
//! Runtimes are created on the worker's own thread by a [`RuntimeLoader`], so
//! a runtime needs to be `Send` but never `Sync`.

mod echo;

pub use echo::{EchoRuntime, ECHO_MODEL};

use crate::{GenerationConfig, Result, TokenId, TokenSequence, stop::StoppingCriteria};
use serde::{Deserialize, Serialize};

/// Per-call parameters forwarded to the runtime.
#[derive(Clone, Debug, Default)]
pub struct GenerateParams {
    /// Token used to pad batches; the deployment's end-of-sequence token.
    pub pad_token_id: Option<TokenId>,
    pub eos_token_id: Option<TokenId>,
    /// Request options, forwarded unchanged.
    pub config: GenerationConfig,
}

/// Receives tokens as they are produced.
pub trait TokenSink {
    fn put(&mut self, tokens: &[TokenId]) -> Result<()>;
    fn end(&mut self) -> Result<()>;
}

pub trait ModelRuntime: Send {
    /// Runs generation to completion.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Generation`] on any runtime failure, including
    /// invalid values in `params.config`. A sink error aborts generation and
    /// is returned as-is.
    fn generate(
        &mut self,
        input: &[TokenId],
        params: &GenerateParams,
        stop: &dyn StoppingCriteria,
        sink: Option<&mut dyn TokenSink>,
    ) -> Result<TokenSequence>;
}

/// Numeric precision requested for model weights.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp32,
    #[default]
    Bf16,
}

/// What a loader needs to instantiate one model.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub model_id: String,
    pub trust_remote_code: bool,
    pub precision: Precision,
}

/// Instantiates runtimes. Called once per worker, on that worker's thread.
pub trait RuntimeLoader: Send + Sync {
    fn load(&self, options: &LoadOptions) -> Result<Box<dyn ModelRuntime>>;
}

/// Loader for the runtimes compiled into this crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinLoader;

impl RuntimeLoader for BuiltinLoader {
    fn load(&self, options: &LoadOptions) -> Result<Box<dyn ModelRuntime>> {
        match options.model_id.as_str() {
            ECHO_MODEL => {
                tracing::debug!(
                    "Loading echo runtime (precision {:?}, trust_remote_code {})",
                    options.precision,
                    options.trust_remote_code
                );
                Ok(Box::new(EchoRuntime::default()))
            }
            other => Err(crate::Error::worker_unavailable(format!(
                "no runtime available for model {other:?}"
            ))),
        }
    }
}

impl<F> RuntimeLoader for F
where
    F: Fn(&LoadOptions) -> Result<Box<dyn ModelRuntime>> + Send + Sync,
{
    fn load(&self, options: &LoadOptions) -> Result<Box<dyn ModelRuntime>> {
        self(options)
    }
}

/// Reads an optional non-negative integer option from a generation config.
///
/// # Errors
///
/// Returns [`crate::Error::Generation`] if the key is present with any other
/// kind of value.
pub fn config_usize(config: &GenerationConfig, key: &str) -> Result<Option<usize>> {
    match config.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|v| usize::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| {
                crate::Error::generation(format!(
                    "`{key}` must be a non-negative integer, got {value}"
                ))
            }),
    }
}
