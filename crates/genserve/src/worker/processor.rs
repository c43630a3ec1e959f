use crate::{
    Error, GenerationConfig, Result, TokenId, TokenSequence,
    bridge::StreamSender,
    detokenize::IncrementalDecoder,
    runtime::{GenerateParams, ModelRuntime, TokenSink},
    stop::{StopCondition, StoppingCriteria},
    tokenizer::Tokenizer,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Stop condition of the deployment, plus per-request cancellation.
struct Halt<'a> {
    stop: &'a StopCondition,
    cancel: &'a CancellationToken,
}

impl StoppingCriteria for Halt<'_> {
    fn should_stop(&self, tokens: &[TokenId]) -> bool {
        self.cancel.is_cancelled() || self.stop.should_stop(tokens)
    }
}

/// Everything a worker needs besides its runtime.
pub(crate) struct Context {
    pub tokenizer: Arc<dyn Tokenizer>,
    pub stop: Arc<StopCondition>,
    pub skip_prompt: bool,
}

impl Context {
    fn params(&self, config: GenerationConfig) -> GenerateParams {
        let eos = self.tokenizer.eos_token_id();
        GenerateParams {
            pad_token_id: eos,
            eos_token_id: eos,
            config,
        }
    }
}

/// Runs a blocking generation request.
///
/// Returns the full sequence (prompt included) or the runtime's error; nothing
/// partial is returned on failure.
pub(crate) fn handle_generate_request(
    worker_id: usize,
    runtime: &mut dyn ModelRuntime,
    context: &Context,
    tokens: &[TokenId],
    config: GenerationConfig,
    cancel: &CancellationToken,
) -> Result<TokenSequence> {
    let halt = Halt {
        stop: &context.stop,
        cancel,
    };
    let output = runtime.generate(tokens, &context.params(config), &halt, None)?;

    if cancel.is_cancelled() {
        return Err(Error::RequestCancelled);
    }

    tracing::debug!(
        "Worker {worker_id} generated {} tokens",
        output.len().saturating_sub(tokens.len())
    );
    Ok(output)
}

/// Decodes tokens as they arrive and forwards the finished text to a stream
/// channel.
struct FragmentSink<'a> {
    decoder: IncrementalDecoder<Arc<dyn Tokenizer>>,
    sender: &'a StreamSender,
    fragments: usize,
}

impl FragmentSink<'_> {
    fn forward(&mut self, text: Option<String>) -> Result<()> {
        if let Some(text) = text {
            self.sender.blocking_put(text)?;
            self.fragments += 1;
        }
        Ok(())
    }
}

impl TokenSink for FragmentSink<'_> {
    fn put(&mut self, tokens: &[TokenId]) -> Result<()> {
        let text = self.decoder.push(tokens)?;
        self.forward(text)
    }

    fn end(&mut self) -> Result<()> {
        let text = self.decoder.finish()?;
        self.forward(text)
    }
}

/// Runs a streaming generation request, writing text fragments into `sender`.
///
/// On success the end marker follows the last fragment. On failure or
/// cancellation the channel is failed instead, so the consumer never mistakes
/// a truncated generation for a complete one. If the consumer has gone away
/// the request simply stops.
pub(crate) fn handle_stream_request(
    worker_id: usize,
    runtime: &mut dyn ModelRuntime,
    context: &Context,
    tokens: &[TokenId],
    config: GenerationConfig,
    cancel: &CancellationToken,
    sender: StreamSender,
) {
    let halt = Halt {
        stop: &context.stop,
        cancel,
    };
    let mut sink = FragmentSink {
        decoder: IncrementalDecoder::new(Arc::clone(&context.tokenizer), context.skip_prompt),
        sender: &sender,
        fragments: 0,
    };

    let result = runtime.generate(tokens, &context.params(config), &halt, Some(&mut sink));
    let fragments = sink.fragments;
    drop(sink);

    match result {
        // A halt caused by cancellation is not a completed generation.
        Ok(_) if cancel.is_cancelled() => {
            tracing::debug!("Worker {worker_id} stream cancelled after {fragments} fragments");
            sender.blocking_fail(Error::RequestCancelled);
        }
        Ok(output) => {
            tracing::debug!(
                "Worker {worker_id} streamed {} tokens in {fragments} fragments",
                output.len().saturating_sub(tokens.len())
            );
            if let Err(e) = sender.blocking_put_end() {
                tracing::debug!("Worker {worker_id} failed to send end of stream: {e}");
            }
        }
        Err(Error::RequestCancelled) => {
            tracing::debug!("Worker {worker_id} stream consumer went away");
        }
        Err(e) => {
            tracing::warn!("Worker {worker_id} stream failed after {fragments} fragments: {e}");
            sender.blocking_fail(e);
        }
    }
}
