//! HTTP service for one deployment.
//!
//! This module defines [`ModelService`], which turns `POST` requests on a
//! deployment's route into work for its [`WorkerPool`]. It supports two
//! response modes:
//!
//! - **Non-streaming**: every prompt is generated to completion and decoded
//!   (prompt included). A single prompt is answered with the text itself, more
//!   than one with a JSON array of texts.
//! - **Streaming**: exactly one prompt. The body is a sequence of chunks, each
//!   holding all text generated so far.
//!
//! ## Responsibilities
//!
//! - Validate request bodies before any worker is involved.
//! - Encode prompts and decode outputs with the deployment's tokenizer.
//! - Create one stream channel and one cancellation token per streaming
//!   request, and cancel generation when the client goes away.
//! - Refuse new work once the deployment is shutting down.

use super::{
    error::ApiError,
    request::{GenerateRequest, Prompt},
};
use crate::server::{
    streaming::coordinator::feed_fragments,
    telemetry::{
        decrement_streams_inflight, increment_request_errors, increment_requests,
        increment_streams_inflight, record_stream_duration, record_tokens_per_request,
    },
};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::post,
};
use core::time::Duration;
use genserve::{Result, bridge::stream_channel, tokenizer::Tokenizer, worker::WorkerPool};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Stream channel settings applied to every streaming request.
#[derive(Clone, Copy, Debug)]
pub struct StreamOptions {
    /// Undelivered fragments buffered per request.
    pub buffer_size: usize,
    /// Bound on any single wait inside the channel.
    pub timeout: Option<Duration>,
}

/// Request dispatcher of one deployment.
#[derive(Clone)]
pub struct ModelService {
    name: Arc<str>,
    worker_pool: Arc<WorkerPool>,
    tokenizer: Arc<dyn Tokenizer>,
    stream: StreamOptions,
}

impl ModelService {
    pub fn new(
        worker_pool: Arc<WorkerPool>,
        tokenizer: Arc<dyn Tokenizer>,
        stream: StreamOptions,
    ) -> Self {
        Self {
            name: Arc::from(worker_pool.name()),
            worker_pool,
            tokenizer,
            stream,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A router answering `POST route` with this service.
    pub fn router(&self, route: &str) -> Router {
        Router::new()
            .route(route, post(generate))
            .with_state(self.clone())
    }

    /// Refuses new requests, lets in-flight streams drain, then stops the
    /// workers.
    pub async fn shutdown(&self) {
        self.worker_pool.shutdown().await;
    }

    async fn handle(&self, body: &[u8]) -> Result<Response> {
        let request = GenerateRequest::from_slice(body)?;
        increment_requests(&self.name);

        if request.stream {
            let prompt = request.prompts.into_iter().next().ok_or_else(|| {
                genserve::Error::bad_request("streaming requests take exactly one prompt")
            })?;
            self.stream(prompt).await
        } else {
            self.complete(request.prompts).await
        }
    }

    /// Generates one prompt to completion. Dropping the future cancels the
    /// generation.
    async fn generate_text(&self, prompt: Prompt) -> Result<String> {
        let tokens = self.tokenizer.encode(&prompt.text, true)?;
        let prompt_len = tokens.len();

        let cancel = self.worker_pool.request_token();
        let guard = cancel.clone().drop_guard();
        let output = self
            .worker_pool
            .generate(tokens, prompt.config, cancel)
            .await?;
        guard.disarm();

        record_tokens_per_request(
            &self.name,
            output.len().saturating_sub(prompt_len) as f64,
        );
        self.tokenizer.decode(&output, true)
    }

    async fn complete(&self, prompts: Vec<Prompt>) -> Result<Response> {
        let mut texts = futures::future::try_join_all(
            prompts.into_iter().map(|prompt| self.generate_text(prompt)),
        )
        .await?;

        let response = if texts.len() == 1 {
            let text = texts.pop().unwrap_or_default();
            ([(header::CONTENT_TYPE, TEXT_PLAIN)], text).into_response()
        } else {
            Json(texts).into_response()
        };
        Ok(response)
    }

    async fn stream(&self, prompt: Prompt) -> Result<Response> {
        let tokens = self.tokenizer.encode(&prompt.text, true)?;

        let (tx, rx) = stream_channel(self.stream.buffer_size, self.stream.timeout);
        let cancel = self.worker_pool.request_token();
        let inflight = self.worker_pool.track_stream();
        self.worker_pool
            .streaming_generate(tokens, prompt.config, tx, cancel.clone())
            .await?;

        let (resp_tx, resp_rx) = mpsc::channel(self.stream.buffer_size);
        let name = Arc::clone(&self.name);
        let start = std::time::Instant::now();
        increment_streams_inflight(&self.name);

        let fut = async move {
            // Cancels the generation however this task ends.
            let _cancel = cancel.drop_guard();
            let _inflight = inflight;

            match feed_fragments(rx, resp_tx).await {
                Ok(chunks) => {
                    tracing::debug!("[{name}] Stream finished after {chunks} chunks");
                    record_stream_duration(&name, start.elapsed().as_millis() as f64);
                }
                Err(genserve::Error::RequestCancelled) => {
                    tracing::debug!("[{name}] Stream cancelled");
                    increment_request_errors(&name);
                }
                Err(e) => {
                    tracing::warn!("[{name}] Stream aborted: {e}");
                    increment_request_errors(&name);
                }
            }
            decrement_streams_inflight(&name);
        };
        #[cfg(feature = "tracing")]
        let fut = {
            use tracing::Instrument;
            fut.instrument(tracing::info_span!("streaming"))
        };
        tokio::spawn(fut);

        let body = Body::from_stream(ReceiverStream::new(resp_rx));
        Ok(([(header::CONTENT_TYPE, TEXT_PLAIN)], body).into_response())
    }
}

/// `POST` handler shared by every deployment route.
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
async fn generate(
    State(service): State<ModelService>,
    body: Bytes,
) -> core::result::Result<Response, ApiError> {
    service.handle(&body).await.map_err(|e| {
        increment_request_errors(service.name());
        ApiError(e)
    })
}
