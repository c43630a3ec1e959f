use super::{
    processor::{Context, handle_generate_request, handle_stream_request},
    request::WorkRequest,
};
use crate::{
    Error, Result,
    runtime::{LoadOptions, ModelRuntime, RuntimeLoader},
};
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};
use tokio::sync::mpsc;

/// Worker thread body: loads one model, then serves [`WorkRequest`]s until a
/// shutdown request arrives or every sender is dropped.
///
/// Runs on a dedicated OS thread so blocking model computation never stalls
/// the async runtime that serves HTTP.
///
/// # Arguments
///
/// - `worker_id`: Index of this worker in its pool (used for logs).
/// - `rx`: Receiver through which [`WorkRequest`]s are received.
/// - `loader`: Creates the runtime; called once, on this thread.
/// - `options`: Which model to load.
/// - `context`: Tokenizer, stop condition and decoding options.
///
/// # Request Types
///
/// - [`WorkRequest::Generate`] - Blocking generation via
///   [`handle_generate_request`].
/// - [`WorkRequest::Stream`] - Streaming generation via
///   [`handle_stream_request`].
/// - [`WorkRequest::Ping`] - Reports whether the model loaded.
/// - [`WorkRequest::Shutdown`] - Acknowledge and stop.
///
/// A panicking runtime is discarded; the request fails and the worker answers
/// every later request with [`Error::WorkerUnavailable`].
pub(crate) fn worker_loop(
    worker_id: usize,
    mut rx: mpsc::Receiver<WorkRequest>,
    loader: Arc<dyn RuntimeLoader>,
    options: LoadOptions,
    context: Context,
) {
    tracing::debug!("Worker {worker_id} loading model {:?}", options.model_id);

    let mut state: Result<Box<dyn ModelRuntime>> =
        match catch_unwind(AssertUnwindSafe(|| loader.load(&options))) {
            Ok(Ok(runtime)) => {
                tracing::info!("Worker {worker_id} loaded model {:?}", options.model_id);
                Ok(runtime)
            }
            Ok(Err(e)) => {
                tracing::error!("Worker {worker_id} failed to load model: {e}");
                Err(unavailable(e))
            }
            Err(_) => {
                tracing::error!("Worker {worker_id} panicked while loading model");
                Err(Error::worker_unavailable("model loader panicked"))
            }
        };

    while let Some(work) = rx.blocking_recv() {
        match work {
            WorkRequest::Generate {
                tokens,
                config,
                cancel,
                response,
            } => {
                if cancel.is_cancelled() || response.is_closed() {
                    tracing::debug!("Worker {worker_id} skipping abandoned request");
                    continue;
                }
                let result = run_guarded(worker_id, &mut state, |runtime| {
                    handle_generate_request(worker_id, runtime, &context, &tokens, config, &cancel)
                });
                if response.send(result).is_err() {
                    tracing::debug!("Worker {worker_id} caller went away before the result");
                }
            }
            WorkRequest::Stream {
                tokens,
                config,
                cancel,
                sink,
            } => {
                if cancel.is_cancelled() || sink.is_closed() {
                    tracing::debug!("Worker {worker_id} skipping abandoned stream");
                    continue;
                }
                match &mut state {
                    Ok(runtime) => {
                        let outcome = catch_unwind(AssertUnwindSafe(|| {
                            handle_stream_request(
                                worker_id,
                                runtime.as_mut(),
                                &context,
                                &tokens,
                                config,
                                &cancel,
                                sink,
                            );
                        }));
                        // The sender was moved into the handler and is dropped
                        // by the unwind, so the consumer sees an abnormal end.
                        if outcome.is_err() {
                            state = Err(poisoned(worker_id));
                        }
                    }
                    Err(e) => sink.blocking_fail(e.clone()),
                }
            }
            WorkRequest::Ping { response } => {
                let _ = response.send(state.as_ref().map(|_| ()).map_err(Clone::clone));
            }
            WorkRequest::Shutdown { response } => {
                tracing::debug!("Worker {worker_id} received shutdown signal");

                if response.send(()).is_err() {
                    tracing::error!("Worker {worker_id} failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    tracing::trace!("Worker {worker_id} stopped");
}

/// Runs `f` against the loaded runtime, converting a panic into a failed
/// request and a worker that no longer serves.
fn run_guarded<T>(
    worker_id: usize,
    state: &mut Result<Box<dyn ModelRuntime>>,
    f: impl FnOnce(&mut dyn ModelRuntime) -> Result<T>,
) -> Result<T> {
    let runtime = match state {
        Ok(runtime) => runtime,
        Err(e) => return Err(e.clone()),
    };

    match catch_unwind(AssertUnwindSafe(|| f(runtime.as_mut()))) {
        Ok(result) => result,
        Err(_) => {
            *state = Err(poisoned(worker_id));
            Err(Error::generation("model runtime panicked"))
        }
    }
}

fn poisoned(worker_id: usize) -> Error {
    tracing::error!("Worker {worker_id} runtime panicked; worker stops serving");
    Error::worker_unavailable(format!("worker {worker_id} runtime panicked"))
}

fn unavailable(e: Error) -> Error {
    match e {
        e @ Error::WorkerUnavailable { .. } => e,
        other => Error::worker_unavailable(other.to_string()),
    }
}
