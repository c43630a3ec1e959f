use super::*;
use crate::{
    TokenId,
    bridge::{StreamItem, StreamReceiver, stream_channel},
    runtime::{GenerateParams, ModelRuntime, TokenSink},
    stop::StoppingCriteria,
    tokenizer::{ByteTokenizer, Tokenizer},
};
use core::time::Duration;
use std::sync::Mutex;

/// Emits a fixed script of tokens, one per step.
#[derive(Clone, Default)]
struct ScriptedRuntime {
    script: Vec<TokenId>,
    fail_after: Option<usize>,
    panic_after: Option<usize>,
    delay: Option<Duration>,
    stop_checks: Arc<Mutex<Vec<bool>>>,
}

impl ScriptedRuntime {
    fn new(script: Vec<TokenId>) -> Self {
        Self {
            script,
            ..Default::default()
        }
    }
}

impl ModelRuntime for ScriptedRuntime {
    fn generate(
        &mut self,
        input: &[TokenId],
        params: &GenerateParams,
        stop: &dyn StoppingCriteria,
        mut sink: Option<&mut dyn TokenSink>,
    ) -> Result<TokenSequence> {
        let mut tokens = input.to_vec();
        if let Some(sink) = sink.as_mut() {
            sink.put(input)?;
        }
        for (step, &next) in self.script.iter().enumerate() {
            if self.fail_after == Some(step) {
                return Err(Error::generation("out of memory"));
            }
            if self.panic_after == Some(step) {
                panic!("kernel fault");
            }
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            tokens.push(next);
            if let Some(sink) = sink.as_mut() {
                sink.put(&[next])?;
            }
            let halt = stop.should_stop(&tokens);
            self.stop_checks.lock().unwrap().push(halt);
            if halt || Some(next) == params.eos_token_id {
                break;
            }
        }
        if let Some(sink) = sink.as_mut() {
            sink.end()?;
        }
        Ok(tokens)
    }
}

fn text(s: &str) -> Vec<TokenId> {
    ByteTokenizer::new().encode(s, false).unwrap()
}

fn settings(runtime: ScriptedRuntime, stop_words: &[&str]) -> WorkerSettings {
    let tokenizer = Arc::new(ByteTokenizer::new());
    let words: Vec<String> = stop_words.iter().map(|w| (*w).to_string()).collect();
    let stop = StopCondition::from_words(tokenizer.as_ref(), &words).unwrap();
    let loader = move |_: &LoadOptions| -> Result<Box<dyn ModelRuntime>> {
        Ok(Box::new(runtime.clone()))
    };
    WorkerSettings {
        name: "test".into(),
        load: LoadOptions::default(),
        loader: Arc::new(loader),
        tokenizer,
        stop: Arc::new(stop),
        skip_prompt: true,
        queue_capacity: 8,
    }
}

fn pool(runtime: ScriptedRuntime, stop_words: &[&str]) -> WorkerPool {
    WorkerPool::spawn(&settings(runtime, stop_words), 1, Duration::from_secs(1)).unwrap()
}

/// Drains a receiver, returning the cumulative text after every fragment.
async fn cumulative(mut rx: StreamReceiver) -> Result<Vec<String>> {
    let mut total = String::new();
    let mut chunks = Vec::new();
    loop {
        match rx.get().await? {
            StreamItem::Fragment(fragment) => {
                total.push_str(&fragment);
                chunks.push(total.clone());
            }
            StreamItem::End => return Ok(chunks),
        }
    }
}

#[tokio::test]
async fn ping_resolves_after_load() {
    let pool = pool(ScriptedRuntime::default(), &[]);
    pool.ping(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn ping_reports_load_failure() {
    let mut settings = settings(ScriptedRuntime::default(), &[]);
    settings.loader = Arc::new(|_: &LoadOptions| -> Result<Box<dyn ModelRuntime>> {
        Err(Error::generation("weights not found"))
    });
    let pool = WorkerPool::spawn(&settings, 2, Duration::from_secs(1)).unwrap();

    let err = pool.ping(Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, Error::WorkerUnavailable { .. }));
    assert!(err.to_string().contains("weights not found"));

    // Requests are refused with the same reason.
    let err = pool
        .generate(text("Hi"), GenerationConfig::new(), pool.request_token())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkerUnavailable { .. }));
}

#[tokio::test]
async fn generate_returns_prompt_and_completion() {
    let pool = pool(ScriptedRuntime::new(text(" there")), &[]);
    let out = pool
        .generate(text("Hi"), GenerationConfig::new(), pool.request_token())
        .await
        .unwrap();
    assert_eq!(ByteTokenizer::new().decode(&out, true).unwrap(), "Hi there");
}

#[tokio::test]
async fn generate_halts_on_stop_word() {
    let pool = pool(ScriptedRuntime::new(text("abc###def")), &["###"]);
    let out = pool
        .generate(text(">"), GenerationConfig::new(), pool.request_token())
        .await
        .unwrap();
    assert_eq!(ByteTokenizer::new().decode(&out, true).unwrap(), ">abc###");
}

#[tokio::test]
async fn generate_failure_returns_no_partial_output() {
    let mut runtime = ScriptedRuntime::new(text("abcdef"));
    runtime.fail_after = Some(3);
    let pool = pool(runtime, &[]);
    let err = pool
        .generate(text("x"), GenerationConfig::new(), pool.request_token())
        .await
        .unwrap_err();
    assert_eq!(err, Error::generation("out of memory"));
}

#[tokio::test]
async fn stop_word_scenario_streams_text_then_end() {
    let mut script = text("Hello");
    script.push(ByteTokenizer::EOS_ID);
    script.extend(text(" never"));
    let runtime = ScriptedRuntime::new(script);
    let checks = Arc::clone(&runtime.stop_checks);
    let pool = pool(runtime, &["</s>"]);

    let (tx, rx) = stream_channel(16, Some(Duration::from_secs(5)));
    pool.streaming_generate(text("Hi"), GenerationConfig::new(), tx, pool.request_token())
        .await
        .unwrap();

    let chunks = cumulative(rx).await.unwrap();
    assert_eq!(chunks.last().map(String::as_str), Some("Hello"));

    // The evaluator fired exactly on the `</s>` token.
    let checks = checks.lock().unwrap().clone();
    assert_eq!(checks.len(), 6);
    assert!(checks[..5].iter().all(|hit| !hit));
    assert!(checks[5]);
}

#[tokio::test]
async fn streamed_chunks_strictly_extend() {
    let pool = pool(ScriptedRuntime::new(text("one two three\nfour")), &[]);
    let (tx, rx) = stream_channel(4, None);
    pool.streaming_generate(text("go"), GenerationConfig::new(), tx, pool.request_token())
        .await
        .unwrap();

    let chunks = cumulative(rx).await.unwrap();
    assert_eq!(
        chunks,
        vec!["one ", "one two ", "one two three\n", "one two three\nfour"]
    );
    for pair in chunks.windows(2) {
        assert!(pair[1].starts_with(&pair[0]) && pair[1].len() > pair[0].len());
    }
}

#[tokio::test]
async fn stream_failure_terminates_without_end() {
    let mut runtime = ScriptedRuntime::new(text("ab cd ef"));
    runtime.fail_after = Some(4);
    let pool = pool(runtime, &[]);

    let (tx, mut rx) = stream_channel(8, None);
    pool.streaming_generate(text(""), GenerationConfig::new(), tx, pool.request_token())
        .await
        .unwrap();

    assert_eq!(
        rx.get().await.unwrap(),
        StreamItem::Fragment("ab ".into())
    );
    assert_eq!(rx.get().await.unwrap_err(), Error::generation("out of memory"));
}

#[tokio::test]
async fn panicking_runtime_takes_worker_out_of_service() {
    let mut runtime = ScriptedRuntime::new(text("abc"));
    runtime.panic_after = Some(1);
    let pool = pool(runtime, &[]);

    let err = pool
        .generate(text("x"), GenerationConfig::new(), pool.request_token())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Generation { .. }));

    let err = pool.ping(Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, Error::WorkerUnavailable { .. }));
}

#[tokio::test]
async fn independent_channels_do_not_interleave() {
    let mut runtime = ScriptedRuntime::new(text("w w w w w w "));
    runtime.delay = Some(Duration::from_millis(1));
    let settings = settings(runtime, &[]);
    let pool = WorkerPool::spawn(&settings, 2, Duration::from_secs(1)).unwrap();

    let mut receivers = Vec::new();
    for prompt in ["a", "b", "c", "d"] {
        let (tx, rx) = stream_channel(2, None);
        pool.streaming_generate(text(prompt), GenerationConfig::new(), tx, pool.request_token())
            .await
            .unwrap();
        receivers.push(rx);
    }

    let results = futures::future::join_all(receivers.into_iter().map(cumulative)).await;
    for chunks in results {
        let chunks = chunks.unwrap();
        assert_eq!(chunks.len(), 6);
        assert_eq!(chunks.last().unwrap(), "w w w w w w ");
    }
}

#[tokio::test]
async fn cancellation_halts_stream_early() {
    let mut runtime = ScriptedRuntime::new(text(&"tok ".repeat(2_000)));
    runtime.delay = Some(Duration::from_millis(1));
    let pool = pool(runtime, &[]);

    let cancel = pool.request_token();
    let (tx, mut rx) = stream_channel(1, None);
    pool.streaming_generate(text("p"), GenerationConfig::new(), tx, cancel.clone())
        .await
        .unwrap();

    assert_eq!(rx.get().await.unwrap(), StreamItem::Fragment("tok ".into()));
    cancel.cancel();

    let mut seen = 1;
    let err = loop {
        match rx.get().await {
            Ok(StreamItem::Fragment(_)) => seen += 1,
            Ok(StreamItem::End) => panic!("cancelled stream ended normally"),
            Err(e) => break e,
        }
    };
    assert_eq!(err, Error::RequestCancelled);
    assert!(seen < 2_000, "stream ran to completion after cancellation");
}

#[tokio::test]
async fn shutdown_fails_streams_that_outlive_the_drain() {
    let mut runtime = ScriptedRuntime::new(text(&"word ".repeat(2_000)));
    runtime.delay = Some(Duration::from_millis(1));
    let pool = WorkerPool::spawn(&settings(runtime, &[]), 1, Duration::from_millis(50)).unwrap();
    pool.ping(Duration::from_secs(5)).await.unwrap();

    let (tx, rx) = stream_channel(1, None);
    let inflight = pool.track_stream();
    pool.streaming_generate(text("p"), GenerationConfig::new(), tx, pool.request_token())
        .await
        .unwrap();

    let consume = async move {
        let result = cumulative(rx).await;
        drop(inflight);
        result
    };
    let ((), result) = tokio::join!(pool.shutdown(), consume);

    // Truncated text must never look like a finished generation.
    assert_eq!(result.unwrap_err(), Error::RequestCancelled);
}

#[tokio::test]
async fn shutdown_refuses_new_requests() {
    let pool = pool(ScriptedRuntime::new(text("a")), &[]);
    pool.ping(Duration::from_secs(5)).await.unwrap();
    pool.shutdown().await;

    let err = pool
        .generate(text("x"), GenerationConfig::new(), pool.request_token())
        .await
        .unwrap_err();
    assert_eq!(err, Error::ServiceShutdown);
}

#[tokio::test]
async fn spawn_keeps_at_least_one_worker() {
    let pool = WorkerPool::spawn(
        &settings(ScriptedRuntime::new(text("!")), &[]),
        0,
        Duration::from_secs(1),
    )
    .unwrap();
    assert_eq!(pool.len(), 1);

    let out = pool
        .generate(text("hi"), GenerationConfig::new(), pool.request_token())
        .await
        .unwrap();
    assert_eq!(out, text("hi!"));
}

#[tokio::test]
async fn stream_guard_tracks_inflight() {
    let pool = pool(ScriptedRuntime::default(), &[]);
    let a = pool.track_stream();
    let b = pool.track_stream();
    assert_eq!(pool.streams_inflight(), 2);
    drop(a);
    drop(b);
    assert_eq!(pool.streams_inflight(), 0);
}
