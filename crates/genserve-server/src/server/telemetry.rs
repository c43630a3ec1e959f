//! Logging, tracing and metrics.
//!
//! Logs always go to the console through `tracing-subscriber`, filtered by
//! `RUST_LOG` (default `info`). OpenTelemetry export is opt-in:
//!
//! - `tracing`: export spans (`generate` handler, `streaming` tasks).
//! - `metrics`: export per-deployment request metrics.
//! - `stdout` / `honeycomb`: where to export. Both may be enabled at once and
//!   each needs `tracing` or `metrics`.
//!
//! Honeycomb export reads `HONEYCOMB_ENDPOINT`, `HONEYCOMB_API_KEY` and
//! `HONEYCOMB_DATASET`, plus `HONEYCOMB_COMPRESSION` (`gzip` when unset).
//!
//! ```bash
//! cargo run --features tracing,metrics,honeycomb
//! ```
//!
//! The metric helpers at the bottom are callable in every build and do
//! nothing unless `metrics` is enabled.

#[cfg(all(
    any(feature = "honeycomb", feature = "stdout"),
    not(any(feature = "tracing", feature = "metrics"))
))]
compile_error!("Exporters require at least one of the 'tracing' or 'metrics' features.");

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, UpDownCounter};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace as sdktrace;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

const SERVICE_NAME: &str = "genserve";

/// Export pipelines that must be flushed before the process exits.
pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_names(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "tracing")]
    let (registry, tracer_provider) = {
        use opentelemetry::trace::TracerProvider;

        opentelemetry::global::set_text_map_propagator(
            opentelemetry_sdk::propagation::TraceContextPropagator::new(),
        );
        let provider = tracer_provider()?;
        opentelemetry::global::set_tracer_provider(provider.clone());
        let layer = tracing_opentelemetry::layer()
            .with_tracer(provider.tracer_with_scope(scope.clone()))
            .with_error_records_to_exceptions(true);
        (registry.with(layer), provider)
    };

    #[cfg(feature = "metrics")]
    let (registry, meter_provider) = {
        let provider = meter_provider()?;
        opentelemetry::global::set_meter_provider(provider.clone());
        let _ = METRICS.set(Metrics::new(&opentelemetry::global::meter_with_scope(scope)));
        let layer = tracing_opentelemetry::MetricsLayer::new(provider.clone());
        (registry.with(layer), provider)
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> opentelemetry_sdk::Resource {
    opentelemetry_sdk::Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

/// Connection settings shared by the Honeycomb span and metric exporters.
#[cfg(feature = "honeycomb")]
struct Honeycomb {
    endpoint: String,
    compression: opentelemetry_otlp::Compression,
    metadata: tonic::metadata::MetadataMap,
}

#[cfg(feature = "honeycomb")]
impl Honeycomb {
    const TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

    fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        use std::str::FromStr;

        let var = |key: &str| std::env::var(key).with_context(|| format!("missing `{key}`"));

        let mut metadata = tonic::metadata::MetadataMap::new();
        metadata.insert(
            "x-honeycomb-team",
            var("HONEYCOMB_API_KEY")?.parse().context("invalid API key")?,
        );
        metadata.insert(
            "x-honeycomb-dataset",
            var("HONEYCOMB_DATASET")?.parse().context("invalid dataset")?,
        );
        let compression = std::env::var("HONEYCOMB_COMPRESSION")
            .unwrap_or_else(|_| "gzip".into())
            .to_ascii_lowercase();

        Ok(Self {
            endpoint: var("HONEYCOMB_ENDPOINT")?,
            compression: opentelemetry_otlp::Compression::from_str(&compression)?,
            metadata,
        })
    }

    /// Applies the connection settings to an exporter builder.
    fn configure<B>(self, builder: B) -> B
    where
        B: opentelemetry_otlp::WithExportConfig + opentelemetry_otlp::WithTonicConfig,
    {
        builder
            .with_tls_config(tonic::transport::ClientTlsConfig::new().with_native_roots())
            .with_metadata(self.metadata)
            .with_compression(self.compression)
            .with_timeout(Self::TIMEOUT)
            .with_endpoint(self.endpoint)
            .with_protocol(opentelemetry_otlp::Protocol::Grpc)
    }
}

#[cfg(feature = "tracing")]
fn batch<E: opentelemetry_sdk::trace::SpanExporter + 'static>(
    exporter: E,
) -> sdktrace::BatchSpanProcessor {
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(std::time::Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build()
}

#[cfg(feature = "tracing")]
fn tracer_provider() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_span_processor(batch(opentelemetry_stdout::SpanExporter::default()));

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let exporter = Honeycomb::from_env()?
            .configure(opentelemetry_otlp::SpanExporter::builder().with_tonic())
            .build()
            .context("failed to build span exporter")?;
        builder.with_span_processor(batch(exporter))
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
fn meter_provider() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_reader(
        sdkmetrics::PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(std::time::Duration::from_secs(5))
            .build(),
    );

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let exporter = Honeycomb::from_env()?
            .configure(opentelemetry_otlp::MetricExporter::builder().with_tonic())
            .with_temporality(sdkmetrics::Temporality::Delta)
            .build()
            .context("failed to build metric exporter")?;
        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

/// Instruments recorded by the request path. Every instrument except
/// `fragments_emitted` carries a `deployment` attribute.
#[cfg(feature = "metrics")]
struct Metrics {
    requests: Counter<u64>,
    errors: Counter<u64>,
    streams_inflight: UpDownCounter<i64>,
    stream_duration: Histogram<f64>,
    fragments_emitted: Counter<u64>,
    tokens_per_request: Histogram<f64>,
}

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Metrics> = OnceLock::new();

#[cfg(feature = "metrics")]
impl Metrics {
    fn new(meter: &opentelemetry::metrics::Meter) -> Self {
        Self {
            requests: meter
                .u64_counter("requests")
                .with_description("Accepted generation requests")
                .build(),
            errors: meter
                .u64_counter("errors")
                .with_description("Rejected, failed or aborted requests")
                .build(),
            streams_inflight: meter
                .i64_up_down_counter("streams_inflight")
                .with_description("Streaming responses being written")
                .build(),
            stream_duration: meter
                .f64_histogram("stream_duration")
                .with_unit("ms")
                .with_description("Time from dispatch to the end of a stream")
                .build(),
            fragments_emitted: meter
                .u64_counter("fragments_emitted")
                .with_description("Text fragments written to streaming responses")
                .build(),
            tokens_per_request: meter
                .f64_histogram("tokens_per_request")
                .with_description("New tokens generated per non-streaming prompt")
                .build(),
        }
    }
}

/// Runs `f` with the metric handles and the deployment attribute.
#[cfg(feature = "metrics")]
fn with_metrics(deployment: &str, f: impl FnOnce(&Metrics, &[KeyValue])) {
    if let Some(metrics) = METRICS.get() {
        f(metrics, &[KeyValue::new("deployment", deployment.to_owned())]);
    }
}

pub fn increment_requests(deployment: &str) {
    #[cfg(feature = "metrics")]
    with_metrics(deployment, |m, attrs| m.requests.add(1, attrs));
    #[cfg(not(feature = "metrics"))]
    let _ = deployment;
}

pub fn increment_request_errors(deployment: &str) {
    #[cfg(feature = "metrics")]
    with_metrics(deployment, |m, attrs| m.errors.add(1, attrs));
    #[cfg(not(feature = "metrics"))]
    let _ = deployment;
}

pub fn increment_streams_inflight(deployment: &str) {
    #[cfg(feature = "metrics")]
    with_metrics(deployment, |m, attrs| m.streams_inflight.add(1, attrs));
    #[cfg(not(feature = "metrics"))]
    let _ = deployment;
}

pub fn decrement_streams_inflight(deployment: &str) {
    #[cfg(feature = "metrics")]
    with_metrics(deployment, |m, attrs| m.streams_inflight.add(-1, attrs));
    #[cfg(not(feature = "metrics"))]
    let _ = deployment;
}

pub fn record_stream_duration(deployment: &str, duration_ms: f64) {
    #[cfg(feature = "metrics")]
    with_metrics(deployment, |m, attrs| m.stream_duration.record(duration_ms, attrs));
    #[cfg(not(feature = "metrics"))]
    let _ = (deployment, duration_ms);
}

pub fn record_tokens_per_request(deployment: &str, count: f64) {
    #[cfg(feature = "metrics")]
    with_metrics(deployment, |m, attrs| m.tokens_per_request.record(count, attrs));
    #[cfg(not(feature = "metrics"))]
    let _ = (deployment, count);
}

pub fn increment_fragments_emitted() {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = METRICS.get() {
        metrics.fragments_emitted.add(1, &[]);
    }
}
