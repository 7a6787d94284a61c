//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! use keelson_types::config::LoggingConfig;
//!
//! keelson_observe::tracing_setup::init_tracing(&LoggingConfig::default()).unwrap();
//! // ... run the engine ...
//! keelson_observe::tracing_setup::shutdown_tracing();
//! ```

use std::sync::OnceLock;

use keelson_types::config::{LogFormat, LoggingConfig};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Filter directive to use: `RUST_LOG` when set and non-empty, otherwise the
/// configured filter.
pub fn filter_directive<'a>(config: &'a LoggingConfig, rust_log: Option<&'a str>) -> &'a str {
    match rust_log {
        Some(directive) if !directive.trim().is_empty() => directive,
        _ => &config.filter,
    }
}

/// Initialize the global tracing subscriber.
///
/// - Installs a `fmt` layer, pretty or JSON per `config.format`, with target
///   visibility and span close timing.
/// - When `config.otel` is set, additionally bridges spans to OpenTelemetry
///   using a stdout exporter.
/// - `RUST_LOG` overrides `config.filter`.
///
/// # Errors
///
/// Returns an error if the filter directive is invalid or a global
/// subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let env_filter = EnvFilter::try_new(filter_directive(config, rust_log.as_deref()))?;

    let fmt_layer = match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
    };

    let otel_layer = if config.otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("keelson");

        // Store the provider for shutdown and register it globally.
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(otel_layer)
        .with(env_filter)
        .try_init()?;

    Ok(())
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// No-op when OTel was not enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}
