use std::io::IsTerminal;

use anyhow::Result;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    trace::{SdkTracerProvider, TracerProviderBuilder},
    Resource,
};
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::config::DirectoryConfig;

const SERVICE_NAME: &str = "blobdir";

pub fn get_env_filter() -> tracing_subscriber::EnvFilter {
    // RUST_LOG used to control logging level.
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    })
}

pub fn get_log_layer<S>(config: &DirectoryConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    S: tracing::Subscriber,
{
    if config.structured_logging() {
        return Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        );
    }

    Box::new(
        tracing_subscriber::fmt::layer()
            .with_ansi(std::io::stderr().is_terminal())
            .with_writer(std::io::stderr)
            .compact(),
    )
}

/// Installs the global subscriber. Returns the tracer provider when span
/// export is enabled so the caller can flush it before exiting.
pub fn setup_tracing(config: &DirectoryConfig) -> Result<Option<SdkTracerProvider>> {
    let base = tracing_subscriber::Registry::default();

    if !config.telemetry.enable_tracing {
        let log_layer = get_log_layer(config).with_filter(get_env_filter());
        tracing::subscriber::set_global_default(base.with(log_layer))?;
        return Ok(None);
    }

    let mut exporter = SpanExporter::builder().with_tonic();
    if let Some(endpoint) = &config.telemetry.endpoint {
        exporter = exporter.with_endpoint(endpoint.clone());
    }
    let tracer_provider = TracerProviderBuilder::default()
        .with_resource(
            Resource::builder_empty()
                .with_service_name(SERVICE_NAME)
                .build(),
        )
        .with_batch_exporter(exporter.build()?)
        .build();
    let span_layer = tracing_opentelemetry::layer()
        .with_tracer(tracer_provider.tracer(SERVICE_NAME))
        .with_filter(get_env_filter());

    let log_layer = get_log_layer(config).with_filter(get_env_filter());
    tracing::subscriber::set_global_default(base.with(span_layer).with(log_layer))?;
    Ok(Some(tracer_provider))
}
