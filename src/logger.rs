use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Result;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider};
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

const SERVICE_NAME: &str = "channel-host";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogConfig {
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
}

impl LogConfig {
    pub fn new(log_level: impl Into<String>, log_dir: Option<PathBuf>, otel_endpoint: Option<String>) -> Self {
        Self {
            log_level: log_level.into(),
            log_dir,
            otel_endpoint,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("info", None, None)
    }
}

/// Keeps exporters and file writers alive; flushes them on drop.
#[derive(Default)]
pub struct TelemetryGuard {
    logger_provider: Option<SdkLoggerProvider>,
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
    file_guards: Vec<WorkerGuard>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(p) = self.logger_provider.take() {
            let _ = p.shutdown();
        }
        if let Some(p) = self.tracer_provider.take() {
            let _ = p.shutdown();
        }
        if let Some(p) = self.meter_provider.take() {
            let _ = p.shutdown();
        }
        self.file_guards.clear();
    }
}

/// Installs the global tracing subscriber.
///
/// - with an OTLP endpoint: logs, spans and metrics go over OTLP/HTTP, plus stdout;
/// - with a log directory: a daily text log and a daily JSON event log;
/// - otherwise: stdout only.
pub fn init_tracing(config: &LogConfig) -> Result<TelemetryGuard> {
    if let Some(endpoint) = config.otel_endpoint.as_deref() {
        return init_otlp(&config.log_level, endpoint);
    }
    if let Some(dir) = config.log_dir.as_ref() {
        return init_files(&config.log_level, dir.clone());
    }
    Registry::default()
        .with(EnvFilter::try_new(&config.log_level)?)
        .with(fmt::layer().with_thread_names(true))
        .try_init()?;
    Ok(TelemetryGuard::default())
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_otlp(log_level: &str, endpoint: &str) -> Result<TelemetryGuard> {
    let log_exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()?;
    let logger_provider = SdkLoggerProvider::builder()
        .with_batch_exporter(log_exporter)
        .with_resource(get_resource())
        .build();

    let span_exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(span_exporter)
        .with_resource(get_resource())
        .build();

    let metric_exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()?;
    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .with_resource(get_resource())
        .build();

    // the exporters themselves speak HTTP; keep their own logs out of the pipeline
    let otel_filter = EnvFilter::try_new(log_level)?
        .add_directive("hyper=off".parse()?)
        .add_directive("h2=off".parse()?)
        .add_directive("reqwest=off".parse()?);
    let otel_layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(otel_filter);
    let fmt_layer = fmt::layer()
        .with_thread_names(true)
        .with_filter(EnvFilter::try_new(log_level)?);

    Registry::default().with(otel_layer).with(fmt_layer).try_init()?;

    global::set_tracer_provider(tracer_provider.clone());
    global::set_meter_provider(meter_provider.clone());

    Ok(TelemetryGuard {
        logger_provider: Some(logger_provider),
        tracer_provider: Some(tracer_provider),
        meter_provider: Some(meter_provider),
        file_guards: Vec::new(),
    })
}

fn init_files(log_level: &str, dir: PathBuf) -> Result<TelemetryGuard> {
    std::fs::create_dir_all(&dir)?;

    let txt_appender = RollingFileAppender::new(Rotation::DAILY, &dir, "channel-host.log");
    let (txt_writer, txt_guard) = tracing_appender::non_blocking(txt_appender);
    let txt_layer = fmt::layer().with_writer(txt_writer).with_ansi(false);

    // connection lifecycle events (target = "io_event") as newline-delimited JSON
    let json_appender = RollingFileAppender::new(Rotation::DAILY, &dir, "channel-host-events.json");
    let (json_writer, json_guard) = tracing_appender::non_blocking(json_appender);
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_writer)
        .with_target(true)
        .with_filter(EnvFilter::try_new("io_event=info")?);

    Registry::default()
        .with(EnvFilter::try_new(log_level)?)
        .with(txt_layer)
        .with(json_layer)
        .try_init()?;

    Ok(TelemetryGuard {
        logger_provider: None,
        tracer_provider: None,
        meter_provider: None,
        file_guards: vec![txt_guard, json_guard],
    })
}

/// Counters recorded by the I/O layer.
///
/// Created from the global meter on first use, so they export through OTLP
/// when `init_tracing` installed a meter provider and are no-ops otherwise.
pub struct IoMetrics {
    pub connections_opened: Counter<u64>,
    pub reconnect_attempts: Counter<u64>,
    pub frames_received: Counter<u64>,
    pub messages_dispatched: Counter<u64>,
    pub messages_evicted: Counter<u64>,
}

static METRICS: OnceLock<IoMetrics> = OnceLock::new();

pub fn metrics() -> &'static IoMetrics {
    METRICS.get_or_init(|| {
        let meter = global::meter(SERVICE_NAME);
        IoMetrics {
            connections_opened: meter
                .u64_counter("io_connections_opened")
                .with_description("Successful transport connects, including reconnects")
                .build(),
            reconnect_attempts: meter.u64_counter("io_reconnect_attempts").build(),
            frames_received: meter.u64_counter("io_frames_received").build(),
            messages_dispatched: meter.u64_counter("io_messages_dispatched").build(),
            messages_evicted: meter
                .u64_counter("io_messages_evicted")
                .with_description("Queued messages dropped because a session queue was full")
                .build(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_are_usable_without_a_provider() {
        let m = metrics();
        m.frames_received.add(1, &[]);
        m.messages_evicted.add(2, &[opentelemetry::KeyValue::new("channel_id", "acme.test")]);
    }

    #[test]
    fn default_log_config_is_stdout_info() {
        let c = LogConfig::default();
        assert_eq!(c.log_level, "info");
        assert!(c.log_dir.is_none());
        assert!(c.otel_endpoint.is_none());
    }
}
