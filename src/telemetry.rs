// SPDX-License-Identifier: MIT
//! Telemetry bootstrap: propagator, tracer, meter and logger providers.
//!
//! [`init_telemetry`] builds the three OTLP pipelines in a fixed order
//! (traces, metrics, logs), registers each provider's teardown in a
//! [`ShutdownRegistry`] as soon as the provider exists, and publishes the
//! providers through the process-wide `opentelemetry::global` state plus a
//! `tracing` subscriber. Construction is not atomic: if any step fails, the
//! providers built so far are drained immediately and the resulting
//! [`InitError`] carries both the construction failure and whatever the
//! rollback reported.
//!
//! All global reads/writes happen here and in the entry point; nothing else
//! touches the process-wide provider state.
//!
//! # Example
//! ```no_run
//! use dice_service::telemetry::{init_telemetry, TelemetryConfig};
//! fn main() -> anyhow::Result<()> {
//!     let handle = init_telemetry(TelemetryConfig::default())?;
//!     // ... application logic ...
//!     handle.shutdown()?; // flush remaining batches
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::time::Duration;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::{BatchConfigBuilder, BatchSpanProcessor, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use thiserror::Error;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::shutdown::{AggregateError, ShutdownRegistry};

/// Span batches are flushed every second so telemetry shows up quickly.
const TRACE_BATCH_DELAY: Duration = Duration::from_secs(1);
/// Metric collection interval.
const METRIC_EXPORT_INTERVAL: Duration = Duration::from_secs(3);
/// Budget handed to each provider teardown by [`TelemetryHandle::shutdown`].
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration used when initializing telemetry.
///
/// Values are sourced from environment variables if available:
/// * `OTEL_EXPORTER_OTLP_ENDPOINT` – base endpoint (e.g. `http://localhost:4318`).
/// * `OTEL_SERVICE_NAME` – service name resource attribute.
/// * `OTEL_SERVICE_INSTANCE_ID` – instance id resource attribute.
///
/// Defaults are used when variables are absent. All fields are owned strings to
/// simplify passing across threads and avoiding lifetime issues.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Base OTLP endpoint (without per-signal suffix). Example: `http://localhost:4318`.
    pub endpoint: String,
    /// Service name reported in resource attributes (`service.name`).
    pub service_name: String,
    /// Service version reported in resource attributes (`service.version`).
    pub service_version: String,
    /// Instance id reported in resource attributes (`service.instance.id`).
    pub service_instance_id: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:4318".to_string()),
            service_name: std::env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| "dice".to_string()),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            service_instance_id: std::env::var("OTEL_SERVICE_INSTANCE_ID")
                .unwrap_or_else(|_| std::process::id().to_string()),
        }
    }
}

/// The telemetry signal a construction step belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Traces,
    Metrics,
    Logs,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Signal::Traces => "traces",
            Signal::Metrics => "metrics",
            Signal::Logs => "logs",
        })
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A provider construction step failed before the provider existed.
#[derive(Debug, Error)]
#[error("failed to construct {signal} provider: {source}")]
pub struct ConstructionError {
    signal: Signal,
    source: BoxError,
}

impl ConstructionError {
    fn new(signal: Signal, source: impl Into<BoxError>) -> Self {
        Self {
            signal,
            source: source.into(),
        }
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }
}

/// Overall initialization failure: the construction error that aborted the
/// sequence, plus any errors reported while rolling back the providers that
/// were already registered.
#[derive(Debug, Error)]
#[error("{construction}{}", fmt_rollback(.rollback))]
pub struct InitError {
    construction: ConstructionError,
    rollback: Option<AggregateError>,
}

impl InitError {
    pub fn construction(&self) -> &ConstructionError {
        &self.construction
    }

    pub fn rollback(&self) -> Option<&AggregateError> {
        self.rollback.as_ref()
    }
}

fn fmt_rollback(rollback: &Option<AggregateError>) -> String {
    match rollback {
        Some(err) => format!("; rollback: {err}"),
        None => String::new(),
    }
}

/// Handle owning the teardowns of every constructed provider.
///
/// Dropping the handle without calling [`TelemetryHandle::shutdown`] may lose
/// final batches, depending on exporter internals. Always shut down at a
/// controlled point, typically just before process exit.
pub struct TelemetryHandle {
    registry: ShutdownRegistry,
}

impl TelemetryHandle {
    /// Drains every provider with [`DEFAULT_SHUTDOWN_TIMEOUT`].
    pub fn shutdown(self) -> Result<(), AggregateError> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    /// Drains every provider in registration order, granting each the given
    /// budget. Failures are collected, never short-circuited; see
    /// [`ShutdownRegistry::shutdown`].
    pub fn shutdown_with_timeout(self, budget: Duration) -> Result<(), AggregateError> {
        self.registry.shutdown(budget)
    }
}

/// Initialize traces, metrics and logs for the application.
///
/// Installs the composite propagator and global tracer/meter providers, and
/// sets up a subscriber registry with a compact console formatter, the OTLP
/// log bridge, and the OpenTelemetry span layer. The returned
/// [`TelemetryHandle`] must be explicitly shut down to flush export queues.
///
/// # Errors
/// Returns [`InitError`] if any exporter builder fails. Providers constructed
/// before the failing step are drained before this returns, and their
/// teardown errors (if any) are folded into the returned value.
pub fn init_telemetry(cfg: TelemetryConfig) -> Result<TelemetryHandle, InitError> {
    let resource = build_resource(&cfg);
    let base = cfg.endpoint.trim_end_matches('/').to_string();
    let mut registry = ShutdownRegistry::new();

    // The propagator has no teardown, so nothing is registered for it.
    global::set_text_map_propagator(propagator());

    let tracer_provider = match build_tracer_provider(&base, &resource) {
        Ok(provider) => provider,
        Err(e) => return Err(abort(registry, e)),
    };
    {
        let provider = tracer_provider.clone();
        registry.register(move |budget| provider.shutdown_with_timeout(budget));
    }
    global::set_tracer_provider(tracer_provider.clone());

    let meter_provider = match build_meter_provider(&base, &resource) {
        Ok(provider) => provider,
        Err(e) => return Err(abort(registry, e)),
    };
    {
        let provider = meter_provider.clone();
        registry.register(move |budget| provider.shutdown_with_timeout(budget));
    }
    global::set_meter_provider(meter_provider);

    let logger_provider = match build_logger_provider(&base, &resource) {
        Ok(provider) => provider,
        Err(e) => return Err(abort(registry, e)),
    };
    {
        let provider = logger_provider.clone();
        registry.register(move |budget| provider.shutdown_with_timeout(budget));
    }

    // Log records reach the logger provider through the tracing bridge rather
    // than a global logger registration.
    let bridge_layer = OpenTelemetryTracingBridge::new(&logger_provider);
    let otel_trace_layer =
        OpenTelemetryLayer::new(tracer_provider.tracer(cfg.service_name.clone()));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter());
    let fmt_layer = tracing_fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .with(bridge_layer)
        .with(otel_trace_layer)
        .init();

    Ok(TelemetryHandle { registry })
}

/// Rolls back every provider registered before a construction failure and
/// reports the union of the construction error and the rollback outcome.
fn abort(registry: ShutdownRegistry, construction: ConstructionError) -> InitError {
    let rollback = registry.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).err();
    InitError {
        construction,
        rollback,
    }
}

/// Debug floor for application logs. The HTTP export machinery is held at
/// `info` so exporting a log record cannot generate further records that
/// feed back into the exporter.
fn default_filter() -> EnvFilter {
    EnvFilter::new("debug,hyper=info,reqwest=info,h2=info,tower=info")
}

fn propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

fn build_resource(cfg: &TelemetryConfig) -> Resource {
    Resource::builder()
        .with_service_name(cfg.service_name.clone())
        .with_attributes([
            KeyValue::new("service.version", cfg.service_version.clone()),
            KeyValue::new("service.instance.id", cfg.service_instance_id.clone()),
        ])
        .build()
}

fn build_tracer_provider(
    base: &str,
    resource: &Resource,
) -> Result<SdkTracerProvider, ConstructionError> {
    let exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(format!("{base}/v1/traces"))
        .build()
        .map_err(|e| ConstructionError::new(Signal::Traces, e))?;

    let processor = BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            BatchConfigBuilder::default()
                .with_scheduled_delay(TRACE_BATCH_DELAY)
                .build(),
        )
        .build();

    Ok(SdkTracerProvider::builder()
        .with_span_processor(processor)
        .with_resource(resource.clone())
        .build())
}

fn build_meter_provider(
    base: &str,
    resource: &Resource,
) -> Result<SdkMeterProvider, ConstructionError> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(format!("{base}/v1/metrics"))
        .build()
        .map_err(|e| ConstructionError::new(Signal::Metrics, e))?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(METRIC_EXPORT_INTERVAL)
        .build();

    Ok(SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource.clone())
        .build())
}

fn build_logger_provider(
    base: &str,
    resource: &Resource,
) -> Result<SdkLoggerProvider, ConstructionError> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(format!("{base}/v1/logs"))
        .build()
        .map_err(|e| ConstructionError::new(Signal::Logs, e))?;

    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource.clone())
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_sdk::error::OTelSdkError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn abort_drains_already_registered_providers() {
        let mut registry = ShutdownRegistry::new();
        let drained = Arc::new(AtomicBool::new(false));
        {
            let drained = drained.clone();
            registry.register(move |_| {
                drained.store(true, Ordering::SeqCst);
                Ok(())
            });
        }
        let err = abort(
            registry,
            ConstructionError::new(Signal::Metrics, "exporter offline"),
        );
        assert!(drained.load(Ordering::SeqCst));
        assert!(err.rollback().is_none());
        assert_eq!(err.construction().signal(), Signal::Metrics);
        assert!(err.to_string().contains("exporter offline"));
    }

    #[test]
    fn abort_combines_construction_and_rollback_failures() {
        let mut registry = ShutdownRegistry::new();
        let drained = Arc::new(AtomicBool::new(false));
        {
            let drained = drained.clone();
            registry.register(move |_| {
                drained.store(true, Ordering::SeqCst);
                Err(OTelSdkError::InternalFailure("flush failed".into()))
            });
        }
        let err = abort(
            registry,
            ConstructionError::new(Signal::Logs, "bad endpoint"),
        );
        assert!(drained.load(Ordering::SeqCst));
        let rollback = err.rollback().expect("rollback errors recorded");
        assert_eq!(rollback.errors().len(), 1);
        let msg = err.to_string();
        assert!(msg.contains("bad endpoint"));
        assert!(msg.contains("flush failed"));
    }

    #[test]
    fn abort_with_empty_registry_reports_only_construction() {
        let err = abort(
            ShutdownRegistry::new(),
            ConstructionError::new(Signal::Traces, "no such host"),
        );
        assert!(err.rollback().is_none());
        assert_eq!(
            err.to_string(),
            "failed to construct traces provider: no such host"
        );
    }

    #[test]
    fn default_log_floor_is_debug_with_export_path_quieted() {
        let rendered = default_filter().to_string();
        assert!(rendered.contains("debug"));
        assert!(rendered.contains("hyper=info"));
        assert!(rendered.contains("reqwest=info"));
    }

    #[test]
    fn default_config_reads_version_from_manifest() {
        let cfg = TelemetryConfig::default();
        assert_eq!(cfg.service_version, env!("CARGO_PKG_VERSION"));
        assert!(!cfg.endpoint.is_empty());
    }
}
