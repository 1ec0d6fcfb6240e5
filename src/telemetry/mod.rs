//! Where the agent's own logs, spans and metrics go.
//!
//! The agent only emits through `tracing` and the global meter; it never
//! installs a subscriber. The embedding application or the `pulse` binary
//! calls [`init_telemetry`] once. With an OTLP collector configured, spans,
//! metrics and log records are exported under a resource that names the
//! agent build; stderr output is installed either way.

pub mod metrics;
pub mod spans;

use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::warn;

use crate::error::{Error, Result};

pub struct TelemetryConfig {
    /// OTLP/gRPC collector, e.g. `http://localhost:4317`. Without one,
    /// nothing leaves the process.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Reported as `service.instance.id`, typically the tab id.
    pub instance: Option<String>,
    /// Filter used when `RUST_LOG` is not set.
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            service_name: env!("CARGO_PKG_NAME").to_string(),
            instance: None,
            default_filter: "info".to_string(),
        }
    }
}

impl TelemetryConfig {
    fn resource(&self) -> Resource {
        let mut attributes = vec![KeyValue::new("service.version", env!("CARGO_PKG_VERSION"))];
        if let Some(instance) = &self.instance {
            attributes.push(KeyValue::new("service.instance.id", instance.clone()));
        }
        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attributes(attributes)
            .build()
    }
}

/// The OTLP pipelines, built together against one collector.
struct Exporters {
    traces: SdkTracerProvider,
    metrics: SdkMeterProvider,
    logs: SdkLoggerProvider,
}

impl Exporters {
    fn build(endpoint: &str, resource: Resource) -> Result<Self> {
        use opentelemetry_otlp::{LogExporter, MetricExporter, SpanExporter, WithExportConfig as _};

        let exporter_error = |signal: &str, e: &dyn std::fmt::Display| {
            Error::Config(format!("OTLP {signal} exporter for {endpoint}: {e}"))
        };

        let spans = SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("span", &e))?;
        let traces = SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource.clone())
            .build();

        let readings = MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("metric", &e))?;
        let metrics = SdkMeterProvider::builder()
            .with_periodic_exporter(readings)
            .with_resource(resource.clone())
            .build();
        // Instruments in `metrics` resolve through the global provider.
        opentelemetry::global::set_meter_provider(metrics.clone());

        let records = LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("log", &e))?;
        let logs = SdkLoggerProvider::builder()
            .with_batch_exporter(records)
            .with_resource(resource)
            .build();

        Ok(Self {
            traces,
            metrics,
            logs,
        })
    }

    fn flush(&self) {
        let results = [
            ("traces", self.traces.force_flush()),
            ("metrics", self.metrics.force_flush()),
            ("logs", self.logs.force_flush()),
        ];
        for (signal, result) in results {
            if let Err(e) = result {
                warn!(signal, error = %e, "telemetry export flush failed");
            }
        }
    }

    fn shutdown(self) {
        let _ = self.logs.shutdown();
        let _ = self.metrics.shutdown();
        let _ = self.traces.shutdown();
    }
}

/// Keeps the exporters alive. Dropping it flushes and shuts them down, so
/// hold it for as long as the agent runs.
pub struct TelemetryGuard {
    exporters: Option<Exporters>,
}

impl TelemetryGuard {
    /// Whether signals are exported to a collector.
    pub fn is_exporting(&self) -> bool {
        self.exporters.is_some()
    }

    /// Export whatever the pipelines have buffered. The `pulse` binary calls
    /// this once its agents are torn down. No-op without a collector.
    pub fn flush(&self) {
        if let Some(exporters) = &self.exporters {
            exporters.flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(exporters) = self.exporters.take() {
            exporters.shutdown();
        }
    }
}

/// Install the global subscriber: env filter, stderr output and, when an
/// endpoint is configured, the OTLP span and log bridges.
///
/// # Errors
///
/// [`Error::Config`] when an exporter cannot be built for the endpoint, and
/// [`Error::Other`] when a global subscriber is already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let exporters = match config.endpoint.as_deref() {
        Some(endpoint) => Some(Exporters::build(endpoint, config.resource())?),
        None => None,
    };
    let span_layer = exporters.as_ref().map(|x| {
        tracing_opentelemetry::layer().with_tracer(x.traces.tracer(env!("CARGO_PKG_NAME")))
    });
    let log_layer = exporters
        .as_ref()
        .map(|x| OpenTelemetryTracingBridge::new(&x.logs));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
        .with(span_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("tracing subscriber already installed: {e}")))?;

    Ok(TelemetryGuard { exporters })
}
