use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod config;
pub mod logs;
pub mod traces;

pub use config::{ObservabilityConfig, TraceConfig};
pub use logs::LogExporterKind;
pub use traces::TraceExporterKind;

/// Keeps the tracer provider alive; dropping it flushes pending spans.
#[must_use]
pub struct ObservabilityGuard {
    provider: Option<SdkTracerProvider>,
}

impl ObservabilityGuard {
    pub fn tracing_exported(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(error) = provider.shutdown() {
                eprintln!("chatrelay: tracer provider shutdown failed: {error}");
            }
        }
    }
}

/// Installs the global subscriber. Exporter failures never abort startup: the relay keeps
/// logging and runs without span export.
pub fn init_observability(service_name: &str, config: &ObservabilityConfig) -> ObservabilityGuard {
    let env_filter = logs::build_env_filter(&config.log_level);
    let fmt_layer = (config.log_exporter == LogExporterKind::Stdout).then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stdout)
            .with_span_events(logs::span_events_mask(config.log_span_events))
    });

    let provider = config.trace.as_ref().and_then(|trace| {
        match traces::build_tracer_provider(service_name, trace) {
            Ok(provider) => Some(provider),
            Err(error) => {
                eprintln!(
                    "chatrelay: failed to initialize OTLP trace exporter (kind={}, endpoint={}): {error}. continuing in soft mode.",
                    trace.exporter.as_str(),
                    trace.endpoint
                );
                None
            }
        }
    });
    let telemetry_layer = provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(service_name.to_string()))
    });
    if let Some(provider) = &provider {
        opentelemetry::global::set_tracer_provider(provider.clone());
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(telemetry_layer)
        .try_init()
        .ok();

    ObservabilityGuard { provider }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_without_tracing_is_repeatable() {
        let config = ObservabilityConfig::from_lookup(|_| None);
        let first = init_observability("chatrelay-test", &config);
        let second = init_observability("chatrelay-test", &config);
        assert!(!first.tracing_exported());
        assert!(!second.tracing_exported());
    }
}
