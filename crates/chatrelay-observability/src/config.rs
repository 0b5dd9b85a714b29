use std::{env, time::Duration};

use opentelemetry_otlp::Protocol;

use crate::{
    logs::{LogExporterKind, parse_log_exporter_kind},
    traces::{TraceExporterKind, parse_http_protocol, parse_trace_exporter_kind},
};

const DEFAULT_TRACE_TIMEOUT_MS: u64 = 3_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceConfig {
    pub exporter: TraceExporterKind,
    pub endpoint: String,
    pub http_protocol: Protocol,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_span_events: bool,
    pub log_exporter: LogExporterKind,
    /// `None` keeps OpenTelemetry export off.
    pub trace: Option<TraceConfig>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl ObservabilityConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// `RELAY_DEBUG` only lowers the default level; an explicit `RELAY_LOG_LEVEL` wins.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let value =
            |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let flag = |name: &str| value(name).map(|v| is_truthy(&v)).unwrap_or(false);

        let log_level = value("RELAY_LOG_LEVEL")
            .unwrap_or_else(|| if flag("RELAY_DEBUG") { "debug" } else { "info" }.to_string());
        let log_exporter =
            parse_log_exporter_kind(&value("RELAY_LOG_EXPORTER").unwrap_or_default());

        let trace = flag("RELAY_TRACE_ENABLED").then(|| {
            let exporter = value("RELAY_OTEL_TRACE_EXPORTER")
                .and_then(|raw| parse_trace_exporter_kind(&raw))
                .unwrap_or(TraceExporterKind::OtlpGrpc);
            TraceConfig {
                exporter,
                endpoint: value("RELAY_OTEL_TRACE_ENDPOINT")
                    .unwrap_or_else(|| exporter.default_endpoint().to_string()),
                http_protocol: parse_http_protocol(
                    &value("RELAY_OTEL_TRACE_HTTP_PROTOCOL").unwrap_or_default(),
                ),
                timeout: Duration::from_millis(
                    value("RELAY_OTEL_TRACE_TIMEOUT_MS")
                        .and_then(|raw| raw.parse::<u64>().ok())
                        .unwrap_or(DEFAULT_TRACE_TIMEOUT_MS),
                ),
            }
        });

        Self { log_level, log_span_events: flag("RELAY_LOG_SPAN_EVENTS"), log_exporter, trace }
    }
}

pub(crate) fn is_truthy(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> ObservabilityConfig {
        let vars = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        ObservabilityConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_log_info_to_stdout_without_traces() {
        let config = config(&[]);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_exporter, LogExporterKind::Stdout);
        assert!(!config.log_span_events);
        assert_eq!(config.trace, None);
    }

    #[test]
    fn debug_flag_only_changes_default_level() {
        assert_eq!(config(&[("RELAY_DEBUG", "true")]).log_level, "debug");
        assert_eq!(
            config(&[("RELAY_DEBUG", "true"), ("RELAY_LOG_LEVEL", "warn")]).log_level,
            "warn"
        );
    }

    #[test]
    fn trace_settings_pick_exporter_defaults() {
        let config = config(&[
            ("RELAY_TRACE_ENABLED", "yes"),
            ("RELAY_OTEL_TRACE_EXPORTER", "otlp-http"),
            ("RELAY_OTEL_TRACE_TIMEOUT_MS", "not-a-number"),
        ]);
        let trace = config.trace.expect("trace config");
        assert_eq!(trace.exporter, TraceExporterKind::OtlpHttp);
        assert_eq!(trace.endpoint, "http://127.0.0.1:4318/v1/traces");
        assert_eq!(trace.http_protocol, Protocol::HttpBinary);
        assert_eq!(trace.timeout, Duration::from_millis(DEFAULT_TRACE_TIMEOUT_MS));
    }

    #[test]
    fn explicit_endpoint_overrides_default() {
        let config = config(&[
            ("RELAY_TRACE_ENABLED", "1"),
            ("RELAY_OTEL_TRACE_ENDPOINT", "http://collector:4317"),
        ]);
        let trace = config.trace.expect("trace config");
        assert_eq!(trace.exporter, TraceExporterKind::OtlpGrpc);
        assert_eq!(trace.endpoint, "http://collector:4317");
    }
}
