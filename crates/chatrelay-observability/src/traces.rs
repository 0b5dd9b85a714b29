use opentelemetry_otlp::{Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};

use crate::config::TraceConfig;

const DEFAULT_OTEL_TRACE_GRPC_ENDPOINT: &str = "http://127.0.0.1:4317";
const DEFAULT_OTEL_TRACE_HTTP_ENDPOINT: &str = "http://127.0.0.1:4318/v1/traces";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceExporterKind {
    OtlpGrpc,
    OtlpHttp,
}

impl TraceExporterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OtlpGrpc => "otlp_grpc",
            Self::OtlpHttp => "otlp_http",
        }
    }

    pub fn default_endpoint(self) -> &'static str {
        match self {
            Self::OtlpGrpc => DEFAULT_OTEL_TRACE_GRPC_ENDPOINT,
            Self::OtlpHttp => DEFAULT_OTEL_TRACE_HTTP_ENDPOINT,
        }
    }
}

pub fn parse_trace_exporter_kind(raw: &str) -> Option<TraceExporterKind> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "otlp_grpc" | "otlp-grpc" | "grpc" => Some(TraceExporterKind::OtlpGrpc),
        "otlp_http" | "otlp-http" | "http" => Some(TraceExporterKind::OtlpHttp),
        _ => None,
    }
}

pub fn parse_http_protocol(raw: &str) -> Protocol {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Protocol::HttpJson,
        _ => Protocol::HttpBinary,
    }
}

pub fn build_span_exporter(config: &TraceConfig) -> Result<SpanExporter, String> {
    let built = match config.exporter {
        TraceExporterKind::OtlpGrpc => SpanExporter::builder()
            .with_tonic()
            .with_endpoint(config.endpoint.clone())
            .with_timeout(config.timeout)
            .build(),
        TraceExporterKind::OtlpHttp => SpanExporter::builder()
            .with_http()
            .with_endpoint(config.endpoint.clone())
            .with_timeout(config.timeout)
            .with_protocol(config.http_protocol)
            .build(),
    };
    built.map_err(|err| err.to_string())
}

/// Batch-exporting provider tagged with `service.name`.
pub fn build_tracer_provider(
    service_name: &str,
    config: &TraceConfig,
) -> Result<SdkTracerProvider, String> {
    let exporter = build_span_exporter(config)?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(Resource::builder().with_service_name(service_name.to_string()).build())
        .build())
}
