use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

const RELAY_CRATES: [&str; 5] = [
    "chatrelay_app",
    "chatrelay_core",
    "chatrelay_clients",
    "chatrelay_stats",
    "chatrelay_observability",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogExporterKind {
    Stdout,
    None,
}

pub fn parse_log_exporter_kind(raw: &str) -> LogExporterKind {
    match raw.trim().to_ascii_lowercase().as_str() {
        "none" | "off" => LogExporterKind::None,
        _ => LogExporterKind::Stdout,
    }
}

pub fn span_events_mask(log_span_events: bool) -> FmtSpan {
    if log_span_events { FmtSpan::NEW | FmtSpan::CLOSE } else { FmtSpan::NONE }
}

/// Used when `RUST_LOG` is absent.
pub fn fallback_directive(level: &str) -> String {
    std::iter::once(level.to_string())
        .chain(RELAY_CRATES.iter().map(|name| format!("{name}={level}")))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn build_env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback_directive(level)))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
