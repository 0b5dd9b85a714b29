use std::env;

use chatrelay_core::{SystemRolePolicy, Template, ThinkingMode};

pub const DEFAULT_API_KEY: &str = "sk-relay-key";
pub const DEFAULT_FE_VERSION: &str = "prod-fe-1.0.94";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    Dolphin,
    Zai,
}

impl UpstreamKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dolphin" | "dphn" => Some(Self::Dolphin),
            "zai" | "z.ai" => Some(Self::Zai),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dolphin => "dolphin",
            Self::Zai => "zai",
        }
    }

    fn default_origin(self) -> &'static str {
        match self {
            Self::Dolphin => "https://chat.dphn.ai",
            Self::Zai => "https://chat.z.ai",
        }
    }

    fn default_chat_url(self) -> &'static str {
        match self {
            Self::Dolphin => "https://chat.dphn.ai/api/chat",
            Self::Zai => "https://chat.z.ai/api/chat/completions",
        }
    }

    fn default_models_url(self) -> &'static str {
        match self {
            Self::Dolphin => "https://chat.dphn.ai/api/models",
            Self::Zai => "https://chat.z.ai/api/models",
        }
    }

    fn default_model_name(self) -> &'static str {
        match self {
            Self::Dolphin => "Dolphin 24B",
            Self::Zai => "GLM-4.5",
        }
    }

    fn default_upstream_model(self) -> &'static str {
        match self {
            Self::Dolphin => "dolphinpod:24B",
            Self::Zai => "0727-360B-API",
        }
    }

    /// Dolphin rejects the `system` role.
    fn default_system_role(self) -> SystemRolePolicy {
        match self {
            Self::Dolphin => SystemRolePolicy::remap_with_default_prefix(),
            Self::Zai => SystemRolePolicy::Passthrough,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub api_key: String,
    pub upstream: UpstreamKind,
    pub upstream_origin: String,
    pub upstream_url: String,
    pub models_url: String,
    pub model_name: String,
    pub upstream_model: String,
    pub upstream_token: Option<String>,
    pub anonymous_token_enabled: bool,
    pub fe_version: String,
    pub default_stream: bool,
    pub default_template: Template,
    pub enable_thinking: bool,
    pub thinking_mode: ThinkingMode,
    pub system_role: SystemRolePolicy,
    pub dashboard_enabled: bool,
    pub upstream_timeout_seconds: u64,
    pub upstream_max_inflight: usize,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid RELAY_PORT value: {0}")]
    InvalidPort(String),
    #[error("invalid RELAY_UPSTREAM value: {0} (expected dolphin or zai)")]
    InvalidUpstream(String),
    #[error("invalid {name} value: {value}")]
    InvalidBool { name: &'static str, value: String },
    #[error("invalid {name} value: {value}")]
    InvalidNumber { name: &'static str, value: String },
    #[error("invalid RELAY_DEFAULT_TEMPLATE value: {0}")]
    InvalidTemplate(String),
    #[error("invalid RELAY_THINK_TAGS_MODE value: {0} (expected raw, strip or think)")]
    InvalidThinkingMode(String),
    #[error("invalid RELAY_SYSTEM_ROLE value: {0} (expected passthrough or remap)")]
    InvalidSystemRole(String),
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let value =
            |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let flag = |name: &'static str, default: bool| match value(name) {
            Some(raw) => parse_bool(&raw).ok_or(ConfigError::InvalidBool { name, value: raw }),
            None => Ok(default),
        };

        let upstream = match value("RELAY_UPSTREAM") {
            Some(raw) => UpstreamKind::parse(&raw).ok_or(ConfigError::InvalidUpstream(raw))?,
            None => UpstreamKind::Dolphin,
        };

        let port_raw = value("RELAY_PORT").unwrap_or_else(|| "9091".to_string());
        let port = port_raw.parse::<u16>().map_err(|_| ConfigError::InvalidPort(port_raw.clone()))?;

        let default_template = match value("RELAY_DEFAULT_TEMPLATE") {
            Some(raw) => Template::parse(&raw).ok_or(ConfigError::InvalidTemplate(raw))?,
            None => Template::Logical,
        };
        let thinking_mode = match value("RELAY_THINK_TAGS_MODE") {
            Some(raw) => raw.parse::<ThinkingMode>().map_err(ConfigError::InvalidThinkingMode)?,
            None => ThinkingMode::Strip,
        };
        let system_role = match value("RELAY_SYSTEM_ROLE") {
            Some(raw) => parse_system_role(&raw).ok_or(ConfigError::InvalidSystemRole(raw))?,
            None => upstream.default_system_role(),
        };

        let number = |name: &'static str, default: &str| {
            let raw = value(name).unwrap_or_else(|| default.to_string());
            parse_positive_usize(&raw).ok_or(ConfigError::InvalidNumber { name, value: raw })
        };
        let upstream_timeout_seconds = number("RELAY_UPSTREAM_TIMEOUT", "120")? as u64;
        let upstream_max_inflight = number("RELAY_UPSTREAM_MAX_INFLIGHT", "100")?;

        Ok(Self {
            host: value("RELAY_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            api_key: value("RELAY_API_KEY").unwrap_or_else(|| DEFAULT_API_KEY.to_string()),
            upstream,
            upstream_origin: value("RELAY_UPSTREAM_ORIGIN")
                .unwrap_or_else(|| upstream.default_origin().to_string()),
            upstream_url: value("RELAY_UPSTREAM_URL")
                .unwrap_or_else(|| upstream.default_chat_url().to_string()),
            models_url: value("RELAY_MODELS_URL")
                .unwrap_or_else(|| upstream.default_models_url().to_string()),
            model_name: value("RELAY_MODEL_NAME")
                .unwrap_or_else(|| upstream.default_model_name().to_string()),
            upstream_model: value("RELAY_UPSTREAM_MODEL")
                .unwrap_or_else(|| upstream.default_upstream_model().to_string()),
            upstream_token: value("RELAY_UPSTREAM_TOKEN"),
            anonymous_token_enabled: flag("RELAY_ANON_TOKEN_ENABLED", true)?,
            fe_version: value("RELAY_FE_VERSION").unwrap_or_else(|| DEFAULT_FE_VERSION.to_string()),
            default_stream: flag("RELAY_DEFAULT_STREAM", true)?,
            default_template,
            enable_thinking: flag("RELAY_ENABLE_THINKING", false)?,
            thinking_mode,
            system_role,
            dashboard_enabled: flag("RELAY_DASHBOARD_ENABLED", true)?,
            upstream_timeout_seconds,
            upstream_max_inflight,
        })
    }

    pub fn for_tests() -> Self {
        Self::from_lookup(|_| None)
            .unwrap_or_else(|err| panic!("default config must be valid: {err}"))
    }

    pub fn for_tests_with(upstream: UpstreamKind) -> Self {
        Self::from_lookup(|name| (name == "RELAY_UPSTREAM").then(|| upstream.as_str().to_string()))
            .unwrap_or_else(|err| panic!("default config must be valid: {err}"))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_positive_usize(value: &str) -> Option<usize> {
    let parsed = value.trim().parse::<usize>().ok()?;
    if parsed == 0 { None } else { Some(parsed) }
}

fn parse_system_role(value: &str) -> Option<SystemRolePolicy> {
    match value.trim().to_ascii_lowercase().as_str() {
        "passthrough" | "keep" => Some(SystemRolePolicy::Passthrough),
        "remap" | "user" => Some(SystemRolePolicy::remap_with_default_prefix()),
        _ => None,
    }
}
