use std::{str::FromStr, sync::OnceLock};

use regex::Regex;

use crate::event::{Phase, UpstreamEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThinkingMode {
    Raw,
    #[default]
    Strip,
    Think,
}

impl ThinkingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Strip => "strip",
            Self::Think => "think",
        }
    }
}

impl FromStr for ThinkingMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(Self::Raw),
            "strip" => Ok(Self::Strip),
            "think" => Ok(Self::Think),
            other => Err(other.to_string()),
        }
    }
}

fn summary_block() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)<summary>.*?</summary>").expect("static regex"))
}

fn details_open() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<details[^>]*>").expect("static regex"))
}

/// Cleans one reasoning delta.
///
/// Markup is handled first (summary block, stray tags, then the `<details>` wrapper), the
/// `"> "` quote prefix second.
pub fn clean_thinking(text: &str, mode: ThinkingMode) -> String {
    if mode == ThinkingMode::Raw {
        return text.to_string();
    }

    let text = summary_block().replace_all(text, "");
    let text = text.replace("</thinking>", "").replace("<Full>", "").replace("</Full>", "");
    let text = match mode {
        ThinkingMode::Think => {
            details_open().replace_all(&text, "<think>").replace("</details>", "</think>")
        }
        _ => details_open().replace_all(&text, "").replace("</details>", ""),
    };

    let text = text.strip_prefix("> ").unwrap_or(&text);
    text.replace("\n> ", "\n")
}

/// Turns upstream events into assistant content deltas.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentTransform {
    mode: ThinkingMode,
}

impl ContentTransform {
    pub fn new(mode: ThinkingMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ThinkingMode {
        self.mode
    }

    /// `None` when the event carries nothing to forward; error events never yield content.
    pub fn apply(&self, event: &UpstreamEvent) -> Option<String> {
        if event.is_error() || event.delta_content.is_empty() {
            return None;
        }
        let text = match event.phase {
            Phase::Thinking => clean_thinking(&event.delta_content, self.mode),
            _ => event.delta_content.clone(),
        };
        if text.is_empty() { None } else { Some(text) }
    }
}
