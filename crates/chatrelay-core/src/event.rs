use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Thinking,
    Answer,
    Done,
    Other,
}

impl Phase {
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("thinking") => Self::Thinking,
            Some("answer") | None => Self::Answer,
            Some("done") => Self::Done,
            Some(_) => Self::Other,
        }
    }
}

/// Nesting levels at which upstreams have been seen to report errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDepth {
    /// `{"error": ...}`
    Envelope,
    /// `{"data": {"error": ...}}`
    Data,
    /// `{"data": {"data": {"error": ...}}}`
    NestedData,
}

impl ErrorDepth {
    pub const ALL: [ErrorDepth; 3] =
        [ErrorDepth::Envelope, ErrorDepth::Data, ErrorDepth::NestedData];

    fn pointer(self) -> &'static str {
        match self {
            Self::Envelope => "/error",
            Self::Data => "/data/error",
            Self::NestedData => "/data/data/error",
        }
    }

    pub fn lookup(self, payload: &Value) -> Option<UpstreamErrorDetail> {
        let raw = payload.pointer(self.pointer())?;
        let (detail, code) = match raw {
            Value::Null | Value::Bool(false) => return None,
            Value::String(text) if text.is_empty() => return None,
            Value::String(text) => (text.clone(), None),
            Value::Object(fields) => {
                let detail = fields
                    .get("detail")
                    .or_else(|| fields.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| raw.to_string());
                let code = fields.get("code").and_then(|code| match code {
                    Value::String(code) => Some(code.clone()),
                    Value::Number(code) => Some(code.to_string()),
                    _ => None,
                });
                (detail, code)
            }
            other => (other.to_string(), None),
        };
        Some(UpstreamErrorDetail { depth: self, detail, code })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamErrorDetail {
    pub depth: ErrorDepth,
    pub detail: String,
    pub code: Option<String>,
}

/// One decoded upstream SSE payload.
///
/// Accepts the Z.ai envelope (`{type, data: {delta_content, phase, done}}`), the same fields at
/// the top level, and OpenAI-style `choices[0].delta.content` chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEvent {
    pub delta_content: String,
    pub phase: Phase,
    pub done: bool,
    pub error: Option<UpstreamErrorDetail>,
}

impl UpstreamEvent {
    pub fn from_value(payload: &Value) -> Self {
        let error = ErrorDepth::ALL.into_iter().find_map(|depth| depth.lookup(payload));

        if let Some(choice) = payload.pointer("/choices/0") {
            let delta_content = choice
                .pointer("/delta/content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let done = choice.get("finish_reason").and_then(Value::as_str).is_some();
            return Self { delta_content, phase: Phase::Answer, done, error };
        }

        let body = payload.get("data").filter(|data| data.is_object()).unwrap_or(payload);
        Self {
            delta_content: body
                .get("delta_content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            phase: Phase::parse(body.get("phase").and_then(Value::as_str)),
            done: body.get("done").and_then(Value::as_bool).unwrap_or(false),
            error,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Logical end of the answer, independent of the transport closing.
    pub fn is_terminal(&self) -> bool {
        self.done || self.phase == Phase::Done
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn envelope_event_reads_nested_data() {
        let event = UpstreamEvent::from_value(&json!({
            "type": "chat:completion",
            "data": {"delta_content": "> step one", "phase": "thinking", "done": false}
        }));
        assert_eq!(event.delta_content, "> step one");
        assert_eq!(event.phase, Phase::Thinking);
        assert!(!event.is_terminal());
        assert!(!event.is_error());
    }

    #[test]
    fn flat_and_openai_shapes_are_understood() {
        let flat = UpstreamEvent::from_value(&json!({"delta_content": "Hel"}));
        assert_eq!(flat.delta_content, "Hel");
        assert_eq!(flat.phase, Phase::Answer);

        let done = UpstreamEvent::from_value(&json!({"done": true}));
        assert!(done.is_terminal());

        let openai = UpstreamEvent::from_value(&json!({
            "choices": [{"index": 0, "delta": {"content": "lo"}, "finish_reason": null}]
        }));
        assert_eq!(openai.delta_content, "lo");
        assert!(!openai.is_terminal());

        let finished = UpstreamEvent::from_value(&json!({
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]
        }));
        assert!(finished.is_terminal());
    }

    #[test]
    fn error_is_found_at_every_known_depth() {
        let cases = [
            (json!({"error": {"detail": "bad", "code": 429}}), ErrorDepth::Envelope),
            (json!({"data": {"error": {"detail": "bad", "code": 429}}}), ErrorDepth::Data),
            (
                json!({"data": {"data": {"error": {"detail": "bad", "code": 429}}}}),
                ErrorDepth::NestedData,
            ),
        ];
        for (payload, depth) in cases {
            let error = UpstreamEvent::from_value(&payload).error.expect("error must be detected");
            assert_eq!(
                error,
                UpstreamErrorDetail {
                    depth,
                    detail: "bad".to_string(),
                    code: Some("429".to_string()),
                }
            );
        }
    }

    #[test]
    fn null_error_field_is_not_an_error() {
        let event = UpstreamEvent::from_value(&json!({
            "error": null,
            "data": {"delta_content": "x", "error": null}
        }));
        assert!(!event.is_error());
    }

    #[test]
    fn phase_done_without_flag_is_terminal() {
        let event = UpstreamEvent::from_value(&json!({"data": {"phase": "done"}}));
        assert_eq!(event.phase, Phase::Done);
        assert!(event.is_terminal());
    }
}
