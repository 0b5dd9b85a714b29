use std::{collections::VecDeque, sync::Arc};

use chatrelay_contracts::{
    COMPLETION_OBJECT, ChatChoice, ChatCompletionResponse, ChatCompletionsRequest, ChatMessage,
    FINISH_REASON_STOP, ModelList, Role, Usage,
};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, info, info_span, warn};

use crate::{
    ByteStream, CoreError, UpstreamClient,
    emit::{ChunkEmitter, SseFrame},
    event::UpstreamEvent,
    resolve::ModelResolver,
    session::{
        SystemRolePolicy, UpstreamRequest, new_chat_id, new_completion_id, new_message_id,
        unix_seconds,
    },
    sse::SseLineDecoder,
    thinking::{ContentTransform, ThinkingMode},
    trace::RequestTrace,
};

const STREAM_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub enable_thinking: bool,
    pub thinking_mode: ThinkingMode,
    pub system_role: SystemRolePolicy,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            enable_thinking: false,
            thinking_mode: ThinkingMode::Strip,
            system_role: SystemRolePolicy::Passthrough,
        }
    }
}

pub struct RelayEngine {
    upstream: Arc<dyn UpstreamClient>,
    resolver: Arc<dyn ModelResolver>,
    settings: RelaySettings,
    transform: ContentTransform,
}

impl RelayEngine {
    pub fn new(
        upstream: Arc<dyn UpstreamClient>,
        resolver: Arc<dyn ModelResolver>,
        settings: RelaySettings,
    ) -> Self {
        let transform = ContentTransform::new(settings.thinking_mode);
        Self { upstream, resolver, settings, transform }
    }

    /// Validates the client request and builds the upstream request. Nothing is sent upstream
    /// when this fails.
    pub fn prepare(
        &self,
        request: ChatCompletionsRequest,
        auth_override: Option<String>,
    ) -> Result<UpstreamRequest, CoreError> {
        let span = info_span!("pipeline_stage", stage = "prepare", model = %request.model);
        let _entered = span.enter();

        if request.messages.is_empty() {
            return Err(CoreError::Validation("messages must not be empty".to_string()));
        }
        let resolved = self.resolver.resolve(&request.model)?;
        let messages = self.settings.system_role.apply(request.messages);

        Ok(UpstreamRequest {
            chat_id: new_chat_id(),
            message_id: new_message_id(),
            display_model: request.model,
            resolved,
            messages,
            enable_thinking: request.enable_thinking.unwrap_or(self.settings.enable_thinking),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            auth_override,
        })
    }

    pub async fn open(&self, request: &UpstreamRequest) -> Result<ByteStream, CoreError> {
        let span = info_span!(
            "pipeline_stage",
            chat_id = %request.chat_id,
            stage = "dispatch",
            model = %request.display_model,
            upstream_model = %request.resolved.upstream_model
        );
        self.upstream.open_chat(request).instrument(span).await
    }

    /// Relays an opened upstream body as OpenAI chunk frames. The trace is finished when the
    /// relay task ends.
    pub fn relay_stream(
        self: Arc<Self>,
        request: UpstreamRequest,
        body: ByteStream,
        trace: RequestTrace,
    ) -> ReceiverStream<SseFrame> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let span = info_span!(
            "pipeline_stage",
            chat_id = %request.chat_id,
            stage = "relay",
            model = %request.display_model
        );
        tokio::spawn(
            async move {
                let status = self.pump(&request, body, &tx).await;
                trace.finish(status);
            }
            .instrument(span),
        );
        ReceiverStream::new(rx)
    }

    async fn pump(
        &self,
        request: &UpstreamRequest,
        body: ByteStream,
        tx: &mpsc::Sender<SseFrame>,
    ) -> u16 {
        let mut emitter =
            ChunkEmitter::new(new_completion_id(), unix_seconds(), request.display_model.clone());
        if !deliver(tx, emitter.open()).await {
            info!(event = "relay.stream.client_gone", "client went away before first chunk");
            return 200;
        }

        let mut events = UpstreamEvents::new(body);
        let mut status = 200;
        let mut delivered = 0usize;
        while let Some(next) = events.next().await {
            let event = match next {
                Ok(event) => event,
                Err(error) => {
                    warn!(event = "relay.stream.transport_error", error = %error);
                    status = 502;
                    break;
                }
            };
            let (content, terminal) = self.digest(&event);
            if let Some(text) = content {
                if !deliver(tx, emitter.content(&text)).await {
                    info!(event = "relay.stream.client_gone", delivered, "stopping upstream read");
                    return status;
                }
                delivered += 1;
            }
            if terminal {
                break;
            }
        }
        drop(events);

        deliver(tx, emitter.finish()).await;
        info!(event = "relay.stream.finished", delivered, status);
        status
    }

    /// Reads the whole upstream answer and returns it as one completion object.
    pub async fn collect_completion(
        &self,
        request: &UpstreamRequest,
        body: ByteStream,
    ) -> Result<ChatCompletionResponse, CoreError> {
        let span = info_span!(
            "pipeline_stage",
            chat_id = %request.chat_id,
            stage = "collect",
            model = %request.display_model
        );
        async move {
            let mut events = UpstreamEvents::new(body);
            let mut content = String::new();
            while let Some(next) = events.next().await {
                let (delta, terminal) = self.digest(&next?);
                if let Some(delta) = delta {
                    content.push_str(&delta);
                }
                if terminal {
                    break;
                }
            }

            let prompt_tokens = request
                .messages
                .iter()
                .map(|message| message.content.split_whitespace().count())
                .sum::<usize>() as u32;
            let completion_tokens = content.split_whitespace().count() as u32;

            Ok::<_, CoreError>(ChatCompletionResponse {
                id: new_completion_id(),
                object: COMPLETION_OBJECT.to_string(),
                created: unix_seconds(),
                model: request.display_model.clone(),
                choices: vec![ChatChoice {
                    index: 0,
                    message: ChatMessage::new(Role::Assistant, content),
                    finish_reason: FINISH_REASON_STOP.to_string(),
                }],
                usage: Usage {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens: prompt_tokens + completion_tokens,
                },
            })
        }
        .instrument(span)
        .await
    }

    /// The advertised model list. Upstream failures degrade to the static fallback.
    pub async fn list_models(&self) -> ModelList {
        let ids = match self.upstream.list_models().await {
            Ok(models) if !models.is_empty() => self.resolver.catalog(&models),
            Ok(_) => {
                warn!(event = "upstream.models.fallback", reason = "empty upstream list");
                self.resolver.fallback_catalog()
            }
            Err(error) => {
                warn!(event = "upstream.models.fallback", error = %error);
                self.resolver.fallback_catalog()
            }
        };
        ModelList::from_ids(ids, unix_seconds(), self.upstream.owned_by())
    }

    /// Content to forward (if any) and whether the answer is over.
    fn digest(&self, event: &UpstreamEvent) -> (Option<String>, bool) {
        if let Some(error) = &event.error {
            warn!(
                event = "upstream.protocol_error",
                depth = ?error.depth,
                detail = %error.detail,
                code = ?error.code
            );
            return (None, true);
        }
        (self.transform.apply(event), event.is_terminal())
    }
}

async fn deliver(tx: &mpsc::Sender<SseFrame>, frames: Vec<SseFrame>) -> bool {
    for frame in frames {
        if tx.send(frame).await.is_err() {
            return false;
        }
    }
    true
}

/// Pulls decoded events off an upstream body one at a time, in arrival order.
struct UpstreamEvents {
    body: ByteStream,
    decoder: SseLineDecoder,
    queue: VecDeque<Value>,
    exhausted: bool,
}

impl UpstreamEvents {
    fn new(body: ByteStream) -> Self {
        Self { body, decoder: SseLineDecoder::new(), queue: VecDeque::new(), exhausted: false }
    }

    async fn next(&mut self) -> Option<Result<UpstreamEvent, CoreError>> {
        loop {
            if let Some(payload) = self.queue.pop_front() {
                return Some(Ok(UpstreamEvent::from_value(&payload)));
            }
            if self.exhausted {
                return None;
            }
            match self.body.next().await {
                Some(Ok(bytes)) => self.queue.extend(self.decoder.push(&bytes)),
                Some(Err(error)) => {
                    self.exhausted = true;
                    return Some(Err(error));
                }
                None => {
                    self.exhausted = true;
                    self.queue.extend(self.decoder.finish());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::{
        UpstreamModel,
        resolve::{AliasTemplateResolver, FixedModelResolver, Template},
        trace::{RequestOutcome, StatsSink},
    };

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Tail {
        Close,
        Hang,
        Fail,
    }

    #[derive(Debug)]
    struct CoreFixture<'a> {
        name: &'a str,
        events: Vec<&'a str>,
        tail: Tail,
    }

    impl<'a> CoreFixture<'a> {
        fn parse(raw: &'a str) -> Self {
            let mut fixture = Self { name: "unnamed", events: Vec::new(), tail: Tail::Close };

            for line in raw.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let Some((key, value)) = line.split_once('=') else {
                    continue;
                };
                let value = value.trim();
                match key.trim() {
                    "name" => fixture.name = value,
                    "event" => fixture.events.push(value),
                    "tail" => {
                        fixture.tail = match value {
                            "close" => Tail::Close,
                            "hang" => Tail::Hang,
                            "fail" => Tail::Fail,
                            other => panic!("unsupported tail fixture value: {other}"),
                        }
                    }
                    other => panic!("unsupported fixture key: {other}"),
                }
            }

            fixture
        }

        fn body(&self) -> ByteStream {
            let frames = self
                .events
                .iter()
                .map(|event| Ok(Bytes::from(format!("data: {event}\n\n"))))
                .collect::<Vec<Result<Bytes, CoreError>>>();
            let head = futures::stream::iter(frames);
            match self.tail {
                Tail::Close => Box::pin(head),
                Tail::Hang => Box::pin(head.chain(futures::stream::pending())),
                Tail::Fail => Box::pin(head.chain(futures::stream::iter([Err(
                    CoreError::UpstreamTransport("connection reset".to_string()),
                )]))),
            }
        }
    }

    struct ScriptedUpstream {
        body: Mutex<Option<ByteStream>>,
        models: Result<Vec<UpstreamModel>, CoreError>,
    }

    impl ScriptedUpstream {
        fn new(body: ByteStream) -> Self {
            Self { body: Mutex::new(Some(body)), models: Ok(Vec::new()) }
        }
    }

    #[async_trait]
    impl UpstreamClient for ScriptedUpstream {
        fn owned_by(&self) -> &str {
            "dolphin-ai"
        }

        async fn open_chat(&self, _request: &UpstreamRequest) -> Result<ByteStream, CoreError> {
            self.body
                .lock()
                .map_err(|_| CoreError::Internal("poisoned".to_string()))?
                .take()
                .ok_or_else(|| CoreError::Internal("body already taken".to_string()))
        }

        async fn list_models(&self) -> Result<Vec<UpstreamModel>, CoreError> {
            self.models.clone()
        }
    }

    struct ChannelSink {
        tx: mpsc::UnboundedSender<RequestOutcome>,
    }

    #[async_trait]
    impl StatsSink for ChannelSink {
        async fn record(&self, outcome: RequestOutcome) {
            let _ = self.tx.send(outcome);
        }
    }

    fn dolphin_resolver() -> Arc<dyn ModelResolver> {
        Arc::new(AliasTemplateResolver::new(
            "dolphin",
            "dolphinpod:24B",
            "Dolphin 24B",
            Template::Logical,
        ))
    }

    fn build_engine(upstream: ScriptedUpstream) -> Arc<RelayEngine> {
        Arc::new(RelayEngine::new(Arc::new(upstream), dolphin_resolver(), RelaySettings::default()))
    }

    fn chat_request(model: &str) -> ChatCompletionsRequest {
        ChatCompletionsRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::new(Role::User, "hi there")],
            stream: None,
            temperature: None,
            max_tokens: None,
            enable_thinking: None,
        }
    }

    fn assert_snapshot(name: &str, actual: &str, expected: &str) {
        let actual = actual.trim();
        let expected = expected.trim();
        assert_eq!(
            actual, expected,
            "snapshot mismatch for fixture `{name}`\n\nactual:\n{actual}\n\nexpected:\n{expected}"
        );
    }

    fn render_frame(frame: &SseFrame) -> String {
        match frame {
            SseFrame::Done => "frame=[DONE]".to_string(),
            SseFrame::Chunk(chunk) => {
                let choice = &chunk.choices[0];
                if choice.delta.role.is_some() {
                    "frame=role".to_string()
                } else if let Some(content) = &choice.delta.content {
                    format!("frame=content:{content}")
                } else {
                    format!("frame=finish:{}", choice.finish_reason.as_deref().unwrap_or("<none>"))
                }
            }
        }
    }

    async fn run_stream(raw: &str) -> (String, String) {
        let fixture = CoreFixture::parse(raw);
        let engine = build_engine(ScriptedUpstream::new(fixture.body()));
        let (stats_tx, mut stats_rx) = mpsc::unbounded_channel();
        let sink = Arc::new(ChannelSink { tx: stats_tx });
        let trace = RequestTrace::start(sink, "POST", "/v1/chat/completions");

        let request =
            engine.prepare(chat_request("Dolphin 24B"), None).expect("request must prepare");
        let body = engine.open(&request).await.expect("upstream must open");
        let frames = tokio::time::timeout(
            Duration::from_secs(5),
            Arc::clone(&engine).relay_stream(request, body, trace).collect::<Vec<_>>(),
        )
        .await
        .expect("stream must terminate");

        let outcome = stats_rx.recv().await.expect("stream must be recorded");
        let mut rendered = frames.iter().map(render_frame).collect::<Vec<_>>();
        rendered.push(format!("recorded_status={}", outcome.status));
        (fixture.name.to_string(), rendered.join("\n"))
    }

    #[tokio::test]
    async fn streaming_fixtures() {
        let fixtures = [
            (
                r#"
name=done_flag_ends_stream
event={"data":{"delta_content":"Hel","phase":"answer"}}
event={"data":{"delta_content":"lo","phase":"answer"}}
event={"data":{"done":true,"phase":"done"}}
event={"data":{"delta_content":"never sent","phase":"answer"}}
"#,
                r#"
frame=role
frame=content:Hel
frame=content:lo
frame=finish:stop
frame=[DONE]
recorded_status=200
"#,
            ),
            (
                r#"
name=done_while_connection_stays_open
event={"data":{"delta_content":"Hi","phase":"answer"}}
event={"data":{"phase":"done"}}
tail=hang
"#,
                r#"
frame=role
frame=content:Hi
frame=finish:stop
frame=[DONE]
recorded_status=200
"#,
            ),
            (
                r#"
name=transport_eof_without_done
event={"choices":[{"delta":{"content":"partial"},"finish_reason":null}]}
"#,
                r#"
frame=role
frame=content:partial
frame=finish:stop
frame=[DONE]
recorded_status=200
"#,
            ),
            (
                r#"
name=embedded_error_ends_cleanly
event={"data":{"delta_content":"a","phase":"answer"}}
event={"type":"error","data":{"data":{"error":{"detail":"rate limited","code":429}}}}
event={"data":{"delta_content":"b","phase":"answer"}}
tail=hang
"#,
                r#"
frame=role
frame=content:a
frame=finish:stop
frame=[DONE]
recorded_status=200
"#,
            ),
            (
                r#"
name=malformed_frame_is_skipped
event={"data":{"delta_content":"x","phase":"answer"}}
event={broken
event={"data":{"delta_content":"y","phase":"answer","done":true}}
"#,
                r#"
frame=role
frame=content:x
frame=content:y
frame=finish:stop
frame=[DONE]
recorded_status=200
"#,
            ),
            (
                r#"
name=thinking_is_stripped
event={"data":{"delta_content":"<details type=\"reasoning\">\n> pondering","phase":"thinking"}}
event={"data":{"delta_content":"</details>","phase":"thinking"}}
event={"data":{"delta_content":"Answer","phase":"answer"}}
"#,
                r#"
frame=role
frame=content:
pondering
frame=content:Answer
frame=finish:stop
frame=[DONE]
recorded_status=200
"#,
            ),
            (
                r#"
name=mid_stream_transport_failure
event={"data":{"delta_content":"a","phase":"answer"}}
tail=fail
"#,
                r#"
frame=role
frame=content:a
frame=finish:stop
frame=[DONE]
recorded_status=502
"#,
            ),
        ];

        for (raw, expected) in fixtures {
            let (name, actual) = run_stream(raw).await;
            assert_snapshot(&name, &actual, expected);
        }
    }

    #[tokio::test]
    async fn collect_concatenates_deltas() {
        let fixture = CoreFixture::parse(
            r#"
event={"data":{"delta_content":"Hel","phase":"answer"}}
event={"data":{"delta_content":"lo","phase":"answer"}}
event={"data":{"done":true}}
tail=hang
"#,
        );
        let engine = build_engine(ScriptedUpstream::new(fixture.body()));
        let request = engine.prepare(chat_request("Dolphin 24B-summary"), None).expect("prepare");
        assert_eq!(request.resolved.template, Some(Template::Summary));

        let body = engine.open(&request).await.expect("open");
        let response = engine.collect_completion(&request, body).await.expect("collect");
        assert_eq!(response.object, "chat.completion");
        assert_eq!(response.model, "Dolphin 24B-summary");
        assert_eq!(response.choices[0].message.content, "Hello");
        assert_eq!(response.choices[0].message.role, Role::Assistant);
        assert_eq!(response.choices[0].finish_reason, "stop");
        assert_eq!(response.usage.prompt_tokens, 2);
        assert_eq!(response.usage.completion_tokens, 1);
        assert_eq!(response.usage.total_tokens, 3);
    }

    #[tokio::test]
    async fn collect_surfaces_transport_failure() {
        let fixture = CoreFixture::parse("event={\"data\":{\"delta_content\":\"a\"}}\ntail=fail");
        let engine = build_engine(ScriptedUpstream::new(fixture.body()));
        let request = engine.prepare(chat_request("dolphin"), None).expect("prepare");
        let body = engine.open(&request).await.expect("open");
        let error = engine.collect_completion(&request, body).await.expect_err("must fail");
        assert_eq!(error, CoreError::UpstreamTransport("connection reset".to_string()));
    }

    #[tokio::test]
    async fn prepare_rejects_before_any_upstream_call() {
        let engine = build_engine(ScriptedUpstream::new(Box::pin(futures::stream::empty())));

        let mut empty = chat_request("Dolphin 24B");
        empty.messages.clear();
        assert_eq!(
            engine.prepare(empty, None),
            Err(CoreError::Validation("messages must not be empty".to_string()))
        );

        let error = engine.prepare(chat_request("gpt-4o"), None).expect_err("must reject");
        assert_eq!(error.to_string(), "unsupported model: gpt-4o");
    }

    #[tokio::test]
    async fn prepare_applies_system_role_policy_and_thinking_default() {
        let settings = RelaySettings {
            enable_thinking: true,
            thinking_mode: ThinkingMode::Think,
            system_role: SystemRolePolicy::remap_with_default_prefix(),
        };
        let engine = RelayEngine::new(
            Arc::new(ScriptedUpstream::new(Box::pin(futures::stream::empty()))),
            Arc::new(FixedModelResolver::new("0727-360B-API", "GLM-4.5")),
            settings,
        );
        let mut request = chat_request("my-model");
        request.messages.insert(0, ChatMessage::new(Role::System, "rules"));

        let prepared = engine.prepare(request, Some("override".to_string())).expect("prepare");
        assert_eq!(prepared.display_model, "my-model");
        assert_eq!(prepared.resolved.upstream_model, "0727-360B-API");
        assert!(prepared.enable_thinking);
        assert_eq!(prepared.auth_override.as_deref(), Some("override"));
        assert_eq!(
            prepared.messages[0],
            ChatMessage::new(Role::User, "[System Instructions]: rules")
        );
    }

    #[tokio::test]
    async fn client_disconnect_releases_upstream_body() {
        struct DropFlag(Arc<AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let released = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(Arc::clone(&released));
        let body: ByteStream = Box::pin(
            futures::stream::repeat_with(|| {
                Ok(Bytes::from_static(b"data: {\"data\":{\"delta_content\":\"x\"}}\n"))
            })
            .map(move |item| {
                let _flag = &flag;
                item
            }),
        );
        let engine = build_engine(ScriptedUpstream::new(body));
        let (stats_tx, mut stats_rx) = mpsc::unbounded_channel();
        let sink = Arc::new(ChannelSink { tx: stats_tx });
        let trace = RequestTrace::start(sink, "POST", "/v1/chat/completions");
        let request = engine.prepare(chat_request("dolphin"), None).expect("prepare");
        let body = engine.open(&request).await.expect("open");

        let mut frames = Arc::clone(&engine).relay_stream(request, body, trace);
        assert!(matches!(frames.next().await, Some(SseFrame::Chunk(_))));
        drop(frames);

        let outcome = tokio::time::timeout(Duration::from_secs(5), stats_rx.recv())
            .await
            .expect("relay task must stop")
            .expect("stream must be recorded");
        assert_eq!(outcome.status, 200);
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn models_fall_back_when_upstream_fails() {
        let mut upstream = ScriptedUpstream::new(Box::pin(futures::stream::empty()));
        upstream.models = Err(CoreError::UpstreamTransport("offline".to_string()));
        let engine = build_engine(upstream);

        let list = engine.list_models().await;
        assert_eq!(list.object, "list");
        assert_eq!(list.data.len(), 5);
        assert_eq!(list.data[0].id, "Dolphin 24B");
        assert!(list.data.iter().all(|entry| entry.owned_by == "dolphin-ai"));
    }
}
