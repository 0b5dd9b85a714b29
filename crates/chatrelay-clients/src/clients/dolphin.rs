use async_trait::async_trait;
use chatrelay_core::{ByteStream, CoreError, UpstreamClient, UpstreamModel, UpstreamRequest};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::{
    HttpRuntime,
    fingerprint::{BrowserProfile, DOLPHIN_CHROME_VERSIONS, SiteContext, insert_header},
};

pub const DOLPHIN_OWNER: &str = "dolphin-ai";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DolphinConfig {
    pub origin: String,
    pub chat_url: String,
    pub models_url: String,
}

pub struct DolphinClient {
    runtime: HttpRuntime,
    config: DolphinConfig,
}

impl DolphinClient {
    pub fn new(runtime: HttpRuntime, config: DolphinConfig) -> Self {
        Self { runtime, config }
    }

    fn headers(&self, accept: &'static str) -> Result<HeaderMap, CoreError> {
        let site = SiteContext::new(&self.config.origin, "/", accept);
        BrowserProfile::random(DOLPHIN_CHROME_VERSIONS).headers(&site)
    }
}

#[async_trait]
impl UpstreamClient for DolphinClient {
    fn owned_by(&self) -> &str {
        DOLPHIN_OWNER
    }

    async fn open_chat(&self, request: &UpstreamRequest) -> Result<ByteStream, CoreError> {
        let payload = build_dolphin_payload(request);
        let body = serde_json::to_vec(&payload)
            .map_err(|err| CoreError::Internal(format!("upstream payload encode failed: {err}")))?;
        let mut headers = self.headers("text/event-stream")?;
        insert_header(&mut headers, "cache-control", "no-cache")?;
        self.runtime.post_event_stream(&self.config.chat_url, headers, body).await
    }

    async fn list_models(&self) -> Result<Vec<UpstreamModel>, CoreError> {
        let headers = self.headers("application/json")?;
        let response: DolphinModelsResponse =
            self.runtime.get_json(&self.config.models_url, headers).await?;
        Ok(response
            .data
            .into_iter()
            .map(|model| UpstreamModel { id: model.id, name: model.label })
            .collect())
    }
}

/// `{messages, model, template}`; the template is left out when the resolver produced none.
pub fn build_dolphin_payload(request: &UpstreamRequest) -> Value {
    let mut payload = Map::new();
    payload.insert("messages".to_string(), json!(request.messages));
    payload.insert("model".to_string(), Value::String(request.resolved.upstream_model.clone()));
    if let Some(template) = request.resolved.template {
        payload.insert("template".to_string(), Value::String(template.as_str().to_string()));
    }
    Value::Object(payload)
}

#[derive(Debug, Deserialize)]
struct DolphinModelsResponse {
    #[serde(default)]
    data: Vec<DolphinModel>,
}

#[derive(Debug, Deserialize)]
struct DolphinModel {
    id: String,
    #[serde(default)]
    label: Option<String>,
}
