use async_trait::async_trait;
use chatrelay_core::{ByteStream, CoreError, UpstreamClient, UpstreamModel, UpstreamRequest};
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::{
    HttpRuntime,
    fingerprint::{
        ACCEPT_LANGUAGE_LONG, BrowserProfile, SiteContext, ZAI_CHROME_VERSIONS, body_signature,
        insert_header,
    },
};

pub const ZAI_OWNER: &str = "z.ai";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZaiConfig {
    pub origin: String,
    pub chat_url: String,
    pub models_url: String,
    pub fe_version: String,
    /// Name reported in `model_item`.
    pub model_name: String,
    pub token: Option<String>,
    pub anonymous_token_enabled: bool,
}

pub struct ZaiClient {
    runtime: HttpRuntime,
    config: ZaiConfig,
}

impl ZaiClient {
    pub fn new(runtime: HttpRuntime, config: ZaiConfig) -> Self {
        Self { runtime, config }
    }

    fn origin(&self) -> &str {
        self.config.origin.trim_end_matches('/')
    }

    /// Per-request override first, then the configured token, then a fresh anonymous one.
    async fn resolve_token(&self, override_token: Option<&str>) -> Result<String, CoreError> {
        if let Some(token) = non_blank(override_token) {
            debug!(event = "upstream.token.override");
            return Ok(token.to_string());
        }
        if let Some(token) = non_blank(self.config.token.as_deref()) {
            return Ok(token.to_string());
        }
        if !self.config.anonymous_token_enabled {
            return Err(CoreError::UpstreamAuth(
                "no upstream token configured and anonymous tokens are disabled".to_string(),
            ));
        }
        self.fetch_anonymous_token().await
    }

    async fn fetch_anonymous_token(&self) -> Result<String, CoreError> {
        let url = format!("{}/api/v1/auths/", self.origin());
        let site = SiteContext::new(self.origin(), "/", "*/*");
        let mut headers = BrowserProfile::random(ZAI_CHROME_VERSIONS).headers(&site)?;
        insert_header(&mut headers, "x-fe-version", &self.config.fe_version)?;

        let response: AnonymousAuth = self
            .runtime
            .get_json(&url, headers)
            .await
            .map_err(|err| {
                CoreError::UpstreamAuth(format!("anonymous token request failed: {err}"))
            })?;
        match non_blank(response.token.as_deref()) {
            Some(token) => {
                debug!(event = "upstream.token.anonymous");
                Ok(token.to_string())
            }
            None => Err(CoreError::UpstreamAuth(
                "anonymous token response carried no token".to_string(),
            )),
        }
    }

    fn chat_headers(
        &self,
        chat_id: &str,
        token: &str,
        signature: &str,
    ) -> Result<HeaderMap, CoreError> {
        let site = SiteContext::new(self.origin(), &format!("/c/{chat_id}"), "*/*")
            .with_accept_language(ACCEPT_LANGUAGE_LONG);
        let mut headers = BrowserProfile::random(ZAI_CHROME_VERSIONS).headers(&site)?;
        insert_header(&mut headers, "authorization", &format!("Bearer {token}"))?;
        insert_header(&mut headers, "x-fe-version", &self.config.fe_version)?;
        insert_header(&mut headers, "x-signature", signature)?;
        insert_header(&mut headers, "cookie", &format!("token={token}"))?;
        Ok(headers)
    }
}

#[async_trait]
impl UpstreamClient for ZaiClient {
    fn owned_by(&self) -> &str {
        ZAI_OWNER
    }

    async fn open_chat(&self, request: &UpstreamRequest) -> Result<ByteStream, CoreError> {
        let token = self.resolve_token(request.auth_override.as_deref()).await?;
        let payload = build_zai_payload(request, &self.config.model_name, Utc::now());
        // Signed bytes and sent bytes must be the same buffer.
        let body = serde_json::to_vec(&payload)
            .map_err(|err| CoreError::Internal(format!("upstream payload encode failed: {err}")))?;
        let signature = body_signature(&body);
        let headers = self.chat_headers(&request.chat_id, &token, &signature)?;
        self.runtime.post_event_stream(&self.config.chat_url, headers, body).await
    }

    async fn list_models(&self) -> Result<Vec<UpstreamModel>, CoreError> {
        let token = self.resolve_token(None).await?;
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "accept", "application/json")?;
        insert_header(&mut headers, "authorization", &format!("Bearer {token}"))?;
        insert_header(&mut headers, "x-fe-version", &self.config.fe_version)?;

        let response: ZaiModelsResponse =
            self.runtime.get_json(&self.config.models_url, headers).await?;
        if response.data.is_empty() {
            warn!(event = "upstream.models.empty", upstream = ZAI_OWNER);
        }
        Ok(response
            .data
            .into_iter()
            .map(|model| UpstreamModel { id: model.id, name: model.name })
            .collect())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

pub fn build_zai_payload(request: &UpstreamRequest, model_name: &str, now: DateTime<Utc>) -> Value {
    let mut params = Map::new();
    if let Some(temperature) = request.temperature {
        params.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(max_tokens) = request.max_tokens {
        params.insert("max_tokens".to_string(), json!(max_tokens));
    }
    let model = &request.resolved.upstream_model;

    json!({
        "stream": true,
        "chat_id": request.chat_id,
        "id": request.message_id,
        "model": model,
        "messages": request.messages,
        "params": params,
        "features": { "enable_thinking": request.enable_thinking },
        "background_tasks": { "title_generation": false, "tags_generation": false },
        "mcp_servers": [],
        "model_item": { "id": model, "name": model_name, "owned_by": "openai" },
        "tool_servers": [],
        "variables": {
            "{{USER_NAME}}": "User",
            "{{USER_LOCATION}}": "Unknown",
            "{{CURRENT_DATETIME}}": now.format("%Y-%m-%d %H:%M:%S").to_string(),
        },
    })
}

#[derive(Debug, Deserialize)]
struct AnonymousAuth {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ZaiModelsResponse {
    #[serde(default)]
    data: Vec<ZaiModel>,
}

#[derive(Debug, Deserialize)]
struct ZaiModel {
    id: String,
    #[serde(default)]
    name: Option<String>,
}
