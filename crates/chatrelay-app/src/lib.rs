use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response, Sse, sse::Event},
    routing::{get, post},
};
use chatrelay_clients::{
    DolphinClient, DolphinConfig, HttpRuntime, ZaiClient, ZaiConfig, build_http_client,
};
use chatrelay_contracts::{
    ChatCompletionChunk, ChatCompletionResponse, ChatCompletionsRequest, DailyBucket, ErrorBody,
    HistoryPoint, HourlyBucket, LiveRequestEntry, ModelList, RequestPage, StatsSnapshot,
};
use chatrelay_core::{
    AliasTemplateResolver, CoreError, FixedModelResolver, ModelResolver, RelayEngine,
    RelaySettings, RequestTrace, SseFrame, StatsSink, UpstreamClient,
};
use chatrelay_stats::InMemoryStats;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use utoipa::{IntoParams, OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::{AppConfig, UpstreamKind};
use crate::error::ApiError;

pub mod config;
pub mod error;

const CHAT_PATH: &str = "/v1/chat/completions";
const MODELS_PATH: &str = "/v1/models";
const TOKEN_OVERRIDE_HEADER: &str = "x-zai-token";
const DOLPHIN_MODEL_PREFIX: &str = "dolphin";

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct PageQuery {
    page: Option<usize>,
    #[serde(rename = "pageSize")]
    page_size: Option<usize>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct HoursQuery {
    hours: Option<usize>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct DaysQuery {
    days: Option<usize>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        get_models,
        post_chat_completions,
        get_dashboard_stats,
        get_dashboard_requests,
        get_dashboard_history,
        get_dashboard_hourly,
        get_dashboard_daily
    ),
    components(
        schemas(
            HealthResponse,
            ErrorBody,
            ModelList,
            ChatCompletionsRequest,
            ChatCompletionResponse,
            ChatCompletionChunk,
            StatsSnapshot,
            LiveRequestEntry,
            RequestPage,
            HistoryPoint,
            HourlyBucket,
            DailyBucket
        )
    ),
    tags(
        (name = "chatrelay", description = "OpenAI-compatible chat relay"),
        (name = "dashboard", description = "Request statistics")
    )
)]
struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    engine: Arc<RelayEngine>,
    stats: InMemoryStats,
    sink: Arc<dyn StatsSink>,
    api_key: Arc<str>,
    default_stream: bool,
    dashboard_enabled: bool,
}

impl AppState {
    pub fn from_config(config: &AppConfig) -> Result<Self, CoreError> {
        let runtime = HttpRuntime::new(
            config.upstream.as_str(),
            build_http_client(config.upstream_timeout_seconds)?,
            Some(config.upstream_max_inflight),
        );
        let upstream: Arc<dyn UpstreamClient> = match config.upstream {
            UpstreamKind::Dolphin => Arc::new(DolphinClient::new(
                runtime,
                DolphinConfig {
                    origin: config.upstream_origin.clone(),
                    chat_url: config.upstream_url.clone(),
                    models_url: config.models_url.clone(),
                },
            )),
            UpstreamKind::Zai => Arc::new(ZaiClient::new(
                runtime,
                ZaiConfig {
                    origin: config.upstream_origin.clone(),
                    chat_url: config.upstream_url.clone(),
                    models_url: config.models_url.clone(),
                    fe_version: config.fe_version.clone(),
                    model_name: config.model_name.clone(),
                    token: config.upstream_token.clone(),
                    anonymous_token_enabled: config.anonymous_token_enabled,
                },
            )),
        };
        Ok(Self::with_upstream(config, upstream))
    }

    pub fn with_upstream(config: &AppConfig, upstream: Arc<dyn UpstreamClient>) -> Self {
        let resolver: Arc<dyn ModelResolver> = match config.upstream {
            UpstreamKind::Dolphin => Arc::new(AliasTemplateResolver::new(
                DOLPHIN_MODEL_PREFIX,
                config.upstream_model.clone(),
                config.model_name.clone(),
                config.default_template,
            )),
            UpstreamKind::Zai => Arc::new(FixedModelResolver::new(
                config.upstream_model.clone(),
                config.model_name.clone(),
            )),
        };
        let settings = RelaySettings {
            enable_thinking: config.enable_thinking,
            thinking_mode: config.thinking_mode,
            system_role: config.system_role.clone(),
        };
        let stats = InMemoryStats::new();
        Self {
            engine: Arc::new(RelayEngine::new(upstream, resolver, settings)),
            sink: Arc::new(stats.clone()),
            stats,
            api_key: Arc::from(config.api_key.as_str()),
            default_stream: config.default_stream,
            dashboard_enabled: config.dashboard_enabled,
        }
    }

    pub fn stats(&self) -> &InMemoryStats {
        &self.stats
    }

    fn trace(&self, method: &str, path: &str, headers: &HeaderMap) -> RequestTrace {
        RequestTrace::start(Arc::clone(&self.sink), method, path)
            .with_client(header_str(headers, "user-agent"), Some(client_ip(headers)))
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let token = header_str(headers, "authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(ApiError::MissingAuthorization)?;
        if token != &*self.api_key {
            debug!(event = "relay.auth.rejected");
            return Err(ApiError::InvalidApiKey);
        }
        Ok(())
    }
}

pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(get_health))
        .route(MODELS_PATH, get(get_models))
        .route(CHAT_PATH, post(post_chat_completions));
    if state.dashboard_enabled {
        router = router
            .route("/dashboard/stats", get(get_dashboard_stats))
            .route("/dashboard/requests", get(get_dashboard_requests))
            .route("/dashboard/history", get(get_dashboard_history))
            .route("/dashboard/hourly", get(get_dashboard_hourly))
            .route("/dashboard/daily", get(get_dashboard_daily));
    }

    router.with_state(state).merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, else `"unknown"`.
fn client_ip(headers: &HeaderMap) -> String {
    header_str(headers, "x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| {
            header_str(headers, "x-real-ip").map(str::trim).filter(|value| !value.is_empty())
        })
        .unwrap_or("unknown")
        .to_string()
}

fn reject(trace: RequestTrace, error: ApiError) -> Response {
    trace.finish(error.status().as_u16());
    error.into_response()
}

fn frame_event(frame: SseFrame) -> Result<Event, axum::Error> {
    match frame {
        SseFrame::Chunk(chunk) => Event::default().json_data(chunk),
        SseFrame::Done => Ok(Event::default().data("[DONE]")),
    }
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service health", body = HealthResponse)),
    tag = "chatrelay"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy".to_string() })
}

#[utoipa::path(
    get,
    path = "/v1/models",
    responses(
        (status = 200, description = "Advertised models, or the static catalog", body = ModelList)
    ),
    tag = "chatrelay"
)]
#[instrument(skip_all)]
async fn get_models(State(state): State<AppState>, headers: HeaderMap) -> Json<ModelList> {
    let trace = state.trace("GET", MODELS_PATH, &headers);
    let models = state.engine.list_models().await;
    trace.finish(200);
    Json(models)
}

#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    request_body = ChatCompletionsRequest,
    responses(
        (status = 200, description = "Completion object, or SSE chunks ending with [DONE]",
            body = ChatCompletionResponse),
        (status = 400, description = "Invalid JSON, empty messages, unknown model",
            body = ErrorBody),
        (status = 401, description = "Missing or wrong API key", body = ErrorBody),
        (status = 502, description = "Upstream failure", body = ErrorBody)
    ),
    tag = "chatrelay"
)]
#[instrument(skip_all, fields(path = CHAT_PATH))]
async fn post_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut trace = state.trace("POST", CHAT_PATH, &headers);
    if let Err(error) = state.authorize(&headers) {
        return reject(trace, error);
    }

    let request = match serde_json::from_slice::<ChatCompletionsRequest>(&body) {
        Ok(request) => request,
        Err(err) => return reject(trace, ApiError::InvalidJson(err.to_string())),
    };
    let streaming = request.stream.unwrap_or(state.default_stream);
    trace.describe_request(&request.model, streaming, request.messages.len());

    let auth_override = header_str(&headers, TOKEN_OVERRIDE_HEADER).map(str::to_string);
    let upstream_request = match state.engine.prepare(request, auth_override) {
        Ok(upstream_request) => upstream_request,
        Err(err) => return reject(trace, err.into()),
    };
    let upstream_body = match state.engine.open(&upstream_request).await {
        Ok(upstream_body) => upstream_body,
        Err(err) => return reject(trace, err.into()),
    };

    if streaming {
        let frames = Arc::clone(&state.engine).relay_stream(upstream_request, upstream_body, trace);
        return Sse::new(frames.map(frame_event)).into_response();
    }

    match state.engine.collect_completion(&upstream_request, upstream_body).await {
        Ok(completion) => {
            trace.finish(200);
            Json(completion).into_response()
        }
        Err(err) => reject(trace, err.into()),
    }
}

#[utoipa::path(
    get,
    path = "/dashboard/stats",
    responses((status = 200, description = "Aggregate counters", body = StatsSnapshot)),
    tag = "dashboard"
)]
async fn get_dashboard_stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot().await)
}

#[utoipa::path(
    get,
    path = "/dashboard/requests",
    params(PageQuery),
    responses((status = 200, description = "Recent requests, newest first", body = RequestPage)),
    tag = "dashboard"
)]
async fn get_dashboard_requests(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Json<RequestPage> {
    Json(state.stats.recent_requests(query.page.unwrap_or(1), query.page_size.unwrap_or(20)).await)
}

#[utoipa::path(
    get,
    path = "/dashboard/history",
    responses((status = 200, description = "Per-minute samples", body = [HistoryPoint])),
    tag = "dashboard"
)]
async fn get_dashboard_history(State(state): State<AppState>) -> Json<Vec<HistoryPoint>> {
    Json(state.stats.history().await)
}

#[utoipa::path(
    get,
    path = "/dashboard/hourly",
    params(HoursQuery),
    responses((status = 200, description = "Hourly buckets, newest first", body = [HourlyBucket])),
    tag = "dashboard"
)]
async fn get_dashboard_hourly(
    State(state): State<AppState>,
    Query(query): Query<HoursQuery>,
) -> Json<Vec<HourlyBucket>> {
    Json(state.stats.hourly(query.hours.unwrap_or(24)).await)
}

#[utoipa::path(
    get,
    path = "/dashboard/daily",
    params(DaysQuery),
    responses((status = 200, description = "Daily rollups, newest first", body = [DailyBucket])),
    tag = "dashboard"
)]
async fn get_dashboard_daily(
    State(state): State<AppState>,
    Query(query): Query<DaysQuery>,
) -> Json<Vec<DailyBucket>> {
    Json(state.stats.daily(query.days.unwrap_or(30)).await)
}
