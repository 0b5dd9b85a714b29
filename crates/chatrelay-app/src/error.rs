use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chatrelay_contracts::{ErrorBody, ErrorDetail};
use chatrelay_core::CoreError;
use tracing::error;

const INVALID_REQUEST: &str = "invalid_request_error";
const AUTHENTICATION: &str = "authentication_error";
const UPSTREAM: &str = "upstream_error";
const INTERNAL: &str = "internal_error";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing or invalid Authorization header")]
    MissingAuthorization,
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingAuthorization | Self::InvalidApiKey => StatusCode::UNAUTHORIZED,
            Self::InvalidJson(_) => StatusCode::BAD_REQUEST,
            Self::Core(core) => match core {
                CoreError::Validation(_) | CoreError::ModelResolution(_) => StatusCode::BAD_REQUEST,
                CoreError::UpstreamAuth(_)
                | CoreError::UpstreamTransport(_)
                | CoreError::UpstreamStatus { .. } => StatusCode::BAD_GATEWAY,
                CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn body(&self) -> ErrorBody {
        let detail = |kind: &str, param: Option<&str>, code: Option<&str>| ErrorDetail {
            message: self.to_string(),
            kind: kind.to_string(),
            param: param.map(str::to_string),
            code: code.map(str::to_string),
        };
        let error = match self {
            Self::MissingAuthorization | Self::InvalidApiKey => {
                detail(AUTHENTICATION, None, Some("invalid_api_key"))
            }
            Self::InvalidJson(_) => detail(INVALID_REQUEST, None, Some("invalid_json")),
            Self::Core(CoreError::Validation(_)) => detail(INVALID_REQUEST, Some("messages"), None),
            Self::Core(CoreError::ModelResolution(_)) => {
                detail(INVALID_REQUEST, Some("model"), Some("model_not_found"))
            }
            Self::Core(CoreError::UpstreamStatus { status, .. }) => {
                detail(UPSTREAM, None, Some(&status.to_string()))
            }
            Self::Core(
                CoreError::UpstreamAuth(_) | CoreError::UpstreamTransport(_),
            ) => detail(UPSTREAM, None, None),
            Self::Core(CoreError::Internal(_)) => ErrorDetail {
                message: "internal server error".to_string(),
                kind: INTERNAL.to_string(),
                param: None,
                code: None,
            },
        };
        ErrorBody { error }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Core(CoreError::Internal(detail)) = &self {
            error!(event = "relay.internal_error", detail = %detail);
        }
        (self.status(), Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use chatrelay_core::ModelResolutionError;

    use super::*;

    fn unsupported_model() -> CoreError {
        ModelResolutionError::UnsupportedModel { model: "gpt-4".to_string() }.into()
    }

    #[test]
    fn status_mapping_covers_every_kind() {
        let cases = [
            (ApiError::MissingAuthorization, 401),
            (ApiError::InvalidApiKey, 401),
            (ApiError::InvalidJson("eof".to_string()), 400),
            (CoreError::Validation("messages must not be empty".to_string()).into(), 400),
            (unsupported_model().into(), 400),
            (CoreError::UpstreamAuth("no token".to_string()).into(), 502),
            (CoreError::UpstreamTransport("reset".to_string()).into(), 502),
            (CoreError::UpstreamStatus { status: 429, detail: "slow".to_string() }.into(), 502),
            (CoreError::Internal("lock poisoned".to_string()).into(), 500),
        ];
        for (error, status) in cases {
            assert_eq!(error.status().as_u16(), status, "{error}");
        }
    }

    #[test]
    fn unknown_model_names_param_and_code() {
        let error: ApiError = unsupported_model().into();
        let body = error.body().error;
        assert_eq!(body.message, "unsupported model: gpt-4");
        assert_eq!(body.kind, "invalid_request_error");
        assert_eq!(body.param.as_deref(), Some("model"));
        assert_eq!(body.code.as_deref(), Some("model_not_found"));
    }

    #[test]
    fn internal_errors_hide_details() {
        let error: ApiError = CoreError::Internal("secret path /etc/x".to_string()).into();
        let body = error.body().error;
        assert_eq!(body.message, "internal server error");
        assert!(!serde_json::to_string(&body).unwrap().contains("secret"));
    }
}
