use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use pvzwatch_blacklist::SearchError;
use pvzwatch_store::StoreError;

/// HTTP-facing error. The body shape is always `{"detail": "..."}`; internal
/// exception text is only ever exposed through the 500 detail string.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    NotFound(String),
    ServiceUnavailable(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn detail(&self) -> &str {
        match self {
            ApiError::Validation(d)
            | ApiError::NotFound(d)
            | ApiError::ServiceUnavailable(d)
            | ApiError::Internal(d) => d,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "detail": self.detail() }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<SearchError> for ApiError {
    fn from(e: SearchError) -> Self {
        match e {
            SearchError::EmptyQuery => ApiError::Validation(e.to_string()),
            SearchError::NoChats | SearchError::Client(_) => {
                ApiError::ServiceUnavailable(e.to_string())
            }
            SearchError::Store(inner) => ApiError::Internal(inner.to_string()),
        }
    }
}
