//! JSON error bodies for routes that use transport status codes.

use crate::types::{Error, TraceId};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug)]
pub struct ApiError {
    error: Error,
    trace_id: Option<TraceId>,
}

impl ApiError {
    pub fn new(error: Error, trace_id: &TraceId) -> Self {
        Self {
            error,
            trace_id: Some(trace_id.clone()),
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self {
            error,
            trace_id: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({
            "error": self.error.code(),
            "message": match &self.error {
                Error::Forbidden => "forbidden".to_string(),
                other => other.to_string(),
            },
        });
        if let Error::Definition(def) = &self.error {
            body["file"] = json!(def.file);
            body["field"] = json!(def.field);
        }
        if let Some(trace_id) = self.trace_id {
            body["trace_id"] = json!(trace_id.as_str());
        }
        (status, Json(body)).into_response()
    }
}
