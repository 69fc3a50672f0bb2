//! JSON HTTP API.
//!
//! Every response, success or failure, uses one envelope:
//!
//! ```json
//! { "code": 200, "msg": "ok", "data": { ... } }
//! ```
//!
//! `code` mirrors the HTTP status. On failure `data` carries the stable error
//! code under `error`, plus `field` and any structured details such as the
//! `available` count of an `INSUFFICIENT_PORTS` error.

mod server;

pub use server::{AppState, ServerHandle, build_router, start_server};

use crate::error::{ApiError, ErrorCode};
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::error;

/// Response envelope shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub code: u16,
    pub msg: String,
    pub data: Option<T>,
}

/// 200 with `data`.
pub fn success<T: Serialize>(data: T, msg: &str) -> Response {
    respond(StatusCode::OK, msg, Some(data))
}

/// 201 with `data`.
pub fn created<T: Serialize>(data: T, msg: &str) -> Response {
    respond(StatusCode::CREATED, msg, Some(data))
}

fn respond<T: Serialize>(status: StatusCode, msg: &str, data: Option<T>) -> Response {
    let body = Envelope {
        code: status.as_u16(),
        msg: msg.to_string(),
        data,
    };
    (status, Json(body)).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(code = ?self.code, "request failed: {}", self.message);
        }

        let mut data = json!({ "error": self.code });
        if let Some(field) = self.field {
            data["field"] = Value::String(field);
        }
        if let Some(Value::Object(details)) = self.data {
            for (key, value) in details {
                data[key] = value;
            }
        }

        respond(status, &self.message, Some(data))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(ErrorCode::InvalidFieldValue, rejection.body_text())
    }
}
