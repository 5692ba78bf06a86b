use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;

use crate::storage::{Envelope, StoreError};

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.body)).into_response()
    }
}

/// Parse a numeric path segment, naming the field on failure.
pub fn parse_number(field: &str, raw: &str) -> Result<i64, Envelope> {
    raw.parse::<i64>().map_err(|_| {
        Envelope::from(StoreError::validation(
            field,
            format!("'{}' is not an integer", raw),
        ))
    })
}

/// Parse a JSON request body. An empty body yields the payload's defaults.
pub fn parse_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, Envelope> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| Envelope::from(StoreError::validation("body", e.to_string())))
}
