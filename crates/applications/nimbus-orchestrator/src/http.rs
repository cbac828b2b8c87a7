//! Shared plumbing for the HTTP adapters

use chrono::{DateTime, NaiveDateTime, Utc};
use nimbus_core::ServiceError;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Header carrying the bearer credential
pub const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

/// Per-request timeout of every adapter
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn build_client() -> Result<reqwest::Client, ServiceError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| ServiceError::transport(format!("cannot build HTTP client: {}", e)))
}

pub(crate) fn transport(e: reqwest::Error) -> ServiceError {
    ServiceError::transport(e.to_string())
}

/// Map a non-success response onto a [`ServiceError`]
pub(crate) async fn checked(response: Response, what: &str) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, what, &body))
}

pub(crate) fn status_error(status: StatusCode, what: &str, body: &str) -> ServiceError {
    match status {
        StatusCode::NOT_FOUND => ServiceError::not_found(what),
        StatusCode::UNAUTHORIZED => ServiceError::Auth(format!("{}: {}", what, body.trim())),
        _ => ServiceError::rejected(status.as_u16(), error_message(body)),
    }
}

/// Pull the human-readable part out of an OpenStack-style error body
fn error_message(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    parsed
        .as_ref()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.pointer("/faultstring"))
                .or_else(|| v.get("message"))
        })
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string())
}

pub(crate) async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ServiceError> {
    let body = response.text().await.map_err(transport)?;
    serde_json::from_str(&body).map_err(|e| ServiceError::decode(e.to_string()))
}

/// Timestamps arrive with or without an offset
pub(crate) fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_mapping() {
        assert!(status_error(StatusCode::NOT_FOUND, "stack s", "").is_not_found());
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "stack s", "expired"),
            ServiceError::Auth(_)
        ));
        assert_eq!(
            status_error(
                StatusCode::BAD_REQUEST,
                "stack s",
                r#"{"error": {"message": "Property error: flavor"}}"#
            ),
            ServiceError::rejected(400, "Property error: flavor")
        );
        assert_eq!(
            status_error(StatusCode::CONFLICT, "stack s", "busy\n"),
            ServiceError::rejected(409, "busy")
        );
    }

    #[test]
    fn test_parse_time() {
        let with_offset = parse_time("2026-03-01T10:00:00Z").unwrap();
        let naive = parse_time("2026-03-01T10:00:00").unwrap();
        assert_eq!(with_offset, naive);
        assert!(parse_time("yesterday").is_none());
    }
}
