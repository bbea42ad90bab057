//! Client for the KellyBot backend API.
//!
//! Wraps the single `POST /api/v1/chat` endpoint the bot depends on and maps
//! every failure mode to a [`KellyApiError`] with a user-facing fallback text.

use crate::config::Settings;
use reqwest::Client as HttpClient;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

/// Errors returned by the KellyBot API client
#[derive(Debug, Error)]
pub enum KellyApiError {
    /// The backend did not answer within the configured read timeout
    #[error("timeout calling Kelly API")]
    Timeout,
    /// Connection, DNS or other transport-level failure
    #[error("network error calling Kelly API: {0}")]
    Network(String),
    /// The backend answered with a non-success HTTP status
    #[error("Kelly API returned HTTP {status}")]
    Status {
        /// HTTP status code
        status: u16,
        /// `detail` field from the error body, when the backend sent one
        detail: Option<String>,
    },
    /// The backend answered 2xx but the body was not the expected JSON
    #[error("invalid JSON from Kelly API: {0}")]
    Json(String),
}

impl KellyApiError {
    /// Text shown to the Telegram user when this error occurs.
    ///
    /// Technical detail stays in the logs; the user gets a short apology.
    /// Client errors (4xx) surface the backend's `detail` so the user can
    /// act on it, server errors never do.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Timeout => {
                "Lo siento, la respuesta está tardando demasiado. \
                 Por favor, inténtalo de nuevo."
                    .to_string()
            }
            Self::Network(_) => {
                "Lo siento, no pude conectarme con el sistema principal. \
                 Por favor, inténtalo de nuevo en unos instantes."
                    .to_string()
            }
            Self::Status { status: 401, .. } => {
                "Error de autenticación con la API interna. Contacta al administrador."
                    .to_string()
            }
            Self::Status {
                status,
                detail: Some(detail),
            } if *status < 500 => format!("Error {status}: {detail}"),
            Self::Status { .. } | Self::Json(_) => {
                "Lo siento, no pude comunicarme con el sistema principal en este momento. \
                 Por favor, inténtalo de nuevo."
                    .to_string()
            }
        }
    }
}

/// Request body for `POST /api/v1/chat`
#[derive(Debug, Serialize)]
pub struct ChatRequest {
    /// The user's message text
    pub message: String,
    /// Conversation session identifier (stable per Telegram user)
    pub session_id: String,
}

/// A knowledge-base document the backend grounded its answer on
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRef {
    /// Identifier of the source document
    pub source_id: String,
    /// Relevance score, when the backend reports one
    #[serde(default)]
    pub score: Option<f64>,
}

/// Successful response from `POST /api/v1/chat`
#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    /// The answer to relay to the user
    pub answer: String,
    /// Sources backing the answer, shown only in debug mode
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    /// Session id echoed by the backend; backfilled by the client when absent
    #[serde(default)]
    pub session_id: Option<String>,
}

/// HTTP client for the KellyBot backend
pub struct KellyApiClient {
    http: HttpClient,
    chat_url: String,
    api_key: String,
}

impl KellyApiClient {
    /// Build a client from settings. The underlying `reqwest::Client` is
    /// created once and reused for every call.
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        let http = HttpClient::builder()
            .connect_timeout(Duration::from_secs_f64(settings.api_timeout_connect_secs))
            .timeout(Duration::from_secs_f64(settings.api_timeout_read_secs))
            .build()
            .unwrap_or_else(|_| HttpClient::new());

        let chat_url = format!("{}/api/v1/chat", settings.api_url.trim_end_matches('/'));

        Self {
            http,
            chat_url,
            api_key: settings.api_access_key.clone(),
        }
    }

    /// Send a user message to the backend and return its answer.
    ///
    /// # Errors
    ///
    /// Returns a [`KellyApiError`] on timeout, transport failure, non-2xx
    /// status or malformed response body.
    pub async fn chat(
        &self,
        message: &str,
        session_id: &str,
    ) -> Result<ChatResponse, KellyApiError> {
        let payload = ChatRequest {
            message: message.to_string(),
            session_id: session_id.to_string(),
        };

        debug!("Calling Kelly API: POST {}", self.chat_url);

        let response = self
            .http
            .post(&self.chat_url)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    error!("Timeout calling Kelly API ({}): {e}", self.chat_url);
                    KellyApiError::Timeout
                } else {
                    error!("Network error calling Kelly API ({}): {e}", self.chat_url);
                    KellyApiError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(
                "Kelly API returned HTTP {status} ({}): {}",
                self.chat_url,
                crate::utils::truncate_str(&body, 200)
            );
            return Err(status_error(status, &body));
        }

        debug!("Kelly API answered with HTTP {status}");

        let mut chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| KellyApiError::Json(e.to_string()))?;

        // The backend is expected to echo the session id, but older versions
        // omitted it; fill it in so downstream code can rely on it.
        if chat_response.session_id.is_none() {
            chat_response.session_id = Some(session_id.to_string());
        }

        Ok(chat_response)
    }
}

/// Build a `Status` error from a non-2xx response body.
///
/// Extracts the `detail` field when the body is a JSON error object. HTML
/// error pages from proxies are detected and never echoed into the error;
/// other non-JSON bodies are truncated to keep log lines readable.
fn status_error(status: StatusCode, body: &str) -> KellyApiError {
    let trimmed = body.trim_start();
    let is_html = trimmed.starts_with("<!DOCTYPE")
        || trimmed.starts_with("<html")
        || trimmed.starts_with("<HTML");

    let detail = if is_html {
        None
    } else {
        serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("detail").and_then(|d| d.as_str().map(String::from)))
            .map(|d| crate::utils::truncate_str(d, 500))
    };

    KellyApiError::Status {
        status: status.as_u16(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_response_parsing() {
        let body = r#"{
            "answer": "MiAdminXML es un administrador de CFDI.",
            "sources": [
                {"source_id": "faq_001", "score": 0.912},
                {"source_id": "manual_03"}
            ],
            "session_id": "tg_user_42",
            "extra_field": true
        }"#;

        let parsed: ChatResponse = serde_json::from_str(body).expect("valid payload");
        assert_eq!(parsed.answer, "MiAdminXML es un administrador de CFDI.");
        assert_eq!(parsed.sources.len(), 2);
        assert_eq!(parsed.sources[0].source_id, "faq_001");
        assert_eq!(parsed.sources[0].score, Some(0.912));
        assert_eq!(parsed.sources[1].score, None);
        assert_eq!(parsed.session_id.as_deref(), Some("tg_user_42"));
    }

    #[test]
    fn test_chat_response_minimal() {
        // Only "answer" is guaranteed; sources and session_id may be absent
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"answer": "Hola"}"#).expect("minimal payload");
        assert_eq!(parsed.answer, "Hola");
        assert!(parsed.sources.is_empty());
        assert!(parsed.session_id.is_none());
    }

    #[test]
    fn test_status_error_extracts_detail() {
        let err = status_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"detail": "session_id is required"}"#,
        );
        match err {
            KellyApiError::Status { status, detail } => {
                assert_eq!(status, 422);
                assert_eq!(detail.as_deref(), Some("session_id is required"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_status_error_ignores_html_body() {
        let err = status_error(
            StatusCode::BAD_GATEWAY,
            "<!DOCTYPE html><html><body>502 Bad Gateway</body></html>",
        );
        match err {
            KellyApiError::Status { status, detail } => {
                assert_eq!(status, 502);
                assert!(detail.is_none());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_user_messages() {
        assert!(KellyApiError::Timeout.user_message().contains("tardando"));
        assert!(KellyApiError::Network("refused".into())
            .user_message()
            .contains("conectarme"));
        assert!(KellyApiError::Status {
            status: 401,
            detail: None
        }
        .user_message()
        .contains("administrador"));

        // 4xx detail is surfaced to the user
        let msg = KellyApiError::Status {
            status: 422,
            detail: Some("mensaje vacío".into()),
        }
        .user_message();
        assert!(msg.contains("422"));
        assert!(msg.contains("mensaje vacío"));

        // 5xx detail is never surfaced
        let msg = KellyApiError::Status {
            status: 500,
            detail: Some("stack trace".into()),
        }
        .user_message();
        assert!(!msg.contains("stack trace"));
    }
}
