//! Synchronous HTTP transport
//!
//! One request, one response. No retries; a failed call is surfaced to the
//! caller, which may resubmit.

use super::wire::{ErrorBody, HealthResponse, HistoryEntry, HistoryResponse};
use super::{ChatClient, ChatRequest, ChatResponse, TransportError};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// reqwest-backed client for the backend's REST surface
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    /// Every request is bounded by `timeout`; exceeding it yields
    /// `TransportErrorKind::Timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Session ids are caller-supplied, so they go in as one encoded segment
    fn history_url(&self, session_id: &str) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            TransportError::network(format!("invalid base URL {}: {e}", self.base_url))
        })?;
        url.path_segments_mut()
            .map_err(|()| {
                TransportError::network(format!("base URL {} cannot carry a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(["api", "chat", "history", session_id]);
        Ok(url)
    }

    /// `GET /health`
    pub async fn health(&self) -> Result<(), TransportError> {
        let response = self.client.get(self.url("/health")).send().await?;
        let body: HealthResponse = read_json(response).await?;
        if body.status == "healthy" {
            Ok(())
        } else {
            Err(TransportError::status(
                200,
                format!("backend reports status {:?}", body.status),
            ))
        }
    }

    /// `GET /api/chat/history/{session_id}`, oldest first
    pub async fn history(&self, session_id: &str) -> Result<Vec<HistoryEntry>, TransportError> {
        let response = self
            .client
            .get(self.history_url(session_id)?)
            .send()
            .await?;
        let body: HistoryResponse = read_json(response).await?;
        Ok(body.history)
    }
}

#[async_trait]
impl ChatClient for HttpTransport {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, TransportError> {
        let start = std::time::Instant::now();
        let result: Result<ChatResponse, TransportError> = async {
            let response = self
                .client
                .post(self.url("/api/chat"))
                .json(request)
                .send()
                .await?;
            read_json(response).await
        }
        .await;

        match &result {
            Ok(_) => tracing::debug!(
                duration_ms = %start.elapsed().as_millis(),
                "chat request completed"
            ),
            Err(e) => tracing::warn!(
                duration_ms = %start.elapsed().as_millis(),
                kind = ?e.kind,
                error = %e.message,
                "chat request failed"
            ),
        }
        result
    }
}

/// Decode a success body, or turn a non-success status into an error
/// carrying the backend's `detail` when it sent one.
async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, TransportError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.detail)
            .unwrap_or_else(|_| {
                if body.is_empty() {
                    status.to_string()
                } else {
                    body
                }
            });
        return Err(TransportError::status(status.as_u16(), detail));
    }
    Ok(response.json::<T>().await?)
}
