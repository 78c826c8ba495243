use super::logging::{debug_payload_enabled, emit_debug_payload};
use crate::config::Config;
use crate::error::{ClientError, Result};
use crate::types::CompletionRequest;
use crate::util::is_local_endpoint_url;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Url;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Moves one completion request to the remote service.
///
/// Implementations must stop promptly once `cancel` fires, dropping the
/// underlying connection.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    /// Buffered call: the decoded JSON body of a 2xx response.
    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Value>;

    /// Streaming call: the raw text/event-stream body of a 2xx response.
    async fn open_stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<ByteStream>;
}

pub type SharedTransport = Arc<dyn CompletionTransport>;

#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    api_key: Option<String>,
    api_url: Url,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self> {
        Self::from_parts(&config.api_url, config.api_key.clone())
    }

    pub fn from_parts(api_url: &str, api_key: Option<String>) -> Result<Self> {
        let api_url = Url::parse(api_url.trim()).map_err(|error| {
            ClientError::Configuration(format!("invalid completion endpoint '{api_url}': {error}"))
        })?;
        if !matches!(api_url.scheme(), "http" | "https") {
            return Err(ClientError::Configuration(format!(
                "completion endpoint '{api_url}' must use http or https"
            )));
        }

        Ok(Self {
            http: reqwest::Client::new(),
            api_key,
            api_url,
        })
    }

    async fn send(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let request_url = self.api_url.as_str();
        let mut builder = self
            .http
            .post(self.api_url.clone())
            .header("content-type", "application/json")
            .json(request);

        if request.stream {
            builder = builder.header("accept", "text/event-stream");
        }
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        if debug_payload_enabled() {
            emit_debug_payload(request_url, request);
        }
        tracing::debug!(
            url = request_url,
            model = %request.model,
            stream = request.stream,
            max_tokens = request.max_tokens,
            "sending completion request"
        );

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            response = builder.send() => {
                response.map_err(|error| map_request_error(error, request_url))?
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            body = response.text() => body.unwrap_or_default(),
        };
        tracing::warn!(url = request_url, status = status.as_u16(), "completion endpoint rejected request");
        Err(ClientError::UpstreamHttp {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            body,
        })
    }
}

#[async_trait]
impl CompletionTransport for HttpTransport {
    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let response = self.send(request, cancel).await?;
        let request_url = self.api_url.to_string();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            body = response.json::<Value>() => {
                body.map_err(|error| map_request_error(error, &request_url))
            }
        }
    }

    async fn open_stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        let response = self.send(request, cancel).await?;
        let request_url = self.api_url.to_string();
        let stream = response
            .bytes_stream()
            .take_until(cancel.clone().cancelled_owned())
            .map(move |item| item.map_err(|error| map_request_error(error, &request_url)));
        Ok(Box::pin(stream))
    }
}

fn map_request_error(error: reqwest::Error, request_url: &str) -> ClientError {
    if error.is_connect() && is_local_endpoint_url(request_url) {
        tracing::warn!(
            url = request_url,
            "cannot reach local completion endpoint; start the local server or update LOOM_API_URL"
        );
    } else if error.is_connect() {
        tracing::warn!(url = request_url, "cannot reach completion endpoint");
    } else if error.is_timeout() {
        tracing::warn!(url = request_url, "completion request timed out in transport");
    } else if error.is_decode() {
        tracing::warn!(url = request_url, "completion response body could not be decoded");
    }
    ClientError::Transport(error)
}
