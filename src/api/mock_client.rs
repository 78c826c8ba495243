use crate::api::client::{ByteStream, CompletionTransport};
use crate::error::{ClientError, Result};
use crate::types::CompletionRequest;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Canned upstream behaviour for one request.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Buffered 2xx JSON body.
    Json(Value),
    /// Non-2xx status with a text body.
    Status { status: u16, body: String },
    /// Streamed body; each entry is sent as one chunk after its delay.
    Events(Vec<(Duration, String)>),
}

impl MockReply {
    /// SSE events sent back to back, each framed with a blank line if needed.
    pub fn events<I, S>(events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MockReply::Events(
            events
                .into_iter()
                .map(|event| (Duration::ZERO, frame_event(event.into())))
                .collect(),
        )
    }

    /// SSE events separated by `delay`.
    pub fn paced_events<I, S>(delay: Duration, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MockReply::Events(
            events
                .into_iter()
                .map(|event| (delay, frame_event(event.into())))
                .collect(),
        )
    }
}

fn frame_event(event: String) -> String {
    let event = if event.starts_with("data:") || event.starts_with("event:") {
        event
    } else {
        format!("data: {event}")
    };
    if event.ends_with("\n\n") {
        event
    } else {
        format!("{event}\n\n")
    }
}

/// Scripted transport: replies are consumed in order and every request is recorded.
#[derive(Clone, Default)]
pub struct MockTransport {
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl MockTransport {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            requests: Arc::default(),
        }
    }

    pub fn push_reply(&self, reply: MockReply) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn next_reply(&self, request: &CompletionRequest) -> Result<MockReply> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        self.replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.pop_front())
            .ok_or_else(|| {
                ClientError::Configuration("MockTransport: no more replies configured".to_string())
            })
    }
}

fn status_error(status: u16, body: String) -> ClientError {
    let status_text = reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or_default()
        .to_string();
    ClientError::UpstreamHttp {
        status,
        status_text,
        body,
    }
}

#[async_trait]
impl CompletionTransport for MockTransport {
    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        match self.next_reply(request)? {
            MockReply::Json(body) => Ok(body),
            MockReply::Status { status, body } => Err(status_error(status, body)),
            MockReply::Events(_) => Err(ClientError::Configuration(
                "MockTransport: streamed reply scripted for a buffered request".to_string(),
            )),
        }
    }

    async fn open_stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let events = match self.next_reply(request)? {
            MockReply::Events(events) => events,
            MockReply::Status { status, body } => return Err(status_error(status, body)),
            MockReply::Json(_) => {
                return Err(ClientError::Configuration(
                    "MockTransport: buffered reply scripted for a streamed request".to_string(),
                ))
            }
        };

        let chunks = stream::iter(events).then(|(delay, chunk)| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok::<Bytes, ClientError>(Bytes::from(chunk))
        });
        Ok(Box::pin(chunks.take_until(cancel.clone().cancelled_owned())))
    }
}
