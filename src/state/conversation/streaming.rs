use crate::api::stream::{StreamFrame, StreamParser};
use crate::api::CompletionTransport;
use crate::error::{ClientError, Result};
use crate::types::{CompletionRequest, CompletionResponse, CompletionResult, PartialReply};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type ProgressSender = mpsc::UnboundedSender<PartialReply>;

/// Accumulated state of one in-flight streamed reply.
#[derive(Debug, Default)]
pub struct StreamState {
    id: Option<String>,
    text: String,
    detail: Option<Value>,
    events: usize,
}

impl StreamState {
    /// Folds one event in. Returns the progress update when the event carried text.
    pub fn apply(&mut self, response: CompletionResponse, raw: Value) -> Option<PartialReply> {
        self.events += 1;
        if let Some(id) = response.id {
            self.id = Some(id);
        }

        let choice = response.choices.into_iter().next()?;
        self.text.push_str(&choice.text);
        self.detail = Some(raw.clone());

        Some(PartialReply {
            id: self.id.clone(),
            delta: choice.text,
            text: self.text.clone(),
            detail: raw,
        })
    }

    pub fn finish(self) -> CompletionResult {
        CompletionResult {
            id: self.id,
            text: self.text.trim().to_string(),
            detail: self.detail.unwrap_or(Value::Null),
        }
    }
}

/// Single request, single JSON body.
pub async fn assemble_buffered(
    transport: &dyn CompletionTransport,
    request: &CompletionRequest,
    cancel: &CancellationToken,
) -> Result<CompletionResult> {
    let body = transport.complete(request, cancel).await?;
    result_from_body(body)
}

pub fn result_from_body(body: Value) -> Result<CompletionResult> {
    let response = CompletionResponse::from_json(&body);

    let Some(choice) = response.choices.first() else {
        return Err(ClientError::UpstreamPayload(response.diagnostic()));
    };

    Ok(CompletionResult {
        id: response.id.clone(),
        text: choice.text.trim().to_string(),
        detail: body,
    })
}

/// Consumes a text/event-stream reply, sending a [`PartialReply`] per text
/// fragment in arrival order. Nothing is sent once `cancel` has fired.
pub async fn assemble_stream(
    transport: &dyn CompletionTransport,
    request: &CompletionRequest,
    cancel: &CancellationToken,
    progress: Option<&ProgressSender>,
) -> Result<CompletionResult> {
    let mut stream = transport.open_stream(request, cancel).await?;
    let mut parser = StreamParser::new();
    let mut state = StreamState::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            next = stream.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };

        for frame in parser.process(&chunk?)? {
            if apply_frame(&mut state, frame, cancel, progress)? {
                tracing::debug!(events = state.events, "stream finished with sentinel");
                return Ok(state.finish());
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(ClientError::Cancelled);
    }
    if let Some(frame) = parser.finish()? {
        if apply_frame(&mut state, frame, cancel, progress)? {
            return Ok(state.finish());
        }
    }
    if state.events == 0 {
        return Err(ClientError::UpstreamPayload(
            "stream closed before any completion event".to_string(),
        ));
    }

    tracing::debug!(events = state.events, "stream closed without sentinel");
    Ok(state.finish())
}

/// Returns true once the sentinel has been seen.
fn apply_frame(
    state: &mut StreamState,
    frame: StreamFrame,
    cancel: &CancellationToken,
    progress: Option<&ProgressSender>,
) -> Result<bool> {
    if cancel.is_cancelled() {
        return Err(ClientError::Cancelled);
    }
    match frame {
        StreamFrame::Done => Ok(true),
        StreamFrame::Completion { response, raw } => {
            if let Some(update) = state.apply(response, raw) {
                emit_progress(progress, update);
            }
            Ok(false)
        }
    }
}

pub(super) fn emit_progress(progress: Option<&ProgressSender>, update: PartialReply) {
    if let Some(tx) = progress {
        let _ = tx.send(update);
    }
}
