use super::logging::emit_sse_parse_error;
use crate::error::{ClientError, Result};
use crate::types::CompletionResponse;
use serde_json::Value;

pub const DONE_SENTINEL: &str = "[DONE]";

/// One decoded text/event-stream event.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    Done,
    Completion {
        response: CompletionResponse,
        raw: Value,
    },
}

/// Largest unterminated event kept while waiting for its blank line.
pub const MAX_PENDING_EVENT_BYTES: usize = 1 << 20;

/// Incremental text/event-stream decoder. Chunks may split events, lines and
/// UTF-8 sequences at arbitrary byte offsets.
#[derive(Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
    // Bytes before this offset hold no event boundary.
    scanned: usize,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, chunk: &[u8]) -> Result<Vec<StreamFrame>> {
        self.buffer.extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));
        let mut frames = Vec::new();
        let mut start = 0;

        loop {
            let search_from = self.scanned.max(start);
            let Some(offset) = find_event_boundary(&self.buffer[search_from..]) else {
                break;
            };
            let end = search_from + offset;
            let event_text = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            start = end + 2;
            self.scanned = start;

            if let Some(frame) = decode_event(&event_text)? {
                frames.push(frame);
            }
        }

        if start > 0 {
            self.buffer.drain(..start);
        }
        // A trailing '\n' may still pair with the next chunk.
        self.scanned = self.buffer.len().saturating_sub(1);

        if self.buffer.len() > MAX_PENDING_EVENT_BYTES {
            return Err(ClientError::UpstreamPayload(format!(
                "stream event exceeds {MAX_PENDING_EVENT_BYTES} bytes without a terminating blank line"
            )));
        }

        Ok(frames)
    }

    /// Decodes an unterminated trailing event left when the connection closed.
    pub fn finish(&mut self) -> Result<Option<StreamFrame>> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        let event_text = String::from_utf8_lossy(&rest);
        if event_text.trim().is_empty() {
            return Ok(None);
        }
        decode_event(&event_text)
    }
}

fn find_event_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\n\n")
}

fn decode_event(event_text: &str) -> Result<Option<StreamFrame>> {
    let mut event_type = None;
    let mut data_lines = Vec::new();

    for line in event_text.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event_type = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }

    let data = data_lines.join("\n");
    let data = data.trim();
    if data.is_empty() {
        return Ok(None);
    }
    if data == DONE_SENTINEL {
        return Ok(Some(StreamFrame::Done));
    }

    match serde_json::from_str::<Value>(data) {
        Ok(raw) => Ok(Some(StreamFrame::Completion {
            response: CompletionResponse::from_json(&raw),
            raw,
        })),
        Err(source) => {
            emit_sse_parse_error(event_type.as_deref(), data, &source);
            Err(ClientError::StreamParse {
                data: data.to_string(),
                source,
            })
        }
    }
}
