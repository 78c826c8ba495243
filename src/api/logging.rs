use crate::types::CompletionRequest;
use std::fs::OpenOptions;
use std::io::Write;

const DEBUG_PAYLOAD_ENV: &str = "LOOM_DEBUG_PAYLOAD";
const API_LOG_PATH_ENV: &str = "LOOM_API_LOG_PATH";

pub fn debug_payload_enabled() -> bool {
    crate::util::env_flag(DEBUG_PAYLOAD_ENV).unwrap_or(false)
}

/// Dumps an outgoing request. Prompts can be large, so this only runs when
/// `LOOM_DEBUG_PAYLOAD` is set.
pub fn emit_debug_payload(request_url: &str, request: &CompletionRequest) {
    let formatted_payload = serde_json::to_string_pretty(request)
        .unwrap_or_else(|_| "<payload serialization error>".to_string());
    let message =
        format!("LOOM_API DEBUG payload_request url={request_url}\npayload:\n{formatted_payload}\n");
    if !append_to_log_file(&message) {
        tracing::debug!(url = request_url, payload = %formatted_payload, "completion request");
    }
}

pub fn emit_sse_parse_error(
    event_type: Option<&str>,
    json_data: &str,
    parse_error: &serde_json::Error,
) {
    let message = format!(
        "LOOM_API ERROR sse_parse_failed error={parse_error}\nevent_type={}\ndata:\n{json_data}\n",
        event_type.unwrap_or("<none>")
    );
    if !append_to_log_file(&message) {
        tracing::warn!(
            error = %parse_error,
            event_type = event_type.unwrap_or("<none>"),
            data = json_data,
            "stream event is not valid JSON"
        );
    }
}

fn append_to_log_file(message: &str) -> bool {
    let Some(path) = resolve_log_path() else {
        return false;
    };
    let written = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut file| file.write_all(message.as_bytes()));
    written.is_ok()
}

fn resolve_log_path() -> Option<String> {
    crate::util::env_string(API_LOG_PATH_ENV)
}
