use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Body posted to the completions endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: usize,
    pub stop: Vec<String>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
}

/// A buffered completion response, or one event of a streamed one.
///
/// Every field is read leniently: a missing, null or mistyped value falls back
/// to its default instead of failing the whole payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionResponse {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub choices: Vec<CompletionChoice>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub detail: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionChoice {
    #[serde(default, deserialize_with = "lenient")]
    pub text: String,
    #[serde(default, deserialize_with = "lenient")]
    pub index: usize,
    #[serde(default, deserialize_with = "lenient")]
    pub finish_reason: Option<String>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

impl CompletionResponse {
    /// Reads whatever `id` and `choices` a JSON value carries. Values that are
    /// not objects yield an empty response.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Object(_) => Self::deserialize(value).unwrap_or_default(),
            _ => Self::default(),
        }
    }

    /// Whatever the upstream said about a response that has no choices.
    pub fn diagnostic(&self) -> String {
        let from_error = self.error.as_ref().and_then(|error| match error {
            Value::String(text) => Some(text.clone()),
            Value::Object(fields) => fields
                .get("message")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            _ => None,
        });
        let from_detail = || {
            self.detail.as_ref().map(|detail| match detail {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
        };
        from_error
            .or_else(from_detail)
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Final reply text as assembled from either a buffered or a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResult {
    pub id: Option<String>,
    pub text: String,
    pub detail: Value,
}

/// Progress update sent while a streamed reply is being assembled.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialReply {
    pub id: Option<String>,
    pub delta: String,
    pub text: String,
    pub detail: Value,
}
