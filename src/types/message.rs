use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of a conversation. Messages form a backward chain through
/// `parent_message_id`; nothing points forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub text: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl Message {
    pub fn user(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        parent_message_id: Option<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            text: text.into(),
            conversation_id: conversation_id.into(),
            parent_message_id,
            detail: None,
        }
    }

    pub fn assistant(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        parent_message_id: Option<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            text: text.into(),
            conversation_id: conversation_id.into(),
            parent_message_id,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

pub(crate) fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
