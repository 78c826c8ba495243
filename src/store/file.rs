use super::ConversationStore;
use crate::error::StoreError;
use crate::types::Message;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

/// Messages kept in memory and mirrored to a single JSON file on every `put`.
///
/// A message becomes visible to `get` only after the file holding it has been
/// written. Readers are not blocked while a write is in flight.
pub struct FileStore {
    path: PathBuf,
    messages: RwLock<HashMap<String, Message>>,
    // Serializes snapshot, persist and publish across concurrent puts.
    writer: Mutex<()>,
}

impl FileStore {
    /// Opens `path`, loading whatever a previous session wrote there.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let messages = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => HashMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(error) => return Err(error.into()),
        };

        tracing::debug!(path = %path.display(), messages = messages.len(), "opened message store");
        Ok(Self {
            path,
            messages: RwLock::new(messages),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, messages: &HashMap<String, Message>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let encoded = serde_json::to_vec_pretty(messages)?;
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, encoded).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for FileStore {
    async fn get(&self, id: &str) -> Result<Option<Message>, StoreError> {
        Ok(self.messages.read().await.get(id).cloned())
    }

    async fn put(&self, message: Message) -> Result<(), StoreError> {
        let _writer = self.writer.lock().await;

        let mut snapshot = self.messages.read().await.clone();
        snapshot.insert(message.id.clone(), message.clone());
        if let Err(error) = self.persist(&snapshot).await {
            tracing::warn!(path = %self.path.display(), message_id = %message.id, %error, "failed to persist message");
            return Err(error);
        }

        self.messages.write().await.insert(message.id.clone(), message);
        Ok(())
    }
}
