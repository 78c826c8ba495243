use super::ConversationStore;
use crate::error::StoreError;
use crate::types::Message;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    messages: RwLock<HashMap<String, Message>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Message>, StoreError> {
        Ok(self.messages.read().await.get(id).cloned())
    }

    async fn put(&self, message: Message) -> Result<(), StoreError> {
        self.messages
            .write()
            .await
            .insert(message.id.clone(), message);
        Ok(())
    }
}
