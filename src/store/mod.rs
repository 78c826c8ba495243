mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::types::Message;
use async_trait::async_trait;
use std::sync::Arc;

/// Keyed message repository. Implementations must tolerate concurrent calls
/// for independent ids; callers add no locking of their own.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// `Ok(None)` and `Err(StoreError::NotFound)` both mean the id is unknown.
    async fn get(&self, id: &str) -> Result<Option<Message>, StoreError>;

    async fn put(&self, message: Message) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn ConversationStore>;
