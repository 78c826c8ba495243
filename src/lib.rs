pub mod api;
pub mod config;
pub mod error;
pub mod state;
pub mod store;
pub mod tokens;
pub mod types;
pub mod util;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{ClientError, Result, StoreError};
pub use state::{ConversationManager, PromptAssembler, PromptBudget, SendOptions};
pub use types::{Message, PartialReply, Role};
