mod core;
pub mod history;
mod state;
pub mod streaming;

#[cfg(test)]
mod tests;

pub use history::{PromptAssembler, PromptBudget, PromptSettings};
pub use state::{ConversationManager, SendOptions};
pub use streaming::{ProgressSender, StreamState};
