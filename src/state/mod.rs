pub mod conversation;

pub use conversation::{
    ConversationManager, ProgressSender, PromptAssembler, PromptBudget, PromptSettings,
    SendOptions,
};
