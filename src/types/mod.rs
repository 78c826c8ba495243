mod api;
mod message;
mod model;

pub use api::{CompletionChoice, CompletionRequest, CompletionResponse, CompletionResult, PartialReply};
pub(crate) use message::generate_id;
pub use message::{Message, Role};
pub use model::{ModelFamily, ENDOFTEXT};
