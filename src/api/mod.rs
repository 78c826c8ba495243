pub mod client;
pub mod logging;
pub mod mock_client;
pub mod stream;

pub use client::{ByteStream, CompletionTransport, HttpTransport, SharedTransport};
pub use mock_client::{MockReply, MockTransport};
