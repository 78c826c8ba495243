use super::streaming::{assemble_buffered, assemble_stream, ProgressSender};
use super::{ConversationManager, SendOptions};
use crate::error::{ClientError, Result};
use crate::types::{generate_id, CompletionRequest, Message};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

struct Turn {
    text: String,
    conversation_id: String,
    message_id: String,
    parent_message_id: Option<String>,
    prompt_prefix: Option<String>,
    prompt_suffix: Option<String>,
    progress: Option<ProgressSender>,
    stream: bool,
}

impl ConversationManager {
    /// Sends `text` as a user message and returns the persisted assistant reply.
    ///
    /// The reply's `id` is the `parent_message_id` to pass for the next turn.
    pub async fn send_message(&self, text: impl Into<String>, options: SendOptions) -> Result<Message> {
        let SendOptions {
            conversation_id,
            parent_message_id,
            message_id,
            prompt_prefix,
            prompt_suffix,
            progress,
            timeout,
            cancel,
            stream,
        } = options;

        let turn = Turn {
            text: text.into(),
            conversation_id: conversation_id.unwrap_or_else(generate_id),
            message_id: message_id.unwrap_or_else(generate_id),
            parent_message_id,
            prompt_prefix: prompt_prefix.or_else(|| self.prompt_prefix.clone()),
            prompt_suffix: prompt_suffix.or_else(|| self.prompt_suffix.clone()),
            stream: stream.unwrap_or(progress.is_some()),
            progress,
        };
        let span = tracing::info_span!(
            "send_message",
            conversation_id = %turn.conversation_id,
            message_id = %turn.message_id,
            stream = turn.stream,
        );

        let timeout = timeout.or(self.timeout);
        let internal_cancel = cancel.is_none();
        let cancel = cancel.unwrap_or_default();

        let guarded = async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ClientError::Cancelled),
                reply = self.run_turn(turn, &cancel) => reply,
            }
        }
        .instrument(span);

        let Some(limit) = timeout else {
            return guarded.await;
        };
        match tokio::time::timeout(limit, guarded).await {
            Ok(reply) => reply,
            Err(_) => {
                if internal_cancel {
                    cancel.cancel();
                }
                tracing::warn!(timeout = ?limit, "send_message timed out");
                Err(ClientError::Timeout(limit))
            }
        }
    }

    async fn run_turn(&self, turn: Turn, cancel: &CancellationToken) -> Result<Message> {
        let user_message = Message::user(
            turn.message_id,
            turn.conversation_id.clone(),
            turn.parent_message_id.clone(),
            turn.text,
        );
        self.store.put(user_message.clone()).await?;

        let budget = self
            .assembler
            .build_prompt(
                &user_message.text,
                turn.parent_message_id.as_deref(),
                turn.prompt_prefix.as_deref(),
                turn.prompt_suffix.as_deref(),
            )
            .await?;

        let request = CompletionRequest {
            model: self.model_options.model.clone(),
            prompt: budget.prompt,
            max_tokens: budget.max_tokens,
            stop: self.model_options.stop.clone(),
            stream: turn.stream,
            temperature: self.model_options.temperature,
            top_p: self.model_options.top_p,
            presence_penalty: self.model_options.presence_penalty,
            frequency_penalty: self.model_options.frequency_penalty,
        };

        let result = if turn.stream {
            assemble_stream(
                self.transport.as_ref(),
                &request,
                cancel,
                turn.progress.as_ref(),
            )
            .await?
        } else {
            assemble_buffered(self.transport.as_ref(), &request, cancel).await?
        };

        let reply = Message::assistant(
            generate_id(),
            turn.conversation_id,
            Some(user_message.id),
            result.text,
        )
        .with_detail(result.detail);
        self.store.put(reply.clone()).await?;

        tracing::info!(
            reply_id = %reply.id,
            history_turns = budget.history_turns,
            prompt_tokens = budget.prompt_tokens,
            "reply stored"
        );
        Ok(reply)
    }
}
