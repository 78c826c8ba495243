use super::history::{PromptAssembler, PromptSettings};
use super::streaming::ProgressSender;
use crate::api::{HttpTransport, SharedTransport};
use crate::config::Config;
use crate::error::Result;
use crate::store::{FileStore, MemoryStore, SharedStore};
use crate::tokens::{HeuristicTokenCounter, SharedTokenCounter};
use crate::types::ModelFamily;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-call options of [`ConversationManager::send_message`].
#[derive(Default, Clone)]
pub struct SendOptions {
    /// Defaults to a fresh id.
    pub conversation_id: Option<String>,
    /// The message being replied to. `None` starts without history.
    pub parent_message_id: Option<String>,
    /// Id for the new user message. Defaults to a fresh id.
    pub message_id: Option<String>,
    pub prompt_prefix: Option<String>,
    pub prompt_suffix: Option<String>,
    pub progress: Option<ProgressSender>,
    /// Overrides the configured timeout.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// Defaults to streaming exactly when `progress` is set.
    pub stream: Option<bool>,
}

impl SendOptions {
    pub fn reply_to(conversation_id: impl Into<String>, parent_message_id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            parent_message_id: Some(parent_message_id.into()),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }
}

/// Sampling parameters forwarded with every request.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct ModelOptions {
    pub(super) model: String,
    pub(super) stop: Vec<String>,
    pub(super) temperature: Option<f32>,
    pub(super) top_p: Option<f32>,
    pub(super) presence_penalty: Option<f32>,
    pub(super) frequency_penalty: Option<f32>,
}

pub struct ConversationManager {
    pub(super) assembler: PromptAssembler,
    pub(super) transport: SharedTransport,
    pub(super) store: SharedStore,
    pub(super) model_options: ModelOptions,
    pub(super) prompt_prefix: Option<String>,
    pub(super) prompt_suffix: Option<String>,
    pub(super) timeout: Option<Duration>,
}

impl ConversationManager {
    /// HTTP transport, heuristic token counter, and a file store when
    /// `store_path` is set (memory store otherwise).
    pub async fn from_config(config: &Config) -> Result<Self> {
        let transport: SharedTransport = Arc::new(HttpTransport::new(config)?);
        let store: SharedStore = match &config.store_path {
            Some(path) => Arc::new(FileStore::open(path).await?),
            None => Arc::new(MemoryStore::new()),
        };
        let counter: SharedTokenCounter = Arc::new(HeuristicTokenCounter::new(
            ModelFamily::from_model_name(&config.model),
        )?);
        Self::with_parts(config, transport, store, counter)
    }

    pub fn with_parts(
        config: &Config,
        transport: SharedTransport,
        store: SharedStore,
        counter: SharedTokenCounter,
    ) -> Result<Self> {
        let settings = PromptSettings::from_config(config);
        let model_options = ModelOptions {
            model: config.model.clone(),
            stop: settings.family.stop_sequences(),
            temperature: config.temperature,
            top_p: config.top_p,
            presence_penalty: config.presence_penalty,
            frequency_penalty: config.frequency_penalty,
        };

        Ok(Self {
            assembler: PromptAssembler::new(settings, counter, Arc::clone(&store))?,
            transport,
            store,
            model_options,
            prompt_prefix: config.prompt_prefix.clone(),
            prompt_suffix: config.prompt_suffix.clone(),
            timeout: config.timeout,
        })
    }

    pub fn store(&self) -> SharedStore {
        Arc::clone(&self.store)
    }

    pub fn assembler(&self) -> &PromptAssembler {
        &self.assembler
    }
}
