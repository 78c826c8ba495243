use crate::config::Config;
use crate::error::{ClientError, Result};
use crate::store::SharedStore;
use crate::tokens::SharedTokenCounter;
use crate::types::{Message, ModelFamily, Role};
use chrono::NaiveDate;

const TURN_SEPARATOR: &str = "\n\n";

/// Fixed inputs of prompt assembly, taken from [`Config`] at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptSettings {
    pub family: ModelFamily,
    pub max_model_tokens: usize,
    pub max_response_tokens: usize,
    pub user_label: String,
    pub assistant_label: String,
}

impl PromptSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            family: ModelFamily::from_model_name(&config.model),
            max_model_tokens: config.max_model_tokens,
            max_response_tokens: config.max_response_tokens,
            user_label: config.user_label.clone(),
            assistant_label: config.assistant_label.clone(),
        }
    }
}

/// A prompt that fits the context window, and what is left for the reply.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptBudget {
    pub prompt: String,
    /// Always within `1..=max_response_tokens`.
    pub max_tokens: usize,
    pub prompt_tokens: usize,
    /// Ancestors of the new message that made it into the prompt.
    pub history_turns: usize,
}

/// Greedy, oldest-dropped-first history fitting over the parent chain.
pub struct PromptAssembler {
    settings: PromptSettings,
    max_context_tokens: usize,
    counter: SharedTokenCounter,
    store: SharedStore,
}

impl PromptAssembler {
    pub fn new(
        settings: PromptSettings,
        counter: SharedTokenCounter,
        store: SharedStore,
    ) -> Result<Self> {
        let max_context_tokens = settings
            .max_model_tokens
            .checked_sub(settings.max_response_tokens)
            .filter(|tokens| *tokens >= 1)
            .ok_or_else(|| {
                ClientError::Configuration(format!(
                    "max_response_tokens ({}) leaves no room for context in max_model_tokens ({})",
                    settings.max_response_tokens, settings.max_model_tokens
                ))
            })?;
        if settings.max_response_tokens == 0 {
            return Err(ClientError::Configuration(
                "max_response_tokens must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            settings,
            max_context_tokens,
            counter,
            store,
        })
    }

    pub fn settings(&self) -> &PromptSettings {
        &self.settings
    }

    pub fn max_context_tokens(&self) -> usize {
        self.max_context_tokens
    }

    pub async fn build_prompt(
        &self,
        new_message_text: &str,
        parent_message_id: Option<&str>,
        prompt_prefix: Option<&str>,
        prompt_suffix: Option<&str>,
    ) -> Result<PromptBudget> {
        let prefix = match prompt_prefix {
            Some(custom) => self.custom_prompt_prefix(custom),
            None => self.default_prompt_prefix(chrono::Local::now().date_naive()),
        };
        let suffix = prompt_suffix
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| self.default_prompt_suffix());

        let mut body = self.format_turn(Role::User, new_message_text);
        let mut parent_id = parent_message_id.map(ToOwned::to_owned);
        let mut accepted: Option<(String, usize)> = None;
        let mut history_turns = 0usize;

        loop {
            let candidate = format!("{prefix}{body}{suffix}");
            let tokens = self.counter.count_tokens(&candidate)?;

            if tokens > self.max_context_tokens {
                if accepted.is_none() {
                    tracing::debug!(
                        tokens,
                        max_context_tokens = self.max_context_tokens,
                        "newest message alone exceeds the context budget; sending it anyway"
                    );
                    accepted = Some((candidate, tokens));
                } else {
                    history_turns = history_turns.saturating_sub(1);
                }
                break;
            }
            accepted = Some((candidate, tokens));

            let Some(id) = parent_id.take() else {
                break;
            };
            let Some(parent) = self.lookup_parent(&id).await? else {
                break;
            };

            body = format!(
                "{}{TURN_SEPARATOR}{body}",
                self.format_turn(parent.role, &parent.text)
            );
            parent_id = parent.parent_message_id;
            history_turns += 1;
        }

        let Some((prompt, prompt_tokens)) = accepted else {
            return Err(ClientError::Configuration(
                "prompt assembly produced no candidate".to_string(),
            ));
        };
        let max_tokens = self
            .settings
            .max_model_tokens
            .saturating_sub(prompt_tokens)
            .clamp(1, self.settings.max_response_tokens);

        tracing::debug!(
            prompt_tokens,
            history_turns,
            max_tokens,
            "assembled prompt"
        );
        Ok(PromptBudget {
            prompt,
            max_tokens,
            prompt_tokens,
            history_turns,
        })
    }

    async fn lookup_parent(&self, id: &str) -> Result<Option<Message>> {
        match self.store.get(id).await {
            Ok(found) => {
                if found.is_none() {
                    tracing::debug!(message_id = id, "parent message not in store; history ends here");
                }
                Ok(found)
            }
            Err(error) if error.is_miss() => {
                tracing::warn!(message_id = id, %error, "parent lookup missed; history ends here");
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    pub fn format_turn(&self, role: Role, text: &str) -> String {
        let label = match role {
            Role::User => &self.settings.user_label,
            Role::Assistant => &self.settings.assistant_label,
        };
        format!("{label}:\n\n{text}{}", self.settings.family.end_token())
    }

    pub fn default_prompt_prefix(&self, today: NaiveDate) -> String {
        format!(
            "Instructions:\nYou are {}, a large language model. Respond conversationally.\nCurrent date: {}{}\n\n",
            self.settings.assistant_label,
            today.format("%Y-%m-%d"),
            self.settings.family.separator_token()
        )
    }

    pub fn custom_prompt_prefix(&self, prefix: &str) -> String {
        let trimmed = prefix.trim();
        let separator = self.settings.family.separator_token();
        if trimmed.ends_with(separator) {
            format!("{trimmed}\n\n")
        } else {
            format!("{trimmed}{separator}\n\n")
        }
    }

    pub fn default_prompt_suffix(&self) -> String {
        format!("\n\n{}:\n\n", self.settings.assistant_label)
    }
}
