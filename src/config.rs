use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::util::{env_flag, env_parse, env_string, is_local_endpoint_url};

pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1/completions";
pub const DEFAULT_MODEL: &str = "text-davinci-003";
pub const DEFAULT_MAX_MODEL_TOKENS: usize = 4097;
pub const DEFAULT_MAX_RESPONSE_TOKENS: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub api_key: Option<String>,
    pub api_url: String,
    pub model: String,
    pub max_model_tokens: usize,
    pub max_response_tokens: usize,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub user_label: String,
    pub assistant_label: String,
    pub prompt_prefix: Option<String>,
    pub prompt_suffix: Option<String>,
    pub timeout: Option<Duration>,
    pub store_path: Option<PathBuf>,
    pub stream: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: DEFAULT_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_model_tokens: DEFAULT_MAX_MODEL_TOKENS,
            max_response_tokens: DEFAULT_MAX_RESPONSE_TOKENS,
            temperature: Some(0.8),
            top_p: Some(1.0),
            presence_penalty: Some(1.0),
            frequency_penalty: None,
            user_label: "User".to_string(),
            assistant_label: "Assistant".to_string(),
            prompt_prefix: None,
            prompt_suffix: None,
            timeout: None,
            store_path: None,
            stream: true,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            api_key: env_string("OPENAI_API_KEY"),
            api_url: env_string("LOOM_API_URL").unwrap_or(defaults.api_url),
            model: env_string("LOOM_MODEL").unwrap_or(defaults.model),
            max_model_tokens: env_parse("LOOM_MAX_MODEL_TOKENS")?
                .unwrap_or(defaults.max_model_tokens),
            max_response_tokens: env_parse("LOOM_MAX_RESPONSE_TOKENS")?
                .unwrap_or(defaults.max_response_tokens),
            temperature: env_parse("LOOM_TEMPERATURE")?.or(defaults.temperature),
            top_p: env_parse("LOOM_TOP_P")?.or(defaults.top_p),
            presence_penalty: env_parse("LOOM_PRESENCE_PENALTY")?.or(defaults.presence_penalty),
            frequency_penalty: env_parse("LOOM_FREQUENCY_PENALTY")?
                .or(defaults.frequency_penalty),
            user_label: env_string("LOOM_USER_LABEL").unwrap_or(defaults.user_label),
            assistant_label: env_string("LOOM_ASSISTANT_LABEL")
                .unwrap_or(defaults.assistant_label),
            prompt_prefix: env_string("LOOM_PROMPT_PREFIX"),
            // Leading and trailing newlines are part of the suffix.
            prompt_suffix: std::env::var("LOOM_PROMPT_SUFFIX")
                .ok()
                .filter(|suffix| !suffix.is_empty()),
            timeout: env_parse::<u64>("LOOM_TIMEOUT_SECS")?.map(Duration::from_secs),
            store_path: env_string("LOOM_STORE_PATH").map(PathBuf::from),
            stream: env_flag("LOOM_STREAM").unwrap_or(defaults.stream),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            bail!(
                "Invalid LOOM_API_URL '{}': expected http:// or https:// URL",
                self.api_url
            );
        }

        if !self.is_local_endpoint() && self.api_key.is_none() {
            bail!(
                "OPENAI_API_KEY must be set for non-local endpoints (url: '{}')",
                self.api_url
            );
        }

        if self.model.trim().is_empty() {
            bail!("LOOM_MODEL must not be empty");
        }

        if self.max_response_tokens == 0 {
            bail!("LOOM_MAX_RESPONSE_TOKENS must be at least 1");
        }

        if self.max_response_tokens >= self.max_model_tokens {
            bail!(
                "LOOM_MAX_RESPONSE_TOKENS ({}) must be smaller than LOOM_MAX_MODEL_TOKENS ({})",
                self.max_response_tokens,
                self.max_model_tokens
            );
        }

        if self.user_label.trim().is_empty() || self.assistant_label.trim().is_empty() {
            bail!("Role labels must not be empty");
        }

        if self.timeout == Some(Duration::ZERO) {
            bail!("LOOM_TIMEOUT_SECS must be at least 1 when set");
        }

        Ok(())
    }

    pub fn is_local_endpoint(&self) -> bool {
        is_local_endpoint_url(&self.api_url)
    }
}
