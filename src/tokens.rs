use crate::error::{ClientError, Result};
use crate::types::{ModelFamily, ENDOFTEXT};
use aho_corasick::AhoCorasick;
use std::sync::Arc;

/// Text to token count. Must be deterministic and free of side effects.
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> Result<usize>;
}

pub type SharedTokenCounter = Arc<dyn TokenCounter>;

const DEFAULT_CHARS_PER_TOKEN: usize = 4;

/// Character based estimate: every `<|endoftext|>` is one token and the text
/// between them costs `ceil(chars / chars_per_token)`.
///
/// Family-specific delimiters are rewritten to `<|endoftext|>` first, so a
/// chat prompt costs the same as its canonical form.
#[derive(Debug, Clone)]
pub struct HeuristicTokenCounter {
    chars_per_token: usize,
    substitutions: Option<(AhoCorasick, Vec<&'static str>)>,
}

impl HeuristicTokenCounter {
    pub fn new(family: ModelFamily) -> Result<Self> {
        Self::with_chars_per_token(family, DEFAULT_CHARS_PER_TOKEN)
    }

    pub fn with_chars_per_token(family: ModelFamily, chars_per_token: usize) -> Result<Self> {
        if chars_per_token == 0 {
            return Err(ClientError::Configuration(
                "chars_per_token must be at least 1".to_string(),
            ));
        }

        let pairs = family.token_substitutions();
        let substitutions = if pairs.is_empty() {
            None
        } else {
            let matcher = AhoCorasick::new(pairs.iter().map(|(from, _)| *from)).map_err(|error| {
                ClientError::Configuration(format!("invalid token substitution table: {error}"))
            })?;
            Some((matcher, pairs.iter().map(|(_, to)| *to).collect()))
        };

        Ok(Self {
            chars_per_token,
            substitutions,
        })
    }

    fn normalize<'a>(&self, text: &'a str) -> std::borrow::Cow<'a, str> {
        match &self.substitutions {
            Some((matcher, replacements)) => {
                std::borrow::Cow::Owned(matcher.replace_all(text, replacements.as_slice()))
            }
            None => std::borrow::Cow::Borrowed(text),
        }
    }

    fn estimate_segment(&self, segment: &str) -> usize {
        segment.chars().count().div_ceil(self.chars_per_token)
    }
}

impl TokenCounter for HeuristicTokenCounter {
    fn count_tokens(&self, text: &str) -> Result<usize> {
        let normalized = self.normalize(text);
        let mut segments = normalized.split(ENDOFTEXT);
        let first = segments.next().map_or(0, |segment| self.estimate_segment(segment));
        Ok(segments.fold(first, |total, segment| {
            total + 1 + self.estimate_segment(segment)
        }))
    }
}
