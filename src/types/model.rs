/// Delimiter conventions of the completion model being prompted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Chat,
    Code,
    Plain,
}

pub const ENDOFTEXT: &str = "<|endoftext|>";
const IM_END: &str = "<|im_end|>";
const IM_SEP: &str = "<|im_sep|>";
const ENDOFPROMPT: &str = "<|endofprompt|>";

impl ModelFamily {
    pub fn from_model_name(model: &str) -> Self {
        let normalized = model.trim().to_ascii_lowercase();
        if normalized.starts_with("text-chat") || normalized.starts_with("text-davinci-002-render")
        {
            ModelFamily::Chat
        } else if normalized.starts_with("code-") {
            ModelFamily::Code
        } else {
            ModelFamily::Plain
        }
    }

    /// Marker closing every turn in the prompt.
    pub fn end_token(self) -> &'static str {
        match self {
            ModelFamily::Chat => IM_END,
            ModelFamily::Code | ModelFamily::Plain => ENDOFTEXT,
        }
    }

    /// Marker closing the instructions block.
    pub fn separator_token(self) -> &'static str {
        match self {
            ModelFamily::Chat => IM_SEP,
            ModelFamily::Code => ENDOFPROMPT,
            ModelFamily::Plain => ENDOFTEXT,
        }
    }

    pub fn stop_sequences(self) -> Vec<String> {
        let mut stops = vec![self.end_token().to_string()];
        if self.separator_token() != self.end_token() {
            stops.push(self.separator_token().to_string());
        }
        stops
    }

    /// Substrings the tokenizer does not know for this family, with the
    /// canonical token they count as.
    pub fn token_substitutions(self) -> &'static [(&'static str, &'static str)] {
        match self {
            ModelFamily::Chat => &[(IM_END, ENDOFTEXT), (IM_SEP, ENDOFTEXT)],
            ModelFamily::Code | ModelFamily::Plain => &[],
        }
    }
}
