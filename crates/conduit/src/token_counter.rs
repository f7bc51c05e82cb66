use std::collections::HashMap;
use std::path::Path;

use tokenizers::tokenizer::Tokenizer;

use crate::models::message::{Message, MessageContent};
use crate::models::tool::Tool;

const GPT_4O_TOKENIZER_KEY: &str = "Xenova--gpt-4o";
const CLAUDE_TOKENIZER_KEY: &str = "Xenova--claude-tokenizer";

const CHARS_PER_TOKEN: usize = 4;
/// Role and formatting tokens added for every message.
const MESSAGE_OVERHEAD: usize = 4;
const TOOL_REQUEST_OVERHEAD: usize = 20;
const TOOL_RESPONSE_OVERHEAD: usize = 10;
/// Flat charge for an attached image or document.
const ATTACHMENT_TOKENS: usize = 1_000;

/// Counts tokens with a real tokenizer when one is available and falls back to
/// a character based estimate otherwise.
#[derive(Default)]
pub struct TokenCounter {
    tokenizers: HashMap<String, Tokenizer>,
}

impl TokenCounter {
    /// A counter that only estimates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `<dir>/<key>/tokenizer.json` for each known tokenizer. Missing or
    /// unreadable files are skipped and those models use the estimate.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Self {
        let mut counter = Self::new();
        for key in [GPT_4O_TOKENIZER_KEY, CLAUDE_TOKENIZER_KEY] {
            counter.load_tokenizer(dir.as_ref(), key);
        }
        counter
    }

    fn load_tokenizer(&mut self, dir: &Path, tokenizer_key: &str) {
        let path = dir.join(tokenizer_key).join("tokenizer.json");
        match Tokenizer::from_file(&path) {
            Ok(tokenizer) => {
                self.tokenizers.insert(tokenizer_key.to_string(), tokenizer);
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "tokenizer not loaded");
            }
        }
    }

    pub fn has_tokenizers(&self) -> bool {
        !self.tokenizers.is_empty()
    }

    fn model_to_tokenizer_key(model_name: &str) -> &'static str {
        if model_name.to_lowercase().contains("claude") {
            CLAUDE_TOKENIZER_KEY
        } else {
            GPT_4O_TOKENIZER_KEY
        }
    }

    pub fn count_tokens(&self, text: &str, model_name: &str) -> usize {
        let key = Self::model_to_tokenizer_key(model_name);
        if let Some(tokenizer) = self.tokenizers.get(key) {
            match tokenizer.encode(text, false) {
                Ok(encoding) => return encoding.len(),
                Err(e) => tracing::debug!(error = %e, "tokenizer failed, estimating"),
            }
        }
        estimate_text(text)
    }

    pub fn count_message(&self, message: &Message, model_name: &str) -> usize {
        let content: usize = message
            .content
            .iter()
            .map(|content| match content {
                MessageContent::Text(text) => self.count_tokens(&text.text, model_name),
                MessageContent::Image(_) | MessageContent::Document(_) => ATTACHMENT_TOKENS,
                MessageContent::ToolRequest(request) => {
                    let arguments = request.tool_call.arguments.to_string();
                    self.count_tokens(&request.tool_call.name, model_name)
                        + self.count_tokens(&arguments, model_name)
                        + TOOL_REQUEST_OVERHEAD
                }
                MessageContent::ToolResponse(response) => {
                    self.count_tokens(&response.output, model_name) + TOOL_RESPONSE_OVERHEAD
                }
            })
            .sum();
        content + MESSAGE_OVERHEAD
    }

    pub fn count_chat_tokens(&self, messages: &[Message], tools: &[Tool], model_name: &str) -> usize {
        let history: usize = messages
            .iter()
            .map(|message| self.count_message(message, model_name))
            .sum();
        let tools: usize = tools
            .iter()
            .map(|tool| self.count_tokens(&tool.to_function_spec().to_string(), model_name))
            .sum();
        history + tools
    }
}

/// Roughly four characters per token, rounded up.
pub fn estimate_text(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}
