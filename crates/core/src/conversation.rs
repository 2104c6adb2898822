//! Fixed chat-style prompt assembly.
//!
//! Exactly three turns: a system turn carrying the instruction, a user turn whose
//! content is the image placeholder followed by the question, and an open assistant
//! turn that signals generation should begin. Richer template sources shipped next
//! to the tokenizer are deliberately ignored in favour of this constant structure.

use crate::tokenizer::IMAGE_TOKEN;

pub const TURN_START: &str = "<|im_start|>";
pub const TURN_END: &str = "<|im_end|>";

/// Instruction placed in the system turn.
pub const SYSTEM_INSTRUCTION: &str =
    "You are a helpful assistant. Please answer in English only.";

#[derive(Debug, Clone)]
pub struct ChatTemplate {
    system_message: String,
}

impl Default for ChatTemplate {
    fn default() -> Self {
        Self {
            system_message: SYSTEM_INSTRUCTION.to_owned(),
        }
    }
}

impl ChatTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_message<S: Into<String>>(system_message: S) -> Self {
        Self {
            system_message: system_message.into(),
        }
    }

    pub fn system_message(&self) -> &str {
        &self.system_message
    }

    /// Render the full prompt string consumed by the tokenizer.
    pub fn render(&self, question: &str) -> String {
        let mut buffer = String::new();
        buffer.push_str(TURN_START);
        buffer.push_str("system\n");
        buffer.push_str(&self.system_message);
        buffer.push_str(TURN_END);
        buffer.push('\n');
        buffer.push_str(TURN_START);
        buffer.push_str("user\n");
        buffer.push_str(IMAGE_TOKEN);
        buffer.push('\n');
        buffer.push_str(question);
        buffer.push_str(TURN_END);
        buffer.push('\n');
        buffer.push_str(TURN_START);
        buffer.push_str("assistant\n");
        buffer
    }
}
