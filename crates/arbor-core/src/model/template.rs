//! Family-specific prompt templates.
//!
//! The root of a token tree stores the raw user prompt; the chat framing is
//! applied once, when the prompt is encoded into the tree's token prefix.

use std::str::FromStr;

/// Model family determining the instruction template around the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Llama 3 instruct formatting with a fixed system header.
    Llama,
    /// Qwen ChatML formatting with thinking enabled.
    Qwen,
    /// EXAONE formatting with its fixed system preamble.
    Exaone,
}

impl ModelFamily {
    /// Render the chat-formatted prompt for a single user message.
    pub fn render_prompt(&self, user_text: &str) -> String {
        match self {
            ModelFamily::Llama => format!(
                "<|begin_of_text|>\
                 <|start_header_id|>system<|end_header_id|>\n\
                 Cutting Knowledge Date: December 2023\n\
                 Today Date: 27 March 2025\n\
                 You are a helpful assistant<|eot_id|>\
                 <|start_header_id|>user<|end_header_id|>\n\
                 {user_text}<|eot_id|>\
                 <|start_header_id|>assistant<|end_header_id|> "
            ),
            // Thinking enabled: the assistant opens its own <think> block,
            // so no empty block is appended here.
            ModelFamily::Qwen => format!(
                "<|im_start|>user\n{user_text}<|im_end|>\n<|im_start|>assistant\n"
            ),
            ModelFamily::Exaone => format!(
                "[|system|]You are EXAONE model from LG AI Research, a helpful assistant.\
                 [|endofturn|]\n[|user|]{user_text}\n[|assistant|]"
            ),
        }
    }
}

impl FromStr for ModelFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "llama" => Ok(ModelFamily::Llama),
            "qwen" => Ok(ModelFamily::Qwen),
            "exaone" => Ok(ModelFamily::Exaone),
            other => Err(format!("unknown model family: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llama_template_wraps_user_text() {
        let prompt = ModelFamily::Llama.render_prompt("hello");
        assert!(prompt.starts_with("<|begin_of_text|>"));
        assert!(prompt.contains("hello<|eot_id|>"));
        assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|> "));
    }

    #[test]
    fn qwen_template_leaves_thinking_open() {
        let prompt = ModelFamily::Qwen.render_prompt("hi");
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
        assert!(!prompt.contains("</think>"));
    }

    #[test]
    fn exaone_template_has_system_preamble() {
        let prompt = ModelFamily::Exaone.render_prompt("hi");
        assert!(prompt.contains("[|system|]You are EXAONE"));
        assert!(prompt.ends_with("[|assistant|]"));
    }

    #[test]
    fn family_parses_case_insensitively() {
        assert_eq!("llama".parse::<ModelFamily>().unwrap(), ModelFamily::Llama);
        assert_eq!("Qwen".parse::<ModelFamily>().unwrap(), ModelFamily::Qwen);
        assert!("gpt".parse::<ModelFamily>().is_err());
    }
}
