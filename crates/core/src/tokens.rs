//! Length-based token estimation.

use crate::types::{Message, Part};

const CHARS_PER_TOKEN: usize = 4;

/// Estimate token count using a 4-characters-per-token heuristic.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    chars.div_ceil(CHARS_PER_TOKEN)
}

impl Part {
    pub fn token_cost(&self) -> usize {
        match self {
            Part::Text { text } => estimate_tokens(text),
            Part::ToolCall { name, args, .. } => {
                estimate_tokens(name) + estimate_tokens(&args.to_string())
            }
            Part::ToolResult { result, .. } => estimate_tokens(result.observation()),
        }
    }
}

impl Message {
    pub fn token_cost(&self) -> usize {
        self.parts.iter().map(Part::token_cost).sum()
    }
}

pub fn conversation_tokens(messages: &[Message]) -> usize {
    messages.iter().map(Message::token_cost).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolResult;

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_tool_result_cost_uses_observation() {
        let part = Part::ToolResult {
            id: "1".into(),
            name: "t".into(),
            result: ToolResult::ok("12345678"),
        };
        assert_eq!(part.token_cost(), 2);
    }
}
