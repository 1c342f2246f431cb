//! Observation masking: bounds the token cost of tool-heavy conversations by
//! replacing stale tool output with a short placeholder.
//!
//! Once the history is over the threshold every eligible observation is
//! masked in one pass. Eligible means a successful tool result that is not
//! among the most recent `recency_window` tool results. Failed results are
//! always kept verbatim so the model can still see what went wrong.

use aiops_core::tokens::conversation_tokens;
use aiops_core::{Message, Part, ToolResult};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

pub const MASKED_PLACEHOLDER: &str =
    "[Observation masked to save context. Re-run the tool if this output is needed again.]";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MaskingPolicy {
    pub token_threshold: usize,
    pub recency_window: usize,
}

impl Default for MaskingPolicy {
    fn default() -> Self {
        Self {
            token_threshold: 60_000,
            recency_window: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaskingStats {
    pub masked_parts: usize,
    pub total_tokens_before: usize,
    pub total_tokens_after: usize,
    pub saved_tokens: usize,
}

#[derive(Debug)]
pub struct MaskingOutcome<'a> {
    /// Borrowed input when nothing was masked, otherwise a masked copy.
    pub messages: Cow<'a, [Message]>,
    pub masked: bool,
    pub stats: MaskingStats,
}

pub fn mask_observations<'a>(messages: &'a [Message], policy: &MaskingPolicy) -> MaskingOutcome<'a> {
    let before = conversation_tokens(messages);
    if before < policy.token_threshold {
        return MaskingOutcome {
            messages: Cow::Borrowed(messages),
            masked: false,
            stats: MaskingStats {
                total_tokens_before: before,
                total_tokens_after: before,
                ..MaskingStats::default()
            },
        };
    }

    let total_results = messages
        .iter()
        .flat_map(|m| m.parts.iter())
        .filter(|p| p.is_tool_result())
        .count();
    let protected_from = total_results.saturating_sub(policy.recency_window);

    let mut copy = messages.to_vec();
    let mut position = 0usize;
    let mut masked_parts = 0usize;

    for part in copy.iter_mut().flat_map(|m| m.parts.iter_mut()) {
        let Part::ToolResult { result, .. } = part else {
            continue;
        };
        let index = position;
        position += 1;

        if index >= protected_from || !result.success || is_placeholder(result) {
            continue;
        }
        *result = ToolResult::ok(MASKED_PLACEHOLDER);
        masked_parts += 1;
    }

    if masked_parts == 0 {
        return MaskingOutcome {
            messages: Cow::Borrowed(messages),
            masked: false,
            stats: MaskingStats {
                total_tokens_before: before,
                total_tokens_after: before,
                ..MaskingStats::default()
            },
        };
    }

    let after = conversation_tokens(&copy);
    MaskingOutcome {
        messages: Cow::Owned(copy),
        masked: true,
        stats: MaskingStats {
            masked_parts,
            total_tokens_before: before,
            total_tokens_after: after,
            saved_tokens: before.saturating_sub(after),
        },
    }
}

fn is_placeholder(result: &ToolResult) -> bool {
    result.agent_content.as_deref() == Some(MASKED_PLACEHOLDER)
}
