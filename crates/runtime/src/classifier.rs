//! Separates prose from a single structured JSON reply while the model is
//! still streaming.
//!
//! Every decision is a function of the buffered prefix alone and is only
//! taken once no continuation of that prefix could change it, so the outcome
//! does not depend on how the backend split its output into fragments.

use serde::{Deserialize, Serialize};

/// A raw JSON reply must name its `"type"` within this many bytes of the `{`.
const RAW_TYPE_WINDOW: usize = 100;
const TYPE_KEY: &str = "\"type\"";
/// A fenced JSON reply must open its fence within this many bytes.
const FENCE_WINDOW: usize = 256;
const FENCE: &str = "```";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierState {
    #[default]
    Unclassified,
    Text,
    JsonRaw,
    JsonFenced,
}

impl ClassifierState {
    pub fn is_json(&self) -> bool {
        matches!(self, ClassifierState::JsonRaw | ClassifierState::JsonFenced)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedResponse {
    pub response: String,
    pub is_json: bool,
    pub preamble: Option<String>,
}

#[derive(Debug, Default)]
pub struct ResponseClassifier {
    state: ClassifierState,
    raw: String,
    preamble: Option<String>,
}

impl ResponseClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ClassifierState {
        self.state
    }

    /// Buffer one fragment. Returns the prose that may be shown now, if any.
    pub fn feed(&mut self, fragment: &str) -> Option<String> {
        if fragment.is_empty() {
            return None;
        }
        self.raw.push_str(fragment);
        match self.state {
            ClassifierState::Text => Some(fragment.to_string()),
            ClassifierState::JsonRaw | ClassifierState::JsonFenced => None,
            ClassifierState::Unclassified => {
                let decided = decide(&self.raw, false)?;
                self.enter(decided)
            }
        }
    }

    /// Settle any pending decision at end of stream. Returns prose still owed
    /// to the sink together with the final classification.
    pub fn finish(&mut self) -> (Option<String>, ClassifiedResponse) {
        let flushed = if self.state == ClassifierState::Unclassified {
            let decided = decide(&self.raw, true).unwrap_or(ClassifierState::Text);
            self.enter(decided)
        } else {
            None
        };

        let response = match self.state {
            ClassifierState::JsonFenced => fenced_body(&self.raw),
            _ => self.raw.trim().to_string(),
        };
        let classified = ClassifiedResponse {
            response,
            is_json: self.state.is_json(),
            preamble: self.preamble.clone(),
        };
        (flushed.filter(|text| !text.is_empty()), classified)
    }

    fn enter(&mut self, state: ClassifierState) -> Option<String> {
        self.state = state;
        match state {
            ClassifierState::Text => Some(self.raw.clone()),
            ClassifierState::JsonFenced => {
                self.preamble = fence_preamble(&self.raw);
                self.preamble.clone()
            }
            ClassifierState::JsonRaw | ClassifierState::Unclassified => None,
        }
    }
}

/// `None` while the buffered prefix is still ambiguous. With `is_final`
/// the prefix is the whole reply and a verdict is always reached.
fn decide(raw: &str, is_final: bool) -> Option<ClassifierState> {
    let trimmed = raw.trim_start();
    if trimmed.is_empty() {
        return is_final.then_some(ClassifierState::Text);
    }

    if trimmed.starts_with('{') {
        if trimmed
            .find(TYPE_KEY)
            .is_some_and(|at| at < RAW_TYPE_WINDOW)
        {
            return Some(ClassifierState::JsonRaw);
        }
        if !is_final && trimmed.len() < RAW_TYPE_WINDOW + TYPE_KEY.len() {
            return None;
        }
    }

    match trimmed.find(FENCE) {
        Some(at) if at < FENCE_WINDOW => {
            let after = &trimmed[at + FENCE.len()..];
            let body = match strip_json_tag(after) {
                Some(body) => body,
                None if is_final => after,
                None => return None,
            };
            match body.trim_start().chars().next() {
                Some('{') => Some(ClassifierState::JsonFenced),
                Some(_) => Some(ClassifierState::Text),
                None if is_final => Some(ClassifierState::Text),
                None => None,
            }
        }
        Some(_) => Some(ClassifierState::Text),
        None if is_final || trimmed.len() + 1 >= FENCE_WINDOW + FENCE.len() => {
            Some(ClassifierState::Text)
        }
        None => None,
    }
}

/// Drop an optional `json` info string. `None` when too little has arrived
/// to tell whether the tag is there.
fn strip_json_tag(after: &str) -> Option<&str> {
    if after.len() >= 4 {
        return Some(match after.get(..4) {
            Some(head) if head.eq_ignore_ascii_case("json") => &after[4..],
            _ => after,
        });
    }
    if "json".starts_with(after.to_ascii_lowercase().as_str()) {
        None
    } else {
        Some(after)
    }
}

fn fence_preamble(raw: &str) -> Option<String> {
    let trimmed = raw.trim_start();
    let at = trimmed.find(FENCE)?;
    let preamble = trimmed[..at].trim();
    if preamble.is_empty() {
        None
    } else {
        Some(preamble.to_string())
    }
}

fn fenced_body(raw: &str) -> String {
    let trimmed = raw.trim_start();
    let Some(at) = trimmed.find(FENCE) else {
        return trimmed.trim().to_string();
    };
    let after = &trimmed[at + FENCE.len()..];
    let body = strip_json_tag(after).unwrap_or(after);
    let body = match body.rfind(FENCE) {
        Some(end) => &body[..end],
        None => body,
    };
    body.trim().to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn run(fragments: &[&str]) -> (String, ClassifiedResponse) {
        let mut classifier = ResponseClassifier::new();
        let mut prose = String::new();
        for fragment in fragments {
            if let Some(text) = classifier.feed(fragment) {
                prose.push_str(&text);
            }
        }
        let (flushed, classified) = classifier.finish();
        if let Some(text) = flushed {
            prose.push_str(&text);
        }
        (prose, classified)
    }

    #[test]
    fn test_fenced_json_with_preamble() {
        let reply = "Here are the findings:\n\n```json\n{\"type\":\"x\"}\n```";
        let (prose, classified) = run(&[reply]);
        assert_eq!(prose, "Here are the findings:");
        assert!(classified.is_json);
        assert_eq!(classified.preamble.as_deref(), Some("Here are the findings:"));
        let payload: serde_json::Value = serde_json::from_str(&classified.response).unwrap();
        assert_eq!(payload, serde_json::json!({"type": "x"}));
    }

    #[test]
    fn test_fenced_json_streamed_never_leaks_json() {
        let fragments = [
            "Here are", " the findings:\n\n``", "`js", "on\n{\"ty", "pe\":\"x\"}\n``", "`",
        ];
        let mut classifier = ResponseClassifier::new();
        let mut sent = Vec::new();
        for fragment in fragments {
            if let Some(text) = classifier.feed(fragment) {
                sent.push(text);
            }
        }
        assert_eq!(sent, vec!["Here are the findings:".to_string()]);
        let (flushed, classified) = classifier.finish();
        assert!(flushed.is_none());
        assert_eq!(classified.response, "{\"type\":\"x\"}");
    }

    #[test]
    fn test_raw_json_split_on_brace() {
        let (prose, classified) = run(&["{", "\"type\":\"x\"}"]);
        assert!(prose.is_empty());
        assert!(classified.is_json);
        assert_eq!(classified.response, "{\"type\":\"x\"}");
        assert_eq!(classified.preamble, None);
    }

    #[test]
    fn test_long_prose_forwarded_before_end() {
        let mut classifier = ResponseClassifier::new();
        let first = "The checkout pod restarted after an OOM kill. ".repeat(8);
        let forwarded = classifier.feed(&first).unwrap();
        assert_eq!(forwarded, first);
        assert_eq!(classifier.state(), ClassifierState::Text);
        assert_eq!(classifier.feed(" More.").as_deref(), Some(" More."));
    }

    #[test]
    fn test_short_prose_flushed_at_finish() {
        let (prose, classified) = run(&["All ", "pods healthy."]);
        assert_eq!(prose, "All pods healthy.");
        assert!(!classified.is_json);
        assert_eq!(classified.response, "All pods healthy.");
    }

    #[test]
    fn test_brace_without_type_key_is_text() {
        let reply = "{ not really json, just a brace }";
        let (prose, classified) = run(&[reply]);
        assert_eq!(prose, reply);
        assert!(!classified.is_json);
    }

    #[test]
    fn test_non_json_fence_is_text() {
        let reply = "Run this:\n```bash\nkubectl get pods\n```";
        let (prose, classified) = run(&[reply]);
        assert_eq!(prose, reply);
        assert!(!classified.is_json);
    }

    #[test]
    fn test_state_is_sticky() {
        let mut classifier = ResponseClassifier::new();
        classifier.feed("{\"type\":\"report\"");
        assert_eq!(classifier.state(), ClassifierState::JsonRaw);
        assert!(classifier.feed(" trailing prose").is_none());
        assert_eq!(classifier.state(), ClassifierState::JsonRaw);
    }

    fn reply_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("Here are the findings:\n\n```json\n{\"type\":\"x\"}\n```".to_string()),
            Just("  {\"type\":\"investigation_report\",\"summary\":\"db down\"}".to_string()),
            Just("```\n{\"type\":\"fix\"}\n```".to_string()),
            Just("Check:\n```yaml\nkey: value\n```\n".to_string()),
            "[a-z {}\"`:\n]{0,300}",
            "\\{[a-z \"]{0,120}\"type\"[a-z ]{0,10}\\}",
            "[a-z ]{0,40}```(json)?\n?\\{[a-z\"]{0,20}\\}```",
        ]
    }

    proptest! {
        #[test]
        fn prop_fragmentation_does_not_change_outcome(
            reply in reply_strategy(),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let mut points: Vec<usize> = cuts
                .iter()
                .map(|c| c.index(reply.len() + 1))
                .filter(|p| reply.is_char_boundary(*p))
                .collect();
            points.sort_unstable();
            points.dedup();

            let mut fragments = Vec::new();
            let mut start = 0;
            for point in points {
                fragments.push(&reply[start..point]);
                start = point;
            }
            fragments.push(&reply[start..]);

            let whole = run(&[reply.as_str()]);
            let split = run(&fragments);
            prop_assert_eq!(whole, split);
        }
    }
}
