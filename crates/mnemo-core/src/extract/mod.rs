//! LLM-guided extraction
//!
//! The extractors turn accumulated raw messages into typed memory:
//! episode-boundary detection producing MemCells, semantic-memory and
//! event-log extraction over an emitted cell, and the incremental profile
//! update protocol.
//!
//! The LLM is a non-deterministic oracle: every parser here tolerates
//! malformed output, and every failure degrades to a safe state-machine
//! outcome rather than an error surfaced to callers.

mod eventlog;
mod memcell;
mod profile;
mod semantic;

pub use eventlog::EventLogExtractor;
pub use memcell::{ExtractOutcome, MemCellExtractor, MemCellExtractorConfig};
pub use profile::{
    create_id_mapping, EpisodeDigest, ProfileAction, ProfileItemKind, ProfileLifeExtractor,
    ProfileOperation,
};
pub use semantic::SemanticExtractor;

/// Extract the first JSON object or array embedded in LLM output.
///
/// Models wrap JSON in prose or code fences; this finds the outermost
/// balanced `{...}` or `[...]` block and hands it to serde.
pub(crate) fn parse_json_block<T: serde::de::DeserializeOwned>(text: &str) -> Option<T> {
    for (open, close) in [('{', '}'), ('[', ']')] {
        let Some(start) = text.find(open) else { continue };
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, ch) in text[start..].char_indices() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == '"' {
                    in_string = false;
                }
                continue;
            }
            match ch {
                '"' => in_string = true,
                c if c == open => depth += 1,
                c if c == close => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[start..start + offset + ch.len_utf8()];
                        if let Ok(parsed) = serde_json::from_str(candidate) {
                            return Some(parsed);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    None
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_parse_json_block_plain() {
        let parsed: Value = parse_json_block(r#"{"a": 1}"#).unwrap();
        assert_eq!(parsed["a"], 1);
    }

    #[test]
    fn test_parse_json_block_in_prose_and_fences() {
        let text = "Sure! Here is the result:\n```json\n{\"boundary\": true, \"note\": \"a } in string\"}\n```\nDone.";
        let parsed: Value = parse_json_block(text).unwrap();
        assert_eq!(parsed["boundary"], true);
    }

    #[test]
    fn test_parse_json_block_array() {
        let text = "facts: [{\"content\": \"x\"}, {\"content\": \"y\"}]";
        let parsed: Vec<Value> = parse_json_block(text).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_parse_json_block_garbage_is_none() {
        assert!(parse_json_block::<Value>("no json here").is_none());
        assert!(parse_json_block::<Value>("{truncated").is_none());
    }
}
