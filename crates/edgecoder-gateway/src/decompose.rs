// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Task decomposition: ask the local model to split a task into subtasks.
//!
//! Local models produce messy JSON — fenced, prefixed with prose, or not
//! JSON at all. Recovery is layered: strip fences, slice out the outermost
//! array, and when nothing parses fall back to a single `single_step`
//! subtask covering the whole prompt. The caller always gets something
//! executable.

use serde::{Deserialize, Serialize};
use tracing::debug;

use edgecoder_model::{GenerateRequest, ModelProvider};

/// Hard cap on subtasks per decomposition.
pub const MAX_SUBTASKS: usize = 10;

const MIN_TIMEOUT_MS: u64 = 5_000;
const MAX_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposedSubtask {
    pub input: String,
    /// `micro_loop` or `single_step`.
    pub kind: String,
    pub timeout_ms: u64,
}

/// Model-facing JSON row; every field optional so partial output still
/// yields usable subtasks.
#[derive(Debug, Deserialize)]
struct RawSubtask {
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

fn decomposition_prompt(prompt: &str, language: &str) -> String {
    format!(
        "Split the following {language} programming task into at most \
         {MAX_SUBTASKS} independent subtasks.\n\
         Task: {prompt}\n\n\
         Reply with ONLY a JSON array; each element is an object with keys \
         \"input\" (string), \"kind\" (\"single_step\" or \"micro_loop\") \
         and \"timeout_ms\" (number). No prose."
    )
}

/// Decompose `prompt` using `model`, falling back to one subtask when the
/// model's JSON cannot be recovered.
pub async fn decompose(
    model: &dyn ModelProvider,
    prompt: &str,
    language: &str,
) -> Vec<DecomposedSubtask> {
    let request = GenerateRequest::prompt(decomposition_prompt(prompt, language));
    let raw = match model.generate(request).await {
        Ok(resp) => resp.text,
        Err(e) => {
            debug!("decomposition model call failed: {e}");
            return vec![fallback_subtask(prompt)];
        }
    };
    parse_subtasks(&raw).unwrap_or_else(|| vec![fallback_subtask(prompt)])
}

fn fallback_subtask(prompt: &str) -> DecomposedSubtask {
    DecomposedSubtask {
        input: prompt.to_string(),
        kind: "single_step".into(),
        timeout_ms: DEFAULT_TIMEOUT_MS,
    }
}

/// Recover a subtask list from model output. `None` when nothing parseable
/// is found or the parse yields zero usable rows.
pub fn parse_subtasks(raw: &str) -> Option<Vec<DecomposedSubtask>> {
    let json_slice = extract_json_array(raw)?;
    let rows: Vec<RawSubtask> = serde_json::from_str(json_slice).ok()?;
    let subtasks: Vec<DecomposedSubtask> = rows
        .into_iter()
        .filter_map(|row| {
            let input = row.input?.trim().to_string();
            if input.is_empty() {
                return None;
            }
            let kind = match row.kind.as_deref() {
                Some("micro_loop") => "micro_loop",
                _ => "single_step",
            };
            Some(DecomposedSubtask {
                input,
                kind: kind.into(),
                timeout_ms: row
                    .timeout_ms
                    .unwrap_or(DEFAULT_TIMEOUT_MS)
                    .clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS),
            })
        })
        .take(MAX_SUBTASKS)
        .collect();
    if subtasks.is_empty() {
        None
    } else {
        Some(subtasks)
    }
}

/// Slice the outermost `[...]` from text that may carry fences or prose.
fn extract_json_array(raw: &str) -> Option<&str> {
    let start = raw.find('[')?;
    let end = raw.rfind(']')?;
    if end <= start {
        return None;
    }
    Some(&raw[start..=end])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_json_array_parses() {
        let raw = r#"[{"input": "step one", "kind": "single_step", "timeout_ms": 10000}]"#;
        let subtasks = parse_subtasks(raw).unwrap();
        assert_eq!(subtasks.len(), 1);
        assert_eq!(subtasks[0].input, "step one");
        assert_eq!(subtasks[0].timeout_ms, 10_000);
    }

    #[test]
    fn fenced_json_with_prose_parses() {
        let raw = "Sure! Here is the breakdown:\n```json\n[{\"input\": \"a\"}, {\"input\": \"b\"}]\n```\nDone.";
        let subtasks = parse_subtasks(raw).unwrap();
        assert_eq!(subtasks.len(), 2);
    }

    #[test]
    fn timeouts_are_clamped_both_ways() {
        let raw = r#"[
            {"input": "fast", "timeout_ms": 1},
            {"input": "slow", "timeout_ms": 600000}
        ]"#;
        let subtasks = parse_subtasks(raw).unwrap();
        assert_eq!(subtasks[0].timeout_ms, 5_000);
        assert_eq!(subtasks[1].timeout_ms, 60_000);
    }

    #[test]
    fn list_is_capped_at_ten() {
        let rows: Vec<String> = (0..25).map(|i| format!(r#"{{"input": "s{i}"}}"#)).collect();
        let raw = format!("[{}]", rows.join(","));
        let subtasks = parse_subtasks(&raw).unwrap();
        assert_eq!(subtasks.len(), MAX_SUBTASKS);
    }

    #[test]
    fn unknown_kind_defaults_to_single_step() {
        let raw = r#"[{"input": "x", "kind": "mystery"}]"#;
        assert_eq!(parse_subtasks(raw).unwrap()[0].kind, "single_step");
    }

    #[test]
    fn unparseable_output_is_none() {
        assert!(parse_subtasks("I cannot split this task.").is_none());
        assert!(parse_subtasks("[not json]").is_none());
        assert!(parse_subtasks("").is_none());
    }

    #[test]
    fn empty_inputs_are_dropped() {
        let raw = r#"[{"input": "  "}, {"input": "real"}]"#;
        let subtasks = parse_subtasks(raw).unwrap();
        assert_eq!(subtasks.len(), 1);
        assert_eq!(subtasks[0].input, "real");
    }

    #[tokio::test]
    async fn model_gibberish_falls_back_to_single_subtask() {
        use edgecoder_model::ScriptedMockProvider;
        let model = ScriptedMockProvider::always("no json here at all");
        let subtasks = decompose(&model, "write a parser", "python").await;
        assert_eq!(subtasks.len(), 1);
        assert_eq!(subtasks[0].input, "write a parser");
        assert_eq!(subtasks[0].kind, "single_step");
    }
}
