// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Code extraction from model output.
//!
//! Models wrap code in Markdown fences most of the time, but not always, and
//! sometimes fence the wrong language. The rule here is deterministic: the
//! *first* fenced block whose info string names a permitted language wins;
//! when no such fence exists, the whole trimmed text is used as-is.

/// Languages the mesh executes.
pub const PERMITTED_LANGUAGES: &[&str] = &["python", "py", "javascript", "js"];

/// Extract the code body from `text`.
///
/// Returns the first fenced code block tagged with a permitted language (or
/// an untagged fence), falling back to the entire trimmed text when no fence
/// is present.
pub fn extract_code(text: &str) -> String {
    if let Some(block) = first_permitted_fence(text) {
        return block;
    }
    text.trim().to_string()
}

/// The first fenced block with a permitted (or empty) info string.
fn first_permitted_fence(text: &str) -> Option<String> {
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        let trimmed = line.trim_start();
        let Some(info) = trimmed.strip_prefix("```") else {
            continue;
        };
        let lang = info.trim().to_ascii_lowercase();
        if !lang.is_empty() && !PERMITTED_LANGUAGES.contains(&lang.as_str()) {
            // Skip the entire non-permitted block so its closing fence is not
            // mistaken for an opening one.
            for inner in lines.by_ref() {
                if inner.trim_start().starts_with("```") {
                    break;
                }
            }
            continue;
        }
        let mut body = Vec::new();
        for inner in lines.by_ref() {
            if inner.trim_start().starts_with("```") {
                return Some(body.join("\n"));
            }
            body.push(inner);
        }
        // Unterminated fence: treat the rest of the text as the block.
        return Some(body.join("\n"));
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
