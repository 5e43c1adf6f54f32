// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Prompt builders for the agent loop.
//!
//! Prompting is deterministic per (task, language, plan, prior error): the
//! same inputs always produce the same prompt string, which keeps agent runs
//! reproducible against a pinned model.

use edgecoder_sandbox::Language;

/// Ask the model for a short implementation plan.
pub fn plan_prompt(task: &str, language: Language) -> String {
    format!(
        "You are a careful {lang} programmer.\n\
         Task: {task}\n\n\
         Write a short numbered plan (3 steps or fewer) for a single \
         self-contained {lang} script that solves the task. \
         Do not write any code yet.",
        lang = language.as_str(),
    )
}

/// Ask the model for the code implementing `plan`.
pub fn generate_prompt(task: &str, language: Language, plan: &str) -> String {
    format!(
        "Task: {task}\n\
         Plan:\n{plan}\n\n\
         Write one complete {lang} script implementing the plan. \
         Constraints: standard library only, no imports, no file or network \
         access, read nothing from stdin, print results to stdout. \
         Reply with a single fenced {lang} code block and nothing else.",
        lang = language.as_str(),
    )
}

/// Ask the model to repair `code` given the failure diagnostics.
pub fn reflect_prompt(
    task: &str,
    language: Language,
    plan: &str,
    code: &str,
    stderr: &str,
    exit_code: i32,
) -> String {
    format!(
        "Task: {task}\n\
         Plan:\n{plan}\n\n\
         The previous attempt failed (exit code {exit_code}).\n\
         Code:\n```{lang}\n{code}\n```\n\
         Error output:\n{stderr}\n\n\
         Diagnose the failure in one sentence, then write a corrected, \
         complete {lang} script. Same constraints: standard library only, no \
         imports, no file or network access. \
         Reply with a single fenced {lang} code block and nothing else.",
        lang = language.as_str(),
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_are_deterministic() {
        let a = generate_prompt("sum a list", Language::Python, "1. iterate");
        let b = generate_prompt("sum a list", Language::Python, "1. iterate");
        assert_eq!(a, b);
    }

    #[test]
    fn plan_prompt_names_the_language() {
        let p = plan_prompt("do x", Language::Javascript);
        assert!(p.contains("javascript"));
        assert!(p.contains("do x"));
    }

    #[test]
    fn reflect_prompt_carries_error_context() {
        let p = reflect_prompt("t", Language::Python, "plan", "print(x)", "NameError: x", 1);
        assert!(p.contains("NameError"));
        assert!(p.contains("exit code 1"));
        assert!(p.contains("print(x)"));
    }
}
