// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The per-task agent: **Plan → Generate → Execute → (ok? done : Reflect →
//! Regenerate → Execute → …)**.
//!
//! One `Agent` type serves both entry points; the interactive path and the
//! swarm worker path differ only in [`AgentOptions`] (iteration budget and
//! default sandbox policy). The model is injected as a narrow generate
//! capability, never as a provider registry.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use edgecoder_model::{extract::extract_code, GenerateRequest, ModelProvider};
use edgecoder_sandbox::{Language, QueueReason, RunResult, SandboxExecutor, SandboxPolicy};

use crate::prompts;

/// Which entry point configured this agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Interactive,
    SwarmWorker,
}

/// The options record that replaces an inheritance tree: the two historical
/// agent variants differ only in these fields.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub kind: AgentKind,
    pub max_iterations: u32,
    pub sandbox: SandboxPolicy,
}

impl AgentOptions {
    pub fn interactive() -> Self {
        Self {
            kind: AgentKind::Interactive,
            max_iterations: 3,
            sandbox: SandboxPolicy::default(),
        }
    }

    pub fn swarm_worker() -> Self {
        Self {
            kind: AgentKind::SwarmWorker,
            max_iterations: 2,
            sandbox: SandboxPolicy {
                required: true,
                ..SandboxPolicy::default()
            },
        }
    }

    pub fn with_sandbox(mut self, sandbox: SandboxPolicy) -> Self {
        self.sandbox = sandbox;
        self
    }
}

/// One loop pass: the plan in force, the code attempted, the outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub iteration: u32,
    pub plan: String,
    pub code: String,
    pub run_result: RunResult,
}

/// Full history of one agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecution {
    pub task: String,
    pub language: Language,
    pub iterations: u32,
    pub history: Vec<Iteration>,
    pub escalated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
}

impl AgentExecution {
    /// The last run result, when at least one iteration executed.
    pub fn final_result(&self) -> Option<&RunResult> {
        self.history.last().map(|i| &i.run_result)
    }

    /// True when the final iteration succeeded.
    pub fn ok(&self) -> bool {
        self.final_result().map(|r| r.ok).unwrap_or(false)
    }
}

/// The core agent. Owns nothing global: model and executor are shared
/// services passed in at construction.
pub struct Agent {
    model: Arc<dyn ModelProvider>,
    executor: Arc<SandboxExecutor>,
    options: AgentOptions,
}

impl Agent {
    pub fn new(
        model: Arc<dyn ModelProvider>,
        executor: Arc<SandboxExecutor>,
        options: AgentOptions,
    ) -> Self {
        Self {
            model,
            executor,
            options,
        }
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// Run the loop to completion for one task.
    ///
    /// Model and sandbox failures never panic or abort the caller's
    /// scheduler; they surface inside the returned execution record. The
    /// returned history always satisfies `history.len() == iterations ≤
    /// max_iterations`.
    pub async fn run(&self, task: &str, language: Language) -> AgentExecution {
        let mut execution = AgentExecution {
            task: task.to_string(),
            language,
            iterations: 0,
            history: Vec::new(),
            escalated: false,
            escalation_reason: None,
        };

        // Plan once; the plan stays in force across reflect rounds.
        let plan = match self
            .model
            .generate(GenerateRequest::prompt(prompts::plan_prompt(task, language)))
            .await
        {
            Ok(resp) => resp.text.trim().to_string(),
            Err(e) => {
                warn!("planning failed: {e}");
                execution.escalated = true;
                execution.escalation_reason = Some("model_limit".into());
                return execution;
            }
        };
        debug!(kind = ?self.options.kind, "plan ready");

        let mut prior: Option<(String, RunResult)> = None;

        for iteration in 1..=self.options.max_iterations {
            let prompt = match &prior {
                None => prompts::generate_prompt(task, language, &plan),
                Some((code, result)) => prompts::reflect_prompt(
                    task,
                    language,
                    &plan,
                    code,
                    &result.stderr,
                    result.exit_code,
                ),
            };

            let generated = match self
                .model
                .generate(GenerateRequest::prompt(prompt))
                .await
            {
                Ok(resp) => resp.text,
                Err(e) => {
                    warn!(iteration, "generation failed: {e}");
                    execution.escalated = true;
                    execution.escalation_reason = Some("model_limit".into());
                    return execution;
                }
            };
            let code = extract_code(&generated);

            let run_result = match self
                .executor
                .run(language, &code, &self.options.sandbox)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    // Policy cannot be satisfied on this host; retrying will
                    // not change that.
                    warn!(iteration, "sandbox refused the run: {e}");
                    execution.iterations = iteration;
                    execution.history.push(Iteration {
                        iteration,
                        plan: plan.clone(),
                        code,
                        run_result: RunResult {
                            language,
                            ok: false,
                            stdout: String::new(),
                            stderr: e.to_string(),
                            exit_code: -1,
                            duration_ms: 0,
                            queue_for_cloud: false,
                            queue_reason: None,
                        },
                    });
                    execution.escalated = true;
                    execution.escalation_reason = Some(e.to_string());
                    return execution;
                }
            };

            execution.iterations = iteration;
            execution.history.push(Iteration {
                iteration,
                plan: plan.clone(),
                code: code.clone(),
                run_result: run_result.clone(),
            });

            if run_result.ok {
                info!(iteration, "task solved");
                return execution;
            }

            if run_result.queue_for_cloud {
                execution.escalated = true;
                execution.escalation_reason = Some(
                    run_result
                        .queue_reason
                        .map(queue_reason_name)
                        .unwrap_or("manual")
                        .to_string(),
                );
                return execution;
            }

            prior = Some((code, run_result));
        }

        // Budget exhausted without success.
        execution.escalated = true;
        execution.escalation_reason = Some("max_iterations_exhausted".into());
        execution
    }
}

fn queue_reason_name(reason: QueueReason) -> &'static str {
    match reason {
        QueueReason::OutsideSubset => "outside_subset",
        QueueReason::Timeout => "timeout",
        QueueReason::ModelLimit => "model_limit",
        QueueReason::Manual => "manual",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
