// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Container-mode execution.
//!
//! The interpreter runs inside a throwaway container with a read-only rootfs,
//! a memory cap, a CPU share, a pid cap and (by default) no network. Code is
//! piped through stdin so nothing is written to the host filesystem.

use std::process::Stdio;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::types::{Language, QueueReason, RunResult, SandboxPolicy, TIMEOUT_EXIT_CODE};

/// Default images per language. Pinned to slim variants so a cold pull stays
/// small.
fn image_for(language: Language) -> &'static str {
    match language {
        Language::Python => "python:3.12-slim",
        Language::Javascript => "node:22-slim",
    }
}

fn interpreter_argv(language: Language) -> &'static [&'static str] {
    match language {
        // `-` reads the program from stdin.
        Language::Python => &["python3", "-"],
        Language::Javascript => &["node", "-"],
    }
}

/// Build the full `docker run` argument vector for a policy.
///
/// Split out from [`run`] so the containment flags are unit-testable without
/// a Docker daemon.
pub(crate) fn docker_args(language: Language, policy: &SandboxPolicy) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "-i".into(),
        "--read-only".into(),
        format!("--memory={}m", policy.memory_mb),
        format!("--cpus={}", policy.cpu_cores),
        format!("--pids-limit={}", policy.pids_limit),
    ];
    if !policy.allow_network {
        args.push("--network=none".into());
    }
    args.push(image_for(language).into());
    args.extend(interpreter_argv(language).iter().map(|s| s.to_string()));
    args
}

/// Run `code` in a container and collect the outcome.
pub(crate) async fn run(language: Language, code: &str, policy: &SandboxPolicy) -> RunResult {
    let started = Instant::now();
    let args = docker_args(language, policy);
    debug!(?language, "docker run {}", args.join(" "));

    let mut cmd = Command::new("docker");
    cmd.args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return RunResult {
                language,
                ok: false,
                stdout: String::new(),
                stderr: format!("failed to spawn docker: {e}"),
                exit_code: -1,
                duration_ms: started.elapsed().as_millis() as u64,
                queue_for_cloud: false,
                queue_reason: None,
            }
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(code.as_bytes()).await;
        // Dropping stdin closes the pipe so the interpreter sees EOF.
    }

    let timeout = std::time::Duration::from_millis(policy.timeout_ms);
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let exit_code = output.status.code().unwrap_or(-1);
            RunResult {
                language,
                ok: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code,
                duration_ms: started.elapsed().as_millis() as u64,
                queue_for_cloud: false,
                queue_reason: None,
            }
        }
        Ok(Err(e)) => RunResult {
            language,
            ok: false,
            stdout: String::new(),
            stderr: format!("docker wait error: {e}"),
            exit_code: -1,
            duration_ms: started.elapsed().as_millis() as u64,
            queue_for_cloud: false,
            queue_reason: None,
        },
        Err(_) => {
            // kill_on_drop already sent SIGKILL when the future was dropped by
            // the timeout; report the coreutils timeout convention.
            RunResult {
                language,
                ok: false,
                stdout: String::new(),
                stderr: format!("timed out after {} ms", policy.timeout_ms),
                exit_code: TIMEOUT_EXIT_CODE,
                duration_ms: started.elapsed().as_millis() as u64,
                queue_for_cloud: true,
                queue_reason: Some(QueueReason::Timeout),
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_disables_network() {
        let args = docker_args(Language::Python, &SandboxPolicy::default());
        assert!(args.contains(&"--network=none".to_string()));
    }

    #[test]
    fn network_flag_is_omitted_when_policy_allows_it() {
        let policy = SandboxPolicy {
            allow_network: true,
            ..SandboxPolicy::default()
        };
        let args = docker_args(Language::Python, &policy);
        assert!(!args.contains(&"--network=none".to_string()));
    }

    #[test]
    fn resource_caps_appear_in_args() {
        let policy = SandboxPolicy {
            memory_mb: 512,
            cpu_cores: 1.5,
            pids_limit: 99,
            ..SandboxPolicy::default()
        };
        let args = docker_args(Language::Javascript, &policy);
        assert!(args.contains(&"--memory=512m".to_string()));
        assert!(args.contains(&"--cpus=1.5".to_string()));
        assert!(args.contains(&"--pids-limit=99".to_string()));
    }

    #[test]
    fn rootfs_is_read_only() {
        let args = docker_args(Language::Python, &SandboxPolicy::default());
        assert!(args.contains(&"--read-only".to_string()));
    }

    #[test]
    fn interpreter_reads_program_from_stdin() {
        let args = docker_args(Language::Python, &SandboxPolicy::default());
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }
}
