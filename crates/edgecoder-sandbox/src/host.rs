// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Host-mode execution — used when the policy permits running without a
//! container (or on hosts without Docker).
//!
//! The interpreter child is still constrained: address-space and CPU rlimits
//! on Unix, `--max-old-space-size` for Node, a new session via `setsid` so it
//! cannot reach the controlling terminal, stdin fed from a pipe that closes
//! at EOF, and a hard wall-clock timeout with `kill_on_drop`. On macOS an
//! optional `sandbox-exec` profile adds a kernel-level deny-by-default layer.

use std::process::Stdio;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::types::{Language, QueueReason, RunResult, SandboxPolicy, TIMEOUT_EXIT_CODE};

/// Minimal `sandbox-exec` profile: deny everything except what an
/// interpreter needs to run a self-contained script.
#[cfg(target_os = "macos")]
const SANDBOX_EXEC_PROFILE: &str = r#"(version 1)
(deny default)
(allow process-exec)
(allow process-fork)
(allow file-read*)
(allow sysctl-read)
(deny network*)
(allow file-write* (subpath "/dev/null"))
"#;

fn interpreter_command(language: Language, policy: &SandboxPolicy) -> Command {
    match language {
        Language::Python => {
            let mut cmd = Command::new("python3");
            // -I: isolated mode — ignores PYTHON* env vars and user site dir.
            cmd.arg("-I").arg("-");
            cmd
        }
        Language::Javascript => {
            let mut cmd = Command::new("node");
            cmd.arg(format!("--max-old-space-size={}", policy.memory_mb));
            cmd.arg("-");
            cmd
        }
    }
}

/// Run `code` directly on the host under rlimits and a timeout.
pub(crate) async fn run(language: Language, code: &str, policy: &SandboxPolicy) -> RunResult {
    let started = Instant::now();
    let mut cmd = interpreter_command(language, policy);

    #[cfg(target_os = "macos")]
    if policy.required {
        // Wrap the interpreter in sandbox-exec when available; the profile is
        // passed inline so no temp file is needed.
        let inner = cmd;
        let mut wrapped = Command::new("sandbox-exec");
        wrapped.arg("-p").arg(SANDBOX_EXEC_PROFILE);
        wrapped.arg(inner.as_std().get_program());
        wrapped.args(inner.as_std().get_args());
        cmd = wrapped;
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // New session: the child has no controlling terminal, so it cannot emit
    // escape sequences at the operator's shell or read from its tty.
    // The rlimits bound memory and CPU for the whole child session.
    #[cfg(unix)]
    {
        let mem_bytes = policy.memory_mb * 1024 * 1024;
        let cpu_secs = (policy.timeout_ms / 1000).max(1);
        unsafe {
            cmd.pre_exec(move || {
                libc::setsid();
                let mem = libc::rlimit {
                    rlim_cur: mem_bytes,
                    rlim_max: mem_bytes,
                };
                libc::setrlimit(libc::RLIMIT_AS, &mem);
                let cpu = libc::rlimit {
                    rlim_cur: cpu_secs,
                    rlim_max: cpu_secs,
                };
                libc::setrlimit(libc::RLIMIT_CPU, &cpu);
                Ok(())
            });
        }
    }

    debug!(?language, "host-mode run");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return RunResult {
                language,
                ok: false,
                stdout: String::new(),
                stderr: format!("failed to spawn interpreter: {e}"),
                exit_code: -1,
                duration_ms: started.elapsed().as_millis() as u64,
                queue_for_cloud: false,
                queue_reason: None,
            }
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(code.as_bytes()).await;
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
            stderr: format!("interpreter wait error: {e}"),
            exit_code: -1,
            duration_ms: started.elapsed().as_millis() as u64,
            queue_for_cloud: false,
            queue_reason: None,
        },
        Err(_) => RunResult {
            language,
            ok: false,
            stdout: String::new(),
            stderr: format!("timed out after {} ms", policy.timeout_ms),
            exit_code: TIMEOUT_EXIT_CODE,
            duration_ms: started.elapsed().as_millis() as u64,
            queue_for_cloud: true,
            queue_reason: Some(QueueReason::Timeout),
        },
    }
}
