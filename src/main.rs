// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use edgecoder_config::{Config, RuntimeMode};
use edgecoder_crypto::{NodeIdentity, TrustedKeys};
use edgecoder_gateway::{run_gateway, run_ide_provider, GatewayState};
use edgecoder_node::{node, worker, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // reqwest's rustls backend needs a process-wide crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut config = edgecoder_config::load(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Keygen { force }) => keygen(&config, force),
        Some(Commands::ShowConfig) => {
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
        Some(Commands::Status { url }) => status(&config, url.as_deref()).await,
        Some(Commands::Start { mode }) => {
            if let Some(mode) = mode {
                config.node.runtime_mode = RuntimeMode::parse(&mode)
                    .ok_or_else(|| anyhow::anyhow!("unknown runtime mode {mode:?}"))?;
            }
            run_node(config).await
        }
        None => run_node(config).await,
    }
}

// ── Node startup ──────────────────────────────────────────────────────────────

/// Assemble the shared state and start every subsystem the runtime mode
/// selects. Blocks until the first subsystem fails.
async fn run_node(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let mode = config.node.runtime_mode;

    let identity = NodeIdentity::load_or_generate(
        &keypair_path(&config),
        config.node.agent_id.as_deref(),
    )?;
    info!(peer_id = %identity.peer_id(), ?mode, "edgecoder node starting");

    let trusted = match &config.node.trusted_keys_file {
        Some(path) => TrustedKeys::load(std::path::Path::new(path))
            .with_context(|| format!("loading trusted keys from {path}"))?,
        None => TrustedKeys::new(),
    };

    let model: Arc<dyn edgecoder_model::ModelProvider> =
        Arc::from(edgecoder_model::from_config(&config.model)?);

    let state = AppState::build(Arc::clone(&config), identity, trusted, model)?;

    let mut servers = tokio::task::JoinSet::new();

    if mode.runs_coordinator() {
        let state = state.clone();
        let bind = config.node.coordinator_bind.clone();
        servers.spawn(async move { node::run_coordinator(state, &bind).await });
    }

    if mode.runs_inference() || mode.runs_ide_provider() {
        let gateway_state = GatewayState::new(
            Arc::clone(state.models.provider()),
            Arc::clone(&state.identity),
            Arc::clone(&state.trusted),
            Arc::clone(&config),
        );
        if mode.runs_inference() {
            let gw = gateway_state.clone();
            let bind = config.node.inference_bind.clone();
            servers.spawn(async move { run_gateway(gw, &bind).await });
        }
        if mode.runs_ide_provider() {
            let gw = gateway_state.clone();
            let bind = config.node.ide_bind.clone();
            servers.spawn(async move { run_ide_provider(gw, &bind).await });
        }
    }

    if mode.runs_worker() {
        // A worker pulls from its configured coordinator; all-in-one nodes
        // default to their own loopback coordinator.
        let coordinator_url = config
            .mesh
            .coordinator_url
            .clone()
            .or_else(|| {
                mode.runs_coordinator().then(|| {
                    let port = config
                        .node
                        .coordinator_bind
                        .rsplit(':')
                        .next()
                        .unwrap_or("4301");
                    format!("http://127.0.0.1:{port}")
                })
            })
            .context("worker mode requires COORDINATOR_URL")?;
        let ctx = worker::WorkerContext::new(
            Arc::clone(&state.identity),
            coordinator_url,
            Arc::clone(state.models.provider()),
            Arc::clone(&state.executor),
            config
                .node
                .agent_os
                .clone()
                .unwrap_or_else(|| std::env::consts::OS.to_string()),
            config.worker.max_concurrent_tasks,
            config.worker.poll_interval_ms,
        );
        servers.spawn(async move {
            worker::run_worker_loop(ctx).await;
            Ok::<(), anyhow::Error>(())
        });
    }

    if servers.is_empty() {
        anyhow::bail!("runtime mode {mode:?} starts no subsystems");
    }

    // Block on the subsystems; the first error (or unexpected exit) wins.
    while let Some(joined) = servers.join_next().await {
        joined.context("subsystem panicked")??;
    }
    Ok(())
}

// ── Subcommands ───────────────────────────────────────────────────────────────

fn keygen(config: &Config, force: bool) -> anyhow::Result<()> {
    let path = keypair_path(config);
    if path.exists() && !force {
        let identity = NodeIdentity::load_or_generate(&path, None)?;
        println!("peer_id:    {}", identity.peer_id());
        println!("public_key: {}", identity.public_key_hex());
        println!("(keypair already exists at {}; use --force to replace)", path.display());
        return Ok(());
    }
    if path.exists() {
        std::fs::remove_file(&path)
            .with_context(|| format!("removing old keypair {}", path.display()))?;
    }
    let identity = NodeIdentity::load_or_generate(&path, config.node.agent_id.as_deref())?;
    println!("peer_id:    {}", identity.peer_id());
    println!("public_key: {}", identity.public_key_hex());
    println!("keypair written to {}", path.display());
    Ok(())
}

async fn status(config: &Config, url: Option<&str>) -> anyhow::Result<()> {
    let base = url
        .map(str::to_string)
        .or_else(|| config.mesh.coordinator_url.clone())
        .unwrap_or_else(|| "http://127.0.0.1:4301".into());
    let status: serde_json::Value = reqwest::Client::new()
        .get(format!("{}/status", base.trim_end_matches('/')))
        .send()
        .await
        .with_context(|| format!("querying {base}/status"))?
        .error_for_status()?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn keypair_path(config: &Config) -> PathBuf {
    match &config.node.keypair_file {
        Some(path) => PathBuf::from(path),
        None => dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("edgecoder/node.key"),
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("EDGECODER_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
