// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "edgecoder",
    version,
    about = "Decentralized peer-to-peer compute mesh for local-model coding tasks"
)]
pub struct Cli {
    /// Explicit config file (overrides the discovered YAML layers)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node (mode from config / EDGE_RUNTIME_MODE unless given)
    Start {
        /// Runtime mode: worker | coordinator | control-plane | inference |
        /// ide-provider | all-in-one
        #[arg(long)]
        mode: Option<String>,
    },
    /// Generate (or print) this node's Ed25519 identity
    Keygen {
        /// Overwrite an existing keypair file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective merged configuration
    ShowConfig,
    /// Query a running coordinator's /status endpoint
    Status {
        /// Coordinator base URL (defaults to the configured one)
        #[arg(long)]
        url: Option<String>,
    },
}
