// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The append-only transaction log.
//!
//! # Tamper evidence
//!
//! Each transaction carries `hash = SHA-256(prev_hash ‖ canonical fields)`,
//! chaining every entry to its predecessor. Editing or deleting any historic
//! entry breaks every later hash, which `verify_chain` detects by replay.
//!
//! # Persistence
//!
//! Optionally backed by a JSONL file: one serialized transaction per line,
//! appended on commit, replayed on load. The in-memory form exposes the same
//! operational surface.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Earn,
    Spend,
    Held,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub tx_id: String,
    pub account_id: String,
    #[serde(rename = "type")]
    pub tx_type: TxType,
    pub credits: f64,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_task_id: Option<String>,
    pub timestamp_ms: i64,
    /// Chain hash over the previous entry's hash and this entry's fields.
    pub hash: String,
}

/// Compute the chain hash for a transaction's fields.
pub(crate) fn chain_hash(
    prev_hash: &str,
    tx_id: &str,
    account_id: &str,
    tx_type: TxType,
    credits: f64,
    reason: &str,
    related_task_id: Option<&str>,
    timestamp_ms: i64,
) -> String {
    let mut hasher = Sha256::new();
    let credits_field = format!("{credits:.3}");
    let ts_field = timestamp_ms.to_string();
    let type_field = match tx_type {
        TxType::Earn => "earn",
        TxType::Spend => "spend",
        TxType::Held => "held",
    };
    // Length-prefix each field so concatenation is unambiguous.
    for field in [
        prev_hash,
        tx_id,
        account_id,
        type_field,
        credits_field.as_str(),
        reason,
        related_task_id.unwrap_or(""),
        ts_field.as_str(),
    ] {
        hasher.update((field.len() as u32).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Append-only transaction log with optional JSONL persistence.
#[derive(Debug, Default)]
pub struct Ledger {
    entries: Vec<CreditTransaction>,
    file: Option<PathBuf>,
}

impl Ledger {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open (or create) a JSONL-backed ledger, replaying existing entries.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let mut entries = Vec::new();
        if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading ledger {}", path.display()))?;
            for (idx, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let tx: CreditTransaction = serde_json::from_str(line)
                    .with_context(|| format!("parsing ledger line {}", idx + 1))?;
                entries.push(tx);
            }
        } else if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating ledger directory {}", parent.display()))?;
        }
        Ok(Self {
            entries,
            file: Some(path.to_path_buf()),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CreditTransaction] {
        &self.entries
    }

    pub fn last_hash(&self) -> &str {
        self.entries.last().map(|e| e.hash.as_str()).unwrap_or("")
    }

    /// Append a transaction, computing its chain hash, and persist it when
    /// file-backed. Returns the stored entry.
    pub fn append(
        &mut self,
        tx_id: String,
        account_id: String,
        tx_type: TxType,
        credits: f64,
        reason: String,
        related_task_id: Option<String>,
        timestamp_ms: i64,
    ) -> anyhow::Result<&CreditTransaction> {
        let hash = chain_hash(
            self.last_hash(),
            &tx_id,
            &account_id,
            tx_type,
            credits,
            &reason,
            related_task_id.as_deref(),
            timestamp_ms,
        );
        let tx = CreditTransaction {
            tx_id,
            account_id,
            tx_type,
            credits,
            reason,
            related_task_id,
            timestamp_ms,
            hash,
        };
        if let Some(path) = &self.file {
            let line = serde_json::to_string(&tx).context("serializing ledger entry")?;
            let mut f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening ledger {}", path.display()))?;
            writeln!(f, "{line}").context("appending ledger entry")?;
        }
        self.entries.push(tx);
        Ok(self.entries.last().expect("entry just pushed"))
    }

    /// Recompute the hash chain from the start; returns the index of the
    /// first broken entry, or `None` when intact.
    pub fn verify_chain(&self) -> Option<usize> {
        let mut prev = String::new();
        for (idx, tx) in self.entries.iter().enumerate() {
            let expected = chain_hash(
                &prev,
                &tx.tx_id,
                &tx.account_id,
                tx.tx_type,
                tx.credits,
                &tx.reason,
                tx.related_task_id.as_deref(),
                tx.timestamp_ms,
            );
            if expected != tx.hash {
                return Some(idx);
            }
            prev = tx.hash.clone();
        }
        None
    }

    /// Transactions for one account, oldest first.
    pub fn history(&self, account_id: &str) -> Vec<CreditTransaction> {
        self.entries
            .iter()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
