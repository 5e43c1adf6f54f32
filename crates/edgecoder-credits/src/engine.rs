// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The credit engine — the only writer of the ledger.
//!
//! All operations take the engine lock, so a balance check and its matching
//! append are atomic; two concurrent spends can never both pass against the
//! same balance.
//!
//! Spendable balance is `sum(earn) − sum(spend) − sum(active holds)`. A hold
//! reserves funds without spending them; releasing a hold returns the funds
//! and appends an earn/spend audit pair referencing the original hold
//! transaction so the ledger replay stays balanced without double counting.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::ledger::{CreditTransaction, Ledger, TxType};
use crate::pricing;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CreditError {
    #[error("insufficient_credits")]
    InsufficientCredits,
    #[error("duplicate_contribution_report")]
    DuplicateReport,
    #[error("not_found")]
    NotFound,
    #[error("ledger storage failure: {0}")]
    Storage(String),
}

/// A worker's claim of compute contributed to one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionReport {
    /// Idempotency key; a duplicate report is rejected outright.
    pub report_id: String,
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub compute_seconds: f64,
    /// Requester-side quality score, clamped to [0.5, 1.5] at pricing time.
    pub quality_score: f64,
    /// `"cpu"` or `"gpu"`.
    pub resource_class: String,
}

/// Mesh load at accrual time, used for demand pricing.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub queued_tasks: u32,
    pub active_agents: u32,
}

/// Result of a full ledger verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyReport {
    pub valid: bool,
    pub tx_count: usize,
    /// Index of the first broken chain entry, when invalid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<usize>,
    /// Spendable balance per account after replay.
    pub balances: HashMap<String, f64>,
}

#[derive(Debug)]
struct EngineState {
    ledger: Ledger,
    /// Spendable balance per account (earn − spend − active holds).
    balances: HashMap<String, f64>,
    /// Active holds: hold tx id → (account, credits).
    holds: HashMap<String, (String, f64)>,
    seen_reports: HashSet<String>,
}

/// Process-wide credit engine. Constructed at boot, shared by reference.
pub struct CreditEngine {
    state: Mutex<EngineState>,
}

impl CreditEngine {
    pub fn in_memory() -> Self {
        Self::from_ledger(Ledger::in_memory())
    }

    /// Open a file-backed engine, replaying the ledger into balances.
    pub fn open(path: &std::path::Path) -> anyhow::Result<Self> {
        Ok(Self::from_ledger(Ledger::open(path)?))
    }

    fn from_ledger(ledger: Ledger) -> Self {
        let mut balances: HashMap<String, f64> = HashMap::new();
        let mut holds: HashMap<String, (String, f64)> = HashMap::new();
        for tx in ledger.entries() {
            match tx.tx_type {
                TxType::Earn => *balances.entry(tx.account_id.clone()).or_default() += tx.credits,
                TxType::Spend => *balances.entry(tx.account_id.clone()).or_default() -= tx.credits,
                TxType::Held => {
                    holds.insert(tx.tx_id.clone(), (tx.account_id.clone(), tx.credits));
                }
            }
            // A release pair closes its hold: the earn leg carries the hold's
            // tx id in related_task_id (see release()).
            if tx.tx_type == TxType::Earn && tx.reason == "hold_release" {
                if let Some(hold_id) = &tx.related_task_id {
                    holds.remove(hold_id);
                }
            }
        }
        Self {
            state: Mutex::new(EngineState {
                ledger,
                balances,
                holds,
                seen_reports: HashSet::new(),
            }),
        }
    }

    /// Spendable balance (held credits excluded).
    pub async fn balance(&self, account_id: &str) -> f64 {
        let state = self.state.lock().await;
        Self::spendable(&state, account_id)
    }

    fn spendable(state: &EngineState, account_id: &str) -> f64 {
        let base = state.balances.get(account_id).copied().unwrap_or(0.0);
        let held: f64 = state
            .holds
            .values()
            .filter(|(acct, _)| acct == account_id)
            .map(|(_, credits)| credits)
            .sum();
        base - held
    }

    /// Credit a worker for a contribution. Duplicate `report_id` is rejected.
    ///
    /// Returns the accrued credit amount.
    pub async fn accrue(
        &self,
        report: &ContributionReport,
        load: LoadSnapshot,
    ) -> Result<f64, CreditError> {
        let mut state = self.state.lock().await;
        if !state.seen_reports.insert(report.report_id.clone()) {
            return Err(CreditError::DuplicateReport);
        }
        let credits = pricing::accrued_credits(
            report.compute_seconds,
            &report.resource_class,
            report.quality_score,
            load.queued_tasks,
            load.active_agents,
        );
        let tx_id = Uuid::new_v4().to_string();
        state
            .ledger
            .append(
                tx_id,
                report.account_id.clone(),
                TxType::Earn,
                credits,
                "contribution".into(),
                report.task_id.clone(),
                now_ms(),
            )
            .map_err(|e| CreditError::Storage(e.to_string()))?;
        *state
            .balances
            .entry(report.account_id.clone())
            .or_default() += credits;
        info!(account = %report.account_id, credits, "contribution accrued");
        Ok(credits)
    }

    /// Debit an account. Fails without appending when the spendable balance
    /// is insufficient.
    pub async fn spend(
        &self,
        account_id: &str,
        credits: f64,
        reason: &str,
        related_task_id: Option<&str>,
    ) -> Result<String, CreditError> {
        let mut state = self.state.lock().await;
        if Self::spendable(&state, account_id) < credits {
            return Err(CreditError::InsufficientCredits);
        }
        let tx_id = Uuid::new_v4().to_string();
        state
            .ledger
            .append(
                tx_id.clone(),
                account_id.to_string(),
                TxType::Spend,
                credits,
                reason.to_string(),
                related_task_id.map(str::to_string),
                now_ms(),
            )
            .map_err(|e| CreditError::Storage(e.to_string()))?;
        *state.balances.entry(account_id.to_string()).or_default() -= credits;
        debug!(account = %account_id, credits, reason, "credits spent");
        Ok(tx_id)
    }

    /// Reserve credits without spending them. The held amount stops counting
    /// toward the spendable balance until released.
    pub async fn hold(
        &self,
        account_id: &str,
        credits: f64,
        reason: &str,
        related_task_id: Option<&str>,
    ) -> Result<String, CreditError> {
        let mut state = self.state.lock().await;
        if Self::spendable(&state, account_id) < credits {
            return Err(CreditError::InsufficientCredits);
        }
        let tx_id = Uuid::new_v4().to_string();
        state
            .ledger
            .append(
                tx_id.clone(),
                account_id.to_string(),
                TxType::Held,
                credits,
                reason.to_string(),
                related_task_id.map(str::to_string),
                now_ms(),
            )
            .map_err(|e| CreditError::Storage(e.to_string()))?;
        state
            .holds
            .insert(tx_id.clone(), (account_id.to_string(), credits));
        debug!(account = %account_id, credits, "credits held");
        Ok(tx_id)
    }

    /// Release a hold, returning its funds to the account.
    ///
    /// Appends a matched earn/spend pair referencing the original hold tx so
    /// replaying the ledger neither double-counts the held amount nor leaves
    /// it dangling.
    pub async fn release(&self, hold_tx_id: &str) -> Result<(), CreditError> {
        let mut state = self.state.lock().await;
        let (account_id, credits) = state
            .holds
            .remove(hold_tx_id)
            .ok_or(CreditError::NotFound)?;
        let ts = now_ms();
        state
            .ledger
            .append(
                Uuid::new_v4().to_string(),
                account_id.clone(),
                TxType::Earn,
                credits,
                "hold_release".into(),
                Some(hold_tx_id.to_string()),
                ts,
            )
            .map_err(|e| CreditError::Storage(e.to_string()))?;
        state
            .ledger
            .append(
                Uuid::new_v4().to_string(),
                account_id.clone(),
                TxType::Spend,
                credits,
                "hold_release".into(),
                Some(hold_tx_id.to_string()),
                ts,
            )
            .map_err(|e| CreditError::Storage(e.to_string()))?;
        debug!(account = %account_id, credits, hold = %hold_tx_id, "hold released");
        Ok(())
    }

    /// Operator adjustment; positive credits earn, negative spend (allowed to
    /// push the balance negative — it is an explicit correction).
    pub async fn adjust(
        &self,
        account_id: &str,
        credits: f64,
        reason: &str,
    ) -> Result<String, CreditError> {
        let mut state = self.state.lock().await;
        let (tx_type, magnitude) = if credits >= 0.0 {
            (TxType::Earn, credits)
        } else {
            (TxType::Spend, -credits)
        };
        let tx_id = Uuid::new_v4().to_string();
        state
            .ledger
            .append(
                tx_id.clone(),
                account_id.to_string(),
                tx_type,
                magnitude,
                format!("adjust: {reason}"),
                None,
                now_ms(),
            )
            .map_err(|e| CreditError::Storage(e.to_string()))?;
        *state.balances.entry(account_id.to_string()).or_default() += credits;
        Ok(tx_id)
    }

    pub async fn history(&self, account_id: &str) -> Vec<CreditTransaction> {
        self.state.lock().await.ledger.history(account_id)
    }

    pub async fn ledger_len(&self) -> usize {
        self.state.lock().await.ledger.len()
    }

    /// Replay the whole ledger: verify the hash chain and recompute every
    /// balance from scratch.
    pub async fn verify(&self) -> VerifyReport {
        let state = self.state.lock().await;
        let broken_at = state.ledger.verify_chain();

        let mut balances: HashMap<String, f64> = HashMap::new();
        let mut holds: HashMap<String, (String, f64)> = HashMap::new();
        for tx in state.ledger.entries() {
            match tx.tx_type {
                TxType::Earn => *balances.entry(tx.account_id.clone()).or_default() += tx.credits,
                TxType::Spend => *balances.entry(tx.account_id.clone()).or_default() -= tx.credits,
                TxType::Held => {
                    holds.insert(tx.tx_id.clone(), (tx.account_id.clone(), tx.credits));
                }
            }
            if tx.tx_type == TxType::Earn && tx.reason == "hold_release" {
                if let Some(hold_id) = &tx.related_task_id {
                    holds.remove(hold_id);
                }
            }
        }
        for (account, credits) in holds.values() {
            *balances.entry(account.clone()).or_default() -= credits;
        }

        VerifyReport {
            valid: broken_at.is_none(),
            tx_count: state.ledger.len(),
            broken_at,
            balances,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: &str, account: &str, seconds: f64) -> ContributionReport {
        ContributionReport {
            report_id: id.into(),
            account_id: account.into(),
            task_id: Some("task-1".into()),
            compute_seconds: seconds,
            quality_score: 1.0,
            resource_class: "cpu".into(),
        }
    }

    fn idle_load() -> LoadSnapshot {
        // pressure 1.0 → multiplier 1.0, so credits == compute_seconds.
        LoadSnapshot {
            queued_tasks: 2,
            active_agents: 2,
        }
    }

    #[tokio::test]
    async fn accrue_credits_the_worker_account() {
        let engine = CreditEngine::in_memory();
        let credits = engine.accrue(&report("r1", "w1", 10.0), idle_load()).await.unwrap();
        assert_eq!(credits, 10.0);
        assert_eq!(engine.balance("w1").await, 10.0);
    }

    #[tokio::test]
    async fn accrual_scenario_pressure_surge() {
        let engine = CreditEngine::in_memory();
        let load = LoadSnapshot {
            queued_tasks: 5,
            active_agents: 2,
        };
        let credits = engine.accrue(&report("r1", "w1", 10.0), load).await.unwrap();
        assert_eq!(credits, 16.0);
    }

    #[tokio::test]
    async fn duplicate_report_id_is_rejected() {
        let engine = CreditEngine::in_memory();
        engine.accrue(&report("r1", "w1", 10.0), idle_load()).await.unwrap();
        let err = engine
            .accrue(&report("r1", "w1", 10.0), idle_load())
            .await
            .unwrap_err();
        assert_eq!(err, CreditError::DuplicateReport);
        assert_eq!(engine.balance("w1").await, 10.0, "no double credit");
    }

    #[tokio::test]
    async fn spend_over_balance_is_rejected_without_append() {
        let engine = CreditEngine::in_memory();
        engine.accrue(&report("r1", "a1", 5.0), idle_load()).await.unwrap();
        let err = engine.spend("a1", 6.0, "too much", None).await.unwrap_err();
        assert_eq!(err, CreditError::InsufficientCredits);
        assert_eq!(engine.balance("a1").await, 5.0);
        assert_eq!(engine.ledger_len().await, 1, "failed spend must not append");
    }

    #[tokio::test]
    async fn spend_within_balance_succeeds() {
        let engine = CreditEngine::in_memory();
        engine.accrue(&report("r1", "a1", 5.0), idle_load()).await.unwrap();
        engine.spend("a1", 3.0, "task", Some("task-9")).await.unwrap();
        assert_eq!(engine.balance("a1").await, 2.0);
    }

    #[tokio::test]
    async fn held_credits_are_not_spendable() {
        let engine = CreditEngine::in_memory();
        engine.accrue(&report("r1", "a1", 10.0), idle_load()).await.unwrap();
        engine.hold("a1", 8.0, "escrow", None).await.unwrap();
        assert_eq!(engine.balance("a1").await, 2.0);
        let err = engine.spend("a1", 5.0, "x", None).await.unwrap_err();
        assert_eq!(err, CreditError::InsufficientCredits);
    }

    #[tokio::test]
    async fn release_returns_held_funds_exactly_once() {
        let engine = CreditEngine::in_memory();
        engine.accrue(&report("r1", "a1", 10.0), idle_load()).await.unwrap();
        let hold_id = engine.hold("a1", 8.0, "escrow", None).await.unwrap();
        engine.release(&hold_id).await.unwrap();
        assert_eq!(engine.balance("a1").await, 10.0, "funds return on release");
        assert_eq!(
            engine.release(&hold_id).await.unwrap_err(),
            CreditError::NotFound,
            "double release must fail"
        );
        assert_eq!(engine.balance("a1").await, 10.0, "no double counting");
    }

    #[tokio::test]
    async fn hold_over_spendable_balance_is_rejected() {
        let engine = CreditEngine::in_memory();
        engine.accrue(&report("r1", "a1", 5.0), idle_load()).await.unwrap();
        engine.hold("a1", 4.0, "escrow", None).await.unwrap();
        let err = engine.hold("a1", 2.0, "escrow", None).await.unwrap_err();
        assert_eq!(err, CreditError::InsufficientCredits);
    }

    #[tokio::test]
    async fn verify_replays_to_current_balances() {
        let engine = CreditEngine::in_memory();
        engine.accrue(&report("r1", "a1", 10.0), idle_load()).await.unwrap();
        engine.spend("a1", 3.0, "task", None).await.unwrap();
        let hold_id = engine.hold("a1", 2.0, "escrow", None).await.unwrap();

        let report = engine.verify().await;
        assert!(report.valid);
        assert_eq!(report.balances.get("a1").copied(), Some(5.0));
        assert_eq!(report.balances["a1"], engine.balance("a1").await);

        engine.release(&hold_id).await.unwrap();
        let report = engine.verify().await;
        assert_eq!(report.balances.get("a1").copied(), Some(7.0));
        assert_eq!(report.balances["a1"], engine.balance("a1").await);
    }

    #[tokio::test]
    async fn adjust_can_push_balance_negative() {
        let engine = CreditEngine::in_memory();
        engine.adjust("a1", -2.5, "penalty").await.unwrap();
        assert_eq!(engine.balance("a1").await, -2.5);
    }

    #[tokio::test]
    async fn file_backed_engine_restores_balances_and_holds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let hold_id;
        {
            let engine = CreditEngine::open(&path).unwrap();
            engine.accrue(&report("r1", "a1", 10.0), idle_load()).await.unwrap();
            hold_id = engine.hold("a1", 4.0, "escrow", None).await.unwrap();
        }
        let engine = CreditEngine::open(&path).unwrap();
        assert_eq!(engine.balance("a1").await, 6.0, "hold survives reload");
        engine.release(&hold_id).await.unwrap();
        assert_eq!(engine.balance("a1").await, 10.0);
    }
}
