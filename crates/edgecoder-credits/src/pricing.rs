// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Pricing formulas.
//!
//! All monetary outputs are rounded to 3 decimals so ledger entries are
//! stable across float-noise in the inputs.

/// Round to 3 decimal places.
pub fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// Demand-based multiplier from queue pressure.
///
/// Pressure `p = queued / max(active, 1)`; an idle mesh discounts compute,
/// a saturated one surges it. `active == 0` with work queued is the maximum
/// surge tier.
pub fn load_multiplier(queued_tasks: u32, active_agents: u32) -> f64 {
    if active_agents == 0 {
        return 2.0;
    }
    let p = queued_tasks as f64 / active_agents as f64;
    if p <= 0.5 {
        0.8
    } else if p <= 1.0 {
        1.0
    } else if p <= 2.0 {
        1.25
    } else {
        1.6
    }
}

/// Base credit rate per compute-second.
pub fn base_rate_per_second(resource_class: &str) -> f64 {
    match resource_class {
        "gpu" => 4.0,
        _ => 1.0,
    }
}

/// Quality score clamped to the payable band.
pub fn quality_multiplier(quality_score: f64) -> f64 {
    quality_score.clamp(0.5, 1.5)
}

/// Credits earned for one contribution.
pub fn accrued_credits(
    compute_seconds: f64,
    resource_class: &str,
    quality_score: f64,
    queued_tasks: u32,
    active_agents: u32,
) -> f64 {
    round3(
        compute_seconds
            * base_rate_per_second(resource_class)
            * quality_multiplier(quality_score)
            * load_multiplier(queued_tasks, active_agents),
    )
}

/// Cost to run an inference against a model of `param_b` billion parameters.
pub fn model_cost_credits(param_b: f64) -> f64 {
    param_b.max(0.5)
}

/// Reward for seeding `bytes` of model weights to `seeders` peers.
///
/// Scarce models (few seeders) pay more per byte.
pub fn model_seed_credits(bytes: u64, seeders: u32) -> f64 {
    let scarcity = 1.0 + 1.0 / (seeders.max(1) as f64);
    round3((bytes as f64 / 1e9) * 0.5 * scarcity)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_multiplier_tiers() {
        assert_eq!(load_multiplier(1, 2), 0.8); // p = 0.5
        assert_eq!(load_multiplier(2, 2), 1.0); // p = 1.0
        assert_eq!(load_multiplier(4, 2), 1.25); // p = 2.0
        assert_eq!(load_multiplier(5, 2), 1.6); // p = 2.5
    }

    #[test]
    fn load_multiplier_no_active_agents_is_max_surge() {
        assert_eq!(load_multiplier(5, 0), 2.0);
        assert_eq!(load_multiplier(0, 0), 2.0);
    }

    #[test]
    fn base_rates() {
        assert_eq!(base_rate_per_second("cpu"), 1.0);
        assert_eq!(base_rate_per_second("gpu"), 4.0);
        assert_eq!(base_rate_per_second("unknown"), 1.0);
    }

    #[test]
    fn quality_is_clamped_to_payable_band() {
        assert_eq!(quality_multiplier(0.1), 0.5);
        assert_eq!(quality_multiplier(1.0), 1.0);
        assert_eq!(quality_multiplier(9.0), 1.5);
    }

    #[test]
    fn accrual_under_queue_pressure_surge() {
        // 10 cpu-seconds, quality 1.0, 5 queued / 2 active → pressure 2.5
        // → multiplier 1.6 → 10 · 1 · 1 · 1.6 = 16.000
        assert_eq!(accrued_credits(10.0, "cpu", 1.0, 5, 2), 16.0);
    }

    #[test]
    fn accrual_is_rounded_to_three_decimals() {
        let credits = accrued_credits(1.23456, "cpu", 1.0, 2, 2);
        assert_eq!(credits, round3(credits));
        assert_eq!(credits, 1.235);
    }

    #[test]
    fn model_cost_has_a_floor() {
        for (param_b, expected) in [
            (0.0, 0.5),
            (0.1, 0.5),
            (0.5, 0.5),
            (1.5, 1.5),
            (7.0, 7.0),
            (70.0, 70.0),
        ] {
            assert_eq!(model_cost_credits(param_b), expected, "param_b = {param_b}");
        }
    }

    #[test]
    fn seed_credits_scale_with_scarcity() {
        // 2 GB, sole seeder: (2)·0.5·(1 + 1/1) = 2.0
        assert_eq!(model_seed_credits(2_000_000_000, 1), 2.0);
        // 2 GB, four seeders: (2)·0.5·(1 + 0.25) = 1.25
        assert_eq!(model_seed_credits(2_000_000_000, 4), 1.25);
    }

    #[test]
    fn seed_credits_treat_zero_seeders_as_one() {
        assert_eq!(
            model_seed_credits(1_000_000_000, 0),
            model_seed_credits(1_000_000_000, 1)
        );
    }
}
