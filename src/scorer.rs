//! Weighted ranking score combining capability, reliability, cost,
//! latency, degraded state, and budget pressure.

use serde::{Deserialize, Serialize};

use crate::budget::ProviderBudget;
use crate::config::ModelRegistryEntry;
use crate::health::ModelHealth;
use crate::types::TaskType;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub capability: f64,
    pub reliability: f64,
    pub cost: f64,
    pub latency: f64,
    pub degrade: f64,
    pub budget: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            capability: 1.0,
            reliability: 0.5,
            cost: 0.5,
            latency: 0.2,
            degrade: 1.5,
            budget: 1.0,
        }
    }
}

const LATENCY_CAP_SECS: f64 = 5.0;
const BUDGET_PRESSURE_RATIO: f64 = 0.9;

/// `score = w_cap*capability(task) - w_cost*costWeight + w_rel*rollingSuccessRate
/// - w_lat*min(latencySeconds,5) - (degraded ? w_degrade : 0)
/// - (nearSoftLimit ? w_budget : 0)`. `capability(task)` is the registry's
/// raw 0-5 integer, not a boolean match.
pub fn score_model(
    model: &ModelRegistryEntry,
    task: TaskType,
    health: &ModelHealth,
    budget: &ProviderBudget,
    weights: &ScoreWeights,
    now_ms: i64,
) -> f64 {
    let latency_secs = (health.rolling_latency_ms / 1000.0).min(LATENCY_CAP_SECS);
    let mut score = weights.capability * model.capability(task) as f64
        - weights.cost * model.cost_weight
        + weights.reliability * health.rolling_success_rate
        - weights.latency * latency_secs;

    if health.is_degraded(now_ms) {
        score -= weights.degrade;
    }

    if let Some(soft) = budget.soft_limit_tokens {
        if soft > 0 && (budget.used_tokens as f64) >= BUDGET_PRESSURE_RATIO * soft as f64 {
            score -= weights.budget;
        }
    }

    score
}

/// Rank candidate models by descending score, stable on ties (preserves
/// input order for equal scores, matching the registry's declared order).
pub fn rank_models(
    candidates: &[(ModelRegistryEntry, ModelHealth, ProviderBudget)],
    task: TaskType,
    weights: &ScoreWeights,
    now_ms: i64,
) -> Vec<(String, f64)> {
    let mut scored: Vec<(String, f64)> = candidates
        .iter()
        .map(|(model, health, budget)| {
            (
                model.id.clone(),
                score_model(model, task, health, budget, weights, now_ms),
            )
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored
}
