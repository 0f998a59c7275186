//! Per-provider token budget accounting.

use parking_lot::RwLock;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;
use crate::db::Database;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProviderBudget {
    pub used_tokens: i64,
    pub soft_limit_tokens: Option<i64>,
    pub hard_limit_tokens: Option<i64>,
}

impl ProviderBudget {
    /// `used >= 0`; `soft <= hard` when both are set.
    pub fn at_hard_limit(&self) -> bool {
        matches!(self.hard_limit_tokens, Some(hard) if self.used_tokens >= hard)
    }

    pub fn near_soft_limit(&self) -> bool {
        matches!(self.soft_limit_tokens, Some(soft) if (self.used_tokens as f64) >= 0.9 * soft as f64)
    }
}

/// Estimate tokens as 4 chars ~= 1 token, used when a provider omits usage.
pub fn estimate_tokens(text: &str) -> i64 {
    ((text.chars().count() as f64) / 4.0).ceil() as i64
}

/// Cache-through SQLite-backed per-provider token budget.
pub struct BudgetStore {
    db: Arc<Database>,
    cache: RwLock<HashMap<String, ProviderBudget>>,
}

impl BudgetStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, provider: &str) -> ProviderBudget {
        if let Some(b) = self.cache.read().get(provider) {
            return *b;
        }

        let conn = self.db.lock();
        let row: Option<ProviderBudget> = conn
            .query_row(
                "SELECT used_tokens, soft_limit_tokens, hard_limit_tokens \
                 FROM provider_budget WHERE provider = ?1",
                params![provider],
                |r| {
                    Ok(ProviderBudget {
                        used_tokens: r.get(0)?,
                        soft_limit_tokens: r.get(1)?,
                        hard_limit_tokens: r.get(2)?,
                    })
                },
            )
            .optional()
            .unwrap_or(None);

        let budget = row.unwrap_or_default();
        self.cache.write().insert(provider.to_string(), budget);
        budget
    }

    fn persist(&self, provider: &str, budget: ProviderBudget) {
        let conn = self.db.lock();
        let _ = conn.execute(
            "INSERT INTO provider_budget (provider, used_tokens, soft_limit_tokens, hard_limit_tokens) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(provider) DO UPDATE SET \
               used_tokens = excluded.used_tokens, \
               soft_limit_tokens = excluded.soft_limit_tokens, \
               hard_limit_tokens = excluded.hard_limit_tokens",
            params![
                provider,
                budget.used_tokens,
                budget.soft_limit_tokens,
                budget.hard_limit_tokens,
            ],
        );
        self.cache.write().insert(provider.to_string(), budget);
    }

    /// Additive; never decreases.
    pub fn record(&self, provider: &str, tokens: i64) {
        if tokens <= 0 {
            return;
        }
        let mut budget = self.get(provider);
        budget.used_tokens += tokens;
        debug!(provider, used_tokens = budget.used_tokens, "budget recorded");
        self.persist(provider, budget);
    }

    /// Overwrites limits, preserves usage.
    pub fn ensure_limits(&self, provider: &str, soft: Option<i64>, hard: Option<i64>) {
        let mut budget = self.get(provider);
        budget.soft_limit_tokens = soft;
        budget.hard_limit_tokens = hard;
        self.persist(provider, budget);
    }
}

/// Pushes each configured provider's soft/hard token limits into the
/// budget store. Run once at startup and again after every successful
/// admin reload, since the store only enforces limits it's been told
/// about and a reload can add providers or change their limits.
pub fn seed_budget_limits(config: &Config, budget: &BudgetStore) {
    for provider in config.providers() {
        if provider.soft_limit_tokens.is_some() || provider.hard_limit_tokens.is_some() {
            budget.ensure_limits(&provider.name, provider.soft_limit_tokens, provider.hard_limit_tokens);
        }
    }
}
