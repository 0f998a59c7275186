//! Per-model health: cooldown, degradation, EMA latency/success, and
//! rate-limit strike tracking.

use parking_lot::RwLock;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::db::Database;

/// EMA smoothing factor for rolling latency/success rate.
const EMA_ALPHA: f64 = 0.2;

/// Strikes reset to 1 when the previous rate-limit hit falls outside this
/// sliding window; otherwise they accumulate.
const STRIKE_WINDOW_MS: i64 = 60_000;

/// Strikes are capped to keep backoff growth bounded under sustained 429s
/// (Open Question (a), resolved in DESIGN.md).
const MAX_STRIKES: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelHealth {
    pub cooldown_until: i64,
    pub degraded_until: i64,
    pub rate_limit_strikes: u32,
    pub last_rate_limit_at: i64,
    pub rolling_latency_ms: f64,
    pub rolling_success_rate: f64,
}

impl Default for ModelHealth {
    fn default() -> Self {
        Self {
            cooldown_until: 0,
            degraded_until: 0,
            rate_limit_strikes: 0,
            last_rate_limit_at: 0,
            rolling_latency_ms: 0.0,
            rolling_success_rate: 1.0,
        }
    }
}

impl ModelHealth {
    pub fn in_cooldown(&self, now_ms: i64) -> bool {
        self.cooldown_until > now_ms
    }

    pub fn is_degraded(&self, now_ms: i64) -> bool {
        self.degraded_until > now_ms
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Cache-through SQLite-backed per-model health.
pub struct HealthStore {
    db: Arc<Database>,
    cache: RwLock<HashMap<String, ModelHealth>>,
}

impl HealthStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, model_id: &str) -> ModelHealth {
        if let Some(h) = self.cache.read().get(model_id) {
            return *h;
        }

        let conn = self.db.lock();
        let row: Option<ModelHealth> = conn
            .query_row(
                "SELECT cooldown_until, degraded_until, rate_limit_strikes, \
                        last_rate_limit_at, rolling_latency_ms, rolling_success_rate \
                 FROM model_health WHERE model_id = ?1",
                params![model_id],
                |r| {
                    Ok(ModelHealth {
                        cooldown_until: r.get(0)?,
                        degraded_until: r.get(1)?,
                        rate_limit_strikes: r.get::<_, i64>(2)? as u32,
                        last_rate_limit_at: r.get(3)?,
                        rolling_latency_ms: r.get(4)?,
                        rolling_success_rate: r.get(5)?,
                    })
                },
            )
            .optional()
            .unwrap_or(None);

        let health = row.unwrap_or_default();
        self.cache.write().insert(model_id.to_string(), health);
        health
    }

    fn persist(&self, model_id: &str, health: ModelHealth) {
        let conn = self.db.lock();
        let _ = conn.execute(
            "INSERT INTO model_health \
               (model_id, cooldown_until, degraded_until, rate_limit_strikes, \
                last_rate_limit_at, rolling_latency_ms, rolling_success_rate) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(model_id) DO UPDATE SET \
               cooldown_until = excluded.cooldown_until, \
               degraded_until = excluded.degraded_until, \
               rate_limit_strikes = excluded.rate_limit_strikes, \
               last_rate_limit_at = excluded.last_rate_limit_at, \
               rolling_latency_ms = excluded.rolling_latency_ms, \
               rolling_success_rate = excluded.rolling_success_rate",
            params![
                model_id,
                health.cooldown_until,
                health.degraded_until,
                health.rate_limit_strikes as i64,
                health.last_rate_limit_at,
                health.rolling_latency_ms,
                health.rolling_success_rate,
            ],
        );
        self.cache.write().insert(model_id.to_string(), health);
    }

    /// Compute the next strike count given the current health and `now`,
    /// applying the sliding-window reset and the strike cap.
    pub fn next_strike_count(&self, model_id: &str, now: i64) -> u32 {
        let health = self.get(model_id);
        if health.last_rate_limit_at > 0 && now - health.last_rate_limit_at <= STRIKE_WINDOW_MS {
            (health.rate_limit_strikes + 1).min(MAX_STRIKES)
        } else {
            1
        }
    }

    /// `cooldownUntil = now + cooldownMs`; overwrites strike counters; other
    /// fields preserved.
    pub fn mark_rate_limited(&self, model_id: &str, cooldown_ms: i64, strikes: u32, now: i64) {
        let mut health = self.get(model_id);
        health.cooldown_until = now + cooldown_ms;
        health.rate_limit_strikes = strikes.min(MAX_STRIKES);
        health.last_rate_limit_at = now;
        debug!(
            model_id,
            cooldown_until = health.cooldown_until,
            strikes = health.rate_limit_strikes,
            "model rate limited"
        );
        self.persist(model_id, health);
    }

    /// `degradedUntil = now + degradeMs`; cooldown preserved.
    pub fn mark_degraded(&self, model_id: &str, degrade_ms: i64, now: i64) {
        let mut health = self.get(model_id);
        health.degraded_until = now + degrade_ms;
        debug!(model_id, degraded_until = health.degraded_until, "model degraded");
        self.persist(model_id, health);
    }

    /// EMA update with alpha = 0.2; a missing latency leaves the latency
    /// EMA unchanged.
    pub fn record_result(&self, model_id: &str, success: bool, latency_ms: Option<f64>) {
        let mut health = self.get(model_id);
        let observed_success = if success { 1.0 } else { 0.0 };
        health.rolling_success_rate =
            health.rolling_success_rate * (1.0 - EMA_ALPHA) + observed_success * EMA_ALPHA;
        if let Some(latency) = latency_ms {
            health.rolling_latency_ms =
                health.rolling_latency_ms * (1.0 - EMA_ALPHA) + latency * EMA_ALPHA;
        }
        self.persist(model_id, health);
    }
}
