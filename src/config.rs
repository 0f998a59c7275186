//! Model registry + routing policy configuration.
//!
//! A directly deserializable file shape (`ConfigFile`), plus a runtime
//! `Config` that wraps an `Arc<ConfigInner>` holding the parsed file
//! alongside a shared `reqwest::Client` connection pool. Admin reload swaps
//! this `Arc` by pointer, via `main.rs`'s `RwLock<Config>`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crate::evaluator::{CodeEvalConfig, JudgeConfig};
use crate::scorer::ScoreWeights;

fn default_context_window() -> u32 {
    128_000
}

fn default_max_output_tokens() -> u32 {
    4_096
}

fn default_cost_weight() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

fn default_quality_threshold() -> f64 {
    0.7
}

fn default_max_attempts() -> usize {
    3
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_max_wait_ms() -> u64 {
    30_000
}

fn default_min_capability() -> u8 {
    0
}

fn default_eval_fail_degrade_ms() -> i64 {
    30_000
}

fn default_context_degrade_ms() -> i64 {
    60_000
}

fn default_chunk_size() -> usize {
    24
}

fn default_chunk_delay_ms() -> u64 {
    20
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_db_path() -> String {
    crate::db::default_db_path()
}

/// One entry in the model registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRegistryEntry {
    pub id: String,
    pub provider: String,
    /// Back-end identifier passed through to the provider adapter, e.g. the
    /// upstream's own model name.
    pub backend: String,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Task type name (`code|rewrite|research|reasoning`) to capability
    /// 0-5. Missing entries default to capability 0.
    #[serde(default)]
    pub capabilities: HashMap<String, u8>,
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ModelRegistryEntry {
    pub fn capability(&self, task: crate::types::TaskType) -> u8 {
        self.capabilities.get(task.as_str()).copied().unwrap_or(0)
    }
}

/// A configured upstream HTTP endpoint + its token budget limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub soft_limit_tokens: Option<i64>,
    #[serde(default)]
    pub hard_limit_tokens: Option<i64>,
}

/// Per-task-type routing policy, with fallback to `default`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPolicy {
    #[serde(default)]
    pub preferred: Vec<String>,
    #[serde(default = "default_min_capability")]
    pub min_capability: u8,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default)]
    pub weights: Option<ScoreWeights>,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            preferred: Vec::new(),
            min_capability: default_min_capability(),
            quality_threshold: default_quality_threshold(),
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            max_wait_ms: default_max_wait_ms(),
            weights: None,
        }
    }
}

/// Buffered-then-streamed chunking parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_delay_ms: default_chunk_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CodeEvalFileConfig {
    pub command: String,
    #[serde(default = "default_cost_weight")]
    pub weight: f64,
    #[serde(default = "default_cost_weight")]
    pub failure_penalty: f64,
    #[serde(default = "default_code_eval_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_code_eval_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeFileConfig {
    pub model_id: String,
    #[serde(default)]
    pub min_score: Option<f64>,
}

/// Degradation windows applied by the engine outside the per-policy
/// knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradeConfig {
    #[serde(default = "default_eval_fail_degrade_ms")]
    pub eval_fail_ms: i64,
    #[serde(default = "default_context_degrade_ms")]
    pub context_length_exceeded_ms: i64,
}

impl Default for DegradeConfig {
    fn default() -> Self {
        Self {
            eval_fail_ms: default_eval_fail_degrade_ms(),
            context_length_exceeded_ms: default_context_degrade_ms(),
        }
    }
}

/// Parsed JSON configuration (deserializable).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub models: Vec<ModelRegistryEntry>,
    pub providers: Vec<ProviderConfig>,
    /// Keyed by task-type name, plus a required `"default"` entry used as
    /// the fallback policy.
    #[serde(default)]
    pub policies: HashMap<String, RoutingPolicy>,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub code_eval: Option<CodeEvalFileConfig>,
    #[serde(default)]
    pub judge: Option<JudgeFileConfig>,
    #[serde(default)]
    pub degrade: DegradeConfig,

    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default)]
    pub admin_token: Option<String>,
    #[serde(default)]
    pub allow_insecure_resume: bool,
    #[serde(default = "default_api_timeout_ms")]
    pub api_timeout_ms: u64,
}

fn default_api_timeout_ms() -> u64 {
    60_000
}

/// Runtime configuration shared across all handlers via Axum state. Wraps
/// the parsed file plus a shared `reqwest::Client` connection pool, the
/// same shape the teacher's `Config` uses for its provider HTTP pool.
#[derive(Debug, Clone)]
pub struct Config {
    inner: Arc<ConfigInner>,
}

#[derive(Debug)]
struct ConfigInner {
    file: ConfigFile,
    http_client: reqwest::Client,
    registry: HashMap<String, ModelRegistryEntry>,
    providers: HashMap<String, ProviderConfig>,
    policies: HashMap<String, RoutingPolicy>,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        let file: ConfigFile =
            serde_json::from_str(&content).context("failed to parse config JSON")?;
        Self::from_parsed(file)
    }

    fn from_parsed(file: ConfigFile) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(file.api_timeout_ms))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .context("failed to build shared HTTP client")?;

        let registry = file
            .models
            .iter()
            .map(|m| (m.id.clone(), m.clone()))
            .collect();
        let providers = file
            .providers
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();
        let mut policies = file.policies.clone();
        policies.entry("default".to_string()).or_default();

        Ok(Config {
            inner: Arc::new(ConfigInner {
                file,
                http_client,
                registry,
                providers,
                policies,
            }),
        })
    }

    /// Builds a `Config` directly from an already-constructed `ConfigFile`,
    /// bypassing file I/O. Used by other modules' `#[cfg(test)]` fixtures.
    #[cfg(test)]
    pub fn from_parsed_for_test(file: ConfigFile) -> Self {
        Self::from_parsed(file).expect("test config fixture must build cleanly")
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.inner.http_client
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelRegistryEntry> {
        self.inner.file.models.iter()
    }

    pub fn model(&self, id: &str) -> Option<&ModelRegistryEntry> {
        self.inner.registry.get(id)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.inner.providers.get(name)
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.inner.file.providers.iter()
    }

    /// Resolve the effective policy for a task type, falling back to
    /// `"default"`.
    pub fn policy(&self, task: crate::types::TaskType) -> &RoutingPolicy {
        self.inner
            .policies
            .get(task.as_str())
            .unwrap_or_else(|| &self.inner.policies["default"])
    }

    pub fn streaming(&self) -> &StreamingConfig {
        &self.inner.file.streaming
    }

    pub fn degrade(&self) -> &DegradeConfig {
        &self.inner.file.degrade
    }

    pub fn code_eval_config(&self) -> Option<CodeEvalConfig> {
        self.inner.file.code_eval.as_ref().map(|c| CodeEvalConfig {
            command: c.command.clone(),
            weight: c.weight,
            failure_penalty: c.failure_penalty,
            timeout: Duration::from_millis(c.timeout_ms),
        })
    }

    pub fn judge_config(&self) -> Option<JudgeConfig> {
        self.inner.file.judge.as_ref().map(|j| JudgeConfig {
            model_id: j.model_id.clone(),
            min_score: j.min_score,
        })
    }

    pub fn db_path(&self) -> &str {
        &self.inner.file.db_path
    }

    pub fn admin_token(&self) -> Option<&str> {
        self.inner.file.admin_token.as_deref()
    }

    pub fn allow_insecure_resume(&self) -> bool {
        self.inner.file.allow_insecure_resume
    }

    pub fn port(&self) -> u16 {
        self.inner.file.port
    }

    pub fn host(&self) -> &str {
        &self.inner.file.host
    }

    /// Overrides the config file's `admin_token`/`allow_insecure_resume`
    /// with CLI/env values (`ADMIN_TOKEN`, `ALLOW_INSECURE_RESUME`),
    /// applied once at startup before the first config snapshot is shared.
    pub fn with_admin_overrides(self, admin_token: Option<String>, allow_insecure_resume: bool) -> Self {
        let mut file = self.inner.file.clone();
        if admin_token.is_some() {
            file.admin_token = admin_token;
        }
        file.allow_insecure_resume = file.allow_insecure_resume || allow_insecure_resume;
        Config {
            inner: Arc::new(ConfigInner {
                file,
                http_client: self.inner.http_client.clone(),
                registry: self.inner.registry.clone(),
                providers: self.inner.providers.clone(),
                policies: self.inner.policies.clone(),
            }),
        }
    }
}
