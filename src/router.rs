//! The router engine. Filters the model registry against health/budget
//! state, scores and orders survivors, attempts them in order with
//! context-fitting and quality evaluation, and retries across poll-interval
//! cycles until success or the request's wall-clock deadline.
//!
//! Axum handlers at the bottom translate the HTTP contract into a
//! [`RouterRequest`] and render the engine's outcome back into the
//! documented JSON/SSE shapes, grounded on the teacher's `main.rs`/
//! `router.rs` wiring, without reproducing its multi-frontend/multi-vendor
//! translation machinery.

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::budget::{self, BudgetStore};
use crate::config::{Config, ModelRegistryEntry, RoutingPolicy};
use crate::context::{self, FitResult};
use crate::error::RouterError;
use crate::evaluator::Evaluator;
use crate::health::{self, HealthStore, ModelHealth};
use crate::metrics;
use crate::provider::{HttpProviderAdapter, ProviderAdapter, ScriptedAdapter};
use crate::scorer::{self, ScoreWeights};
use crate::session::{AttemptOutcome, AttemptRecord, SessionStatus, SessionStore};
use crate::sse;
use crate::task_type;
use crate::types::{Message, NormalizedResponse, RouterRequest, TaskType};

// ============================================================================
// Adapter resolution
// ============================================================================

/// Resolves a live [`ProviderAdapter`] for a registry entry, given the
/// request's configuration snapshot. Kept separate from `RouterDeps` so
/// admin reload never leaves a stale provider binding behind.
pub trait AdapterSource: Send + Sync {
    fn adapter_for(&self, config: &Config, model: &ModelRegistryEntry) -> Option<Arc<dyn ProviderAdapter>>;
}

/// Production adapter source: one generic OpenAI-Chat-Completions-shaped
/// HTTP adapter per provider entry.
pub struct HttpAdapterSource;

impl AdapterSource for HttpAdapterSource {
    fn adapter_for(&self, config: &Config, model: &ModelRegistryEntry) -> Option<Arc<dyn ProviderAdapter>> {
        let provider = config.provider(&model.provider)?;
        Some(Arc::new(HttpProviderAdapter::new(
            config.http_client().clone(),
            provider.base_url.clone(),
            provider.api_key.clone(),
        )))
    }
}

/// Test adapter source backing every candidate with a single shared
/// [`ScriptedAdapter`], so the engine's retry/wait loop can be exercised
/// without network I/O.
#[derive(Clone)]
pub struct ScriptedAdapterSource {
    pub adapter: Arc<ScriptedAdapter>,
}

impl ScriptedAdapterSource {
    pub fn new() -> Self {
        Self {
            adapter: Arc::new(ScriptedAdapter::new()),
        }
    }
}

impl Default for ScriptedAdapterSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterSource for ScriptedAdapterSource {
    fn adapter_for(&self, _config: &Config, _model: &ModelRegistryEntry) -> Option<Arc<dyn ProviderAdapter>> {
        Some(self.adapter.clone())
    }
}

// ============================================================================
// Shared application state + per-request dependency bundle
// ============================================================================

/// Shared application state threaded through Axum handlers. `config` is
/// behind a `parking_lot::RwLock` so an admin reload can swap the snapshot
/// by pointer without disturbing in-flight requests, which each clone the
/// `Arc<ConfigInner>` once at request start.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<Config>>,
    pub config_path: Arc<String>,
    pub health: Arc<HealthStore>,
    pub budget: Arc<BudgetStore>,
    pub session: Arc<SessionStore>,
    pub adapters: Arc<dyn AdapterSource>,
    pub active_stream: Arc<AtomicI64>,
    pub active_nonstream: Arc<AtomicI64>,
}

/// The dependency bundle the engine operates against: a config snapshot
/// plus the three stores and the adapter source. Cheap to clone (all `Arc`
/// or `Arc`-backed) so it can be moved into a spawned streaming task.
#[derive(Clone)]
pub struct RouterDeps {
    pub config: Config,
    pub health: Arc<HealthStore>,
    pub budget: Arc<BudgetStore>,
    pub session: Arc<SessionStore>,
    pub adapters: Arc<dyn AdapterSource>,
}

impl RouterDeps {
    pub fn from_state(state: &AppState) -> Self {
        Self {
            config: state.config.read().clone(),
            health: state.health.clone(),
            budget: state.budget.clone(),
            session: state.session.clone(),
            adapters: state.adapters.clone(),
        }
    }

    fn adapter_for(&self, model: &ModelRegistryEntry) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.adapter_for(&self.config, model)
    }

    fn judge_adapter(&self) -> Option<Arc<dyn ProviderAdapter>> {
        let judge = self.config.judge_config()?;
        let model = self.config.model(&judge.model_id)?;
        self.adapter_for(model)
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// A complete, already-evaluated response.
#[derive(Debug, Clone)]
pub struct BufferedResult {
    pub task_type: TaskType,
    pub model_id: String,
    pub text: String,
    pub tool_calls: Option<Value>,
    pub score: f64,
    pub attempts: Vec<AttemptRecord>,
    pub resumed: bool,
}

/// A live provider stream forwarded to the client in real time; evaluation
/// and accounting happen post-hoc once the stream ends.
pub struct PassthroughResult {
    pub task_type: TaskType,
    pub model_id: String,
    pub provider: String,
    pub prompt_messages: Vec<Message>,
    pub stream: BoxStream<'static, Result<String, crate::error::AdapterError>>,
}

pub enum RouteOutcome {
    Buffered(BufferedResult),
    Passthrough(PassthroughResult),
}

// ============================================================================
// Candidate filtering, scoring, ordering
// ============================================================================

fn filter_candidates(deps: &RouterDeps, policy: &RoutingPolicy, task: TaskType, now: i64) -> Vec<ModelRegistryEntry> {
    deps.config
        .models()
        .filter(|m| m.enabled)
        .filter(|m| policy.preferred.is_empty() || policy.preferred.iter().any(|p| p == &m.id))
        .filter(|m| m.capability(task) >= policy.min_capability)
        .filter(|m| !deps.health.get(&m.id).in_cooldown(now))
        .filter(|m| !deps.budget.get(&m.provider).at_hard_limit())
        .cloned()
        .collect()
}

/// Score and sort survivors descending, tie-broken by position in the
/// preferred list (absent means last). Achieved by presenting candidates
/// to the scorer's stable sort already ordered by preferred position, so
/// equal scores retain that relative order.
fn order_candidates(
    deps: &RouterDeps,
    policy: &RoutingPolicy,
    candidates: Vec<ModelRegistryEntry>,
    task: TaskType,
    weights: &ScoreWeights,
    now: i64,
) -> Vec<ModelRegistryEntry> {
    let mut by_preference = candidates;
    by_preference.sort_by_key(|m| {
        policy
            .preferred
            .iter()
            .position(|p| p == &m.id)
            .unwrap_or(usize::MAX)
    });

    let triples: Vec<(ModelRegistryEntry, ModelHealth, crate::budget::ProviderBudget)> = by_preference
        .into_iter()
        .map(|m| {
            let h = deps.health.get(&m.id);
            let b = deps.budget.get(&m.provider);
            (m, h, b)
        })
        .collect();

    let ranked = scorer::rank_models(&triples, task, weights, now);
    ranked
        .into_iter()
        .filter_map(|(id, _)| triples.iter().find(|(m, _, _)| m.id == id).map(|(m, _, _)| m.clone()))
        .collect()
}

// ============================================================================
// Rate-limit cooldown
// ============================================================================

/// `min(BASE·2^(strikes-1), CAP)`, BASE=2s, CAP=60s.
fn rate_limit_cooldown_ms(strikes: u32) -> i64 {
    const BASE_MS: i64 = 2_000;
    const CAP_MS: i64 = 60_000;
    let exponent = strikes.saturating_sub(1).min(16);
    (BASE_MS.saturating_mul(1i64 << exponent)).min(CAP_MS)
}

// ============================================================================
// Exception dispatch
// ============================================================================

async fn handle_adapter_error(
    deps: &RouterDeps,
    model: &ModelRegistryEntry,
    err: crate::error::AdapterError,
    request_id: &str,
    task: TaskType,
) {
    use crate::error::AdapterError;

    let now = health::now_ms();
    let outcome = match &err {
        AdapterError::RateLimit { retry_after } => {
            let strikes = deps.health.next_strike_count(&model.id, now);
            let cooldown_ms = retry_after
                .map(|d| d.as_millis() as i64)
                .unwrap_or_else(|| rate_limit_cooldown_ms(strikes));
            deps.health.mark_rate_limited(&model.id, cooldown_ms, strikes, now);
            deps.health.record_result(&model.id, false, None);
            metrics::record_rate_limit_hit(&model.id);
            warn!(model_id = %model.id, cooldown_ms, strikes, "model rate limited");
            AttemptOutcome::RateLimit
        }
        AdapterError::QuotaExceeded => {
            deps.health.record_result(&model.id, false, None);
            AttemptOutcome::Quota
        }
        AdapterError::Transient(msg) => {
            deps.health.record_result(&model.id, false, None);
            debug!(model_id = %model.id, error = %msg, "transient provider error");
            AttemptOutcome::Transient
        }
        AdapterError::Permanent { message, .. } => {
            if err.is_context_length_exceeded() {
                deps.health
                    .mark_degraded(&model.id, deps.config.degrade().context_length_exceeded_ms, now);
            }
            deps.health.record_result(&model.id, false, None);
            warn!(model_id = %model.id, error = %message, "permanent provider error");
            AttemptOutcome::Permanent
        }
        AdapterError::Other(e) => {
            deps.health.record_result(&model.id, false, None);
            warn!(model_id = %model.id, error = %e, "unexpected adapter error");
            AttemptOutcome::Permanent
        }
    };

    metrics::record_model_call(&model.id, outcome_label(outcome));
    deps.session.record_attempt(
        request_id,
        task.as_str(),
        AttemptRecord {
            model_id: model.id.clone(),
            outcome,
            score: None,
        },
    );
}

fn outcome_label(outcome: AttemptOutcome) -> &'static str {
    match outcome {
        AttemptOutcome::Success => "success",
        AttemptOutcome::EvalFail => "eval_fail",
        AttemptOutcome::RateLimit => "rate_limit",
        AttemptOutcome::Transient => "transient",
        AttemptOutcome::Quota => "quota",
        AttemptOutcome::Permanent => "permanent",
    }
}

// ============================================================================
// Per-candidate attempt
// ============================================================================

enum AttemptStep {
    Success(BufferedResult),
    Passthrough(PassthroughResult),
    Continue,
}

#[allow(clippy::too_many_arguments)]
async fn attempt_candidate(
    deps: &RouterDeps,
    request: &RouterRequest,
    task: TaskType,
    threshold: f64,
    model: &ModelRegistryEntry,
    cancel: CancellationToken,
) -> AttemptStep {
    let max_output = request.max_tokens.unwrap_or(model.max_output_tokens);
    let fit: FitResult = match context::fit_context(&request.messages, max_output, model.context_window as i64) {
        Some(fit) => fit,
        None => {
            deps.session.record_attempt(
                &request.request_id,
                task.as_str(),
                AttemptRecord {
                    model_id: model.id.clone(),
                    outcome: AttemptOutcome::Permanent,
                    score: None,
                },
            );
            metrics::record_model_call(&model.id, "permanent");
            debug!(model_id = %model.id, "context does not fit, skipping candidate");
            return AttemptStep::Continue;
        }
    };

    let Some(adapter) = deps.adapter_for(model) else {
        warn!(model_id = %model.id, provider = %model.provider, "no adapter available for provider, skipping candidate");
        deps.session.record_attempt(
            &request.request_id,
            task.as_str(),
            AttemptRecord {
                model_id: model.id.clone(),
                outcome: AttemptOutcome::Permanent,
                score: None,
            },
        );
        return AttemptStep::Continue;
    };

    if request.stream && request.allow_degrade {
        return match adapter
            .stream(&model.backend, &fit.messages, request.temperature, request.top_p, request.max_tokens, cancel)
            .await
        {
            Ok(stream) => AttemptStep::Passthrough(PassthroughResult {
                task_type: task,
                model_id: model.id.clone(),
                provider: model.provider.clone(),
                prompt_messages: fit.messages,
                stream,
            }),
            Err(e) => {
                handle_adapter_error(deps, model, e, &request.request_id, task).await;
                AttemptStep::Continue
            }
        };
    }

    let attempt_start = Instant::now();
    let result = adapter
        .generate(
            &model.backend,
            &fit.messages,
            request.temperature,
            request.top_p,
            request.max_tokens,
            request.tools.as_ref(),
            cancel,
        )
        .await;
    let latency_ms = attempt_start.elapsed().as_millis() as f64;

    let resp: NormalizedResponse = match result {
        Ok(resp) => resp,
        Err(e) => {
            handle_adapter_error(deps, model, e, &request.request_id, task).await;
            return AttemptStep::Continue;
        }
    };

    metrics::record_attempt_latency_ms(&model.id, latency_ms);

    let has_tool_calls = resp.has_tool_calls();
    let evaluator = Evaluator::new(deps.config.code_eval_config(), deps.config.judge_config());
    let judge_adapter = deps.judge_adapter();
    let eval = evaluator
        .evaluate(&resp.text, task, has_tool_calls, threshold, &model.id, judge_adapter.as_deref())
        .await;
    metrics::record_eval_score(task.as_str(), eval.score);

    let accept = request.allow_degrade || eval.score >= threshold;
    if !accept {
        deps.health.record_result(&model.id, false, Some(latency_ms));
        deps.health
            .mark_degraded(&model.id, deps.config.degrade().eval_fail_ms, health::now_ms());
        metrics::record_model_call(&model.id, "eval_fail");
        deps.session.record_attempt(
            &request.request_id,
            task.as_str(),
            AttemptRecord {
                model_id: model.id.clone(),
                outcome: AttemptOutcome::EvalFail,
                score: Some(eval.score),
            },
        );
        return AttemptStep::Continue;
    }

    deps.health.record_result(&model.id, true, Some(latency_ms));
    metrics::record_model_call(&model.id, "success");
    deps.session.record_attempt(
        &request.request_id,
        task.as_str(),
        AttemptRecord {
            model_id: model.id.clone(),
            outcome: AttemptOutcome::Success,
            score: Some(eval.score),
        },
    );

    if let Some(usage) = &resp.usage {
        if usage.total_tokens > 0 {
            deps.budget.record(&model.provider, usage.total_tokens);
        }
    } else {
        let prompt_tokens = context::estimate_tokens(&fit.messages, 0);
        let output_tokens = budget::estimate_tokens(&resp.text);
        deps.budget.record(&model.provider, prompt_tokens + output_tokens);
    }
    metrics::set_budget_used_tokens(&model.provider, deps.budget.get(&model.provider).used_tokens);

    deps.session
        .record_result(&request.request_id, task.as_str(), &model.id, &resp.text);

    let session = deps.session.get(&request.request_id);
    AttemptStep::Success(BufferedResult {
        task_type: task,
        model_id: model.id.clone(),
        text: resp.text,
        tool_calls: resp.tool_calls,
        score: eval.score,
        attempts: session.map(|s| s.attempts).unwrap_or_default(),
        resumed: false,
    })
}

/// Evaluation + accounting run once a passthrough stream completes; the
/// client has already received the text.
pub async fn finalize_passthrough(
    deps: &RouterDeps,
    request_id: &str,
    task: TaskType,
    model_id: &str,
    provider: &str,
    prompt_messages: &[Message],
    text: &str,
    threshold: f64,
) {
    let evaluator = Evaluator::new(deps.config.code_eval_config(), None);
    let eval = evaluator.evaluate(text, task, false, threshold, model_id, None).await;
    metrics::record_eval_score(task.as_str(), eval.score);

    deps.health.record_result(model_id, true, None);
    metrics::record_model_call(model_id, "success");
    deps.session.record_attempt(
        request_id,
        task.as_str(),
        AttemptRecord {
            model_id: model_id.to_string(),
            outcome: AttemptOutcome::Success,
            score: Some(eval.score),
        },
    );
    deps.session.record_result(request_id, task.as_str(), model_id, text);

    let prompt_tokens = context::estimate_tokens(prompt_messages, 0);
    let output_tokens = budget::estimate_tokens(text);
    deps.budget.record(provider, prompt_tokens + output_tokens);
    metrics::set_budget_used_tokens(provider, deps.budget.get(provider).used_tokens);
}

async fn sleep_until_deadline_or_interval(poll_interval_ms: u64, deadline: Instant) {
    let now = Instant::now();
    if now >= deadline {
        return;
    }
    let remaining = deadline - now;
    tokio::time::sleep(Duration::from_millis(poll_interval_ms).min(remaining)).await;
}

// ============================================================================
// Main loop
// ============================================================================

/// Run the filter->score->attempt->retry/poll loop to completion or
/// deadline. Resume is checked first and, if a complete session exists,
/// short-circuits with no adapter call.
pub async fn route(request: RouterRequest, deps: &RouterDeps) -> Result<RouteOutcome, RouterError> {
    let task = task_type::resolve_task_type(&request.messages, request.task_type);

    if request.resume {
        if let Some(session) = deps.session.get(&request.request_id) {
            if session.status == SessionStatus::Complete {
                if let (Some(model_id), Some(text)) = (session.model_id.clone(), session.response_text.clone()) {
                    info!(request_id = %request.request_id, model_id, "resumed completed session");
                    return Ok(RouteOutcome::Buffered(BufferedResult {
                        task_type: task,
                        model_id,
                        text,
                        tool_calls: None,
                        score: 1.0,
                        attempts: session.attempts,
                        resumed: true,
                    }));
                }
            }
        }
    }

    let policy = deps.config.policy(task).clone();
    let threshold = if request.quality_threshold > 0.0 {
        request.quality_threshold
    } else {
        policy.quality_threshold
    };
    let max_wait_ms = if request.max_wait_ms > 0 {
        request.max_wait_ms
    } else {
        policy.max_wait_ms
    };
    let attempt_budget = if request.attempt_budget > 0 {
        request.attempt_budget
    } else {
        policy.max_attempts
    };
    let weights = policy.weights.clone().unwrap_or_default();

    let overall_start = Instant::now();
    let deadline = overall_start + Duration::from_millis(max_wait_ms);

    let cancel = CancellationToken::new();
    let cancel_for_deadline = cancel.clone();
    tokio::spawn(async move {
        let now = Instant::now();
        if deadline > now {
            tokio::time::sleep(deadline - now).await;
        }
        cancel_for_deadline.cancel();
    });

    let mut cycles: u32 = 0;
    loop {
        if Instant::now() >= deadline {
            metrics::record_wait_time_ms("timeout", overall_start.elapsed().as_millis() as f64);
            metrics::record_cycles(task.as_str(), cycles);
            return Err(RouterError::NoSuitableModel { retry_after_ms: 10_000 });
        }

        cycles += 1;
        let now = health::now_ms();
        let candidates = filter_candidates(deps, &policy, task, now);
        if candidates.is_empty() {
            sleep_until_deadline_or_interval(policy.poll_interval_ms, deadline).await;
            continue;
        }

        let ordered = order_candidates(deps, &policy, candidates, task, &weights, now);
        let mut result: Option<AttemptStep> = None;

        for model in ordered.iter().take(attempt_budget.max(1)) {
            if Instant::now() >= deadline {
                break;
            }
            match attempt_candidate(deps, &request, task, threshold, model, cancel.clone()).await {
                AttemptStep::Continue => continue,
                success_or_stream => {
                    result = Some(success_or_stream);
                    break;
                }
            }
        }

        match result {
            Some(AttemptStep::Success(buffered)) => {
                metrics::record_wait_time_ms("success", overall_start.elapsed().as_millis() as f64);
                metrics::record_cycles(task.as_str(), cycles);
                return Ok(RouteOutcome::Buffered(buffered));
            }
            Some(AttemptStep::Passthrough(passthrough)) => {
                metrics::record_cycles(task.as_str(), cycles);
                return Ok(RouteOutcome::Passthrough(passthrough));
            }
            _ => {
                sleep_until_deadline_or_interval(policy.poll_interval_ms, deadline).await;
            }
        }
    }
}

// ============================================================================
// HTTP surface
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RawMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionsBody {
    #[serde(default)]
    pub messages: Vec<RawMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Option<Value>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ResponsesInput {
    Text(String),
    Messages(Vec<RawMessage>),
}

#[derive(Debug, Deserialize)]
pub struct ResponsesBody {
    pub input: ResponsesInput,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
}

fn role_from_str(s: &str) -> crate::types::Role {
    use crate::types::Role;
    match s {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        _ => Role::User,
    }
}

fn normalize_messages(raw: Vec<RawMessage>) -> Vec<Message> {
    raw.into_iter()
        .map(|m| Message {
            role: role_from_str(&m.role),
            content: crate::types::flatten_content(&m.content),
            tool_call_id: m.tool_call_id,
        })
        .collect()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_bool(headers: &HeaderMap, name: &str) -> bool {
    matches!(header_str(headers, name), Some("true") | Some("1"))
}

/// `x-router-quality-threshold`: 0-1 passes through, 1-5 is divided by 5.
fn parse_quality_threshold(headers: &HeaderMap) -> Option<f64> {
    let raw: f64 = header_str(headers, "x-router-quality-threshold")?.parse().ok()?;
    if raw > 1.0 {
        Some((raw / 5.0).clamp(0.0, 1.0))
    } else {
        Some(raw.clamp(0.0, 1.0))
    }
}

fn generate_request_id() -> String {
    static COUNTER: AtomicI64 = AtomicI64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("req-{}-{}", health::now_ms(), n)
}

struct RequestMeta {
    request_id: String,
    debug: bool,
    resume_requested: bool,
    admin_token: Option<String>,
}

fn request_meta(headers: &HeaderMap) -> RequestMeta {
    RequestMeta {
        request_id: header_str(headers, "x-router-request-id")
            .map(|s| s.to_string())
            .unwrap_or_else(generate_request_id),
        debug: header_bool(headers, "x-router-debug"),
        resume_requested: header_bool(headers, "x-router-resume"),
        admin_token: header_str(headers, "x-router-admin-token").map(|s| s.to_string()),
    }
}

/// Resume is admin-only unless `ALLOW_INSECURE_RESUME` is set.
fn resume_authorized(config: &Config, meta: &RequestMeta) -> bool {
    if !meta.resume_requested {
        return true;
    }
    if config.allow_insecure_resume() {
        return true;
    }
    match (config.admin_token(), meta.admin_token.as_deref()) {
        (Some(expected), Some(provided)) => expected == provided,
        _ => false,
    }
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let body = json!({ "error": { "code": code, "message": message.into() } });
    (status, Json(body)).into_response()
}

fn no_suitable_model_response(retry_after_ms: u64) -> Response {
    let body = json!({ "error": { "code": "no_suitable_model_available", "retry_after_ms": retry_after_ms } });
    (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
}

struct ActiveGuard {
    counter: Arc<AtomicI64>,
    stream: bool,
}

impl ActiveGuard {
    fn start(state: &AppState, stream: bool) -> Self {
        let counter = if stream {
            state.active_stream.clone()
        } else {
            state.active_nonstream.clone()
        };
        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active_requests(stream, count);
        Self { counter, stream }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let count = self.counter.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_active_requests(self.stream, count.max(0));
    }
}

/// Debug-mode attempt log attached as the body's `router` field.
fn debug_router_field(result: &BufferedResult) -> serde_json::Value {
    json!({
        "task_type": result.task_type.as_str(),
        "score": result.score,
        "resumed": result.resumed,
        "attempts": result.attempts,
    })
}

/// Debug-mode summary mirrored into the base64 `x-router-metadata` header.
fn debug_metadata_header(model_id: &str, result: &BufferedResult) -> Option<axum::http::HeaderValue> {
    let metadata = json!({
        "task_type": result.task_type.as_str(),
        "model_id": model_id,
        "score": result.score,
        "attempts": result.attempts,
    });
    let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, metadata.to_string());
    axum::http::HeaderValue::from_str(&encoded).ok()
}

/// Builds a JSON response, attaching the debug `router` field to `body`
/// and the `x-router-metadata` header when debug mode was requested.
fn json_response_with_debug(mut body: serde_json::Value, model_id: &str, result: &BufferedResult, debug: bool) -> Response {
    if debug {
        body["router"] = debug_router_field(result);
    }
    let mut response = (StatusCode::OK, Json(body)).into_response();
    if debug {
        if let Some(value) = debug_metadata_header(model_id, result) {
            response.headers_mut().insert("x-router-metadata", value);
        }
    }
    response
}

fn chat_completion_json(request_id: &str, model_id: &str, result: &BufferedResult, debug: bool) -> Response {
    let finish_reason = if result.tool_calls.is_some() { "tool_calls" } else { "stop" };
    let mut message = json!({
        "role": "assistant",
        "content": result.text,
    });
    if let Some(tool_calls) = &result.tool_calls {
        message["tool_calls"] = tool_calls.clone();
    }

    let body = json!({
        "id": request_id,
        "object": "chat.completion",
        "created": health::now_ms() / 1000,
        "model": model_id,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
    });

    json_response_with_debug(body, model_id, result, debug)
}

/// Buffered-then-streamed rendering: chunk the already-evaluated text at
/// `streaming.chunkSize` with `streaming.chunkDelayMs` per chunk.
fn buffered_sse_response(request_id: String, model_id: String, text: String, chunk_size: usize, chunk_delay_ms: u64) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(16);

    tokio::spawn(async move {
        for chunk in sse::chunk_text(&text, chunk_size) {
            let payload = json!({
                "id": request_id,
                "object": "chat.completion.chunk",
                "model": model_id,
                "choices": [{ "index": 0, "delta": { "content": chunk } }],
            });
            let frame = sse::format_sse_chunk(&payload);
            if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                return;
            }
            if chunk_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(chunk_delay_ms)).await;
            }
        }
        let _ = tx.send(Ok(Bytes::from(sse::SSE_DONE))).await;
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
        .header(axum::http::header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap()
}

/// Passthrough rendering: forward provider deltas live, then finalize
/// evaluation/accounting once the stream ends.
fn passthrough_sse_response(
    deps: RouterDeps,
    request_id: String,
    threshold: f64,
    result: PassthroughResult,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    let PassthroughResult {
        task_type,
        model_id,
        provider,
        prompt_messages,
        mut stream,
    } = result;

    tokio::spawn(async move {
        let mut accumulated = String::new();
        loop {
            match stream.next().await {
                Some(Ok(delta)) => {
                    accumulated.push_str(&delta);
                    let payload = json!({
                        "id": request_id,
                        "object": "chat.completion.chunk",
                        "model": model_id,
                        "choices": [{ "index": 0, "delta": { "content": delta } }],
                    });
                    let frame = sse::format_sse_chunk(&payload);
                    if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    warn!(model_id, error = %e, "passthrough stream error, finalizing with partial text");
                    break;
                }
                None => break,
            }
        }

        finalize_passthrough(
            &deps,
            &request_id,
            task_type,
            &model_id,
            &provider,
            &prompt_messages,
            &accumulated,
            threshold,
        )
        .await;
        let _ = tx.send(Ok(Bytes::from(sse::SSE_DONE))).await;
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
        .header(axum::http::header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap()
}

async fn render_outcome(
    state: &AppState,
    deps: RouterDeps,
    request_id: String,
    threshold: f64,
    stream_requested: bool,
    debug: bool,
    outcome: RouteOutcome,
) -> Response {
    match outcome {
        RouteOutcome::Buffered(result) => {
            let model_id = result.model_id.clone();
            // Tool calls force non-streaming delivery regardless of the
            // request's stream flag.
            if stream_requested && result.tool_calls.is_none() {
                let streaming_cfg = deps.config.streaming().clone();
                buffered_sse_response(request_id, model_id, result.text, streaming_cfg.chunk_size, streaming_cfg.chunk_delay_ms)
            } else {
                chat_completion_json(&request_id, &model_id, &result, debug)
            }
        }
        RouteOutcome::Passthrough(result) => {
            let _ = state;
            passthrough_sse_response(deps, request_id, threshold, result)
        }
    }
}

/// `POST /v1/chat/completions`.
pub async fn chat_completions_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatCompletionsBody>,
) -> Response {
    let _guard = ActiveGuard::start(&state, body.stream);
    let deps = RouterDeps::from_state(&state);
    let meta = request_meta(&headers);

    if !resume_authorized(&deps.config, &meta) {
        return error_response(StatusCode::FORBIDDEN, "resume_not_authorized", "resume requires a valid admin token");
    }

    if body.messages.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "invalid_request", "messages must not be empty");
    }

    let messages = normalize_messages(body.messages);
    let explicit_task = header_str(&headers, "x-router-task-type").and_then(task_type::resolve_explicit);
    let quality_threshold = parse_quality_threshold(&headers).unwrap_or(0.0);
    let max_wait_ms = header_str(&headers, "x-router-max-wait-ms")
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    let allow_degrade = header_bool(&headers, "x-router-allow-degrade");

    let request = RouterRequest {
        request_id: meta.request_id.clone(),
        messages,
        task_type: explicit_task,
        quality_threshold,
        max_wait_ms,
        attempt_budget: 0,
        temperature: body.temperature,
        top_p: body.top_p,
        max_tokens: body.max_tokens,
        stream: body.stream,
        allow_degrade,
        resume: meta.resume_requested,
        tools: body.tools,
        tool_choice: body.tool_choice,
    };

    let policy = deps.config.policy(task_type::resolve_task_type(&request.messages, request.task_type)).clone();
    let effective_threshold = if quality_threshold > 0.0 { quality_threshold } else { policy.quality_threshold };

    match route(request, &deps).await {
        Ok(outcome) => render_outcome(&state, deps, meta.request_id, effective_threshold, body.stream, meta.debug, outcome).await,
        Err(RouterError::NoSuitableModel { retry_after_ms }) => no_suitable_model_response(retry_after_ms),
        Err(RouterError::ContextDoesNotFit) => {
            error_response(StatusCode::BAD_REQUEST, "context_does_not_fit", "no candidate model could fit the supplied messages")
        }
        Err(RouterError::Store(e)) => {
            warn!(error = %e, "store error while routing request");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error")
        }
    }
}

/// `POST /v1/responses`: same routing, Responses-shaped body; streaming is
/// rejected with 400.
pub async fn responses_handler(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<ResponsesBody>) -> Response {
    if body.stream {
        return error_response(StatusCode::BAD_REQUEST, "streaming_not_supported", "/v1/responses does not support streaming");
    }

    let messages = match body.input {
        ResponsesInput::Text(text) => vec![Message::user(text)],
        ResponsesInput::Messages(raw) => normalize_messages(raw),
    };
    if messages.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "invalid_request", "input must not be empty");
    }

    let _guard = ActiveGuard::start(&state, false);
    let deps = RouterDeps::from_state(&state);
    let meta = request_meta(&headers);

    if !resume_authorized(&deps.config, &meta) {
        return error_response(StatusCode::FORBIDDEN, "resume_not_authorized", "resume requires a valid admin token");
    }

    let explicit_task = header_str(&headers, "x-router-task-type").and_then(task_type::resolve_explicit);
    let quality_threshold = parse_quality_threshold(&headers).unwrap_or(0.0);
    let max_wait_ms = header_str(&headers, "x-router-max-wait-ms")
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let request = RouterRequest {
        request_id: meta.request_id.clone(),
        messages,
        task_type: explicit_task,
        quality_threshold,
        max_wait_ms,
        attempt_budget: 0,
        temperature: body.temperature,
        top_p: body.top_p,
        max_tokens: body.max_tokens,
        stream: false,
        allow_degrade: header_bool(&headers, "x-router-allow-degrade"),
        resume: meta.resume_requested,
        tools: None,
        tool_choice: None,
    };

    match route(request, &deps).await {
        Ok(RouteOutcome::Buffered(result)) => {
            let model_id = result.model_id.clone();
            let body = json!({
                "id": meta.request_id,
                "object": "response",
                "model": model_id,
                "output_text": result.text,
            });
            json_response_with_debug(body, &model_id, &result, meta.debug)
        }
        Ok(RouteOutcome::Passthrough(_)) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "passthrough is not valid for a non-streaming request")
        }
        Err(RouterError::NoSuitableModel { retry_after_ms }) => no_suitable_model_response(retry_after_ms),
        Err(RouterError::ContextDoesNotFit) => {
            error_response(StatusCode::BAD_REQUEST, "context_does_not_fit", "no candidate model could fit the supplied messages")
        }
        Err(RouterError::Store(e)) => {
            warn!(error = %e, "store error while routing request");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error")
        }
    }
}

pub async fn health_handler() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    reloaded: bool,
}

/// Admin reload: replaces the registry/policy snapshot by pointer swap.
/// Gated the same way resume is.
pub async fn admin_reload_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let current = state.config.read().clone();
    let expected = current.admin_token();
    let provided = header_str(&headers, "x-router-admin-token");
    if expected.is_some() && expected != provided {
        return error_response(StatusCode::FORBIDDEN, "unauthorized", "invalid admin token");
    }

    match Config::from_file(&state.config_path) {
        Ok(new_config) => {
            crate::budget::seed_budget_limits(&new_config, &state.budget);
            *state.config.write() = new_config;
            info!(path = %state.config_path, "config reloaded");
            (StatusCode::OK, Json(ReloadResponse { reloaded: true })).into_response()
        }
        Err(e) => {
            warn!(error = %e, "config reload failed, keeping previous snapshot");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "reload_failed", e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelRegistryEntry, ProviderConfig};
    use crate::db::Database;
    use std::collections::HashMap;

    fn deps_with(models: Vec<ModelRegistryEntry>, providers: Vec<ProviderConfig>) -> (RouterDeps, ScriptedAdapterSource) {
        let file = crate::config::ConfigFile {
            models,
            providers,
            policies: HashMap::new(),
            streaming: crate::config::StreamingConfig::default(),
            code_eval: None,
            judge: None,
            degrade: crate::config::DegradeConfig::default(),
            port: 8080,
            host: "127.0.0.1".into(),
            db_path: ":memory:".into(),
            admin_token: None,
            allow_insecure_resume: false,
            api_timeout_ms: 5_000,
        };
        let config = Config::from_parsed_for_test(file);
        let adapters = ScriptedAdapterSource::new();
        let db = Arc::new(Database::open_in_memory().unwrap());
        (
            RouterDeps {
                config,
                health: Arc::new(HealthStore::new(db.clone())),
                budget: Arc::new(BudgetStore::new(db.clone())),
                session: Arc::new(SessionStore::new(db)),
                adapters: Arc::new(adapters.clone()),
            },
            adapters,
        )
    }

    fn model(id: &str, provider: &str) -> ModelRegistryEntry {
        ModelRegistryEntry {
            id: id.to_string(),
            provider: provider.to_string(),
            backend: id.to_string(),
            context_window: 128_000,
            max_output_tokens: 4_096,
            capabilities: HashMap::from([("code".to_string(), 4), ("reasoning".to_string(), 4)]),
            cost_weight: 0.5,
            enabled: true,
        }
    }

    fn provider(name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            base_url: "http://example.invalid".to_string(),
            api_key: "test".to_string(),
            soft_limit_tokens: None,
            hard_limit_tokens: None,
        }
    }

    fn request(messages: Vec<Message>, max_wait_ms: u64) -> RouterRequest {
        RouterRequest {
            request_id: "req-test".to_string(),
            messages,
            task_type: Some(TaskType::Code),
            quality_threshold: 0.75,
            max_wait_ms,
            attempt_budget: 3,
            temperature: None,
            top_p: None,
            max_tokens: Some(256),
            stream: false,
            allow_degrade: false,
            resume: false,
            tools: None,
            tool_choice: None,
        }
    }

    #[tokio::test]
    async fn rate_limit_failover_prefers_healthy_candidate() {
        let (deps, adapters) = deps_with(
            vec![model("a", "openai"), model("b", "openai")],
            vec![provider("openai")],
        );
        adapters.adapter.script(
            "a",
            vec![crate::provider::ScriptedOutcome::Error(crate::provider::ScriptedError::RateLimit(Some(
                Duration::from_secs(10),
            )))],
        );
        adapters
            .adapter
            .script("b", vec![crate::provider::ScriptedOutcome::Text("```ts\nfn ok() {}\n```".to_string())]);

        let req = request(vec![Message::user("there is a bug, please fix")], 5_000);
        let outcome = route(req, &deps).await.unwrap();
        match outcome {
            RouteOutcome::Buffered(result) => {
                assert_eq!(result.model_id, "b");
                assert!(result.attempts.iter().any(|a| a.model_id == "a" && a.outcome == AttemptOutcome::RateLimit));
                assert!(result.attempts.last().unwrap().outcome == AttemptOutcome::Success);
            }
            RouteOutcome::Passthrough(_) => panic!("expected buffered result"),
        }
        assert!(deps.health.get("a").cooldown_until > health::now_ms());
    }

    #[tokio::test]
    async fn timeout_surfaces_no_suitable_model() {
        let (deps, adapters) = deps_with(vec![model("a", "openai")], vec![provider("openai")]);
        adapters.adapter.script("a", vec![crate::provider::ScriptedOutcome::Text("no".to_string())]);

        let mut req = request(vec![Message::user("there is a bug")], 20);
        req.quality_threshold = 0.95;
        let err = route(req, &deps).await.unwrap_err();
        match err {
            RouterError::NoSuitableModel { retry_after_ms } => assert_eq!(retry_after_ms, 10_000),
            other => panic!("expected NoSuitableModel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn budget_exclusion_skips_hard_limited_provider() {
        let (deps, adapters) = deps_with(
            vec![model("a", "openai"), model("b", "google")],
            vec![provider("openai"), provider("google")],
        );
        deps.budget.ensure_limits("openai", None, Some(10));
        deps.budget.record("openai", 10);
        adapters
            .adapter
            .script("b", vec![crate::provider::ScriptedOutcome::Text("```ts\nfn ok() {}\n```".to_string())]);

        let req = request(vec![Message::user("there is a bug")], 5_000);
        let outcome = route(req, &deps).await.unwrap();
        match outcome {
            RouteOutcome::Buffered(result) => assert_eq!(result.model_id, "b"),
            RouteOutcome::Passthrough(_) => panic!("expected buffered result"),
        }
    }

    #[tokio::test]
    async fn resume_returns_stored_response_without_adapter_call() {
        let (deps, _adapters) = deps_with(vec![model("a", "openai")], vec![provider("openai")]);
        deps.session.record_result("req-test", "code", "a", "cached answer");

        let mut req = request(vec![Message::user("there is a bug")], 5_000);
        req.resume = true;
        let outcome = route(req, &deps).await.unwrap();
        match outcome {
            RouteOutcome::Buffered(result) => {
                assert_eq!(result.text, "cached answer");
                assert!(result.resumed);
            }
            RouteOutcome::Passthrough(_) => panic!("expected buffered result"),
        }
    }

    #[test]
    fn cooldown_backoff_doubles_and_caps() {
        assert_eq!(rate_limit_cooldown_ms(1), 2_000);
        assert_eq!(rate_limit_cooldown_ms(2), 4_000);
        assert_eq!(rate_limit_cooldown_ms(6), 60_000);
    }

    #[test]
    fn quality_threshold_header_above_one_is_divided_by_five() {
        let mut headers = HeaderMap::new();
        headers.insert("x-router-quality-threshold", "4".parse().unwrap());
        assert_eq!(parse_quality_threshold(&headers), Some(0.8));
    }
}
