//! Counters, gauges, and histograms consumed by the external `/metrics`
//! endpoint.

use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec, TextEncoder,
};

lazy_static! {
    /// One increment per finalized attempt, labeled by model id and outcome
    /// (`success|eval_fail|rate_limit|transient|quota|permanent`).
    static ref MODEL_CALLS_TOTAL: CounterVec = register_counter_vec!(
        "router_model_calls_total",
        "Total provider calls per model and outcome",
        &["model_id", "outcome"]
    )
    .unwrap();

    /// The evaluator's score for every attempted response, labeled by task
    /// type.
    static ref EVAL_SCORE_HISTOGRAM: HistogramVec = register_histogram_vec!(
        "router_eval_score",
        "Evaluator score distribution",
        &["task_type"],
        vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]
    )
    .unwrap();

    /// Overall per-request wall-clock wait until a response is accepted or
    /// the deadline is hit, labeled by outcome.
    static ref WAIT_TIME_MS_HISTOGRAM: HistogramVec = register_histogram_vec!(
        "router_wait_time_ms",
        "Wall-clock wait time per request in milliseconds",
        &["outcome"],
        vec![10.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0]
    )
    .unwrap();

    /// Rate-limit (429-class) hits per model, a leading indicator distinct
    /// from the generic call counter.
    static ref RATE_LIMIT_HITS_TOTAL: CounterVec = register_counter_vec!(
        "router_rate_limit_hits_total",
        "Rate limit responses observed per model",
        &["model_id"]
    )
    .unwrap();

    /// Per-candidate-per-request attempt latency, labeled by model id.
    /// The health store's rolling latency EMA feeds from the same
    /// observation.
    static ref ATTEMPT_LATENCY_MS_HISTOGRAM: HistogramVec = register_histogram_vec!(
        "router_attempt_latency_ms",
        "Per-attempt provider call latency in milliseconds",
        &["model_id"],
        vec![50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0]
    )
    .unwrap();

    /// Cumulative tokens recorded against a provider's budget.
    static ref BUDGET_USED_TOKENS: GaugeVec = register_gauge_vec!(
        "router_budget_used_tokens",
        "Cumulative tokens recorded against a provider budget",
        &["provider"]
    )
    .unwrap();

    /// Requests currently inside the router's filter/score/attempt/poll
    /// loop.
    static ref ACTIVE_REQUESTS: GaugeVec = register_gauge_vec!(
        "router_active_requests",
        "Requests currently being routed",
        &["stream"]
    )
    .unwrap();

    /// Cycles executed per request (one per filter/score/attempt pass)
    /// before a success or deadline expiry.
    static ref CYCLES_HISTOGRAM: HistogramVec = register_histogram_vec!(
        "router_cycles",
        "Filter/score/attempt cycles executed per request",
        &["task_type"],
        vec![1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0]
    )
    .unwrap();
}

pub fn record_model_call(model_id: &str, outcome: &str) {
    MODEL_CALLS_TOTAL.with_label_values(&[model_id, outcome]).inc();
}

pub fn record_eval_score(task_type: &str, score: f64) {
    EVAL_SCORE_HISTOGRAM.with_label_values(&[task_type]).observe(score);
}

pub fn record_wait_time_ms(outcome: &str, ms: f64) {
    WAIT_TIME_MS_HISTOGRAM.with_label_values(&[outcome]).observe(ms);
}

pub fn record_rate_limit_hit(model_id: &str) {
    RATE_LIMIT_HITS_TOTAL.with_label_values(&[model_id]).inc();
}

pub fn record_attempt_latency_ms(model_id: &str, ms: f64) {
    ATTEMPT_LATENCY_MS_HISTOGRAM.with_label_values(&[model_id]).observe(ms);
}

pub fn set_budget_used_tokens(provider: &str, used: i64) {
    BUDGET_USED_TOKENS.with_label_values(&[provider]).set(used as f64);
}

pub fn set_active_requests(stream: bool, count: i64) {
    let label = if stream { "true" } else { "false" };
    ACTIVE_REQUESTS.with_label_values(&[label]).set(count as f64);
}

pub fn record_cycles(task_type: &str, cycles: u32) {
    CYCLES_HISTOGRAM.with_label_values(&[task_type]).observe(cycles as f64);
}

/// `GET /metrics`: the external admin surface scrapes this handler. The
/// router engine itself never reads these back; they are write-only from
/// its perspective.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();

    ([("content-type", "text/plain; version=0.0.4")], buffer)
}
