//! Heuristic quality scoring, optional executable code-test scoring,
//! optional judge-model hook.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::provider::ProviderAdapter;
use crate::types::{Message, TaskType};

const REFUSAL_PHRASES: &[&str] = &[
    "i can't",
    "i cannot",
    "i am not able",
    "i'm not able",
    "as an ai",
    "i do not have the ability",
    "i cannot comply",
    "unable to help",
];

fn code_fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```|^(---|\+\+\+|@@ )").unwrap())
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://\S+").unwrap())
}

#[derive(Debug, Clone, Default)]
pub struct EvalDetails {
    pub heuristic_score: f64,
    pub judged_score: Option<f64>,
    pub code_eval_ran: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EvalResult {
    pub score: f64,
    pub details: EvalDetails,
}

#[derive(Debug, Clone)]
pub struct CodeEvalConfig {
    pub command: String,
    pub weight: f64,
    pub failure_penalty: f64,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub model_id: String,
    pub min_score: Option<f64>,
}

/// Pure heuristic score over (text, taskType, hasToolCalls): no I/O, no
/// shared state, same inputs always produce the same score.
pub fn heuristic_score(text: &str, task: TaskType, has_tool_calls: bool) -> f64 {
    if text.is_empty() && !has_tool_calls {
        return 0.0;
    }

    let mut score = if has_tool_calls { 0.45 } else { 0.35 };
    let len = text.chars().count();

    if len >= 120 {
        score += 0.15;
    }
    if len >= 400 {
        score += 0.20;
    }
    if len < 40 {
        score -= 0.20;
    }

    let lower = text.to_lowercase();
    if REFUSAL_PHRASES.iter().any(|p| lower.contains(p)) {
        score -= 0.70;
    }

    match task {
        TaskType::Code => {
            if code_fence_re().is_match(text) {
                score += 0.25;
            } else if !has_tool_calls {
                score -= 0.30;
            }
            if ["src/", "lib/", "tests/"].iter().any(|p| text.contains(p))
                || [".ts", ".js", ".py", ".go"].iter().any(|ext| text.contains(ext))
            {
                score += 0.05;
            }
        }
        TaskType::Research => {
            if url_re().is_match(text) {
                score += 0.10;
            }
        }
        TaskType::Rewrite | TaskType::Reasoning => {}
    }

    score.clamp(0.0, 1.0)
}

/// Run a configured shell command with a hard-killed timeout; exit 0 adds
/// `weight`, non-zero subtracts `failure_penalty`.
async fn run_code_eval(config: &CodeEvalConfig, text: &str) -> f64 {
    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(&config.command)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "failed to spawn code-eval command");
            return -config.failure_penalty;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        use tokio::io::AsyncWriteExt;
        let _ = stdin.write_all(text.as_bytes()).await;
    }

    match tokio::time::timeout(config.timeout, child.wait()).await {
        Ok(Ok(status)) if status.success() => config.weight,
        Ok(Ok(_)) => -config.failure_penalty,
        Ok(Err(e)) => {
            warn!(error = %e, "code-eval command failed to run");
            -config.failure_penalty
        }
        Err(_) => {
            let _ = child.kill().await;
            debug!("code-eval command timed out, hard-killed");
            -config.failure_penalty
        }
    }
}

/// Parse the first `0(.d+)?|1(.0+)?` token out of a judge model's response.
/// Returns `None` on unparseable output; judge failures are best-effort.
fn parse_judge_score(text: &str) -> Option<f64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\b(0(?:\.\d+)?|1(?:\.0+)?)\b").unwrap());
    re.captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

pub struct Evaluator {
    code_eval: Option<CodeEvalConfig>,
    judge: Option<JudgeConfig>,
}

impl Evaluator {
    pub fn new(code_eval: Option<CodeEvalConfig>, judge: Option<JudgeConfig>) -> Self {
        Self { code_eval, judge }
    }

    /// `evaluate(text, request, codeEvalConfig?, {hasToolCalls}) -> {score, details}`.
    /// The judge hook, when configured, is consulted only when the
    /// heuristic score falls in the borderline band below threshold.
    #[allow(clippy::too_many_arguments)]
    pub async fn evaluate(
        &self,
        text: &str,
        task: TaskType,
        has_tool_calls: bool,
        threshold: f64,
        candidate_id: &str,
        adapter: Option<&dyn ProviderAdapter>,
    ) -> EvalResult {
        let mut score = heuristic_score(text, task, has_tool_calls);
        let mut details = EvalDetails {
            heuristic_score: score,
            ..Default::default()
        };

        if let Some(code_eval) = &self.code_eval {
            let delta = run_code_eval(code_eval, text).await;
            score = (score + delta).clamp(0.0, 1.0);
            details.code_eval_ran = true;
        }

        if let (Some(judge), Some(adapter)) = (&self.judge, adapter) {
            let min_score = judge.min_score.unwrap_or(threshold - 0.2);
            if score >= min_score && score < threshold && judge.model_id != candidate_id {
                if let Some(judged) = self.consult_judge(judge, text, adapter).await {
                    details.judged_score = Some(judged);
                    score = judged;
                }
            }
        }

        EvalResult { score, details }
    }

    async fn consult_judge(
        &self,
        judge: &JudgeConfig,
        text: &str,
        adapter: &dyn ProviderAdapter,
    ) -> Option<f64> {
        let prompt = format!(
            "Score the following response's quality from 0 to 1. Reply with only the number.\n\n{}",
            text
        );
        let messages = vec![Message::user(prompt)];
        let result = adapter
            .generate(
                &judge.model_id,
                &messages,
                None,
                None,
                None,
                None,
                tokio_util::sync::CancellationToken::new(),
            )
            .await;
        match result {
            Ok(resp) => parse_judge_score(&resp.text),
            Err(e) => {
                debug!(error = %e, "judge call failed, ignoring (best-effort)");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_without_tool_calls_scores_zero() {
        assert_eq!(heuristic_score("", TaskType::Reasoning, false), 0.0);
    }

    #[test]
    fn empty_text_with_tool_calls_scores_base() {
        assert_eq!(heuristic_score("", TaskType::Reasoning, true), 0.45);
    }

    #[test]
    fn long_text_scores_higher() {
        let short = heuristic_score(&"x".repeat(10), TaskType::Reasoning, false);
        let medium = heuristic_score(&"x".repeat(150), TaskType::Reasoning, false);
        let long = heuristic_score(&"x".repeat(500), TaskType::Reasoning, false);
        assert!(medium > short);
        assert!(long > medium);
    }

    #[test]
    fn refusal_phrase_penalized() {
        let text = "I cannot help with that request.";
        let score = heuristic_score(text, TaskType::Reasoning, false);
        assert!(score < 0.1);
    }

    #[test]
    fn code_task_rewards_fenced_block() {
        let with_fence = heuristic_score("```ts\nfn x() {}\n```", TaskType::Code, false);
        let without_fence = heuristic_score("just prose, no code here at all", TaskType::Code, false);
        assert!(with_fence > without_fence);
    }

    #[test]
    fn research_task_rewards_url() {
        let with_url = heuristic_score(
            "see https://example.com/docs for details and context",
            TaskType::Research,
            false,
        );
        let without_url = heuristic_score(
            "see the documentation for details and context here",
            TaskType::Research,
            false,
        );
        assert!(with_url > without_url);
    }

    #[test]
    fn score_is_clamped_to_unit_interval() {
        let score = heuristic_score(&"x".repeat(1000), TaskType::Code, false);
        assert!(score <= 1.0);
    }

    #[test]
    fn parse_judge_score_extracts_leading_decimal() {
        assert_eq!(parse_judge_score("0.82"), Some(0.82));
        assert_eq!(parse_judge_score("I'd say 1.0 out of 1"), Some(1.0));
        assert_eq!(parse_judge_score("no number here"), None);
    }

    #[tokio::test]
    async fn evaluate_is_pure_without_code_eval_or_judge() {
        let evaluator = Evaluator::new(None, None);
        let result = evaluator
            .evaluate("a plain reasonable answer of decent length here", TaskType::Reasoning, false, 0.75, "model-a", None)
            .await;
        let direct = heuristic_score("a plain reasonable answer of decent length here", TaskType::Reasoning, false);
        assert_eq!(result.score, direct);
        assert_eq!(result.details.heuristic_score, direct);
    }
}
