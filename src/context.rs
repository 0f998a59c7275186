//! Context-window fitter: estimates prompt token cost and trims the
//! oldest non-system messages until the estimate fits a model's context
//! window.

use crate::types::{Message, Role};

/// `ceil(totalChars/4) + maxOutputTokens`, with one separator char charged
/// between each adjacent pair of messages.
pub fn estimate_tokens(messages: &[Message], max_output_tokens: u32) -> i64 {
    if messages.is_empty() {
        return max_output_tokens as i64;
    }
    let total_chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
    let separators = messages.len().saturating_sub(1);
    let prompt_tokens = ((total_chars + separators) as f64 / 4.0).ceil() as i64;
    prompt_tokens + max_output_tokens as i64
}

#[derive(Debug, Clone)]
pub struct FitResult {
    pub messages: Vec<Message>,
    pub trimmed_count: usize,
}

/// Repeatedly drop the oldest non-system message until the estimate fits
/// `context_window`, or `None` once no non-system message remains.
pub fn fit_context(
    messages: &[Message],
    max_output_tokens: u32,
    context_window: i64,
) -> Option<FitResult> {
    let mut current = messages.to_vec();
    let mut trimmed_count = 0;

    loop {
        if estimate_tokens(&current, max_output_tokens) <= context_window {
            return Some(FitResult {
                messages: current,
                trimmed_count,
            });
        }

        let drop_idx = current.iter().position(|m| m.role != Role::System)?;
        current.remove(drop_idx);
        trimmed_count += 1;
    }
}
