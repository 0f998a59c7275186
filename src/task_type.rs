//! Task-type inference from the latest user message, used to pick a
//! routing policy when the caller doesn't supply an explicit override.

use crate::types::{Message, Role, TaskType};

const CODE_KEYWORDS: &[&str] = &[
    "stack trace",
    "error",
    "exception",
    "refactor",
    "implement",
    "bug",
    "typescript",
    "javascript",
];

const REWRITE_KEYWORDS: &[&str] = &["summarize", "rewrite", "rephrase", "tone", "polish"];

const RESEARCH_KEYWORDS: &[&str] = &["latest", "source", "compare", "research", "cite"];

fn any_keyword_matches(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

fn has_code_fence(text: &str) -> bool {
    text.contains("```")
}

/// Infer a task type from the most recent user message's lowercased text:
/// code (fence or keyword) → rewrite → research → otherwise reasoning.
pub fn infer_task_type(messages: &[Message]) -> TaskType {
    let raw = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default();
    let text = raw.to_lowercase();

    if has_code_fence(&raw) || any_keyword_matches(&text, CODE_KEYWORDS) {
        TaskType::Code
    } else if any_keyword_matches(&text, REWRITE_KEYWORDS) {
        TaskType::Rewrite
    } else if any_keyword_matches(&text, RESEARCH_KEYWORDS) {
        TaskType::Research
    } else {
        TaskType::Reasoning
    }
}

/// Resolve the effective task type: an explicit override always wins over
/// inference.
pub fn resolve_task_type(messages: &[Message], explicit: Option<TaskType>) -> TaskType {
    explicit.unwrap_or_else(|| infer_task_type(messages))
}

/// Parse a caller-supplied task-type header/body value, recognizing only
/// the known set; unknown values fall through to inference.
pub fn resolve_explicit(value: &str) -> Option<TaskType> {
    TaskType::parse(&value.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(content: &str) -> Message {
        Message {
            role: Role::User,
            content: content.to_string(),
            tool_call_id: None,
        }
    }

    #[test]
    fn code_fence_detected() {
        let messages = vec![user("```rust\nfn main() {}\n```")];
        assert_eq!(infer_task_type(&messages), TaskType::Code);
    }

    #[test]
    fn code_keyword_detected_without_fence() {
        let messages = vec![user("can you fix this bug in my code")];
        assert_eq!(infer_task_type(&messages), TaskType::Code);
    }

    #[test]
    fn rewrite_keywords_detected() {
        let messages = vec![user("please rewrite this paragraph for clarity")];
        assert_eq!(infer_task_type(&messages), TaskType::Rewrite);
    }

    #[test]
    fn research_keywords_detected() {
        let messages = vec![user("can you research the latest trends in batteries")];
        assert_eq!(infer_task_type(&messages), TaskType::Research);
    }

    #[test]
    fn unmatched_text_defaults_to_reasoning() {
        let messages = vec![user("hello there, how are you today")];
        assert_eq!(infer_task_type(&messages), TaskType::Reasoning);
    }

    #[test]
    fn ignores_trailing_assistant_message() {
        let messages = vec![
            user("there is a bug in this function"),
            Message {
                role: Role::Assistant,
                content: "let me research that for you".to_string(),
                tool_call_id: None,
            },
        ];
        assert_eq!(infer_task_type(&messages), TaskType::Code);
    }

    #[test]
    fn explicit_override_wins() {
        let messages = vec![user("there is a bug in this function")];
        assert_eq!(
            resolve_task_type(&messages, Some(TaskType::Research)),
            TaskType::Research
        );
    }

    #[test]
    fn code_checked_before_rewrite_and_research() {
        let messages = vec![user("please summarize this error and exception trace")];
        assert_eq!(infer_task_type(&messages), TaskType::Code);
    }
}
