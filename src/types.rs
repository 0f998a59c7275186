//! Shared domain types threaded between the HTTP surface, the provider
//! adapter, and the router engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single conversation message, normalized to flat text at the HTTP
/// boundary: a string or structured content parts collapse to
/// concatenated text, discarding non-text parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
        }
    }
}

/// Collapse a possibly-structured `content` JSON value (string, or an array
/// of `{type, text}` parts) to flat text.
pub fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Code,
    Rewrite,
    Research,
    Reasoning,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Code => "code",
            TaskType::Rewrite => "rewrite",
            TaskType::Research => "research",
            TaskType::Reasoning => "reasoning",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "code" => Some(TaskType::Code),
            "rewrite" => Some(TaskType::Rewrite),
            "research" => Some(TaskType::Research),
            "reasoning" => Some(TaskType::Reasoning),
            _ => None,
        }
    }
}

/// An incoming routed request, normalized from either HTTP surface.
#[derive(Debug, Clone)]
pub struct RouterRequest {
    pub request_id: String,
    pub messages: Vec<Message>,
    pub task_type: Option<TaskType>,
    pub quality_threshold: f64,
    pub max_wait_ms: u64,
    pub attempt_budget: usize,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stream: bool,
    pub allow_degrade: bool,
    pub resume: bool,
    pub tools: Option<Value>,
    pub tool_choice: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedResponse {
    pub text: String,
    pub tool_calls: Option<Value>,
    pub usage: Option<Usage>,
}

impl NormalizedResponse {
    pub fn has_tool_calls(&self) -> bool {
        matches!(&self.tool_calls, Some(Value::Array(a)) if !a.is_empty())
    }
}
