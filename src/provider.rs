//! Uniform provider adapter interface plus a generic OpenAI-Chat-
//! Completions-shaped HTTP adapter.
//!
//! The multi-vendor payload-shape quirks the teacher's `transform/*`
//! modules handle are out of scope here — one wire shape is enough to
//! exercise the routing engine against any configured base URL.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::AdapterError;
use crate::types::{Message, NormalizedResponse, Role, Usage};

/// Uniform capability set: generate, stream.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        messages: &[Message],
        temperature: Option<f32>,
        top_p: Option<f32>,
        max_tokens: Option<u32>,
        tools: Option<&serde_json::Value>,
        cancel: CancellationToken,
    ) -> Result<NormalizedResponse, AdapterError>;

    /// Lazy sequence of text deltas.
    async fn stream(
        &self,
        model: &str,
        messages: &[Message],
        temperature: Option<f32>,
        top_p: Option<f32>,
        max_tokens: Option<u32>,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<String, AdapterError>>, AdapterError>;
}

/// A single configured upstream (base URL + API key) speaking the OpenAI
/// Chat Completions wire format.
pub struct HttpProviderAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpProviderAdapter {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn body(
        &self,
        model: &str,
        messages: &[Message],
        temperature: Option<f32>,
        top_p: Option<f32>,
        max_tokens: Option<u32>,
        tools: Option<&serde_json::Value>,
        stream: bool,
    ) -> serde_json::Value {
        let messages: Vec<_> = messages
            .iter()
            .map(|m| {
                json!({
                    "role": role_str(m.role),
                    "content": m.content,
                    "tool_call_id": m.tool_call_id,
                })
            })
            .collect();
        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(t) = temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = top_p {
            body["top_p"] = json!(p);
        }
        if let Some(m) = max_tokens {
            body["max_tokens"] = json!(m);
        }
        if let Some(tools) = tools {
            body["tools"] = tools.clone();
        }
        body
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize, Default)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Default, Serialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
}

/// Classify a transport-level error / status code into the normalized
/// taxonomy.
async fn classify_error_response(resp: reqwest::Response) -> AdapterError {
    let status = resp.status();
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs);

    if status.as_u16() == 429 {
        return AdapterError::RateLimit { retry_after };
    }
    if status.as_u16() == 402 {
        return AdapterError::QuotaExceeded;
    }
    if status.is_server_error() {
        let text = resp.text().await.unwrap_or_default();
        return AdapterError::Transient(format!("{}: {}", status, text));
    }

    let text = resp.text().await.unwrap_or_default();
    if text.to_lowercase().contains("context_length_exceeded")
        || text.to_lowercase().contains("maximum context length")
    {
        return AdapterError::context_length_exceeded(text);
    }
    AdapterError::permanent(format!("{}: {}", status, text))
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    async fn generate(
        &self,
        model: &str,
        messages: &[Message],
        temperature: Option<f32>,
        top_p: Option<f32>,
        max_tokens: Option<u32>,
        tools: Option<&serde_json::Value>,
        cancel: CancellationToken,
    ) -> Result<NormalizedResponse, AdapterError> {
        let body = self.body(model, messages, temperature, top_p, max_tokens, tools, false);

        let send = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let resp = tokio::select! {
            result = send => result.map_err(|e| AdapterError::Transient(e.to_string()))?,
            _ = cancel.cancelled() => {
                return Err(AdapterError::Transient("request cancelled at deadline".to_string()));
            }
        };

        if !resp.status().is_success() {
            return Err(classify_error_response(resp).await);
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| AdapterError::Transient(format!("malformed response body: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::permanent("no choices in response"))?;

        Ok(NormalizedResponse {
            text: choice.message.content.unwrap_or_default(),
            tool_calls: choice.message.tool_calls,
            usage: parsed.usage.map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }

    async fn stream(
        &self,
        model: &str,
        messages: &[Message],
        temperature: Option<f32>,
        top_p: Option<f32>,
        max_tokens: Option<u32>,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<String, AdapterError>>, AdapterError> {
        use futures::StreamExt;

        let body = self.body(model, messages, temperature, top_p, max_tokens, None, true);
        let send = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let resp = tokio::select! {
            result = send => result.map_err(|e| AdapterError::Transient(e.to_string()))?,
            _ = cancel.cancelled() => {
                return Err(AdapterError::Transient("request cancelled at deadline".to_string()));
            }
        };

        if !resp.status().is_success() {
            return Err(classify_error_response(resp).await);
        }

        let deltas = crate::sse::decode_sse_deltas(resp.bytes_stream()).map(|frame| {
            frame.map_err(AdapterError::Transient)
        });
        Ok(Box::pin(deltas))
    }
}

/// Deterministic, scripted in-memory adapter used by tests to exercise the
/// router engine's retry/wait loop without network I/O.
#[derive(Clone)]
pub struct ScriptedAdapter {
    scripts: std::sync::Arc<parking_lot::Mutex<std::collections::HashMap<String, Vec<ScriptedOutcome>>>>,
}

#[derive(Clone)]
pub enum ScriptedOutcome {
    Text(String),
    ToolCall(serde_json::Value),
    Error(ScriptedError),
}

#[derive(Clone)]
pub enum ScriptedError {
    RateLimit(Option<Duration>),
    Quota,
    Transient,
    Permanent,
    ContextLengthExceeded,
}

impl Default for ScriptedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self {
            scripts: std::sync::Arc::new(parking_lot::Mutex::new(std::collections::HashMap::new())),
        }
    }

    /// Queue a sequence of outcomes for `model`; each call to `generate`
    /// pops the next one, repeating the last once exhausted.
    pub fn script(&self, model: &str, outcomes: Vec<ScriptedOutcome>) {
        self.scripts.lock().insert(model.to_string(), outcomes);
    }

    fn next_outcome(&self, model: &str) -> ScriptedOutcome {
        let mut scripts = self.scripts.lock();
        let queue = scripts
            .entry(model.to_string())
            .or_insert_with(|| vec![ScriptedOutcome::Text(String::new())]);
        if queue.len() > 1 {
            queue.remove(0)
        } else {
            queue[0].clone()
        }
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    async fn generate(
        &self,
        model: &str,
        _messages: &[Message],
        _temperature: Option<f32>,
        _top_p: Option<f32>,
        _max_tokens: Option<u32>,
        _tools: Option<&serde_json::Value>,
        _cancel: CancellationToken,
    ) -> Result<NormalizedResponse, AdapterError> {
        match self.next_outcome(model) {
            ScriptedOutcome::Text(text) => Ok(NormalizedResponse {
                text,
                tool_calls: None,
                usage: None,
            }),
            ScriptedOutcome::ToolCall(tool_calls) => Ok(NormalizedResponse {
                text: String::new(),
                tool_calls: Some(tool_calls),
                usage: None,
            }),
            ScriptedOutcome::Error(ScriptedError::RateLimit(retry_after)) => {
                Err(AdapterError::RateLimit { retry_after })
            }
            ScriptedOutcome::Error(ScriptedError::Quota) => Err(AdapterError::QuotaExceeded),
            ScriptedOutcome::Error(ScriptedError::Transient) => {
                Err(AdapterError::Transient("upstream 503".to_string()))
            }
            ScriptedOutcome::Error(ScriptedError::Permanent) => {
                Err(AdapterError::permanent("upstream 400"))
            }
            ScriptedOutcome::Error(ScriptedError::ContextLengthExceeded) => {
                Err(AdapterError::context_length_exceeded("context_length_exceeded"))
            }
        }
    }

    async fn stream(
        &self,
        model: &str,
        messages: &[Message],
        temperature: Option<f32>,
        top_p: Option<f32>,
        max_tokens: Option<u32>,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<String, AdapterError>>, AdapterError> {
        let resp = self
            .generate(model, messages, temperature, top_p, max_tokens, None, cancel)
            .await?;
        let chunks: Vec<Result<String, AdapterError>> = resp
            .text
            .chars()
            .collect::<Vec<_>>()
            .chunks(8)
            .map(|c| Ok(c.iter().collect::<String>()))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_adapter_returns_queued_text() {
        let adapter = ScriptedAdapter::new();
        adapter.script("model-a", vec![ScriptedOutcome::Text("hello".to_string())]);
        let resp = adapter
            .generate(
                "model-a",
                &[Message::user("hi")],
                None,
                None,
                None,
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(resp.text, "hello");
    }

    #[tokio::test]
    async fn scripted_adapter_advances_through_script() {
        let adapter = ScriptedAdapter::new();
        adapter.script(
            "model-a",
            vec![
                ScriptedOutcome::Error(ScriptedError::RateLimit(Some(Duration::from_secs(1)))),
                ScriptedOutcome::Text("second".to_string()),
            ],
        );
        let first = adapter
            .generate("model-a", &[], None, None, None, None, CancellationToken::new())
            .await;
        assert!(matches!(first, Err(AdapterError::RateLimit { .. })));
        let second = adapter
            .generate("model-a", &[], None, None, None, None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.text, "second");
    }

    #[tokio::test]
    async fn scripted_adapter_repeats_last_entry() {
        let adapter = ScriptedAdapter::new();
        adapter.script("model-a", vec![ScriptedOutcome::Text("only".to_string())]);
        for _ in 0..3 {
            let resp = adapter
                .generate("model-a", &[], None, None, None, None, CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(resp.text, "only");
        }
    }
}
