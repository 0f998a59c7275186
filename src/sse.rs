//! SSE frame decode/encode helpers used by the generic HTTP provider
//! adapter's streaming path and by the HTTP surface's passthrough
//! response framing.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Parse the text deltas out of a single `data:` payload.
fn parse_event_text(data: &str) -> Option<String> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let chunk: StreamChunk = serde_json::from_str(data).ok()?;
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|s| !s.is_empty())
}

/// Decode a raw upstream byte stream (OpenAI-Chat-Completions-shaped SSE)
/// into a stream of text deltas, buffering partial frames across chunk
/// boundaries.
pub fn decode_sse_deltas<S>(stream: S) -> impl Stream<Item = Result<String, String>>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let initial = (Box::pin(stream) as std::pin::Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>, String::new());

    futures::stream::unfold(initial, |(mut inner, mut buf)| async move {
        loop {
            if let Some(idx) = buf.find("\n\n") {
                let event = buf[..idx].to_string();
                buf.drain(..idx + 2);
                let mut text = None;
                for line in event.lines() {
                    if let Some(data) = line.strip_prefix("data:") {
                        if let Some(t) = parse_event_text(data) {
                            text = Some(t);
                        }
                    }
                }
                if let Some(t) = text {
                    return Some((Ok(t), (inner, buf)));
                }
                continue;
            }

            match inner.next().await {
                Some(Ok(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(s) => buf.push_str(s),
                    Err(_) => return Some((Err("invalid utf-8 in SSE chunk".to_string()), (inner, buf))),
                },
                Some(Err(e)) => return Some((Err(e.to_string()), (inner, buf))),
                None => return None,
            }
        }
    })
}

/// Render a stored response as client-facing SSE chunks at
/// `streaming.chunkSize` chars, for buffered-then-streamed delivery.
pub fn chunk_text(text: &str, chunk_size: usize) -> Vec<String> {
    if chunk_size == 0 {
        return vec![text.to_string()];
    }
    text.chars()
        .collect::<Vec<_>>()
        .chunks(chunk_size)
        .map(|c| c.iter().collect::<String>())
        .collect()
}

/// Format a single OpenAI-shaped streaming chunk as an SSE `data:` line.
pub fn format_sse_chunk(json_body: &serde_json::Value) -> String {
    format!("data: {}\n\n", json_body)
}

pub const SSE_DONE: &str = "data: [DONE]\n\n";
