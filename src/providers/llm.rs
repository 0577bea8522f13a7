//! Streaming chat completion clients
//!
//! Groq and `OpenAI` share the chat-completions wire format; Anthropic uses
//! the messages API. Both stream server-sent events, which are split into
//! lines across network chunks and parsed one line at a time.

use async_trait::async_trait;
use futures::{StreamExt, future, stream};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Generator, LlmKind, TextStream};
use crate::pipeline::TextDelta;
use crate::{Error, Result};

/// Anthropic API version header value
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Reply length cap for Anthropic (required by the API)
const ANTHROPIC_MAX_TOKENS: u32 = 256;

/// Sampling penalties for chat-completions providers
const FREQUENCY_PENALTY: f32 = 0.7;
const PRESENCE_PENALTY: f32 = 0.5;

/// Speaker of a history message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// The person talking
    User,
    /// The assistant
    Assistant,
}

/// One message of conversation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Speaker
    pub role: ChatRole,
    /// Message text
    pub content: String,
}

impl ChatMessage {
    /// A user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    /// An assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A parsed server-sent event line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Generated text
    Text(String),
    /// End of the reply
    Done,
    /// Provider reported an error mid-stream
    Error(String),
}

/// Parse one SSE line for `kind`
///
/// Returns `None` for lines that carry nothing of interest (comments, event
/// names, keep-alives, other event types) and for malformed JSON.
#[must_use]
pub fn parse_sse_line(kind: LlmKind, line: &str) -> Option<SseEvent> {
    let data = line.trim_end_matches('\r').strip_prefix("data:")?.trim_start();

    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }

    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            tracing::trace!(error = %e, "skipping malformed sse line");
            return None;
        }
    };

    match kind {
        LlmKind::Groq | LlmKind::OpenAi => value
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
            .map(|text| SseEvent::Text(text.to_string())),
        LlmKind::Anthropic => match value.get("type").and_then(Value::as_str)? {
            "content_block_delta" => value
                .pointer("/delta/text")
                .and_then(Value::as_str)
                .filter(|text| !text.is_empty())
                .map(|text| SseEvent::Text(text.to_string())),
            "message_stop" => Some(SseEvent::Done),
            "error" => Some(SseEvent::Error(
                value
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            )),
            _ => None,
        },
    }
}

/// Splits a byte stream into lines, holding partial lines across chunks
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        complete
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }
}

/// Streams replies from a chat provider
pub struct ChatClient {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    kind: LlmKind,
}

impl ChatClient {
    /// Create a client for `kind`, using the provider's default model when
    /// `model` is `None`
    #[must_use]
    pub fn new(kind: LlmKind, api_key: SecretString, model: Option<String>) -> Self {
        let model = model.unwrap_or_else(|| default_model(kind).to_string());
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            kind,
        }
    }

    /// Model in use
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    fn request(&self, system_prompt: &str, history: &[ChatMessage]) -> reqwest::RequestBuilder {
        match self.kind {
            LlmKind::Groq | LlmKind::OpenAi => {
                let url = if self.kind == LlmKind::Groq {
                    "https://api.groq.com/openai/v1/chat/completions"
                } else {
                    "https://api.openai.com/v1/chat/completions"
                };

                let mut messages = vec![json!({ "role": "system", "content": system_prompt })];
                messages.extend(history.iter().map(|m| json!(m)));

                self.client
                    .post(url)
                    .bearer_auth(self.api_key.expose_secret())
                    .json(&json!({
                        "model": self.model,
                        "messages": messages,
                        "stream": true,
                        "frequency_penalty": FREQUENCY_PENALTY,
                        "presence_penalty": PRESENCE_PENALTY,
                    }))
            }
            LlmKind::Anthropic => self
                .client
                .post("https://api.anthropic.com/v1/messages")
                .header("x-api-key", self.api_key.expose_secret())
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&json!({
                    "model": self.model,
                    "max_tokens": ANTHROPIC_MAX_TOKENS,
                    "system": system_prompt,
                    "messages": history,
                    "stream": true,
                })),
        }
    }
}

/// Default model per provider
const fn default_model(kind: LlmKind) -> &'static str {
    match kind {
        LlmKind::Groq => "llama-3.3-70b-versatile",
        LlmKind::OpenAi => "gpt-4o-mini",
        LlmKind::Anthropic => "claude-haiku-4-5-20251001",
    }
}

/// Turn an SSE response body into numbered text deltas
fn delta_stream(response: reqwest::Response, kind: LlmKind) -> TextStream {
    let lines = response
        .bytes_stream()
        .scan(LineBuffer::default(), |buffer, chunk| {
            let items: Vec<Result<String>> = match chunk {
                Ok(bytes) => buffer.push(&bytes).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(Error::Llm(format!("stream interrupted: {e}")))],
            };
            future::ready(Some(stream::iter(items)))
        })
        .flatten();

    let deltas = lines
        .filter_map(move |line| {
            future::ready(match line {
                Ok(line) => parse_sse_line(kind, &line).map(Ok),
                Err(e) => Some(Err(e)),
            })
        })
        .take_while(|event| future::ready(!matches!(event, Ok(SseEvent::Done))))
        .scan(false, |failed, event| {
            // Nothing follows an error
            if *failed {
                return future::ready(None);
            }
            let item = match event {
                Ok(SseEvent::Text(text)) => Ok(text),
                Ok(SseEvent::Error(message)) => Err(Error::Llm(message)),
                Ok(SseEvent::Done) => Err(Error::Llm("unexpected end of stream".to_string())),
                Err(e) => Err(e),
            };
            *failed = item.is_err();
            future::ready(Some(item))
        })
        .enumerate()
        .map(|(index, item)| {
            item.map(|text| TextDelta {
                index: index as u64,
                text,
            })
        });

    Box::pin(deltas)
}

#[async_trait]
impl Generator for ChatClient {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    async fn generate(&self, system_prompt: &str, history: &[ChatMessage]) -> Result<TextStream> {
        tracing::debug!(
            provider = %self.kind,
            model = %self.model,
            messages = history.len(),
            "starting generation"
        );

        let response = self.request(system_prompt, history).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Llm(format!("{} API error {status}: {body}", self.kind)));
        }

        Ok(delta_stream(response, self.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_lines() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#;
        assert_eq!(
            parse_sse_line(LlmKind::OpenAi, line),
            Some(SseEvent::Text("Hi".to_string()))
        );
        assert_eq!(parse_sse_line(LlmKind::Groq, "data: [DONE]"), Some(SseEvent::Done));
        assert_eq!(parse_sse_line(LlmKind::Groq, ": keep-alive"), None);
        assert_eq!(parse_sse_line(LlmKind::Groq, "data: {not json"), None);
        // Role-only first chunk carries no text
        let role = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_line(LlmKind::OpenAi, role), None);
    }

    #[test]
    fn test_anthropic_lines() {
        let delta =
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Yo"}}"#;
        assert_eq!(
            parse_sse_line(LlmKind::Anthropic, delta),
            Some(SseEvent::Text("Yo".to_string()))
        );
        assert_eq!(parse_sse_line(LlmKind::Anthropic, "event: content_block_delta"), None);
        assert_eq!(
            parse_sse_line(LlmKind::Anthropic, r#"data: {"type":"message_stop"}"#),
            Some(SseEvent::Done)
        );
        let error = r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert_eq!(
            parse_sse_line(LlmKind::Anthropic, error),
            Some(SseEvent::Error("Overloaded".to_string()))
        );
    }

    #[test]
    fn test_line_buffer_across_chunks() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"data: {\"a\"").is_empty());
        assert_eq!(buffer.push(b":1}\r\n\ndata: x"), vec!["data: {\"a\":1}\r".to_string()]);
        assert_eq!(buffer.push(b"\n"), vec!["data: x".to_string()]);
    }

    #[test]
    fn test_line_buffer_split_multibyte() {
        let mut buffer = LineBuffer::default();
        let text = "data: é\n".as_bytes();
        assert!(buffer.push(&text[..7]).is_empty());
        assert_eq!(buffer.push(&text[7..]), vec!["data: é".to_string()]);
    }

    #[test]
    fn test_history_serializes_lowercase_roles() {
        let value = json!(ChatMessage::assistant("ok"));
        assert_eq!(value["role"], "assistant");
    }
}
