//! HTTP client for the DeepSeek chat-completions API.
//!
//! [`DeepSeek`] issues non-streaming and streaming exchanges against the
//! `/chat/completions` endpoint. The [`ChatBackend`] trait is the seam the
//! conversation controller talks through, so tests can script replies
//! without a network.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Response, header};
use serde::{Deserialize, Serialize};

use crate::config::ChatConfig;
use crate::error::{Error, Result};
use crate::sse::process_sse;
use crate::types::{MessageRole, Session, StreamEvent};

const DEFAULT_API_URL: &str = "https://api.deepseek.com/v1/";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One role/content pair as sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Message author.
    pub role: MessageRole,
    /// Message text.
    pub content: String,
}

impl WireMessage {
    /// Creates a wire message.
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Request payload for `/chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// Model name.
    pub model: String,
    /// Ordered history, oldest first.
    pub messages: Vec<WireMessage>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum tokens in the reply.
    pub max_tokens: u32,
    /// Whether the reply is streamed as SSE.
    pub stream: bool,
}

/// Non-streaming response body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    /// Completion choices; this client requests exactly one.
    pub choices: Vec<ResponseChoice>,
}

/// One completion choice in a non-streaming response.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseChoice {
    /// The full reply message.
    pub message: WireMessage,
    /// Why generation stopped.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl ChatResponse {
    /// The reply text, if the response carried one.
    pub fn text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

/// One SSE chunk of a streaming response.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    /// Completion choices; deltas arrive on the first.
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

/// One choice within a streaming chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    /// Incremental fields for this choice.
    #[serde(default)]
    pub delta: ChunkDelta,
    /// Set on the closing chunk of the choice.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Incremental fields carried by a chunk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDelta {
    /// Role announcement; present on the first chunk only.
    #[serde(default)]
    pub role: Option<MessageRole>,
    /// Incremental reply text.
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatCompletionChunk {
    /// Incremental reply text carried by this chunk, if any.
    pub fn delta_text(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.delta.content.as_deref())
    }

    /// The finish reason, set on the closing chunk.
    pub fn finish_reason(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.finish_reason.as_deref())
    }
}

/// Chat backend contract used by the conversation controller.
///
/// One call represents one HTTP exchange. The returned stream yields every
/// event for the exchange, ending with exactly one terminal event
/// (`is_final == true`); request failures surface as a single terminal error
/// event rather than an `Err` return. Dropping the stream cancels the
/// exchange and releases the underlying connection.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Opens one streaming exchange for the session's transcript.
    async fn send_turn(&self, session: &Session) -> BoxStream<'static, StreamEvent>;
}

/// Client for the DeepSeek API.
#[derive(Debug, Clone)]
pub struct DeepSeek {
    api_key: String,
    client: ReqwestClient,
    base_url: String,
    timeout: Duration,
    config: ChatConfig,
}

impl DeepSeek {
    /// Create a new DeepSeek client.
    ///
    /// The API key can be provided directly or read from the
    /// DEEPSEEK_API_KEY environment variable.
    pub fn new(api_key: Option<String>, config: ChatConfig) -> Result<Self> {
        Self::with_options(api_key, config, None, None)
    }

    /// Create a new client with a custom base URL and timeout.
    pub fn with_options(
        api_key: Option<String>,
        config: ChatConfig,
        base_url: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let api_key = match api_key {
            Some(key) => key,
            None => env::var("DEEPSEEK_API_KEY").map_err(|_| {
                Error::authentication(
                    "API key not provided and DEEPSEEK_API_KEY environment variable not set",
                )
            })?,
        };

        let base_url = match base_url {
            Some(base_url) => {
                url::Url::parse(&base_url)?;
                if base_url.ends_with('/') {
                    base_url
                } else {
                    format!("{base_url}/")
                }
            }
            None => DEFAULT_API_URL.to_string(),
        };

        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let client = ReqwestClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                Error::http_client(format!("Failed to build HTTP client: {e}"), Some(Box::new(e)))
            })?;

        Ok(Self {
            api_key,
            client,
            base_url,
            timeout,
            config,
        })
    }

    /// Returns the active chat configuration.
    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Create and return default headers for API requests.
    fn default_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| Error::authentication("API key contains invalid header characters"))?;
        headers.insert(header::AUTHORIZATION, bearer);
        Ok(headers)
    }

    fn request(&self, messages: Vec<WireMessage>, stream: bool) -> ChatRequest {
        ChatRequest {
            model: self.config.model.clone(),
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream,
        }
    }

    fn map_transport_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::timeout(
                format!("Request timed out: {e}"),
                Some(self.timeout.as_secs_f64()),
            )
        } else if e.is_connect() {
            Error::connection(format!("Connection error: {e}"), Some(Box::new(e)))
        } else {
            Error::http_client(format!("Request failed: {e}"), Some(Box::new(e)))
        }
    }

    /// Process API response errors and convert to our Error type
    async fn process_error_response(response: Response) -> Error {
        let status_code = response.status().as_u16();

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|val| val.to_str().ok())
            .and_then(|val| val.parse::<u64>().ok());

        // Try to parse error response body
        #[derive(Deserialize)]
        struct ErrorResponse {
            error: Option<ErrorDetail>,
        }

        #[derive(Deserialize)]
        struct ErrorDetail {
            #[serde(rename = "type")]
            error_type: Option<String>,
            message: Option<String>,
            param: Option<String>,
        }

        let error_body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Error::http_client(
                    format!("Failed to read error response: {e}"),
                    Some(Box::new(e)),
                );
            }
        };

        let parsed_error = serde_json::from_str::<ErrorResponse>(&error_body).ok();
        let error_type = parsed_error
            .as_ref()
            .and_then(|e| e.error.as_ref())
            .and_then(|e| e.error_type.clone());
        let error_message = parsed_error
            .as_ref()
            .and_then(|e| e.error.as_ref())
            .and_then(|e| e.message.clone())
            .unwrap_or_else(|| error_body.clone());
        let error_param = parsed_error
            .as_ref()
            .and_then(|e| e.error.as_ref())
            .and_then(|e| e.param.clone());

        // Map HTTP status code to appropriate error type
        match status_code {
            400 => Error::bad_request(error_message, error_param),
            401 => Error::authentication(error_message),
            404 => Error::not_found(error_message, None),
            408 => Error::timeout(error_message, None),
            429 => Error::rate_limit(error_message, retry_after),
            500 => Error::internal_server(error_message),
            502..=504 => Error::service_unavailable(error_message, retry_after),
            _ => Error::api(status_code, error_type, error_message),
        }
    }

    /// Send a message history to the API and get a non-streaming response.
    pub async fn send(&self, messages: Vec<WireMessage>) -> Result<ChatResponse> {
        let url = format!("{}chat/completions", self.base_url);
        let params = self.request(messages, false);

        let response = self
            .client
            .post(&url)
            .headers(self.default_headers()?)
            .json(&params)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !response.status().is_success() {
            return Err(Self::process_error_response(response).await);
        }

        response.json::<ChatResponse>().await.map_err(|e| {
            Error::serialization(format!("Failed to parse response: {e}"), Some(Box::new(e)))
        })
    }

    /// Send a message history to the API and get a streaming response.
    ///
    /// Returns a stream of chunks ending at the `[DONE]` terminator. The
    /// call never blocks for the full reply; chunks surface as they arrive.
    pub async fn stream(
        &self,
        messages: Vec<WireMessage>,
    ) -> Result<impl Stream<Item = Result<ChatCompletionChunk>> + Send + 'static> {
        let url = format!("{}chat/completions", self.base_url);
        let params = self.request(messages, true);

        let mut headers = self.default_headers()?;
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(&params)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !response.status().is_success() {
            return Err(Self::process_error_response(response).await);
        }

        Ok(process_sse(response.bytes_stream()))
    }
}

#[async_trait]
impl ChatBackend for DeepSeek {
    async fn send_turn(&self, session: &Session) -> BoxStream<'static, StreamEvent> {
        let session_id = session.id.clone();
        let history = build_history(session, &self.config);
        log::debug!(
            "dispatching turn for session {session_id} ({} messages upstream)",
            history.len()
        );
        match self.stream(history).await {
            Ok(chunks) => relay_events(session_id, chunks.boxed()),
            Err(err) => {
                stream::once(async move { StreamEvent::failed(session_id, err.to_string()) })
                    .boxed()
            }
        }
    }
}

/// Builds the outbound payload from a session's transcript.
///
/// Only complete messages are sent: the streaming placeholder is empty by
/// construction and failed fragments would fabricate context the model never
/// produced. When the cumulative content length exceeds the configured
/// context budget, the oldest messages are dropped first; the newest message
/// is always kept. Truncation affects only this payload, never the stored
/// transcript. The configured system prompt, if any, is prepended outside
/// the budget.
pub fn build_history(session: &Session, config: &ChatConfig) -> Vec<WireMessage> {
    let complete: Vec<&crate::types::Message> =
        session.messages.iter().filter(|m| m.is_complete()).collect();

    let mut kept = Vec::new();
    let mut spent = 0usize;
    for (offset, message) in complete.iter().rev().enumerate() {
        let cost = message.content.chars().count();
        if offset > 0 && spent + cost > config.context_budget {
            log::debug!(
                "session {}: context budget reached, dropping {} oldest message(s)",
                session.id,
                complete.len() - kept.len()
            );
            break;
        }
        spent += cost;
        kept.push(WireMessage::new(message.role, message.content.clone()));
    }
    kept.reverse();

    let mut payload = Vec::with_capacity(kept.len() + 1);
    if let Some(prompt) = &config.system_prompt {
        payload.push(WireMessage::new(MessageRole::System, prompt.clone()));
    }
    payload.extend(kept);
    payload
}

/// Adapts a chunk stream into the controller-facing event stream.
///
/// Each non-empty delta becomes an incremental event; the first error or the
/// end of the chunk stream produces the single terminal event, after which
/// nothing further is yielded.
fn relay_events(
    session_id: String,
    chunks: BoxStream<'static, Result<ChatCompletionChunk>>,
) -> BoxStream<'static, StreamEvent> {
    stream::unfold(
        (chunks, session_id, false),
        |(mut chunks, session_id, done)| async move {
            if done {
                return None;
            }
            loop {
                match chunks.next().await {
                    Some(Ok(chunk)) => match chunk.delta_text() {
                        Some(text) if !text.is_empty() => {
                            let text = text.to_string();
                            return Some((
                                StreamEvent::delta(session_id.clone(), text),
                                (chunks, session_id, false),
                            ));
                        }
                        // Role announcements and empty chunks carry no text.
                        _ => continue,
                    },
                    Some(Err(err)) => {
                        return Some((
                            StreamEvent::failed(session_id.clone(), err.to_string()),
                            (chunks, session_id, true),
                        ));
                    }
                    None => {
                        return Some((
                            StreamEvent::finished(session_id.clone()),
                            (chunks, session_id, true),
                        ));
                    }
                }
            }
        },
    )
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    fn session_with(messages: Vec<Message>) -> Session {
        let mut session = Session::new();
        session.messages = messages;
        session
    }

    #[test]
    fn build_history_skips_incomplete_messages() {
        let mut failed = Message::assistant_placeholder();
        failed.append_delta("partial");
        failed.mark_failed("connection reset");
        let session = session_with(vec![
            Message::user("first"),
            failed,
            Message::user("second"),
            Message::assistant_placeholder(),
        ]);

        let history = build_history(&session, &ChatConfig::new());
        assert_eq!(
            history,
            vec![
                WireMessage::new(MessageRole::User, "first"),
                WireMessage::new(MessageRole::User, "second"),
            ]
        );
    }

    #[test]
    fn build_history_truncates_oldest_first() {
        let session = session_with(vec![
            Message::user("aaaaaaaaaa"),
            Message::user("bbbbbbbbbb"),
            Message::user("cccccccccc"),
        ]);
        let config = ChatConfig::new().with_context_budget(20);

        let history = build_history(&session, &config);
        assert_eq!(
            history,
            vec![
                WireMessage::new(MessageRole::User, "bbbbbbbbbb"),
                WireMessage::new(MessageRole::User, "cccccccccc"),
            ]
        );
    }

    #[test]
    fn build_history_always_keeps_newest() {
        let session = session_with(vec![Message::user("x".repeat(100))]);
        let config = ChatConfig::new().with_context_budget(10);

        let history = build_history(&session, &config);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn build_history_prepends_system_prompt() {
        let session = session_with(vec![Message::user("hi")]);
        let config = ChatConfig::new().with_system_prompt("Be brief.");

        let history = build_history(&session, &config);
        assert_eq!(history[0], WireMessage::new(MessageRole::System, "Be brief."));
        assert_eq!(history[1], WireMessage::new(MessageRole::User, "hi"));
    }

    #[test]
    fn chunk_deserialization() {
        let json = r#"{"id":"c1","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"},"finish_reason":null}]}"#;
        let chunk: ChatCompletionChunk = serde_json::from_str(json).unwrap();
        assert_eq!(chunk.delta_text(), Some("Hel"));
        assert_eq!(chunk.finish_reason(), None);
    }

    #[test]
    fn response_deserialization() {
        let json = r#"{"choices":[{"message":{"role":"assistant","content":"Hello!"},"finish_reason":"stop"}]}"#;
        let response: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.text(), Some("Hello!"));
    }

    #[tokio::test]
    async fn relay_maps_chunks_to_events() {
        let chunks: Vec<Result<ChatCompletionChunk>> = vec![
            Ok(serde_json::from_str(
                r#"{"choices":[{"delta":{"role":"assistant"},"finish_reason":null}]}"#,
            )
            .unwrap()),
            Ok(serde_json::from_str(
                r#"{"choices":[{"delta":{"content":"He"},"finish_reason":null}]}"#,
            )
            .unwrap()),
            Ok(serde_json::from_str(
                r#"{"choices":[{"delta":{"content":"llo!"},"finish_reason":"stop"}]}"#,
            )
            .unwrap()),
        ];
        let mut events = relay_events("s1".to_string(), stream::iter(chunks).boxed());

        assert_eq!(events.next().await.unwrap(), StreamEvent::delta("s1", "He"));
        assert_eq!(
            events.next().await.unwrap(),
            StreamEvent::delta("s1", "llo!")
        );
        assert_eq!(events.next().await.unwrap(), StreamEvent::finished("s1"));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn relay_terminates_on_error() {
        let chunks: Vec<Result<ChatCompletionChunk>> = vec![
            Ok(serde_json::from_str(
                r#"{"choices":[{"delta":{"content":"par"},"finish_reason":null}]}"#,
            )
            .unwrap()),
            Err(Error::streaming("connection reset", None)),
            Ok(serde_json::from_str(
                r#"{"choices":[{"delta":{"content":"never"},"finish_reason":null}]}"#,
            )
            .unwrap()),
        ];
        let mut events = relay_events("s1".to_string(), stream::iter(chunks).boxed());

        assert_eq!(
            events.next().await.unwrap(),
            StreamEvent::delta("s1", "par")
        );
        let terminal = events.next().await.unwrap();
        assert!(terminal.is_final);
        assert!(terminal.error.is_some());
        // Nothing is surfaced after the terminal event.
        assert!(events.next().await.is_none());
    }

    #[test]
    fn missing_key_is_authentication_error() {
        // Only meaningful when the variable is absent from the environment.
        if env::var("DEEPSEEK_API_KEY").is_ok() {
            return;
        }
        let err = DeepSeek::new(None, ChatConfig::new()).unwrap_err();
        assert!(err.is_authentication());
    }

    #[test]
    fn rejects_malformed_base_url() {
        let err = DeepSeek::with_options(
            Some("sk-test".to_string()),
            ChatConfig::new(),
            Some("not a url".to_string()),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Url { .. }));
    }
}
