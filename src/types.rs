//! Core data model for the deepterm engine.
//!
//! A [`Session`] is one persisted conversation: a stable identifier, a title
//! derived from the first user message, and an ordered transcript of
//! [`Message`] values. [`StreamEvent`] is the transient value the streaming
//! client hands to the conversation controller; it is never persisted.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Maximum title length before truncation, in characters.
const TITLE_MAX_CHARS: usize = 30;

/// Characters kept when a title is truncated.
const TITLE_KEEP_CHARS: usize = 27;

/// Title given to a session before the first user message arrives.
pub const DEFAULT_TITLE: &str = "New chat";

/// RFC 3339 (de)serialization for [`OffsetDateTime`] fields.
pub(crate) mod rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;
    use time::format_description::well_known::Rfc3339;

    pub fn serialize<S>(datetime: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = datetime
            .format(&Rfc3339)
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<OffsetDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        OffsetDateTime::parse(&s, &Rfc3339).map_err(serde::de::Error::custom)
    }
}

/// The author of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// A message from the user.
    User,
    /// A message from the model.
    Assistant,
    /// A system instruction.
    System,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// The lifecycle state of a message.
///
/// A message is created `Streaming` when a request is dispatched and moves to
/// `Complete` on the final chunk or `Failed` on error or cancellation. Both
/// terminal states are immutable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Fully delivered.
    Complete,
    /// An assistant reply still being streamed in.
    Streaming,
    /// Terminal failure; never resumes.
    Failed,
}

/// One entry in a session transcript.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who authored the message.
    pub role: MessageRole,
    /// Message text; may contain Markdown.
    pub content: String,
    /// Lifecycle state.
    pub status: MessageStatus,
    /// When the message was created.
    #[serde(with = "rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Failure annotation, present only on `Failed` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    /// Creates a complete user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            status: MessageStatus::Complete,
            timestamp: OffsetDateTime::now_utc(),
            error: None,
        }
    }

    /// Creates the empty assistant placeholder that accumulates streamed text.
    pub fn assistant_placeholder() -> Self {
        Self {
            role: MessageRole::Assistant,
            content: String::new(),
            status: MessageStatus::Streaming,
            timestamp: OffsetDateTime::now_utc(),
            error: None,
        }
    }

    /// Appends streamed delta text. Only meaningful while `Streaming`.
    pub fn append_delta(&mut self, delta: &str) {
        self.content.push_str(delta);
    }

    /// Transitions the message to `Complete`.
    pub fn mark_complete(&mut self) {
        self.status = MessageStatus::Complete;
    }

    /// Transitions the message to `Failed` with an annotation.
    pub fn mark_failed(&mut self, annotation: impl Into<String>) {
        self.status = MessageStatus::Failed;
        self.error = Some(annotation.into());
    }

    /// Returns true if the message is still streaming.
    pub fn is_streaming(&self) -> bool {
        self.status == MessageStatus::Streaming
    }

    /// Returns true if the message is complete.
    pub fn is_complete(&self) -> bool {
        self.status == MessageStatus::Complete
    }
}

/// One persisted conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque stable identifier, unique across the registry.
    pub id: String,
    /// Title shown in the sidebar; derived from the first user message.
    pub title: String,
    /// Creation time; immutable.
    #[serde(with = "rfc3339")]
    pub created_at: OffsetDateTime,
    /// Transcript in strict append order.
    pub messages: Vec<Message>,
}

impl Session {
    /// Creates a fresh empty session with a generated identifier.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: DEFAULT_TITLE.to_string(),
            created_at: OffsetDateTime::now_utc(),
            messages: Vec::new(),
        }
    }

    /// Appends a complete user message, deriving the title if this is the
    /// first one.
    pub fn push_user_message(&mut self, text: &str) {
        if !self.messages.iter().any(|m| m.role == MessageRole::User) {
            self.title = derive_title(text);
        }
        self.messages.push(Message::user(text));
    }

    /// Appends the streaming assistant placeholder and returns its index.
    pub fn push_assistant_placeholder(&mut self) -> usize {
        self.messages.push(Message::assistant_placeholder());
        self.messages.len() - 1
    }

    /// Index of the in-flight streaming message, if any.
    pub fn streaming_index(&self) -> Option<usize> {
        self.messages.iter().position(Message::is_streaming)
    }

    /// Marks any message stuck in `Streaming` as `Failed`.
    ///
    /// Called when a transcript is reloaded: a crash mid-stream leaves no
    /// valid resumable state. Returns the number of messages normalized.
    pub fn normalize_interrupted(&mut self) -> usize {
        let mut normalized = 0;
        for message in &mut self.messages {
            if message.is_streaming() {
                message.mark_failed("interrupted");
                normalized += 1;
            }
        }
        normalized
    }

    /// Returns the lightweight summary used for sidebar listings.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            message_count: self.messages.len(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Session metadata without the message bodies.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSummary {
    /// Session identifier.
    pub id: String,
    /// Sidebar title.
    pub title: String,
    /// Creation time.
    pub created_at: OffsetDateTime,
    /// Number of messages in the transcript.
    pub message_count: usize,
}

/// A transient streaming update from the remote model.
///
/// Exactly one terminal event (`is_final == true`) closes each exchange.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamEvent {
    /// The session this event belongs to.
    pub session_id: String,
    /// Incremental reply text; empty on terminal events.
    pub delta_text: String,
    /// True on the last event of the exchange.
    pub is_final: bool,
    /// Failure detail; set only on a terminal error event.
    pub error: Option<String>,
}

impl StreamEvent {
    /// Creates an incremental text event.
    pub fn delta(session_id: impl Into<String>, delta_text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            delta_text: delta_text.into(),
            is_final: false,
            error: None,
        }
    }

    /// Creates the terminal success event.
    pub fn finished(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            delta_text: String::new(),
            is_final: true,
            error: None,
        }
    }

    /// Creates the terminal error event.
    pub fn failed(session_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            delta_text: String::new(),
            is_final: true,
            error: Some(error.into()),
        }
    }
}

/// Derives a sidebar title from the first user message.
///
/// Uses the first line only, truncated to 27 characters plus an ellipsis
/// once it exceeds 30.
fn derive_title(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if first_line.chars().count() > TITLE_MAX_CHARS {
        let mut title: String = first_line.chars().take(TITLE_KEEP_CHARS).collect();
        title.push_str("...");
        title
    } else {
        first_line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_has_unique_id() {
        let a = Session::new();
        let b = Session::new();
        assert_ne!(a.id, b.id);
        assert_eq!(a.title, DEFAULT_TITLE);
        assert!(a.messages.is_empty());
    }

    #[test]
    fn title_from_first_user_message() {
        let mut session = Session::new();
        session.push_user_message("hello there");
        assert_eq!(session.title, "hello there");

        // Later user messages must not retitle the session.
        session.push_user_message("something entirely different");
        assert_eq!(session.title, "hello there");
    }

    #[test]
    fn title_truncated_past_thirty_chars() {
        let mut session = Session::new();
        session.push_user_message("tell me everything about the rust borrow checker please");
        assert_eq!(session.title.chars().count(), 30);
        assert!(session.title.ends_with("..."));
    }

    #[test]
    fn title_uses_first_line_only() {
        let mut session = Session::new();
        session.push_user_message("short question\nwith a very long follow-up paragraph");
        assert_eq!(session.title, "short question");
    }

    #[test]
    fn blank_first_message_keeps_default_title() {
        let mut session = Session::new();
        session.push_user_message("   ");
        assert_eq!(session.title, DEFAULT_TITLE);
    }

    #[test]
    fn at_most_one_streaming_message() {
        let mut session = Session::new();
        session.push_user_message("hi");
        let idx = session.push_assistant_placeholder();
        assert_eq!(session.streaming_index(), Some(idx));

        session.messages[idx].mark_complete();
        assert_eq!(session.streaming_index(), None);
    }

    #[test]
    fn normalize_interrupted_fails_streaming_messages() {
        let mut session = Session::new();
        session.push_user_message("hi");
        session.push_assistant_placeholder();

        assert_eq!(session.normalize_interrupted(), 1);
        let last = session.messages.last().unwrap();
        assert_eq!(last.status, MessageStatus::Failed);
        assert_eq!(last.error.as_deref(), Some("interrupted"));

        // Idempotent: failed messages stay failed.
        assert_eq!(session.normalize_interrupted(), 0);
    }

    #[test]
    fn message_serde_round_trip() {
        let mut message = Message::user("**bold** and `code`");
        message.timestamp = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"role\":\"user\""));
        assert!(json.contains("\"status\":\"complete\""));
        assert!(!json.contains("\"error\""));

        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn failed_message_serializes_annotation() {
        let mut message = Message::assistant_placeholder();
        message.mark_failed("connection reset");
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"error\":\"connection reset\""));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn stream_event_constructors() {
        let delta = StreamEvent::delta("s1", "He");
        assert!(!delta.is_final);
        assert!(delta.error.is_none());

        let fin = StreamEvent::finished("s1");
        assert!(fin.is_final);
        assert!(fin.error.is_none());

        let failed = StreamEvent::failed("s1", "boom");
        assert!(failed.is_final);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }
}
