//! deepterm is the session and streaming engine behind a terminal chat
//! client for the DeepSeek chat-completions API.
//!
//! The crate keeps conversation state, streams replies without blocking,
//! applies deltas to the transcript incrementally, and persists every
//! session as a JSON file. It deliberately contains no terminal UI; a
//! frontend drives the [`ConversationController`] with user intents and
//! re-renders from snapshots whenever the revision counter it subscribes to
//! changes.
//!
//! # Getting started
//!
//! ```no_run
//! use deepterm::{
//!     ChatConfig, ConversationController, DeepSeek, SessionRegistry, TranscriptStore,
//! };
//!
//! # async fn example() -> Result<(), deepterm::Error> {
//! let backend = DeepSeek::new(None, ChatConfig::default())?;
//! let store = TranscriptStore::new("/tmp/deepterm-chats")?;
//! let registry = SessionRegistry::new(store)?;
//! let mut controller = ConversationController::new(backend, registry)?;
//!
//! controller.submit("explain the borrow checker").await?;
//! controller.run_to_idle().await?;
//! for message in controller.messages() {
//!     println!("{}: {}", message.role, message.content);
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod controller;
mod error;
mod registry;
mod sse;
mod store;
mod types;

pub use client::{
    build_history, ChatBackend, ChatCompletionChunk, ChatRequest, ChatResponse, ChunkChoice,
    ChunkDelta, DeepSeek, ResponseChoice, WireMessage,
};
pub use config::ChatConfig;
pub use controller::{ConversationController, TurnState};
pub use error::{Error, Result};
pub use registry::SessionRegistry;
pub use store::TranscriptStore;
pub use types::{Message, MessageRole, MessageStatus, Session, SessionSummary, StreamEvent};
