//! Conversation orchestration.
//!
//! The [`ConversationController`] is the single writer of session state. It
//! owns the active [`Session`], drives streaming requests through a
//! [`ChatBackend`], applies incoming [`StreamEvent`]s to the transcript, and
//! persists through the [`SessionRegistry`]. The presentation layer only
//! reads snapshots and forwards intents.
//!
//! The turn state machine is `Idle -> AwaitingReply -> Idle`; a failure
//! surfaces as a `failed` message and also lands back in `Idle`, so the user
//! can retry by submitting again. Exactly one reply may be in flight at a
//! time; a submit during `AwaitingReply` is rejected, not queued.

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::watch;

use crate::client::ChatBackend;
use crate::error::{Error, Result};
use crate::registry::SessionRegistry;
use crate::types::{Session, SessionSummary, StreamEvent};

/// Annotation recorded on a reply abandoned by the user.
const CANCELLED: &str = "cancelled";

/// Whether the controller is waiting on a streamed reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnState {
    /// No exchange in flight; commands are accepted.
    Idle,
    /// A streamed reply is being applied to the active transcript.
    AwaitingReply,
}

/// Orchestrates sessions, streaming, and persistence.
pub struct ConversationController<B: ChatBackend> {
    backend: B,
    registry: SessionRegistry,
    active: Session,
    in_flight: Option<BoxStream<'static, StreamEvent>>,
    revision: watch::Sender<u64>,
}

impl<B: ChatBackend> ConversationController<B> {
    /// Creates a controller, resuming the most recent persisted session or
    /// creating a fresh one if the registry is empty.
    pub fn new(backend: B, mut registry: SessionRegistry) -> Result<Self> {
        let active = match registry.most_recent() {
            Some(summary) => {
                let id = summary.id.clone();
                registry.load_session(&id)?
            }
            None => registry.create_session()?,
        };
        let (revision, _) = watch::channel(0);
        Ok(Self {
            backend,
            registry,
            active,
            in_flight: None,
            revision,
        })
    }

    /// The current turn state.
    pub fn state(&self) -> TurnState {
        if self.in_flight.is_some() {
            TurnState::AwaitingReply
        } else {
            TurnState::Idle
        }
    }

    /// The active session.
    pub fn active_session(&self) -> &Session {
        &self.active
    }

    /// The active session's transcript, in append order.
    pub fn messages(&self) -> &[crate::types::Message] {
        &self.active.messages
    }

    /// Session summaries, most recent first.
    pub fn list_sessions(&self) -> &[SessionSummary] {
        self.registry.list_sessions()
    }

    /// Subscribes to state mutations.
    ///
    /// The receiver observes a revision counter bumped on every mutation;
    /// the UI re-renders from snapshots whenever it changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn notify(&self) {
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    /// Sends a user message, opening a streamed reply.
    ///
    /// Appends the user message and a streaming assistant placeholder, then
    /// dispatches the request. Only legal while `Idle`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if a reply is already in flight, and the
    /// storage error if the save fails; the transcript is left untouched in
    /// both cases.
    pub async fn submit(&mut self, text: &str) -> Result<()> {
        if self.in_flight.is_some() {
            log::warn!(
                "session {}: submit rejected while awaiting a reply",
                self.active.id
            );
            return Err(Error::invalid_transition(
                "submit while a reply is in flight",
            ));
        }

        let base_len = self.active.messages.len();
        let base_title = self.active.title.clone();
        self.active.push_user_message(text);
        self.active.push_assistant_placeholder();
        if let Err(err) = self.registry.save_session(&self.active) {
            // A failed save must not leave a stray placeholder behind: the
            // next submit would push a second streaming message.
            self.active.messages.truncate(base_len);
            self.active.title = base_title;
            return Err(err);
        }
        self.notify();

        let stream = self.backend.send_turn(&self.active).await;
        self.in_flight = Some(stream);
        Ok(())
    }

    /// Awaits and applies the next streamed event.
    ///
    /// Returns the state after application: `AwaitingReply` while deltas
    /// keep arriving, `Idle` once the terminal event lands (reply complete
    /// or failed, transcript persisted either way). Returns `Idle`
    /// immediately when nothing is in flight.
    pub async fn tick(&mut self) -> Result<TurnState> {
        let Some(stream) = self.in_flight.as_mut() else {
            return Ok(TurnState::Idle);
        };

        match stream.next().await {
            Some(event) => self.apply_event(event),
            None => {
                // The backend contract promises a terminal event; treat a
                // bare end-of-stream as a failure.
                self.in_flight = None;
                self.fail_streaming_message("stream ended unexpectedly");
                self.registry.save_session(&self.active)?;
                self.notify();
                Ok(TurnState::Idle)
            }
        }
    }

    /// Drives the in-flight exchange to completion.
    pub async fn run_to_idle(&mut self) -> Result<()> {
        while self.tick().await? == TurnState::AwaitingReply {}
        Ok(())
    }

    fn apply_event(&mut self, event: StreamEvent) -> Result<TurnState> {
        if event.session_id != self.active.id {
            // Cancellation drops the stream before any switch, so a stale
            // event indicates a backend bug. Drop it rather than corrupt
            // the active transcript.
            log::warn!(
                "dropping stream event for session {} while {} is active",
                event.session_id,
                self.active.id
            );
            return Ok(self.state());
        }

        if let Some(error) = event.error {
            self.in_flight = None;
            self.fail_streaming_message(&error);
            self.registry.save_session(&self.active)?;
            self.notify();
            return Ok(TurnState::Idle);
        }

        if let Some(idx) = self.active.streaming_index() {
            self.active.messages[idx].append_delta(&event.delta_text);
        } else {
            log::warn!(
                "session {}: stream event with no streaming message",
                self.active.id
            );
        }

        if event.is_final {
            self.in_flight = None;
            if let Some(idx) = self.active.streaming_index() {
                self.active.messages[idx].mark_complete();
            }
            self.registry.save_session(&self.active)?;
            self.notify();
            Ok(TurnState::Idle)
        } else {
            self.notify();
            Ok(TurnState::AwaitingReply)
        }
    }

    fn fail_streaming_message(&mut self, annotation: &str) {
        if let Some(idx) = self.active.streaming_index() {
            self.active.messages[idx].mark_failed(annotation);
        }
    }

    /// Drops the in-flight stream, if any, and records the abandoned reply.
    ///
    /// Dropping the stream releases the underlying connection; no further
    /// events can be delivered.
    fn cancel_in_flight(&mut self) -> Result<()> {
        if self.in_flight.take().is_some() {
            log::debug!("session {}: in-flight reply cancelled", self.active.id);
            self.fail_streaming_message(CANCELLED);
            self.registry.save_session(&self.active)?;
            self.notify();
        }
        Ok(())
    }

    /// Creates and activates a fresh session, cancelling any in-flight
    /// reply first.
    pub fn new_session(&mut self) -> Result<()> {
        self.cancel_in_flight()?;
        self.active = self.registry.create_session()?;
        self.notify();
        Ok(())
    }

    /// Activates another session, cancelling any in-flight reply first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such session exists; the previously active
    /// session stays active and any in-flight reply keeps streaming.
    pub fn switch_session(&mut self, session_id: &str) -> Result<()> {
        if session_id == self.active.id {
            return Ok(());
        }
        if !self.registry.contains(session_id) {
            return Err(Error::not_found(
                "no such session",
                Some(session_id.to_string()),
            ));
        }
        self.cancel_in_flight()?;
        self.active = self.registry.load_session(session_id)?;
        self.notify();
        Ok(())
    }

    /// Deletes a session, cancelling any in-flight reply first.
    ///
    /// Deleting the active session activates the most recent survivor, or a
    /// fresh session when none remain; the controller never points at a
    /// deleted id. Idempotent for ids already gone.
    pub fn delete_session(&mut self, session_id: &str) -> Result<()> {
        self.cancel_in_flight()?;
        self.registry.delete_session(session_id)?;
        if self.active.id == session_id {
            self.active = match self.registry.most_recent() {
                Some(summary) => {
                    let id = summary.id.clone();
                    self.registry.load_session(&id)?
                }
                None => self.registry.create_session()?,
            };
        }
        self.notify();
        Ok(())
    }

    /// Cancels any in-flight reply and persists the active session.
    ///
    /// Process exit is the caller's business; this only flushes state.
    pub fn quit(&mut self) -> Result<()> {
        self.cancel_in_flight()?;
        self.registry.save_session(&self.active)?;
        self.notify();
        Ok(())
    }
}
