//! In-memory catalog of known sessions.
//!
//! The registry fronts the [`TranscriptStore`] with a summary cache so the
//! sidebar can be populated without touching the disk. It is the single disk
//! gateway the conversation controller goes through; ordering of
//! `list_sessions` (newest first) is a user-facing contract.

use crate::error::Result;
use crate::store::TranscriptStore;
use crate::types::{Session, SessionSummary};

/// Catalog of sessions backed by a [`TranscriptStore`].
#[derive(Debug)]
pub struct SessionRegistry {
    store: TranscriptStore,
    summaries: Vec<SessionSummary>,
}

impl SessionRegistry {
    /// Builds a registry over `store`, priming the cache from disk.
    pub fn new(store: TranscriptStore) -> Result<Self> {
        let summaries = store.list_all()?;
        let mut registry = Self { store, summaries };
        registry.sort_summaries();
        log::debug!("registry primed with {} session(s)", registry.summaries.len());
        Ok(registry)
    }

    /// Creates a fresh session and persists its shell immediately, so a
    /// crash right after creation does not lose it.
    pub fn create_session(&mut self) -> Result<Session> {
        let session = Session::new();
        self.store.save(&session)?;
        self.summaries.insert(0, session.summary());
        self.sort_summaries();
        log::debug!("created session {}", session.id);
        Ok(session)
    }

    /// Returns summaries ordered by creation time, most recent first.
    pub fn list_sessions(&self) -> &[SessionSummary] {
        &self.summaries
    }

    /// Returns the most recently created session's summary, if any.
    pub fn most_recent(&self) -> Option<&SessionSummary> {
        self.summaries.first()
    }

    /// Returns true if the registry knows `session_id`.
    pub fn contains(&self, session_id: &str) -> bool {
        self.summaries.iter().any(|s| s.id == session_id)
    }

    /// Loads the full session from the store.
    pub fn load_session(&self, session_id: &str) -> Result<Session> {
        self.store.load(session_id)
    }

    /// Persists a session and refreshes its cached summary.
    pub fn save_session(&mut self, session: &Session) -> Result<()> {
        self.store.save(session)?;
        match self.summaries.iter_mut().find(|s| s.id == session.id) {
            Some(cached) => *cached = session.summary(),
            None => self.summaries.push(session.summary()),
        }
        self.sort_summaries();
        Ok(())
    }

    /// Removes a session from the cache and the store. Idempotent: deleting
    /// an unknown id is a no-op. Never auto-selects a replacement; that is
    /// the caller's responsibility.
    pub fn delete_session(&mut self, session_id: &str) -> Result<()> {
        self.store.delete(session_id)?;
        self.summaries.retain(|s| s.id != session_id);
        Ok(())
    }

    fn sort_summaries(&mut self) {
        self.summaries
            .sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
    }
}
