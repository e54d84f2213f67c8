//! Durable transcript storage.
//!
//! Each session is persisted as one JSON file named `<id>.json` under the
//! store root. Saves are atomic: the record is written to a sibling temp
//! file and renamed into place, so a crash or concurrent reader never
//! observes a partially written transcript.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::IgnoredAny;
use serde_json::{from_reader, to_writer_pretty};
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::types::{Session, SessionSummary};

/// Suffix for the temp file a save is staged through.
const TMP_SUFFIX: &str = ".tmp";

/// File-per-session transcript store.
#[derive(Debug)]
pub struct TranscriptStore {
    root: PathBuf,
}

/// Summary view of an on-disk record. `messages` is deserialized as ignored
/// placeholders so listing stays cheap on long transcripts.
#[derive(Deserialize)]
struct SummaryRecord {
    id: String,
    title: String,
    #[serde(with = "crate::types::rfc3339")]
    created_at: OffsetDateTime,
    #[serde(default)]
    messages: Vec<IgnoredAny>,
}

impl TranscriptStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|err| Error::storage("failed to create transcript directory", err))?;
        Ok(Self { root })
    }

    /// Returns the store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.json"))
    }

    /// Persists the full session atomically.
    pub fn save(&self, session: &Session) -> Result<()> {
        let path = self.path_for(&session.id);
        let tmp_path = self.root.join(format!("{}.json{TMP_SUFFIX}", session.id));

        let file = File::create(&tmp_path)
            .map_err(|err| Error::storage("failed to create transcript temp file", err))?;
        let mut writer = BufWriter::new(file);
        to_writer_pretty(&mut writer, session).map_err(|err| {
            Error::serialization("failed to serialize transcript", Some(Box::new(err)))
        })?;
        writer
            .flush()
            .map_err(|err| Error::storage("failed to flush transcript temp file", err))?;

        fs::rename(&tmp_path, &path)
            .map_err(|err| Error::storage("failed to commit transcript file", err))?;
        log::debug!(
            "saved session {} ({} messages)",
            session.id,
            session.messages.len()
        );
        Ok(())
    }

    /// Loads a session by id.
    ///
    /// Messages left in streaming status by a crash are normalized to failed.
    pub fn load(&self, session_id: &str) -> Result<Session> {
        let path = self.path_for(session_id);
        let file = File::open(&path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                Error::not_found("no transcript on disk", Some(session_id.to_string()))
            } else {
                Error::storage("failed to open transcript file", err)
            }
        })?;
        let reader = BufReader::new(file);
        let mut session: Session = from_reader(reader).map_err(|err| {
            Error::serialization("failed to parse transcript", Some(Box::new(err)))
        })?;
        let normalized = session.normalize_interrupted();
        if normalized > 0 {
            log::warn!(
                "session {}: {normalized} interrupted message(s) marked failed on reload",
                session.id
            );
        }
        Ok(session)
    }

    /// Lists summaries for every readable record, in directory order.
    ///
    /// Unreadable or malformed files are skipped with a warning so one
    /// corrupt transcript cannot take down the sidebar.
    pub fn list_all(&self) -> Result<Vec<SessionSummary>> {
        let entries = fs::read_dir(&self.root)
            .map_err(|err| Error::storage("failed to read transcript directory", err))?;

        let mut summaries = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("skipping unreadable directory entry: {err}");
                    continue;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_summary(&path) {
                Ok(summary) => summaries.push(summary),
                Err(err) => {
                    log::warn!("skipping malformed transcript {}: {err}", path.display());
                }
            }
        }
        Ok(summaries)
    }

    fn read_summary(path: &Path) -> Result<SessionSummary> {
        let file =
            File::open(path).map_err(|err| Error::storage("failed to open transcript", err))?;
        let reader = BufReader::new(file);
        let record: SummaryRecord = from_reader(reader).map_err(|err| {
            Error::serialization("failed to parse transcript header", Some(Box::new(err)))
        })?;
        Ok(SessionSummary {
            id: record.id,
            title: record.title,
            created_at: record.created_at,
            message_count: record.messages.len(),
        })
    }

    /// Removes the persisted record. A missing file is a no-op, which makes
    /// deletion idempotent.
    pub fn delete(&self, session_id: &str) -> Result<()> {
        match fs::remove_file(self.path_for(session_id)) {
            Ok(()) => {
                log::debug!("deleted session {session_id}");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::storage("failed to delete transcript file", err)),
        }
    }
}
