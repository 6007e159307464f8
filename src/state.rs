use crate::kv::JsonStore;
use crate::model::{AggregateState, Artifact, Session};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

const KEY_CUMULATIVE_MS: &str = "cumulative_tracked_ms";
const KEY_IS_TRACKING: &str = "is_tracking";
const KEY_ACTIVE_SESSION: &str = "active_session";
const KEY_SESSIONS: &str = "sessions";
const KEY_ARTIFACTS: &str = "artifacts";

/// Durable totals and session history, layered on the key-value store.
///
/// Mutated only by the session engine at start, stop, and checkpoint; a
/// failed persist is propagated so in-memory state never silently diverges
/// from disk.
#[derive(Debug, Clone)]
pub struct AggregateStore {
    kv: Arc<JsonStore>,
}

impl AggregateStore {
    pub fn new(kv: Arc<JsonStore>) -> Self {
        Self { kv }
    }

    pub fn load(&self) -> AggregateState {
        AggregateState {
            cumulative_tracked_ms: self.kv.get(KEY_CUMULATIVE_MS, 0),
            is_tracking: self.kv.get(KEY_IS_TRACKING, false),
            active_session: self.kv.get(KEY_ACTIVE_SESSION, None),
        }
    }

    pub fn persist(&self, state: &AggregateState) -> Result<()> {
        self.kv
            .set(KEY_CUMULATIVE_MS, &state.cumulative_tracked_ms)
            .context("failed to persist cumulative tracked time")?;
        self.kv
            .set(KEY_ACTIVE_SESSION, &state.active_session)
            .context("failed to persist active session record")?;
        self.kv
            .set(KEY_IS_TRACKING, &state.is_tracking)
            .context("failed to persist tracking flag")?;
        Ok(())
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.kv.get(KEY_SESSIONS, Vec::new())
    }

    pub fn last_session(&self) -> Option<Session> {
        self.sessions().pop()
    }

    /// Appends a closed session to history. History is append-only; sessions
    /// are never rewritten or deleted.
    pub fn append_session(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions();
        sessions.push(session.clone());
        self.kv
            .set(KEY_SESSIONS, &sessions)
            .context("failed to persist session history")
    }
}

/// Append-only list of committed capture records.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    kv: Arc<JsonStore>,
}

impl ArtifactStore {
    pub fn new(kv: Arc<JsonStore>) -> Self {
        Self { kv }
    }

    pub fn all(&self) -> Vec<Artifact> {
        self.kv.get(KEY_ARTIFACTS, Vec::new())
    }

    pub fn count(&self) -> usize {
        self.all().len()
    }

    pub fn append(&self, artifact: &Artifact) -> Result<()> {
        let mut artifacts = self.all();
        artifacts.push(artifact.clone());
        self.kv
            .set(KEY_ARTIFACTS, &artifacts)
            .context("failed to persist artifact record")
    }

    /// Artifacts captured within the half-open window `[start, end)`.
    pub fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Artifact> {
        self.all()
            .into_iter()
            .filter(|artifact| artifact.captured_at >= start && artifact.captured_at < end)
            .collect()
    }
}
