use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Pixel rectangle of a window on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Foreground window as reported by the OS at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRef {
    pub title: String,
    pub owner_name: String,
    pub bounds: Option<Bounds>,
    pub process_id: i32,
}

/// How a capture was obtained, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    /// Scoped to the foreground window's bounds.
    ActiveWindow,
    /// Full screen because no window context was available.
    FullscreenFallback,
    /// Full screen after a scoped (or first) capture attempt failed.
    FullscreenBackup,
}

/// One committed capture record. Immutable once written; the backing file
/// exists on disk before the record is committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub filename: String,
    pub captured_at: DateTime<Utc>,
    pub kind: CaptureKind,
    pub source_window: Option<WindowRef>,
    pub byte_size: u64,
    pub storage_path: PathBuf,
}

/// One tracked interval of work. `ended_at` is `None` only for the active
/// session; closed sessions are immutable history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub artifacts: Vec<Artifact>,
}

/// Persisted anchor for a session that is still open. `checkpointed_ms` is the
/// portion of this session already folded into the cumulative total by a
/// shutdown checkpoint, so a later `stop()` does not count it twice.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActiveSessionRecord {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub checkpointed_ms: i64,
}

/// Durable process-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    pub cumulative_tracked_ms: i64,
    pub is_tracking: bool,
    pub active_session: Option<ActiveSessionRecord>,
}

/// Transient activity reading emitted to observers. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivitySample {
    pub sampled_at: DateTime<Utc>,
    pub window_title: Option<String>,
    pub window_process_id: Option<i32>,
    pub system_idle_seconds: Option<u64>,
    pub has_recent_activity: bool,
    pub is_idle: bool,
    pub last_activity_at: DateTime<Utc>,
}

/// Result of a successful `stop()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    pub session_duration_ms: i64,
    pub cumulative_tracked_ms: i64,
}

/// Snapshot returned by the stats operation.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub cumulative_tracked_ms: i64,
    pub sessions_count: usize,
    pub artifacts_count: usize,
    pub is_tracking: bool,
    pub last_session: Option<Session>,
}
