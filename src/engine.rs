use crate::activity::{ActivityTracker, DEFAULT_IDLE_THRESHOLD};
use crate::capabilities::{IdleMeter, WindowInspector};
use crate::capture::CapturePipeline;
use crate::clock::Clock;
use crate::model::{ActiveSessionRecord, ActivitySample, Artifact, Session, Stats, StopOutcome};
use crate::state::{AggregateStore, ArtifactStore};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const DEFAULT_CAPTURE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_ACTIVITY_INTERVAL: Duration = Duration::from_secs(30);
const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub capture_interval: Duration,
    pub activity_interval: Duration,
    pub idle_threshold: TimeDelta,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capture_interval: DEFAULT_CAPTURE_INTERVAL,
            activity_interval: DEFAULT_ACTIVITY_INTERVAL,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
        }
    }
}

/// Notifications for observers (the presentation layer).
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Started {
        session_id: Uuid,
        resumed: bool,
    },
    /// 1 Hz while tracking. Observational only.
    Tick {
        session_ms: i64,
        total_ms: i64,
    },
    Activity(ActivitySample),
    ArtifactCommitted(Artifact),
    Stopped(StopOutcome),
}

struct PeriodicTasks {
    ticker: JoinHandle<()>,
    capture: JoinHandle<()>,
    activity: JoinHandle<()>,
}

impl PeriodicTasks {
    fn abort_all(&self) {
        self.ticker.abort();
        self.capture.abort();
        self.activity.abort();
    }
}

struct TrackingState {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    /// Portion of this session already folded into the cumulative total by
    /// `checkpoint()`.
    checkpointed_ms: i64,
    tasks: PeriodicTasks,
}

/// The session lifecycle state machine.
///
/// Two states: Idle (`inner` is `None`) and Tracking. `start`/`stop` guard on
/// the current state under a single lock, which is the whole of the
/// concurrency control; the periodic tasks only append to their own store or
/// read shared state.
pub struct SessionEngine {
    inner: Arc<Mutex<Option<TrackingState>>>,
    aggregate: AggregateStore,
    artifacts: ArtifactStore,
    pipeline: Arc<CapturePipeline>,
    inspector: Arc<dyn WindowInspector>,
    idle_meter: Arc<dyn IdleMeter>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    events: Option<UnboundedSender<EngineEvent>>,
}

impl SessionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        aggregate: AggregateStore,
        artifacts: ArtifactStore,
        pipeline: Arc<CapturePipeline>,
        inspector: Arc<dyn WindowInspector>,
        idle_meter: Arc<dyn IdleMeter>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        events: Option<UnboundedSender<EngineEvent>>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
            aggregate,
            artifacts,
            pipeline,
            inspector,
            idle_meter,
            clock,
            config,
            events,
        }
    }

    /// Starts a new session. Returns `Ok(false)` without side effects when a
    /// session is already tracking. The tracking flag and session anchor are
    /// persisted before the in-memory transition so a crash right after
    /// `start()` still resumes.
    pub async fn start(&self) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        if guard.is_some() {
            return Ok(false);
        }

        let now = self.clock.now();
        let session_id = Uuid::new_v4();

        let mut state = self.aggregate.load();
        state.is_tracking = true;
        state.active_session = Some(ActiveSessionRecord {
            id: session_id,
            started_at: now,
            checkpointed_ms: 0,
        });
        self.aggregate
            .persist(&state)
            .context("failed to persist tracking state at start")?;

        *guard = Some(TrackingState {
            session_id,
            started_at: now,
            checkpointed_ms: 0,
            tasks: self.spawn_tasks(),
        });
        drop(guard);

        info!("session {session_id} started");
        self.send(EngineEvent::Started {
            session_id,
            resumed: false,
        });

        // A session always gets an immediate capture attempt; failure here is
        // tolerated like any other missed tick.
        match self.pipeline.capture_once().await {
            Ok(Some(artifact)) => self.send(EngineEvent::ArtifactCommitted(artifact)),
            Ok(None) => {}
            Err(err) => warn!("initial capture failed: {err:#}"),
        }

        Ok(true)
    }

    /// Closes the active session: cancels the periodic tasks, folds elapsed
    /// time into the cumulative total, snapshots the session's artifacts by
    /// the `[started_at, ended_at)` window, and appends it to history.
    /// Returns `Ok(None)` when already idle.
    pub async fn stop(&self) -> Result<Option<StopOutcome>> {
        let mut guard = self.inner.lock().await;
        let Some(tracking) = guard.take() else {
            return Ok(None);
        };
        tracking.tasks.abort_all();

        let now = self.clock.now();
        let duration_ms = (now - tracking.started_at).num_milliseconds();

        let mut state = self.aggregate.load();
        state.cumulative_tracked_ms += duration_ms - tracking.checkpointed_ms;
        state.is_tracking = false;
        state.active_session = None;

        // A capture in flight when the tasks were aborted may still commit
        // afterwards; the window filter excludes it deterministically.
        let session = Session {
            id: tracking.session_id,
            started_at: tracking.started_at,
            ended_at: Some(now),
            duration_ms,
            artifacts: self.artifacts.between(tracking.started_at, now),
        };

        self.aggregate
            .append_session(&session)
            .context("failed to persist closed session at stop")?;
        self.aggregate
            .persist(&state)
            .context("failed to persist aggregate state at stop")?;
        drop(guard);

        let outcome = StopOutcome {
            session_duration_ms: duration_ms,
            cumulative_tracked_ms: state.cumulative_tracked_ms,
        };
        info!(
            "session {} stopped after {}ms ({} artifacts)",
            session.id,
            duration_ms,
            session.artifacts.len()
        );
        self.send(EngineEvent::Stopped(outcome));
        Ok(Some(outcome))
    }

    /// Shutdown path: folds elapsed time into the cumulative total without
    /// closing the session, so the next start-up resumes it. The amount
    /// already folded is recorded on the active-session record and deducted
    /// at `stop()`.
    pub async fn checkpoint(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let Some(tracking) = guard.as_mut() else {
            return Ok(());
        };

        let now = self.clock.now();
        let elapsed_ms = (now - tracking.started_at).num_milliseconds();

        let mut state = self.aggregate.load();
        state.cumulative_tracked_ms += elapsed_ms - tracking.checkpointed_ms;
        if let Some(active) = state.active_session.as_mut() {
            active.checkpointed_ms = elapsed_ms;
        }
        self.aggregate
            .persist(&state)
            .context("failed to persist aggregate state at checkpoint")?;
        tracking.checkpointed_ms = elapsed_ms;

        info!("checkpointed {elapsed_ms}ms of the active session");
        Ok(())
    }

    /// Reconstructs the Tracking state after a restart. A session left open
    /// by a crash or shutdown resumes with its original `started_at`, as if
    /// it never stopped. Returns whether a session was resumed.
    pub async fn recover(&self) -> Result<bool> {
        let state = self.aggregate.load();
        if !state.is_tracking {
            return Ok(false);
        }
        let Some(record) = state.active_session else {
            warn!("tracking flag set without a session anchor; clearing");
            let mut cleared = state;
            cleared.is_tracking = false;
            self.aggregate
                .persist(&cleared)
                .context("failed to clear dangling tracking flag")?;
            return Ok(false);
        };

        let mut guard = self.inner.lock().await;
        if guard.is_some() {
            return Ok(false);
        }
        *guard = Some(TrackingState {
            session_id: record.id,
            started_at: record.started_at,
            checkpointed_ms: record.checkpointed_ms,
            tasks: self.spawn_tasks(),
        });
        drop(guard);

        info!(
            "resumed session {} started at {}",
            record.id, record.started_at
        );
        self.send(EngineEvent::Started {
            session_id: record.id,
            resumed: true,
        });
        Ok(true)
    }

    pub async fn is_tracking(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Elapsed time of the active session, if any.
    pub async fn session_elapsed_ms(&self) -> Option<i64> {
        let guard = self.inner.lock().await;
        guard
            .as_ref()
            .map(|tracking| (self.clock.now() - tracking.started_at).num_milliseconds())
    }

    pub fn stats(&self) -> Stats {
        let state = self.aggregate.load();
        let sessions = self.aggregate.sessions();
        Stats {
            cumulative_tracked_ms: state.cumulative_tracked_ms,
            sessions_count: sessions.len(),
            artifacts_count: self.artifacts.count(),
            is_tracking: state.is_tracking,
            last_session: sessions.into_iter().next_back(),
        }
    }

    /// Manual capture, independent of the periodic scheduler.
    pub async fn capture_now(&self) -> Result<Option<Artifact>> {
        let artifact = self.pipeline.capture_once().await?;
        if let Some(artifact) = artifact.clone() {
            self.send(EngineEvent::ArtifactCommitted(artifact));
        }
        Ok(artifact)
    }

    fn spawn_tasks(&self) -> PeriodicTasks {
        PeriodicTasks {
            ticker: self.spawn_ticker(),
            capture: self.spawn_capture_scheduler(),
            activity: self.spawn_activity_monitor(),
        }
    }

    /// 1 Hz elapsed-time ticker. Observational only; never touches durable
    /// state.
    fn spawn_ticker(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let aggregate = self.aggregate.clone();
        let clock = self.clock.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let tick = {
                    let guard = inner.lock().await;
                    let Some(tracking) = guard.as_ref() else {
                        break;
                    };
                    let session_ms = (clock.now() - tracking.started_at).num_milliseconds();
                    let total_ms = aggregate.load().cumulative_tracked_ms + session_ms
                        - tracking.checkpointed_ms;
                    EngineEvent::Tick {
                        session_ms,
                        total_ms,
                    }
                };
                send_event(&events, tick);
            }
        })
    }

    fn spawn_capture_scheduler(&self) -> JoinHandle<()> {
        let pipeline = self.pipeline.clone();
        let events = self.events.clone();
        let every = self.config.capture_interval;

        tokio::spawn(async move {
            // The immediate capture at start() covers the first shot; this
            // task owns the periodic ones.
            loop {
                tokio::time::sleep(every).await;
                match pipeline.capture_once().await {
                    Ok(Some(artifact)) => {
                        send_event(&events, EngineEvent::ArtifactCommitted(artifact));
                    }
                    Ok(None) => {}
                    Err(err) => warn!("scheduled capture failed: {err:#}"),
                }
            }
        })
    }

    fn spawn_activity_monitor(&self) -> JoinHandle<()> {
        let inspector = self.inspector.clone();
        let idle_meter = self.idle_meter.clone();
        let clock = self.clock.clone();
        let events = self.events.clone();
        let every = self.config.activity_interval;
        let idle_threshold = self.config.idle_threshold;

        tokio::spawn(async move {
            let mut tracker = ActivityTracker::new(clock.now(), idle_threshold);
            loop {
                tokio::time::sleep(every).await;
                let window = inspector.active_window().await;
                let idle = idle_meter.idle_seconds().await;
                let sample = tracker.observe(clock.now(), &window, &idle, true);
                if sample.is_idle {
                    // Informational only; idle never auto-stops the session.
                    info!(
                        "user appears idle since {}",
                        sample.last_activity_at.to_rfc3339()
                    );
                }
                send_event(&events, EngineEvent::Activity(sample));
            }
        })
    }

    fn send(&self, event: EngineEvent) {
        send_event(&self.events, event);
    }
}

fn send_event(events: &Option<UnboundedSender<EngineEvent>>, event: EngineEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineConfig, SessionEngine};
    use crate::capabilities::{
        IdleProbe, MockCaptureBehavior, MockIdleMeter, MockScreenCapturer, MockWindowInspector,
        WindowProbe,
    };
    use crate::capture::{CaptureConfig, CapturePipeline};
    use crate::clock::ManualClock;
    use crate::kv::JsonStore;
    use crate::state::{AggregateStore, ArtifactStore};
    use chrono::{DateTime, TimeZone, Utc};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).single().expect("timestamp")
    }

    struct Harness {
        engine: SessionEngine,
        clock: Arc<ManualClock>,
        capturer: Arc<MockScreenCapturer>,
        aggregate: AggregateStore,
        artifacts: ArtifactStore,
    }

    fn harness(dir: &Path, start_millis: i64) -> Harness {
        let kv = Arc::new(JsonStore::open(dir.join("store.json")).expect("open"));
        let aggregate = AggregateStore::new(kv.clone());
        let artifacts = ArtifactStore::new(kv);
        let clock = Arc::new(ManualClock::new(at(start_millis)));
        let capturer = Arc::new(MockScreenCapturer::default());
        let inspector = Arc::new(MockWindowInspector::new(WindowProbe::Available(None)));
        let idle_meter = Arc::new(MockIdleMeter::new(IdleProbe::Available(60)));

        let pipeline = Arc::new(CapturePipeline::new(
            capturer.clone(),
            inspector.clone(),
            artifacts.clone(),
            clock.clone(),
            CaptureConfig::new(dir.join("artifacts")),
        ));
        let engine = SessionEngine::new(
            aggregate.clone(),
            artifacts.clone(),
            pipeline,
            inspector,
            idle_meter,
            clock.clone(),
            EngineConfig::default(),
            None,
        );

        Harness {
            engine,
            clock,
            capturer,
            aggregate,
            artifacts,
        }
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_closes_one_session() {
        let dir = tempdir().expect("tempdir");
        let h = harness(dir.path(), 1_000);

        assert!(h.engine.start().await.expect("start"));
        assert!(!h.engine.start().await.expect("second start"));
        assert!(h.engine.is_tracking().await);

        h.clock.set(at(2_000));
        let outcome = h.engine.stop().await.expect("stop").expect("was tracking");
        assert_eq!(outcome.session_duration_ms, 1_000);
        assert!(h.engine.stop().await.expect("second stop").is_none());

        let sessions = h.aggregate.sessions();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].ended_at.is_some());
    }

    #[tokio::test]
    async fn at_most_one_session_is_ever_open() {
        let dir = tempdir().expect("tempdir");
        let h = harness(dir.path(), 1_000);

        for round in 0..3 {
            h.engine.start().await.expect("start");
            h.clock.advance(chrono::TimeDelta::milliseconds(500));
            h.engine.stop().await.expect("stop");
            let open = h
                .aggregate
                .sessions()
                .iter()
                .filter(|s| s.ended_at.is_none())
                .count();
            assert_eq!(open, 0, "round {round}");
        }
        assert!(!h.aggregate.load().is_tracking);
    }

    #[tokio::test]
    async fn stop_conserves_wall_clock_time() {
        let dir = tempdir().expect("tempdir");
        let h = harness(dir.path(), 1_000);

        h.engine.start().await.expect("start");
        h.clock.set(at(5_000));
        let outcome = h.engine.stop().await.expect("stop").expect("was tracking");

        assert_eq!(outcome.session_duration_ms, 4_000);
        assert_eq!(outcome.cumulative_tracked_ms, 4_000);
        assert_eq!(h.aggregate.load().cumulative_tracked_ms, 4_000);
    }

    #[tokio::test]
    async fn scenario_single_capture_session() {
        let dir = tempdir().expect("tempdir");
        let h = harness(dir.path(), 1_000);

        // No artifact from the immediate capture in this scenario.
        h.capturer.set_behavior(MockCaptureBehavior::FailAll);
        h.engine.start().await.expect("start");

        h.capturer.set_behavior(MockCaptureBehavior::Succeed);
        h.clock.set(at(1_030));
        let a1 = h
            .engine
            .capture_now()
            .await
            .expect("capture")
            .expect("artifact");

        h.clock.set(at(5_000));
        let outcome = h.engine.stop().await.expect("stop").expect("was tracking");
        assert_eq!(outcome.session_duration_ms, 4_000);
        assert_eq!(outcome.cumulative_tracked_ms, 4_000);

        let session = h.aggregate.last_session().expect("session");
        assert_eq!(session.artifacts, vec![a1]);
    }

    #[tokio::test]
    async fn restart_resumes_with_original_start_time() {
        let dir = tempdir().expect("tempdir");
        {
            let h = harness(dir.path(), 1_000);
            h.engine.start().await.expect("start");
            // Process "crashes" here: no stop, no checkpoint.
        }

        let h = harness(dir.path(), 3_000);
        assert!(h.engine.recover().await.expect("recover"));
        assert!(h.engine.is_tracking().await);

        h.clock.set(at(5_000));
        let outcome = h.engine.stop().await.expect("stop").expect("was tracking");
        assert_eq!(outcome.session_duration_ms, 4_000);
        assert_eq!(outcome.cumulative_tracked_ms, 4_000);
    }

    #[tokio::test]
    async fn checkpoint_then_restart_does_not_double_count() {
        let dir = tempdir().expect("tempdir");
        {
            let h = harness(dir.path(), 1_000);
            h.engine.start().await.expect("start");
            h.clock.set(at(3_000));
            h.engine.checkpoint().await.expect("checkpoint");
            assert_eq!(h.aggregate.load().cumulative_tracked_ms, 2_000);
        }

        let h = harness(dir.path(), 4_000);
        assert!(h.engine.recover().await.expect("recover"));
        h.clock.set(at(5_000));
        let outcome = h.engine.stop().await.expect("stop").expect("was tracking");

        // Full wall-clock duration, counted exactly once.
        assert_eq!(outcome.session_duration_ms, 4_000);
        assert_eq!(outcome.cumulative_tracked_ms, 4_000);
    }

    #[tokio::test]
    async fn recover_without_open_session_is_a_noop() {
        let dir = tempdir().expect("tempdir");
        let h = harness(dir.path(), 1_000);
        assert!(!h.engine.recover().await.expect("recover"));
        assert!(!h.engine.is_tracking().await);
    }

    #[tokio::test]
    async fn late_artifacts_are_excluded_from_the_closed_session() {
        let dir = tempdir().expect("tempdir");
        let h = harness(dir.path(), 1_000);

        h.engine.start().await.expect("start");
        h.clock.set(at(1_030));
        h.engine.capture_now().await.expect("capture");

        h.clock.set(at(5_000));
        h.engine.stop().await.expect("stop");

        // A capture landing after stop() is still committed to the artifact
        // store, just not to the closed session.
        h.clock.set(at(6_000));
        h.engine.capture_now().await.expect("late capture");

        let session = h.aggregate.last_session().expect("session");
        let times: Vec<i64> = session
            .artifacts
            .iter()
            .map(|a| a.captured_at.timestamp_millis())
            .collect();
        assert_eq!(times, vec![1_000, 1_030]);
        assert_eq!(h.artifacts.count(), 3);
    }

    #[tokio::test]
    async fn stats_reflect_history_and_tracking_flag() {
        let dir = tempdir().expect("tempdir");
        let h = harness(dir.path(), 1_000);

        h.engine.start().await.expect("start");
        h.clock.set(at(2_500));
        h.engine.stop().await.expect("stop");

        let stats = h.engine.stats();
        assert_eq!(stats.cumulative_tracked_ms, 1_500);
        assert_eq!(stats.sessions_count, 1);
        assert_eq!(stats.artifacts_count, 1);
        assert!(!stats.is_tracking);
        assert_eq!(stats.last_session.expect("last session").duration_ms, 1_500);
    }

    #[tokio::test]
    async fn start_fails_loudly_when_state_cannot_be_persisted() {
        let dir = tempdir().expect("tempdir");
        let h = harness(dir.path(), 1_000);

        // A directory squatting on the store path makes every persist fail.
        std::fs::remove_file(dir.path().join("store.json")).ok();
        std::fs::create_dir_all(dir.path().join("store.json")).expect("dir");

        assert!(h.engine.start().await.is_err());
        assert!(!h.engine.is_tracking().await);
    }
}
