use crate::capabilities::{IdleProbe, WindowProbe};
use crate::model::ActivitySample;
use chrono::{DateTime, TimeDelta, Utc};
use log::debug;

/// Idle-meter reading below this counts as fresh input.
pub const RECENT_INPUT_THRESHOLD_SECS: u64 = 5;

/// Time without any activity evidence before the user counts as idle.
pub const DEFAULT_IDLE_THRESHOLD: TimeDelta = TimeDelta::minutes(5);

/// Activity detection state between ticks.
///
/// Retains exactly the previous `(window title, process id)` pair for change
/// detection, nothing deeper. A window change or a low idle-meter reading is
/// evidence of activity; while a session is tracking, tracking itself also
/// counts as activity and refreshes `last_activity_at`.
#[derive(Debug)]
pub struct ActivityTracker {
    previous_window: (String, i32),
    last_activity_at: DateTime<Utc>,
    idle_threshold: TimeDelta,
}

impl ActivityTracker {
    pub fn new(now: DateTime<Utc>, idle_threshold: TimeDelta) -> Self {
        Self {
            previous_window: (String::new(), 0),
            last_activity_at: now,
            idle_threshold,
        }
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    pub fn observe(
        &mut self,
        now: DateTime<Utc>,
        window: &WindowProbe,
        idle: &IdleProbe,
        is_tracking: bool,
    ) -> ActivitySample {
        let mut window_title = None;
        let mut window_process_id = None;
        let mut window_changed = false;

        if let WindowProbe::Available(front) = window {
            let current = front
                .as_ref()
                .map(|w| (w.title.clone(), w.process_id))
                .unwrap_or_default();
            if current != self.previous_window {
                window_changed = true;
                debug!("activity: foreground window changed to {:?}", current.0);
            }
            if let Some(front) = front {
                window_title = Some(front.title.clone());
                window_process_id = Some(front.process_id);
            }
            self.previous_window = current;
        }

        let mut system_idle_seconds = None;
        let mut recent_input = false;
        if let IdleProbe::Available(seconds) = idle {
            system_idle_seconds = Some(*seconds);
            if *seconds < RECENT_INPUT_THRESHOLD_SECS {
                recent_input = true;
                debug!("activity: system idle time is low ({seconds}s)");
            }
        }

        let has_recent_activity = window_changed || recent_input;
        if has_recent_activity || is_tracking {
            self.last_activity_at = now;
        }

        let is_idle = now - self.last_activity_at > self.idle_threshold;

        ActivitySample {
            sampled_at: now,
            window_title,
            window_process_id,
            system_idle_seconds,
            has_recent_activity,
            is_idle,
            last_activity_at: self.last_activity_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ActivityTracker, DEFAULT_IDLE_THRESHOLD};
    use crate::capabilities::{IdleProbe, ProbeUnavailable, WindowProbe};
    use crate::model::WindowRef;
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).single().expect("timestamp")
    }

    fn window(title: &str, pid: i32) -> WindowProbe {
        WindowProbe::Available(Some(WindowRef {
            title: title.to_string(),
            owner_name: "app".to_string(),
            bounds: None,
            process_id: pid,
        }))
    }

    fn unavailable() -> WindowProbe {
        WindowProbe::Unavailable(ProbeUnavailable::NotSupported)
    }

    #[test]
    fn window_change_counts_as_activity() {
        let mut tracker = ActivityTracker::new(at(0), DEFAULT_IDLE_THRESHOLD);

        // First reading differs from the empty initial pair.
        let sample = tracker.observe(at(1_000), &window("a", 1), &IdleProbe::Available(60), false);
        assert!(sample.has_recent_activity);

        let sample = tracker.observe(at(2_000), &window("a", 1), &IdleProbe::Available(60), false);
        assert!(!sample.has_recent_activity);

        let sample = tracker.observe(at(3_000), &window("b", 1), &IdleProbe::Available(60), false);
        assert!(sample.has_recent_activity);
    }

    #[test]
    fn low_idle_meter_counts_as_activity() {
        let mut tracker = ActivityTracker::new(at(0), DEFAULT_IDLE_THRESHOLD);
        tracker.observe(at(500), &window("a", 1), &IdleProbe::Available(60), false);

        let sample = tracker.observe(at(1_000), &window("a", 1), &IdleProbe::Available(2), false);
        assert!(sample.has_recent_activity);
        assert_eq!(sample.system_idle_seconds, Some(2));
    }

    #[test]
    fn unavailable_probes_are_excluded_without_failing() {
        let mut tracker = ActivityTracker::new(at(0), DEFAULT_IDLE_THRESHOLD);
        let sample = tracker.observe(
            at(1_000),
            &unavailable(),
            &IdleProbe::Unavailable(ProbeUnavailable::NotSupported),
            false,
        );
        assert!(!sample.has_recent_activity);
        assert_eq!(sample.window_title, None);
        assert_eq!(sample.system_idle_seconds, None);
    }

    #[test]
    fn becomes_idle_after_threshold_without_evidence() {
        let mut tracker = ActivityTracker::new(at(0), TimeDelta::seconds(10));
        tracker.observe(at(1_000), &window("a", 1), &IdleProbe::Available(60), false);

        // Just inside the threshold.
        let sample = tracker.observe(at(11_000), &window("a", 1), &IdleProbe::Available(60), false);
        assert!(!sample.is_idle);

        let sample = tracker.observe(at(30_000), &window("a", 1), &IdleProbe::Available(60), false);
        assert!(sample.is_idle);
        assert_eq!(sample.last_activity_at, at(1_000));
    }

    #[test]
    fn tracking_itself_refreshes_last_activity() {
        let mut tracker = ActivityTracker::new(at(0), TimeDelta::seconds(10));
        tracker.observe(at(1_000), &window("a", 1), &IdleProbe::Available(60), true);

        // Far past the threshold, but tracking keeps the anchor fresh.
        let sample = tracker.observe(at(60_000), &window("a", 1), &IdleProbe::Available(60), true);
        assert!(!sample.is_idle);
        assert_eq!(sample.last_activity_at, at(60_000));
    }
}
