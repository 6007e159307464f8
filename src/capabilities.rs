use crate::model::{Bounds, WindowRef};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

/// Failure of the screen-capture primitive at one fallback level.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture primitive failed: {0}")]
    Primitive(String),
    #[error("capture timed out after {0:.0?}")]
    Timeout(Duration),
}

/// Why a probe produced no reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeUnavailable {
    /// The OS denied the capability (e.g. missing Accessibility permission).
    PermissionDenied,
    /// The capability does not exist on this platform.
    NotSupported,
    /// The capability exists but this attempt failed.
    Failed(String),
}

impl std::fmt::Display for ProbeUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeUnavailable::PermissionDenied => write!(f, "permission denied"),
            ProbeUnavailable::NotSupported => write!(f, "not supported on this platform"),
            ProbeUnavailable::Failed(detail) => write!(f, "{detail}"),
        }
    }
}

/// Foreground-window reading. `Available(None)` means the inspector worked
/// but no window is frontmost.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowProbe {
    Available(Option<WindowRef>),
    Unavailable(ProbeUnavailable),
}

/// Seconds-since-last-input reading.
#[derive(Debug, Clone, PartialEq)]
pub enum IdleProbe {
    Available(u64),
    Unavailable(ProbeUnavailable),
}

#[async_trait]
pub trait ScreenCapturer: Send + Sync {
    /// Captures the given region, or the full screen when `region` is `None`,
    /// returning encoded PNG bytes.
    async fn capture(&self, region: Option<Bounds>) -> std::result::Result<Vec<u8>, CaptureError>;
}

#[async_trait]
pub trait WindowInspector: Send + Sync {
    async fn active_window(&self) -> WindowProbe;
}

#[async_trait]
pub trait IdleMeter: Send + Sync {
    async fn idle_seconds(&self) -> IdleProbe;
}

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);
const OSASCRIPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Captures via the `screencapture` binary, scoped with `-R` when bounds are
/// given.
#[derive(Debug, Default, Clone, Copy)]
pub struct MacOsScreenCapturer;

#[async_trait]
impl ScreenCapturer for MacOsScreenCapturer {
    async fn capture(&self, region: Option<Bounds>) -> std::result::Result<Vec<u8>, CaptureError> {
        let output_path = temp_capture_path();
        let mut command = Command::new("screencapture");
        command.arg("-x").arg("-t").arg("png");
        if let Some(bounds) = region {
            command.arg("-R").arg(format!(
                "{},{},{},{}",
                bounds.x.max(0),
                bounds.y.max(0),
                bounds.width,
                bounds.height
            ));
        }
        command.arg(&output_path);

        let status = timeout(CAPTURE_TIMEOUT, command.status())
            .await
            .map_err(|_| CaptureError::Timeout(CAPTURE_TIMEOUT))?
            .map_err(|err| CaptureError::Primitive(format!("failed to run screencapture: {err}")))?;

        if !status.success() {
            let _ = std::fs::remove_file(&output_path);
            return Err(CaptureError::Primitive(format!(
                "screencapture exited with status {status}"
            )));
        }

        let bytes = std::fs::read(&output_path).map_err(|err| {
            CaptureError::Primitive(format!("failed to read capture output: {err}"))
        })?;
        let _ = std::fs::remove_file(&output_path);
        Ok(bytes)
    }
}

fn temp_capture_path() -> PathBuf {
    std::env::temp_dir().join(format!("worktrack-capture-{}.png", uuid::Uuid::new_v4()))
}

/// Queries the frontmost window via AppleScript. Accessibility denial shows
/// up as an osascript error and maps to `PermissionDenied`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MacOsWindowInspector;

const FRONT_WINDOW_SCRIPT: &str = r#"
tell application "System Events"
    set frontApp to first application process whose frontmost is true
    set frontName to name of frontApp
    set frontPid to unix id of frontApp
    set windowTitle to ""
    set windowFrame to ""
    try
        set frontWindow to front window of frontApp
        set windowTitle to name of frontWindow
        set {px, py} to position of frontWindow
        set {sw, sh} to size of frontWindow
        set windowFrame to (px as string) & "," & py & "," & sw & "," & sh
    end try
end tell
return frontName & "\n" & frontPid & "\n" & windowTitle & "\n" & windowFrame
"#;

#[async_trait]
impl WindowInspector for MacOsWindowInspector {
    async fn active_window(&self) -> WindowProbe {
        match run_osascript(FRONT_WINDOW_SCRIPT).await {
            Ok(output) => match parse_front_window(&output) {
                Ok(window) => WindowProbe::Available(window),
                Err(err) => WindowProbe::Unavailable(ProbeUnavailable::Failed(format!("{err:#}"))),
            },
            Err(err) => {
                let detail = format!("{err:#}");
                if detail.contains("not authorized") || detail.contains("assistive access") {
                    WindowProbe::Unavailable(ProbeUnavailable::PermissionDenied)
                } else {
                    WindowProbe::Unavailable(ProbeUnavailable::Failed(detail))
                }
            }
        }
    }
}

fn parse_front_window(output: &str) -> Result<Option<WindowRef>> {
    let mut lines = output.lines();
    let owner_name = match lines.next().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => return Ok(None),
    };
    let process_id = lines
        .next()
        .map(str::trim)
        .unwrap_or_default()
        .parse::<i32>()
        .context("front process id was not numeric")?;
    let title = lines.next().map(str::trim).unwrap_or_default().to_string();
    let bounds = lines
        .next()
        .map(str::trim)
        .filter(|frame| !frame.is_empty())
        .and_then(parse_frame);

    Ok(Some(WindowRef {
        title,
        owner_name,
        bounds,
        process_id,
    }))
}

fn parse_frame(frame: &str) -> Option<Bounds> {
    let mut parts = frame.split(',').map(str::trim);
    let x = parts.next()?.parse().ok()?;
    let y = parts.next()?.parse().ok()?;
    let width = parts.next()?.parse().ok()?;
    let height = parts.next()?.parse().ok()?;
    Some(Bounds {
        x,
        y,
        width,
        height,
    })
}

async fn run_osascript(script: &str) -> Result<String> {
    let output = timeout(
        OSASCRIPT_TIMEOUT,
        Command::new("osascript")
            .arg("-e")
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output(),
    )
    .await
    .map_err(|_| anyhow!("osascript timed out"))?
    .context("failed to execute osascript")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "osascript exited with status {}: {}",
            output.status,
            stderr.trim()
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Seconds since last HID input, via CoreGraphics.
#[derive(Debug, Default, Clone, Copy)]
pub struct MacOsIdleMeter;

#[async_trait]
impl IdleMeter for MacOsIdleMeter {
    async fn idle_seconds(&self) -> IdleProbe {
        system_idle_seconds()
    }
}

#[cfg(target_os = "macos")]
fn system_idle_seconds() -> IdleProbe {
    const HID_SYSTEM_STATE: i32 = 1;
    const ANY_INPUT_EVENT_TYPE: u32 = u32::MAX;

    let seconds =
        unsafe { CGEventSourceSecondsSinceLastEventType(HID_SYSTEM_STATE, ANY_INPUT_EVENT_TYPE) };
    if seconds.is_finite() && seconds >= 0.0 {
        IdleProbe::Available(seconds as u64)
    } else {
        IdleProbe::Unavailable(ProbeUnavailable::Failed(format!(
            "implausible idle reading {seconds}"
        )))
    }
}

#[cfg(not(target_os = "macos"))]
fn system_idle_seconds() -> IdleProbe {
    IdleProbe::Unavailable(ProbeUnavailable::NotSupported)
}

#[cfg(target_os = "macos")]
#[link(name = "CoreGraphics", kind = "framework")]
unsafe extern "C" {
    fn CGEventSourceSecondsSinceLastEventType(state_id: i32, event_type: u32) -> f64;
}

/// Scriptable capturer for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCaptureBehavior {
    Succeed,
    FailScoped,
    FailAll,
}

#[derive(Debug)]
pub struct MockScreenCapturer {
    behavior: Mutex<MockCaptureBehavior>,
}

impl MockScreenCapturer {
    pub fn new(behavior: MockCaptureBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
        }
    }

    pub fn set_behavior(&self, behavior: MockCaptureBehavior) {
        *self.behavior.lock().expect("behavior mutex poisoned") = behavior;
    }
}

impl Default for MockScreenCapturer {
    fn default() -> Self {
        Self::new(MockCaptureBehavior::Succeed)
    }
}

#[async_trait]
impl ScreenCapturer for MockScreenCapturer {
    async fn capture(&self, region: Option<Bounds>) -> std::result::Result<Vec<u8>, CaptureError> {
        let behavior = *self.behavior.lock().expect("behavior mutex poisoned");
        match behavior {
            MockCaptureBehavior::Succeed => Ok(b"mock-image".to_vec()),
            MockCaptureBehavior::FailScoped if region.is_some() => Err(CaptureError::Primitive(
                "intentional scoped capture failure".to_string(),
            )),
            MockCaptureBehavior::FailScoped => Ok(b"mock-image".to_vec()),
            MockCaptureBehavior::FailAll => Err(CaptureError::Primitive(
                "intentional capture failure".to_string(),
            )),
        }
    }
}

/// Settable window inspector for tests.
#[derive(Debug)]
pub struct MockWindowInspector {
    probe: Mutex<WindowProbe>,
}

impl MockWindowInspector {
    pub fn new(probe: WindowProbe) -> Self {
        Self {
            probe: Mutex::new(probe),
        }
    }

    pub fn set(&self, probe: WindowProbe) {
        *self.probe.lock().expect("probe mutex poisoned") = probe;
    }
}

#[async_trait]
impl WindowInspector for MockWindowInspector {
    async fn active_window(&self) -> WindowProbe {
        self.probe.lock().expect("probe mutex poisoned").clone()
    }
}

/// Settable idle meter for tests.
#[derive(Debug)]
pub struct MockIdleMeter {
    probe: Mutex<IdleProbe>,
}

impl MockIdleMeter {
    pub fn new(probe: IdleProbe) -> Self {
        Self {
            probe: Mutex::new(probe),
        }
    }

    pub fn set(&self, probe: IdleProbe) {
        *self.probe.lock().expect("probe mutex poisoned") = probe;
    }
}

#[async_trait]
impl IdleMeter for MockIdleMeter {
    async fn idle_seconds(&self) -> IdleProbe {
        self.probe.lock().expect("probe mutex poisoned").clone()
    }
}
