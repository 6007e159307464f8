use crate::capabilities::{ProbeUnavailable, ScreenCapturer, WindowInspector, WindowProbe};
use crate::clock::Clock;
use crate::model::{Artifact, CaptureKind, WindowRef};
use crate::state::ArtifactStore;
use anyhow::{Context, Result};
use log::{debug, warn};
use std::fs::{File, create_dir_all};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Once};
use uuid::Uuid;

static PERMISSION_WARNING: Once = Once::new();

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub artifact_dir: PathBuf,
    pub filename_prefix: String,
}

impl CaptureConfig {
    pub fn new(artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifact_dir: artifact_dir.into(),
            filename_prefix: "capture".to_string(),
        }
    }
}

/// Single-tick capture logic shared by the periodic scheduler, the manual
/// capture operation, and the analysis gateway's fresh-capture step.
///
/// Fallback ladder: window-scoped capture when the inspector reports bounds,
/// retried unscoped on failure (`fullscreen_backup`); unscoped directly when
/// no window context exists (`fullscreen_fallback`). A tick where every level
/// fails commits nothing and is never fatal.
pub struct CapturePipeline {
    capturer: Arc<dyn ScreenCapturer>,
    inspector: Arc<dyn WindowInspector>,
    artifacts: ArtifactStore,
    clock: Arc<dyn Clock>,
    config: CaptureConfig,
}

impl CapturePipeline {
    pub fn new(
        capturer: Arc<dyn ScreenCapturer>,
        inspector: Arc<dyn WindowInspector>,
        artifacts: ArtifactStore,
        clock: Arc<dyn Clock>,
        config: CaptureConfig,
    ) -> Self {
        Self {
            capturer,
            inspector,
            artifacts,
            clock,
            config,
        }
    }

    /// Runs one capture tick. Returns the committed artifact, or `None` when
    /// capture failed at every fallback level.
    pub async fn capture_once(&self) -> Result<Option<Artifact>> {
        let window = self.probe_window().await;

        let scoped_region = window.as_ref().and_then(|w| w.bounds);
        let attempt = match scoped_region {
            Some(bounds) => match self.capturer.capture(Some(bounds)).await {
                Ok(bytes) => Some((bytes, CaptureKind::ActiveWindow)),
                Err(err) => {
                    warn!("window-scoped capture failed, retrying full screen: {err}");
                    self.fullscreen_backup().await
                }
            },
            None => match self.capturer.capture(None).await {
                Ok(bytes) => Some((bytes, CaptureKind::FullscreenFallback)),
                Err(err) => {
                    warn!("full-screen capture failed, retrying once: {err}");
                    self.fullscreen_backup().await
                }
            },
        };

        let Some((bytes, kind)) = attempt else {
            return Ok(None);
        };

        let artifact = self.commit(bytes, kind, window)?;
        debug!(
            "committed {} artifact {} ({} bytes)",
            match artifact.kind {
                CaptureKind::ActiveWindow => "active-window",
                CaptureKind::FullscreenFallback => "fullscreen-fallback",
                CaptureKind::FullscreenBackup => "fullscreen-backup",
            },
            artifact.filename,
            artifact.byte_size
        );
        Ok(Some(artifact))
    }

    async fn probe_window(&self) -> Option<WindowRef> {
        match self.inspector.active_window().await {
            WindowProbe::Available(window) => window,
            WindowProbe::Unavailable(ProbeUnavailable::PermissionDenied) => {
                // Denial repeats on every tick; warn once per process.
                PERMISSION_WARNING.call_once(|| {
                    warn!(
                        "window inspection denied by the OS; captures degrade to full screen \
                         until permission is granted"
                    );
                });
                None
            }
            WindowProbe::Unavailable(ProbeUnavailable::NotSupported) => None,
            WindowProbe::Unavailable(ProbeUnavailable::Failed(detail)) => {
                debug!("window inspection failed this tick: {detail}");
                None
            }
        }
    }

    async fn fullscreen_backup(&self) -> Option<(Vec<u8>, CaptureKind)> {
        match self.capturer.capture(None).await {
            Ok(bytes) => Some((bytes, CaptureKind::FullscreenBackup)),
            Err(err) => {
                warn!("capture failed at every fallback level, skipping this tick: {err}");
                None
            }
        }
    }

    /// Writes the capture bytes durably, then commits the record. The record
    /// never references a file that is not already on disk.
    fn commit(
        &self,
        bytes: Vec<u8>,
        kind: CaptureKind,
        source_window: Option<WindowRef>,
    ) -> Result<Artifact> {
        create_dir_all(&self.config.artifact_dir).with_context(|| {
            format!(
                "failed to create artifact directory {}",
                self.config.artifact_dir.display()
            )
        })?;

        let captured_at = self.clock.now();
        let filename = format!(
            "{}-{}.png",
            self.config.filename_prefix,
            captured_at.format("%Y%m%dT%H%M%S%.3fZ")
        );
        let storage_path = self.config.artifact_dir.join(&filename);

        let mut file = File::create(&storage_path)
            .with_context(|| format!("failed to create {}", storage_path.display()))?;
        file.write_all(&bytes)
            .and_then(|()| file.sync_all())
            .with_context(|| format!("failed to write {}", storage_path.display()))?;

        let artifact = Artifact {
            id: Uuid::new_v4(),
            filename,
            captured_at,
            kind,
            source_window,
            byte_size: bytes.len() as u64,
            storage_path,
        };
        self.artifacts.append(&artifact)?;
        Ok(artifact)
    }
}
