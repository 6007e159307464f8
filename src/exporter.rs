use crate::model::{Artifact, CaptureKind, Session, WindowRef};
use crate::settings::Settings;
use crate::state::{AggregateStore, ArtifactStore};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use log::info;
use reqwest::Client;
use serde::Serialize;
use uuid::Uuid;

/// Capture record as shipped to the remote collector. Local filesystem paths
/// stay on this machine.
#[derive(Debug, Serialize)]
struct ExportArtifact<'a> {
    id: Uuid,
    filename: &'a str,
    captured_at: DateTime<Utc>,
    kind: CaptureKind,
    source_window: Option<&'a WindowRef>,
    byte_size: u64,
}

impl<'a> From<&'a Artifact> for ExportArtifact<'a> {
    fn from(artifact: &'a Artifact) -> Self {
        Self {
            id: artifact.id,
            filename: &artifact.filename,
            captured_at: artifact.captured_at,
            kind: artifact.kind,
            source_window: artifact.source_window.as_ref(),
            byte_size: artifact.byte_size,
        }
    }
}

#[derive(Debug, Serialize)]
struct ExportUser<'a> {
    first_name: &'a str,
    last_name: &'a str,
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct ExportPayload<'a> {
    user: ExportUser<'a>,
    sessions: &'a [Session],
    artifacts: Vec<ExportArtifact<'a>>,
    exported_at: DateTime<Utc>,
}

fn payload<'a>(
    settings: &'a Settings,
    sessions: &'a [Session],
    artifacts: &'a [Artifact],
    exported_at: DateTime<Utc>,
) -> ExportPayload<'a> {
    ExportPayload {
        user: ExportUser {
            first_name: &settings.first_name,
            last_name: &settings.last_name,
            email: &settings.email,
        },
        sessions,
        artifacts: artifacts.iter().map(ExportArtifact::from).collect(),
        exported_at,
    }
}

/// One-shot upload of the session history and capture records to the
/// configured collector endpoint.
pub async fn export(
    client: &Client,
    settings: &Settings,
    aggregate: &AggregateStore,
    artifacts: &ArtifactStore,
) -> Result<()> {
    let server_url = settings.server_url.trim_end_matches('/');
    if server_url.is_empty() {
        bail!("no server URL configured; set one before exporting");
    }
    let url = format!("{server_url}/upload");

    let sessions = aggregate.sessions();
    let records = artifacts.all();
    let body = payload(settings, &sessions, &records, Utc::now());

    let response = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("failed to reach {url}"))?;
    if !response.status().is_success() {
        bail!("collector rejected upload: {}", response.status());
    }

    info!(
        "exported {} sessions and {} artifacts to {url}",
        sessions.len(),
        records.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::payload;
    use crate::model::{Artifact, CaptureKind, Session};
    use crate::settings::Settings;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    #[test]
    fn payload_omits_local_storage_paths() {
        let settings = Settings {
            first_name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            ..Settings::default()
        };
        let captured_at = Utc.timestamp_millis_opt(1_030).single().expect("timestamp");
        let artifact = Artifact {
            id: Uuid::new_v4(),
            filename: "capture-1030.png".to_string(),
            captured_at,
            kind: CaptureKind::ActiveWindow,
            source_window: None,
            byte_size: 10,
            storage_path: "/home/ada/.worktrack/artifacts/capture-1030.png".into(),
        };
        let sessions: Vec<Session> = Vec::new();

        let body = payload(&settings, &sessions, std::slice::from_ref(&artifact), captured_at);
        let value = serde_json::to_value(&body).expect("serialize");

        assert_eq!(value["user"]["first_name"], "Ada");
        assert_eq!(value["artifacts"][0]["filename"], "capture-1030.png");
        assert_eq!(value["artifacts"][0]["kind"], "active_window");
        assert!(value["artifacts"][0].get("storage_path").is_none());
    }
}
