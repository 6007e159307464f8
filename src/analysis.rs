use crate::capture::CapturePipeline;
use crate::model::Artifact;
use crate::settings::Settings;
use crate::state::ArtifactStore;
use base64::{Engine as _, engine::general_purpose};
use image::ImageFormat;
use log::warn;
use reqwest::Client;
use serde_json::{Value, json};
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;

/// Analysis failures, surfaced verbatim to the caller. None of these ever
/// touch session or artifact state.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("{provider} API key not configured")]
    Configuration { provider: &'static str },
    #[error("unsupported provider: {0}")]
    InvalidProvider(String),
    #[error("provider request failed: {0}")]
    Provider(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
}

impl Provider {
    pub fn parse(id: &str) -> Result<Self, AnalysisError> {
        match id.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "anthropic" => Ok(Provider::Anthropic),
            other => Err(AnalysisError::InvalidProvider(other.to_string())),
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o-mini",
            Provider::Anthropic => "claude-3-sonnet-20240229",
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OpenAI",
            Provider::Anthropic => "Anthropic",
        }
    }
}

/// Images wider than this are downscaled before the provider call.
const MAX_IMAGE_WIDTH: u32 = 1280;
const ANTHROPIC_MAX_TOKENS: u32 = 512;

/// On-demand analysis: one fresh capture, the most recent stored artifacts,
/// and the user's query, forwarded to the selected provider.
pub struct AnalysisGateway {
    client: Client,
    pipeline: Arc<CapturePipeline>,
    artifacts: ArtifactStore,
}

impl AnalysisGateway {
    pub fn new(pipeline: Arc<CapturePipeline>, artifacts: ArtifactStore) -> Self {
        Self {
            client: Client::new(),
            pipeline,
            artifacts,
        }
    }

    /// Runs one query. The credential check happens before the fresh capture
    /// so a misconfigured provider leaves no artifact behind.
    pub async fn analyze(
        &self,
        query: &str,
        provider_id: &str,
        model: Option<&str>,
        settings: &Settings,
        recent_count: usize,
    ) -> Result<String, AnalysisError> {
        let provider = Provider::parse(provider_id)?;
        let api_key = match provider {
            Provider::OpenAi => settings.openai_api_key.trim(),
            Provider::Anthropic => settings.anthropic_api_key.trim(),
        };
        if api_key.is_empty() {
            return Err(AnalysisError::Configuration {
                provider: provider.name(),
            });
        }
        let model = model.unwrap_or_else(|| provider.default_model());

        let fresh = match self.pipeline.capture_once().await {
            Ok(artifact) => artifact,
            Err(err) => {
                warn!("fresh capture for analysis failed: {err:#}");
                None
            }
        };
        let selected = select_recent(fresh, self.artifacts.all(), recent_count.max(1));

        let mut images = Vec::new();
        for artifact in &selected {
            match encode_for_provider(artifact) {
                Ok(encoded) => images.push(encoded),
                Err(err) => warn!(
                    "skipping artifact {} for analysis: {err:#}",
                    artifact.filename
                ),
            }
        }

        match provider {
            Provider::OpenAi => self.call_openai(api_key, model, query, &images).await,
            Provider::Anthropic => self.call_anthropic(api_key, model, query, &images).await,
        }
    }

    async fn call_openai(
        &self,
        api_key: &str,
        model: &str,
        query: &str,
        images: &[String],
    ) -> Result<String, AnalysisError> {
        let mut content = vec![json!({"type": "input_text", "text": query})];
        for encoded in images {
            content.push(json!({
                "type": "input_image",
                "image_url": format!("data:image/png;base64,{encoded}"),
            }));
        }
        let body = json!({
            "model": model,
            "input": [{"role": "user", "content": content}],
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/responses")
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| AnalysisError::Provider(format!("OpenAI request failed: {err}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Provider(format!(
                "OpenAI API error {status}: {detail}"
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| AnalysisError::Provider(format!("bad OpenAI response JSON: {err}")))?;
        extract_openai_text(&payload).ok_or_else(|| {
            AnalysisError::Provider("OpenAI response contained no text output".to_string())
        })
    }

    async fn call_anthropic(
        &self,
        api_key: &str,
        model: &str,
        query: &str,
        images: &[String],
    ) -> Result<String, AnalysisError> {
        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&anthropic_body(model, query, images))
            .send()
            .await
            .map_err(|err| AnalysisError::Provider(format!("Anthropic request failed: {err}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Provider(format!(
                "Anthropic API error {status}: {detail}"
            )));
        }

        let payload: Value = response.json().await.map_err(|err| {
            AnalysisError::Provider(format!("bad Anthropic response JSON: {err}"))
        })?;
        payload
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                AnalysisError::Provider("Anthropic response contained no text output".to_string())
            })
    }
}

fn anthropic_body(model: &str, query: &str, images: &[String]) -> Value {
    let mut content: Vec<Value> = images
        .iter()
        .map(|encoded| {
            json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": "image/png",
                    "data": encoded,
                },
            })
        })
        .collect();
    content.push(json!({"type": "text", "text": query}));

    json!({
        "model": model,
        "max_tokens": ANTHROPIC_MAX_TOKENS,
        "messages": [{"role": "user", "content": content}],
    })
}

/// Picks up to `count` artifacts for the provider call: the fresh capture
/// first, then the most recent stored artifacts whose backing file still
/// exists, without repeating the fresh one.
fn select_recent(fresh: Option<Artifact>, mut stored: Vec<Artifact>, count: usize) -> Vec<Artifact> {
    stored.sort_by(|a, b| b.captured_at.cmp(&a.captured_at));

    let mut selected = Vec::new();
    if let Some(fresh) = fresh {
        selected.push(fresh);
    }
    for artifact in stored {
        if selected.len() >= count {
            break;
        }
        if selected.iter().any(|chosen| chosen.id == artifact.id) {
            continue;
        }
        if !artifact.storage_path.exists() {
            continue;
        }
        selected.push(artifact);
    }
    selected.truncate(count);
    selected
}

/// Downscales and re-encodes the artifact as PNG, base64 for the wire.
fn encode_for_provider(artifact: &Artifact) -> anyhow::Result<String> {
    let bytes = std::fs::read(&artifact.storage_path)?;
    let decoded = image::load_from_memory(&bytes)?;
    let resized = if decoded.width() > MAX_IMAGE_WIDTH {
        decoded.thumbnail(MAX_IMAGE_WIDTH, u32::MAX)
    } else {
        decoded
    };

    let mut out = Vec::new();
    resized.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(general_purpose::STANDARD.encode(out))
}

fn extract_openai_text(root: &Value) -> Option<String> {
    if let Some(text) = root.get("output_text").and_then(Value::as_str) {
        return Some(text.to_string());
    }

    let output = root.get("output")?.as_array()?;
    let mut fragments = Vec::new();
    for item in output {
        let Some(parts) = item.get("content").and_then(Value::as_array) else {
            continue;
        };
        for part in parts {
            let part_type = part.get("type").and_then(Value::as_str).unwrap_or_default();
            if matches!(part_type, "output_text" | "text")
                && let Some(text) = part.get("text").and_then(Value::as_str)
            {
                fragments.push(text.trim().to_string());
            }
        }
    }

    if fragments.is_empty() {
        None
    } else {
        Some(fragments.join("\n"))
    }
}
