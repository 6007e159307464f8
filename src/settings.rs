use crate::kv::JsonStore;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const KEY_SETTINGS: &str = "settings";

/// User-editable configuration, persisted as one object in the store.
///
/// API keys live here rather than in environment variables so they survive
/// restarts alongside the rest of the durable state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub openai_api_key: String,
    pub anthropic_api_key: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub server_url: String,
}

impl Settings {
    pub fn load(kv: &Arc<JsonStore>) -> Self {
        kv.get(KEY_SETTINGS, Settings::default())
    }

    pub fn save(&self, kv: &Arc<JsonStore>) -> Result<()> {
        kv.set(KEY_SETTINGS, self)
            .context("failed to persist settings")
    }
}

#[cfg(test)]
mod tests {
    use super::Settings;
    use crate::kv::JsonStore;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn settings_round_trip_and_default_when_absent() {
        let dir = tempdir().expect("tempdir");
        let kv = Arc::new(JsonStore::open(dir.path().join("store.json")).expect("open"));

        assert_eq!(Settings::load(&kv), Settings::default());

        let settings = Settings {
            openai_api_key: "sk-test".to_string(),
            email: "dev@example.com".to_string(),
            ..Settings::default()
        };
        settings.save(&kv).expect("save");

        let reopened = Arc::new(JsonStore::open(kv.path()).expect("reopen"));
        assert_eq!(Settings::load(&reopened), settings);
    }

    #[test]
    fn unknown_fields_in_stored_settings_are_tolerated() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        std::fs::write(
            &path,
            r#"{"settings": {"openai_api_key": "sk-old", "theme": "dark"}}"#,
        )
        .expect("seed");

        let kv = Arc::new(JsonStore::open(path).expect("open"));
        let settings = Settings::load(&kv);
        assert_eq!(settings.openai_api_key, "sk-old");
        assert_eq!(settings.anthropic_api_key, "");
    }
}
