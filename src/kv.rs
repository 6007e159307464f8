use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{File, create_dir_all, rename};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Synchronous JSON-file key-value store.
///
/// Every `set` rewrites the whole file through a temp-file rename, so a crash
/// mid-write leaves the previous contents intact. Values are arbitrary serde
/// types; callers own the key layout.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl JsonStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read store file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("store file {} is not valid JSON", path.display()))?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the stored value for `key`, or `default` when the key is
    /// absent or does not deserialize as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        let values = self.values.lock().expect("store mutex poisoned");
        values
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or(default)
    }

    /// Writes `value` under `key` and flushes the store to disk before
    /// returning.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut values = self.values.lock().expect("store mutex poisoned");
        let encoded = serde_json::to_value(value)
            .with_context(|| format!("failed to serialize value for key {key}"))?;
        values.insert(key.to_string(), encoded);
        self.flush(&values)
    }

    fn flush(&self, values: &BTreeMap<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent).with_context(|| {
                format!("failed to create store directory {}", parent.display())
            })?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        let body = serde_json::to_vec_pretty(values).context("failed to encode store contents")?;
        file.write_all(&body)
            .and_then(|()| file.sync_all())
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed to move {} into place at {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }
}
