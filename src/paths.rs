use std::path::PathBuf;

/// Root directory for durable state. On macOS this is the conventional
/// Application Support location; elsewhere a dot-directory in $HOME. Falls
/// back to the current directory when no home is resolvable.
pub fn default_data_dir() -> PathBuf {
    let Some(home) = std::env::var_os("HOME").map(PathBuf::from) else {
        return PathBuf::from(".");
    };
    if cfg!(target_os = "macos") {
        home.join("Library/Application Support/worktrack")
    } else {
        home.join(".worktrack")
    }
}

pub fn default_store_path() -> PathBuf {
    default_data_dir().join("store.json")
}

pub fn default_artifact_dir() -> PathBuf {
    default_data_dir().join("artifacts")
}
