use crate::core::error::Result;
use crate::core::schema::{MarkFlag, SchemaConfig};
use crate::utils::get_config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Build-time override for the `iptables` binary (packagers set this).
const DEFAULT_IPTABLES: &str = match option_env!("IPTSYNC_IPTABLES") {
    Some(path) => path,
    None => "iptables",
};

const DEFAULT_IPTABLES_SAVE: &str = match option_env!("IPTSYNC_IPTABLES_SAVE") {
    Some(path) => path,
    None => "iptables-save",
};

const CONFIG_FILE: &str = "config.json";

/// Host configuration for talking to `iptables`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default = "default_iptables")]
    pub iptables: String,
    #[serde(default = "default_iptables_save")]
    pub iptables_save: String,
    /// Explicit mark flag; wins over `iptables_version`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark_flag: Option<MarkFlag>,
    /// Version of the host's `iptables`, e.g. `1.8.7`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iptables_version: Option<String>,
    /// File that receives `iptables-save` output after every change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            iptables: default_iptables(),
            iptables_save: default_iptables_save(),
            mark_flag: None,
            iptables_version: None,
            persist_path: None,
        }
    }
}

fn default_iptables() -> String {
    DEFAULT_IPTABLES.to_string()
}

fn default_iptables_save() -> String {
    DEFAULT_IPTABLES_SAVE.to_string()
}

impl AppConfig {
    /// Resolves host-dependent schema choices.
    pub fn schema_config(&self) -> SchemaConfig {
        let mark_flag = match (self.mark_flag, self.iptables_version.as_deref()) {
            (Some(flag), _) => flag,
            (None, Some(version)) => MarkFlag::for_version(version),
            (None, None) => MarkFlag::default(),
        };
        SchemaConfig { mark_flag }
    }
}

/// Saves the config to the XDG config directory using an atomic write pattern.
/// 1. Writes to a temporary file.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
pub async fn save_config(config: &AppConfig) -> std::io::Result<()> {
    if let Some(mut path) = get_config_dir() {
        tokio::fs::create_dir_all(&path).await?;
        path.push(CONFIG_FILE);
        save_config_to(config, &path).await?;
    }
    Ok(())
}

/// Atomic write of `config` to `path`.
pub async fn save_config_to(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("json.tmp");

    // Create file with restrictive permissions before any data is written
    #[cfg(unix)]
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(&temp_path)
        .await?;

    #[cfg(not(unix))]
    let mut file = tokio::fs::File::create(&temp_path).await?;

    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Loads the config from the XDG config directory, or returns the default
/// if none is found or it cannot be read.
pub async fn load_config() -> AppConfig {
    if let Some(mut path) = get_config_dir() {
        path.push(CONFIG_FILE);
        if let Ok(json) = tokio::fs::read_to_string(&path).await {
            match serde_json::from_str::<AppConfig>(&json) {
                Ok(config) => return config,
                Err(e) => tracing::warn!("Ignoring unreadable config {:?}: {}", path, e),
            }
        }
    }
    AppConfig::default()
}

/// Loads the config from an explicit path.
///
/// # Errors
///
/// Returns `Err` if the file cannot be read or is not valid JSON.
pub async fn load_config_from(path: &Path) -> Result<AppConfig> {
    let json = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&json)?)
}
