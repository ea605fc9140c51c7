use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tandem_call::CallConfig;

use crate::logging::DEFAULT_LOG_FILTER;

/// Persistent client settings, saved as `settings.json` in the Tandem data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long a dropped call may try to reconnect before it fails.
    pub reconnect_window_secs: u64,
    /// Where key pairs are stored. None = `<data dir>/keys`.
    pub key_store_dir: Option<String>,
    pub log_filter: String,
    /// Send direct messages in plaintext when the peer has no published key.
    pub plaintext_fallback: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_window_secs: tandem_call::RECONNECT_WINDOW.as_secs(),
            key_store_dir: None,
            log_filter: DEFAULT_LOG_FILTER.into(),
            plaintext_fallback: true,
        }
    }
}

impl ClientConfig {
    pub fn call_config(&self) -> CallConfig {
        CallConfig {
            reconnect_window: Duration::from_secs(self.reconnect_window_secs),
        }
    }

    pub fn resolve_key_store_dir(&self) -> Result<PathBuf> {
        match &self.key_store_dir {
            Some(dir) => Ok(PathBuf::from(dir)),
            None => Ok(data_dir()?.join("keys")),
        }
    }
}

/// The Tandem data directory (`~/.config/Tandem` on Linux, `%APPDATA%\Tandem`
/// on Windows). Created if missing.
pub fn data_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .context("failed to determine config directory")?
        .join("Tandem");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    Ok(dir)
}

pub fn config_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("settings.json"))
}

/// Load settings from `path`. Returns defaults on any error (missing file, parse error).
pub fn load_config(path: &Path) -> ClientConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("failed to parse {}: {e}, using defaults", path.display());
                ClientConfig::default()
            }
        },
        Err(_) => ClientConfig::default(),
    }
}

/// Save settings atomically (write to .tmp, then rename).
pub fn save_config(path: &Path, config: &ClientConfig) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(config).context("failed to serialize settings")?;
    std::fs::write(&tmp_path, json)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
