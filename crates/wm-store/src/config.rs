//! Data directory resolution and `wm.toml` loading.

use std::path::{Path, PathBuf};
use std::{env, fs};

use wm_core::EngineConfig;

use crate::error::Result;

pub const CONFIG_FILE: &str = "wm.toml";
pub const DB_FILE: &str = "wm.db";

/// `WM_DATA_DIR` if set, otherwise `~/.working-memory`.
pub fn default_base_dir() -> PathBuf {
    if let Ok(dir) = env::var("WM_DATA_DIR")
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs_home().join(".working-memory")
}

fn dirs_home() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Read `wm.toml` from `dir`. A missing file yields defaults; sections and
/// keys the file omits keep their defaults.
pub fn load_config(dir: &Path) -> Result<EngineConfig> {
    let path = dir.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let text = fs::read_to_string(&path)?;
    let config: EngineConfig = toml::from_str(&text)?;
    tracing::debug!("loaded config from {}", path.display());
    Ok(config)
}
