use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::StateError;
use crate::session::CommitMode;

const SETTINGS_VERSION: u32 = 1;
const SETTINGS_FILE: &str = "configurator.json";

/// Tuning for a [`crate::configurator::ConfiguratorCore`], stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CoreSettings {
    pub version: u32,
    /// Overrides every session's own commit-mode default when set.
    #[serde(default)]
    pub default_commit_mode: Option<CommitMode>,
    #[serde(default = "default_max_history_entries")]
    pub max_history_entries: usize,
    /// URL query parameter carrying a model state id.
    #[serde(default = "default_model_state_query_param")]
    pub model_state_query_param: String,
    /// Render each flagged viewport once a process manager released it.
    #[serde(default = "default_true")]
    pub render_after_processes: bool,
}

fn default_max_history_entries() -> usize {
    50
}

fn default_model_state_query_param() -> String {
    "modelStateId".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            default_commit_mode: None,
            max_history_entries: default_max_history_entries(),
            model_state_query_param: default_model_state_query_param(),
            render_after_processes: true,
        }
    }
}

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join(SETTINGS_FILE)
}

/// Write `data` to a sibling temp file, fsync, then rename over `path`.
/// The previous file is kept as `<name>.bak`.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StateError> {
    let file_name = path.file_name().unwrap_or_default();

    let mut tmp_name = OsString::from(file_name);
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(&tmp_name);

    let mut bak_name = OsString::from(file_name);
    bak_name.push(".bak");
    let bak_path = path.with_file_name(&bak_name);

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    // Best effort.
    if path.exists() {
        let _ = fs::rename(path, &bak_path);
    }

    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load settings from `config_dir`. Returns None if no settings file exists
/// or it cannot be parsed.
pub fn load_settings(config_dir: &Path) -> Option<CoreSettings> {
    let path = settings_path(config_dir);
    if !path.exists() {
        return None;
    }
    let data = fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<CoreSettings>(&data) {
        Ok(mut settings) => {
            if settings.version < SETTINGS_VERSION {
                settings.version = SETTINGS_VERSION;
            }
            Some(settings)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable settings");
            None
        }
    }
}

pub fn save_settings(config_dir: &Path, settings: &CoreSettings) -> Result<(), StateError> {
    fs::create_dir_all(config_dir)?;
    let json = serde_json::to_string_pretty(settings)?;
    atomic_write(&settings_path(config_dir), json.as_bytes())
}
