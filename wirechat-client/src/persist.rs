use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversations::Conversation;
use crate::notices::SystemNotice;

/// Defensive bound: the state file holds the roster and notices, which is
/// small. This prevents pathological reads if the file is corrupted or
/// replaced.
pub const MAX_STATE_BYTES: u64 = 4 * 1024 * 1024;

const STATE_FILE: &str = "state.json";

/// Everything the session keeps across process restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedState {
    #[serde(default)]
    pub notices: Vec<SystemNotice>,
    #[serde(default)]
    pub conversations: Vec<Conversation>,
}

#[derive(Debug, Error)]
pub enum StateLoadError {
    #[error("metadata read failed: {0}")]
    Metadata(std::io::Error),
    #[error("file too large: {size} bytes (max {MAX_STATE_BYTES})")]
    TooLarge { size: u64 },
    #[error("read failed: {0}")]
    Read(std::io::Error),
    #[error("parse failed: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StateSaveError {
    #[error("serialize failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(std::io::Error),
    #[error("rename failed: {0}")]
    Rename(std::io::Error),
}

pub fn state_path(data_dir: &Path) -> PathBuf {
    data_dir.join(STATE_FILE)
}

pub fn load_state(path: &Path) -> Result<SavedState, StateLoadError> {
    let meta = fs::metadata(path).map_err(StateLoadError::Metadata)?;
    if meta.len() > MAX_STATE_BYTES {
        return Err(StateLoadError::TooLarge { size: meta.len() });
    }
    let data = fs::read_to_string(path).map_err(StateLoadError::Read)?;
    Ok(serde_json::from_str(&data)?)
}

pub fn load_state_or_default(path: &Path) -> SavedState {
    load_state(path).unwrap_or_default()
}

pub fn save_state(path: &Path, state: &SavedState) -> Result<(), StateSaveError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let payload = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload.as_bytes()).map_err(StateSaveError::WriteTmp)?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }
    fs::rename(&tmp, path).map_err(StateSaveError::Rename)?;
    Ok(())
}

pub fn save_state_with_retry(path: &Path, state: &SavedState) -> Result<(), StateSaveError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut last_err: Option<StateSaveError> = None;
    for attempt in 1..=MAX_ATTEMPTS {
        match save_state(path, state) {
            Ok(()) => return Ok(()),
            Err(err) => {
                last_err = Some(err);
                if attempt >= MAX_ATTEMPTS {
                    break;
                }
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
            }
        }
    }

    Err(last_err.expect("retry loop sets last_err"))
}
