// utils.rs
// Description: JSON file helpers and atomic file writes used for checkpoints and snapshots.
// History:
// - 2026-02-01: Add JSON checkpoint helpers and atomic write for save and load.
// - 2026-10-15: Switch to Path based helpers with typed errors.
// Author: Marcus Schlieper

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{LatentOdeError, Result};

pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    // JSON is data only, nothing is executed on load.
    Ok(serde_json::to_string(value)?)
}

pub fn read_json_file<T: DeserializeOwned>(p_path: &Path) -> Result<T> {
    let s_json = fs::read_to_string(p_path).map_err(|e| LatentOdeError::io(p_path, e))?;
    if s_json.trim().is_empty() {
        return Err(LatentOdeError::CheckpointInvalid(format!(
            "json_file_empty: {}",
            p_path.display()
        )));
    }
    Ok(serde_json::from_str(&s_json)?)
}

// Writes {path}.tmp and renames it into place, so readers never see a partial file.
pub fn write_file_atomic(p_path: &Path, s_content: &str) -> Result<()> {
    if p_path.as_os_str().is_empty() {
        return Err(LatentOdeError::InvalidConfig("file_path_empty".to_string()));
    }

    if let Some(p_parent) = p_path.parent() {
        if !p_parent.as_os_str().is_empty() {
            fs::create_dir_all(p_parent).map_err(|e| LatentOdeError::io(p_parent, e))?;
        }
    }

    let mut s_tmp = p_path.as_os_str().to_owned();
    s_tmp.push(".tmp");
    let p_tmp = PathBuf::from(s_tmp);

    fs::write(&p_tmp, s_content).map_err(|e| LatentOdeError::io(&p_tmp, e))?;

    fs::rename(&p_tmp, p_path).map_err(|e| {
        let _ = fs::remove_file(&p_tmp);
        LatentOdeError::io(p_path, e)
    })?;

    Ok(())
}

pub fn write_json_atomic<T: Serialize>(p_path: &Path, value: &T) -> Result<()> {
    let s_json = to_json(value)?;
    write_file_atomic(p_path, &s_json)
}
