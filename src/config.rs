use std::fs;
use std::path::{Path, PathBuf};

use crate::{ToolError, ToolsConfig};

pub(crate) fn tools_config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("external_tools.json")
}

/// Load the server-tools configuration document. A missing file yields
/// the defaults; an unreadable one is reported and also yields the
/// defaults so a corrupt document never takes the server down.
pub(crate) fn load_tools_config(path: &Path) -> ToolsConfig {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(_) => return ToolsConfig::default(),
    };
    let mut value: serde_json::Value = match serde_json::from_str(&data) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("error loading tools config {}: {err}", path.display());
            return ToolsConfig::default();
        }
    };
    // One tolerated legacy rename: a top-level `tools` array predates
    // the server_tools/settings split.
    if let Some(object) = value.as_object_mut() {
        if !object.contains_key("server_tools") {
            if let Some(tools) = object.remove("tools") {
                object.insert("server_tools".to_string(), tools);
            }
        }
    }
    match serde_json::from_value(value) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error parsing tools config {}: {err}", path.display());
            ToolsConfig::default()
        }
    }
}

/// Rewrite the whole document atomically (tmp file + rename); partial
/// writes must never corrupt the registry.
pub(crate) fn save_tools_config(path: &Path, config: &ToolsConfig) -> Result<(), ToolError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ToolError::Persistence(e.to_string()))?;
    }
    let json =
        serde_json::to_string_pretty(config).map_err(|e| ToolError::Persistence(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &json).map_err(|e| ToolError::Persistence(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| ToolError::Persistence(e.to_string()))?;
    Ok(())
}
