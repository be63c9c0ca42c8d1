use std::env;
use std::path::{Path, PathBuf};

use chrono::Utc;

pub(crate) fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn user_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("portal.sqlite")
}

pub(crate) fn log_dir_path(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

pub(crate) fn client_tools_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("client_tools")
}

pub(crate) fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Split a shell command line into the platform's shell invocation.
pub(crate) fn shell_command_vec(command: &str) -> Vec<String> {
    if cfg!(windows) {
        vec!["cmd".to_string(), "/C".to_string(), command.to_string()]
    } else {
        vec!["sh".to_string(), "-c".to_string(), command.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_string_encodes() {
        assert_eq!(hex_string(&[0x00, 0xff, 0x10]), "00ff10");
    }

    #[test]
    fn shell_command_vec_wraps_whole_string() {
        let parts = shell_command_vec("echo a | grep a");
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2], "echo a | grep a");
    }
}
