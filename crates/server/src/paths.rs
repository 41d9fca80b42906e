//! Config directory resolution.
//!
//! Priority: CLI `--config-dir` > `PROMPTDOCK_CONFIG_DIR` env > the system
//! directory when it exists > `./config` for local development.

use std::path::{Path, PathBuf};

pub const SYSTEM_CONFIG_DIR: &str = "/etc/claude-automation";
pub const LOCAL_CONFIG_DIR: &str = "./config";

pub const CONFIG_FILE: &str = "config.json";
pub const TASKS_FILE: &str = "tasks.json";
pub const APIS_FILE: &str = "apis.json";

pub fn resolve_config_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    if let Ok(env_val) = std::env::var("PROMPTDOCK_CONFIG_DIR") {
        if !env_val.trim().is_empty() {
            return PathBuf::from(env_val);
        }
    }
    let system = Path::new(SYSTEM_CONFIG_DIR);
    if system.is_dir() {
        return system.to_path_buf();
    }
    PathBuf::from(LOCAL_CONFIG_DIR)
}

/// Directories watched for hot reload: the resolved one plus the local
/// development directory, deduplicated, existing only.
pub fn watch_dirs(config_dir: &Path) -> Vec<PathBuf> {
    let mut dirs = vec![config_dir.to_path_buf()];
    let local = PathBuf::from(LOCAL_CONFIG_DIR);
    if !dirs.contains(&local) {
        dirs.push(local);
    }
    dirs.retain(|d| d.is_dir());
    dirs
}

/// Default root for per-session chat working directories.
pub fn default_session_root() -> PathBuf {
    std::env::temp_dir().join("promptdock-chat")
}
