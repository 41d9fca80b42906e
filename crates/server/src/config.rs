//! Application configuration.
//!
//! Three JSON files live side by side in the config directory:
//! `config.json` (server, notifications, log dir, chat worker),
//! `tasks.json` (name → task) and `apis.json` (name → API definition).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use promptdock_worker::{RetryPolicy, WorkerCommand};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::{self, APIS_FILE, CONFIG_FILE, TASKS_FILE};

const DEFAULT_LOG_DIR: &str = "/var/log/claude-tasks";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid listen address {host}:{port}")]
    InvalidAddress { host: String, port: u16 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default, rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let invalid = || ConfigError::InvalidAddress {
            host: self.host.clone(),
            port: self.port,
        };
        let host = if self.host == "localhost" {
            "127.0.0.1"
        } else {
            self.host.as_str()
        };
        let ip = host.parse().map_err(|_| invalid())?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyOn {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    /// Filled from the map key when omitted.
    #[serde(default)]
    pub name: String,
    pub prompt: String,
    pub working_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default)]
    pub notify_on: Vec<NotifyOn>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl TaskConfig {
    pub fn notifies_on(&self, outcome: NotifyOn) -> bool {
        self.notify_on.contains(&outcome)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKind {
    Rest,
    Mcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiAuthKind {
    Header,
    Bearer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiAuth {
    #[serde(rename = "type")]
    pub kind: ApiAuthKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ApiKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ApiAuth>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushbulletConfig {
    #[serde(default)]
    pub token: String,
}

/// How chat turns and task runs invoke the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatConfig {
    #[serde(default = "default_worker_program")]
    pub worker_program: String,
    #[serde(default)]
    pub worker_args: Vec<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "paths::default_session_root")]
    pub session_root: PathBuf,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            worker_program: default_worker_program(),
            worker_args: Vec::new(),
            max_attempts: default_max_attempts(),
            session_root: paths::default_session_root(),
        }
    }
}

impl ChatConfig {
    pub fn worker_command(&self) -> WorkerCommand {
        WorkerCommand::from_config(&self.worker_program, &self.worker_args)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts.max(1))
    }
}

/// Shape of `config.json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    server: ServerConfig,
    #[serde(default)]
    pushbullet: PushbulletConfig,
    #[serde(default)]
    log_dir: Option<PathBuf>,
    #[serde(default)]
    chat: ChatConfig,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub tasks: HashMap<String, TaskConfig>,
    pub apis: HashMap<String, ApiConfig>,
    pub pushbullet: PushbulletConfig,
    pub log_dir: PathBuf,
    pub chat: ChatConfig,
}

impl AppConfig {
    /// Load all three files from `dir`.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let file: ConfigFile = read_json(&dir.join(CONFIG_FILE))?;
        let mut tasks: HashMap<String, TaskConfig> = read_json(&dir.join(TASKS_FILE))?;
        let mut apis: HashMap<String, ApiConfig> = read_json(&dir.join(APIS_FILE))?;

        for (key, task) in tasks.iter_mut() {
            if task.name.is_empty() {
                task.name = key.clone();
            }
        }
        for (key, api) in apis.iter_mut() {
            if api.name.is_empty() {
                api.name = key.clone();
            }
        }

        let config = Self {
            server: file.server,
            tasks,
            apis,
            pushbullet: file.pushbullet,
            log_dir: file
                .log_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            chat: file.chat,
        };
        config.server.socket_addr()?;
        Ok(config)
    }

    pub fn task(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.get(name)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn default_true() -> bool {
    true
}

fn default_worker_program() -> String {
    promptdock_worker::invoker::DEFAULT_PROGRAM.to_string()
}

fn default_max_attempts() -> u32 {
    3
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn loads_all_three_files_with_defaults() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_config_dir(
            tmp.path(),
            r#"{
                "server": {
                    "port": 8080,
                    "host": "0.0.0.0",
                    "apiKey": "secret",
                    "allowedIPs": ["127.0.0.1"]
                },
                "pushbullet": { "token": "pb" },
                "logDir": "/tmp/promptdock-logs"
            }"#,
            r#"{
                "nightly": {
                    "prompt": "Summarize the repo",
                    "workingDir": "/tmp/nightly",
                    "schedule": "*/30 * * * *",
                    "notifyOn": ["failure"]
                }
            }"#,
        );
        std::fs::write(
            tmp.path().join("apis.json"),
            r#"{ "tracker": { "type": "rest", "baseUrl": "https://example.test",
                 "auth": { "type": "bearer", "token": "t" } } }"#,
        )
        .expect("write apis");

        let config = AppConfig::load(tmp.path()).expect("load");

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.api_key, "secret");
        assert_eq!(config.server.allowed_ips, vec!["127.0.0.1"]);
        assert_eq!(config.pushbullet.token, "pb");
        assert_eq!(config.log_dir, PathBuf::from("/tmp/promptdock-logs"));

        let task = config.task("nightly").expect("task");
        assert_eq!(task.name, "nightly");
        assert!(task.enabled);
        assert!(task.notifies_on(NotifyOn::Failure));
        assert!(!task.notifies_on(NotifyOn::Success));

        let api = config.apis.get("tracker").expect("api");
        assert_eq!(api.name, "tracker");
        assert_eq!(api.kind, ApiKind::Rest);
        assert_eq!(api.auth.as_ref().map(|a| a.kind), Some(ApiAuthKind::Bearer));

        assert_eq!(config.chat.worker_program, "claude");
        assert_eq!(config.chat.max_attempts, 3);
    }

    #[test]
    fn log_dir_defaults_when_missing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_config_dir(tmp.path(), MINIMAL_CONFIG, "{}");

        let config = AppConfig::load(tmp.path()).expect("load");
        assert_eq!(config.log_dir, PathBuf::from(DEFAULT_LOG_DIR));
        assert!(config.server.api_key.is_empty());
    }

    #[test]
    fn missing_file_reports_path() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = AppConfig::load(tmp.path()).expect_err("should fail");
        match err {
            ConfigError::Read { path, .. } => assert!(path.ends_with("config.json")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_config_dir(tmp.path(), MINIMAL_CONFIG, "{ not json");
        assert!(matches!(
            AppConfig::load(tmp.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn localhost_resolves_to_loopback() {
        let server = ServerConfig {
            port: 3000,
            host: "localhost".into(),
            api_key: String::new(),
            allowed_ips: Vec::new(),
        };
        assert_eq!(
            server.socket_addr().expect("addr"),
            "127.0.0.1:3000".parse().expect("socket addr")
        );
    }
}
