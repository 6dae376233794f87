use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8787/ws";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;
pub const DEFAULT_CONFIG_FILE: &str = "acp-agent.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding config: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Persisted agent settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_true")]
    pub connect_on_startup: bool,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            license_uuid: None,
            customer_id: None,
            token: None,
            connect_on_startup: true,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
        }
    }
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}

impl AgentConfig {
    /// Loads the file at `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let body = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, body).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms.max(100))
    }
}

#[derive(Parser, Debug)]
#[command(name = "acp-agent", about = "Remote agent for the control relay")]
pub struct Args {
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
    #[arg(long, default_value = "")]
    pub server_url: String,
    #[arg(long, default_value = "")]
    pub token: String,
    #[arg(long, default_value = "")]
    pub license_uuid: String,
    #[arg(long, default_value = "")]
    pub customer_id: String,
    #[arg(long)]
    pub reconnect_delay_ms: Option<u64>,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    /// Write the effective settings back to the config file.
    #[arg(long, default_value_t = false)]
    pub save_config: bool,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub agent: AgentConfig,
    pub config_path: PathBuf,
    pub log_dir: String,
    pub log_stdout: bool,
    pub save_config: bool,
}

pub fn load_config(args: Args) -> Result<RuntimeConfig, ConfigError> {
    let mut agent = AgentConfig::load(&args.config)?;
    if let Some(url) = resolve_value(&args.server_url, "ACP_SERVER_URL") {
        agent.server_url = url;
    }
    if let Some(token) = resolve_value(&args.token, "ACP_AGENT_TOKEN") {
        agent.token = Some(token);
    }
    if let Some(license) = non_empty(&args.license_uuid) {
        agent.license_uuid = Some(license);
    }
    if let Some(customer) = non_empty(&args.customer_id) {
        agent.customer_id = Some(customer);
    }
    if let Some(delay) = args.reconnect_delay_ms {
        agent.reconnect_delay_ms = delay;
    }
    Ok(RuntimeConfig {
        agent,
        config_path: args.config,
        log_dir: resolve_value(&args.log_dir, "ACP_LOG_DIR").unwrap_or_default(),
        log_stdout: resolve_log_stdout(),
        save_config: args.save_config,
    })
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn resolve_value(flag: &str, env_key: &str) -> Option<String> {
    non_empty(flag).or_else(|| env::var(env_key).ok().and_then(|value| non_empty(&value)))
}

fn resolve_log_stdout() -> bool {
    if let Ok(value) = env::var("ACP_LOG_STDOUT") {
        match value.trim() {
            "1" | "true" | "TRUE" | "yes" | "YES" => return true,
            "0" | "false" | "FALSE" | "no" | "NO" => return false,
            _ => {}
        }
    }
    true
}
