use crate::auth::DEFAULT_TOKEN_PREFIX;
use clap::Parser;
use std::time::Duration;

pub const DEFAULT_ADDR: &str = "0.0.0.0:8787";

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub addr: String,
    pub debug: bool,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub token_prefix: String,
    pub stale_seconds: u64,
    pub sse_ping_interval: Duration,
    pub write_timeout: Duration,
    pub register_timeout: Duration,
    pub log_dir: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            debug: false,
            request_timeout: Duration::from_millis(30_000),
            heartbeat_interval: Duration::from_millis(acp_core::DEFAULT_HEARTBEAT_INTERVAL_MS),
            token_prefix: DEFAULT_TOKEN_PREFIX.to_string(),
            stale_seconds: 0,
            sse_ping_interval: Duration::from_secs(15),
            write_timeout: Duration::from_secs(2),
            register_timeout: Duration::from_secs(10),
            log_dir: String::new(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "acp-relay", about = "Relay between remote agents and tool clients")]
pub struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 30_000)]
    request_timeout_ms: u64,
    #[arg(long, default_value_t = 5_000)]
    heartbeat_interval_ms: u64,
    #[arg(long, default_value = "")]
    token_prefix: String,
    #[arg(long, default_value_t = 0)]
    stale_seconds: u64,
    #[arg(long, default_value_t = 15)]
    sse_ping_seconds: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 10)]
    register_timeout: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
}

impl Args {
    pub fn into_config(self) -> RelayConfig {
        RelayConfig {
            addr: resolve_flag(&self.addr, "ACP_RELAY_ADDR", DEFAULT_ADDR),
            debug: self.debug || env_true("ACP_RELAY_DEBUG"),
            request_timeout: Duration::from_millis(self.request_timeout_ms.max(1)),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms.max(1)),
            token_prefix: resolve_flag(&self.token_prefix, "ACP_TOKEN_PREFIX", DEFAULT_TOKEN_PREFIX),
            stale_seconds: self.stale_seconds,
            sse_ping_interval: Duration::from_secs(self.sse_ping_seconds.max(1)),
            write_timeout: Duration::from_secs(self.write_timeout.max(1)),
            register_timeout: Duration::from_secs(self.register_timeout.max(1)),
            log_dir: resolve_flag(&self.log_dir, "ACP_LOG_DIR", ""),
        }
    }
}

pub fn load_config() -> RelayConfig {
    Args::parse().into_config()
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

/// Flag value, else the environment variable, else the fallback.
fn resolve_flag(flag: &str, env_key: &str, fallback: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    fallback.to_string()
}

/// Port component of a listen address, used to name the log file.
pub fn addr_port(addr: &str) -> &str {
    addr.rsplit_once(':').map(|(_, port)| port).unwrap_or(addr)
}
