use acp_core::logging::{self, LogGuard};

pub fn log_file_name(port: &str) -> String {
    format!("acp-relay-{port}.log")
}

/// Logs go to stdout and, with a log directory, to `acp-relay-<port>.log`.
pub fn init_logging(debug: bool, log_dir: &str, port: &str) -> Option<LogGuard> {
    logging::init_logging(
        &logging::default_level(debug),
        log_dir,
        &log_file_name(port),
        true,
    )
}
