use acp_core::logging::{self, LogGuard};

pub fn log_file_name(machine_name: &str) -> String {
    logging::sanitize_component(&format!("acp-agent-{machine_name}.log"))
}

pub fn init_logging(log_dir: &str, machine_name: &str, stdout_enabled: bool) -> Option<LogGuard> {
    logging::init_logging(
        &logging::default_level(false),
        log_dir,
        &log_file_name(machine_name),
        stdout_enabled,
    )
}
