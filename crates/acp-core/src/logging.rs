//! Log sink shared by the relay and agent binaries: an `EnvFilter`ed
//! subscriber writing to stdout and, optionally, an append-only file.

use std::{
    env,
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

pub const LOG_LEVEL_ENV: &str = "ACP_LOG_LEVEL";

/// Keeps the shared log file handle alive for the life of the process.
pub struct LogGuard {
    file: Option<Arc<Mutex<File>>>,
}

impl LogGuard {
    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }
}

struct MultiWriter {
    stdout_enabled: bool,
    file: Option<Arc<Mutex<File>>>,
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stdout_enabled {
            let _ = io::stdout().write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stdout_enabled {
            let _ = io::stdout().flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

/// Level used when `RUST_LOG` is unset: `debug` when forced, else
/// `ACP_LOG_LEVEL`, else `info`.
pub fn default_level(debug: bool) -> String {
    if debug {
        return "debug".to_string();
    }
    env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string())
}

/// Installs the global subscriber. `file_name` is created under `log_dir`
/// unless the directory is blank. Returns `None` when a subscriber is
/// already installed.
pub fn init_logging(
    level: &str,
    log_dir: &str,
    file_name: &str,
    stdout_enabled: bool,
) -> Option<LogGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(log_dir, file_name) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter {
        stdout_enabled,
        file: file.clone(),
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

pub fn open_log_file(log_dir: &str, file_name: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path(&dir, file_name))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn log_path(dir: &Path, file_name: &str) -> PathBuf {
    dir.join(sanitize_component(file_name))
}

/// Replaces anything outside `[A-Za-z0-9._-]` so a host or port string is
/// safe to use as a file name. Leading dots are replaced too.
pub fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .enumerate()
        .map(|(idx, ch)| {
            let keep = ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || (ch == '.' && idx > 0);
            if keep {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
