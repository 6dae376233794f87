use acp_core::{Fingerprint, RegisterPayload};
use std::{fs, path::Path, process::Command};

const SCREEN_LOCKERS: &[&str] = &["gnome-screensaver", "xscreensaver", "i3lock", "swaylock"];

/// Identity and platform facts reported to the relay on registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineInfo {
    pub machine_id: String,
    pub machine_name: String,
    pub os_type: String,
    pub os_version: String,
    pub arch: String,
    pub cpu_model: String,
    pub mac_addresses: Vec<String>,
}

impl MachineInfo {
    pub fn detect() -> Self {
        let machine_name = hostname();
        let machine_id = read_trimmed("/etc/machine-id")
            .or_else(|| read_trimmed("/var/lib/dbus/machine-id"))
            .unwrap_or_else(|| machine_name.clone());
        let os_version = fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|content| parse_os_release(&content))
            .unwrap_or_else(|| std::env::consts::OS.to_string());
        let cpu_model = fs::read_to_string("/proc/cpuinfo")
            .ok()
            .and_then(|content| parse_cpu_model(&content))
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            machine_id,
            machine_name,
            os_type: std::env::consts::OS.to_string(),
            os_version,
            arch: normalize_arch(std::env::consts::ARCH).to_string(),
            cpu_model,
            mac_addresses: mac_addresses(Path::new("/sys/class/net")),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            hostname: self.machine_name.clone(),
            cpu_model: self.cpu_model.clone(),
            mac_addresses: self.mac_addresses.clone(),
        }
    }

    pub fn register_payload(
        &self,
        token: Option<String>,
        license_uuid: Option<String>,
        customer_id: Option<String>,
    ) -> RegisterPayload {
        RegisterPayload {
            machine_id: self.machine_id.clone(),
            machine_name: self.machine_name.clone(),
            os_type: self.os_type.clone(),
            os_version: self.os_version.clone(),
            arch: self.arch.clone(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            license_uuid,
            customer_id,
            token,
            fingerprint: self.fingerprint(),
        }
    }
}

pub fn hostname() -> String {
    read_trimmed("/proc/sys/kernel/hostname")
        .or_else(|| read_trimmed("/etc/hostname"))
        .or_else(|| {
            std::env::var("HOSTNAME")
                .ok()
                .filter(|value| !value.trim().is_empty())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// True while a known screen locker process is running.
pub fn is_screen_locked() -> bool {
    SCREEN_LOCKERS.iter().any(|name| {
        Command::new("pgrep")
            .arg("-x")
            .arg(name)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    })
}

pub fn normalize_arch(arch: &str) -> &'static str {
    match arch {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        _ => "unknown",
    }
}

pub fn parse_os_release(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|value| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

pub fn parse_cpu_model(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() == "model name" {
            Some(value.trim().to_string()).filter(|value| !value.is_empty())
        } else {
            None
        }
    })
}

fn mac_addresses(net_dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(net_dir) else {
        return Vec::new();
    };
    let mut macs: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.file_name() != "lo")
        .filter_map(|entry| read_trimmed(entry.path().join("address")))
        .filter(|mac| !mac.is_empty() && mac != "00:00:00:00:00:00")
        .collect();
    macs.sort();
    macs.dedup();
    macs
}

fn read_trimmed(path: impl AsRef<Path>) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
