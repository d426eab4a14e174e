//! Local system probes: machine id and the machine info sent to the service.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

use regex::Regex;

use crate::contract::MachineInfo;
use crate::files::machine_token::MachineToken;

pub const ETC_MACHINE_ID: &str = "/etc/machine-id";
pub const DBUS_MACHINE_ID: &str = "/var/lib/dbus/machine-id";

/// Cached machine id, resolved once per process.
///
/// Must be cleared after a join returns a machine id so the rest of the run
/// does not keep using the pre-join value.
#[derive(Debug, Clone)]
pub struct MachineIdCache {
    cached: Option<String>,
    sources: Vec<PathBuf>,
}

impl Default for MachineIdCache {
    fn default() -> Self {
        Self::with_sources(vec![
            PathBuf::from(ETC_MACHINE_ID),
            PathBuf::from(DBUS_MACHINE_ID),
        ])
    }
}

impl MachineIdCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look for the system id in `sources`, in order.
    pub const fn with_sources(sources: Vec<PathBuf>) -> Self {
        Self {
            cached: None,
            sources,
        }
    }

    /// Resolve the machine id.
    ///
    /// Order: the attached machine token, then each source file, then a
    /// random UUID. The random id is cached for this process but not written
    /// anywhere.
    pub fn get(&mut self, token: Option<&MachineToken>) -> String {
        if let Some(id) = &self.cached {
            return id.clone();
        }
        let id = token
            .map(|t| t.machine_id.clone())
            .filter(|id| !id.is_empty())
            .or_else(|| self.from_sources())
            .unwrap_or_else(|| {
                tracing::debug!("no system machine id found, generating one");
                uuid::Uuid::new_v4().to_string()
            });
        self.cached = Some(id.clone());
        id
    }

    fn from_sources(&self) -> Option<String> {
        self.sources.iter().find_map(|path| {
            let content = fs::read_to_string(path).ok()?;
            let id = content.trim_end_matches('\n').trim();
            (!id.is_empty()).then(|| id.to_string())
        })
    }

    pub fn clear(&mut self) {
        self.cached = None;
    }

    pub const fn is_cached(&self) -> bool {
        self.cached.is_some()
    }
}

/// Parse `os-release` content into key-value pairs.
pub fn parse_os_release(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"');
            if !value.is_empty() {
                map.insert(key.to_string(), value.to_string());
            }
        }
    }
    map
}

/// Distribution name and series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub distribution: String,
    pub series: String,
    pub release: String,
}

impl ReleaseInfo {
    pub fn from_os_release(map: &HashMap<String, String>) -> Self {
        Self {
            distribution: map.get("NAME").cloned().unwrap_or_else(|| "UNKNOWN".into()),
            series: map
                .get("VERSION_CODENAME")
                .map(|s| s.to_lowercase())
                .unwrap_or_default(),
            release: map.get("VERSION_ID").cloned().unwrap_or_default(),
        }
    }

    pub fn detect() -> Self {
        let content = fs::read_to_string("/etc/os-release")
            .or_else(|_| fs::read_to_string("/usr/lib/os-release"))
            .unwrap_or_default();
        Self::from_os_release(&parse_os_release(&content))
    }
}

/// Stdout of `program args`, or `None` if it could not run or failed.
fn command_output(program: &str, args: &[&str]) -> Option<String> {
    tracing::debug!("exec (capture): {program} {}", args.join(" "));
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        tracing::debug!("{program} exited with {}", output.status);
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub fn kernel_release() -> String {
    nix::sys::utsname::uname()
        .map(|u| u.release().to_string_lossy().trim().to_string())
        .unwrap_or_default()
}

/// Debian architecture name.
pub fn dpkg_arch() -> String {
    command_output("dpkg", &["--print-architecture"])
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| debian_arch(std::env::consts::ARCH).to_string())
}

fn debian_arch(rust_arch: &str) -> &str {
    match rust_arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "i386",
        "powerpc64" => "ppc64el",
        "riscv64" => "riscv64",
        other => other,
    }
}

/// Virtualization type from `systemd-detect-virt`.
///
/// Containers without systemd are recognised from `/proc/1/cgroup`.
pub fn virt_type() -> String {
    command_output("systemd-detect-virt", &[]).unwrap_or_else(|| {
        fs::read_to_string("/proc/1/cgroup")
            .map(|c| virt_from_cgroup(&c).to_string())
            .unwrap_or_default()
    })
}

fn virt_from_cgroup(cgroup: &str) -> &'static str {
    if cgroup.contains("docker") || cgroup.contains("buildkit") {
        "docker"
    } else if cgroup.contains("buildah") {
        "podman"
    } else {
        ""
    }
}

/// Graphical session, or an installed `tasksel` desktop task.
pub fn is_desktop() -> bool {
    let has_display = ["DISPLAY", "WAYLAND_DISPLAY"]
        .iter()
        .any(|v| std::env::var_os(v).is_some_and(|s| !s.is_empty()));
    has_display
        || command_output("tasksel", &["--list-tasks"]).is_some_and(|out| has_desktop_task(&out))
}

fn has_desktop_task(tasksel: &str) -> bool {
    tasksel.lines().any(|line| {
        let mut parts = line.split_whitespace();
        parts.next() == Some("i") && parts.next().is_some_and(|task| task.contains("desktop"))
    })
}

/// First value of `field` in `/proc/cpuinfo`-style content, whitespace
/// collapsed.
fn cpuinfo_field(cpuinfo: &str, field: &str) -> Option<String> {
    let re = Regex::new(&format!(r"(?m)^{}\s*:\s*(.+)$", regex::escape(field))).ok()?;
    let value = re.captures(cpuinfo)?.get(1)?.as_str();
    Some(value.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// `field:value` pairs for `fields`, sorted by field name.
fn cpuinfo_fallback(cpuinfo: &str, fields: &[&str]) -> String {
    let mut fields = fields.to_vec();
    fields.sort_unstable();
    fields
        .iter()
        .map(|f| format!("{f}:{}", cpuinfo_field(cpuinfo, f).unwrap_or_default()))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Human-readable CPU type for `arch`.
///
/// x86 uses the `model name` line. ARM prefers the device-tree model and
/// falls back to the implementer/part fields.
pub fn cpu_type_from(arch: &str, cpuinfo: &str, device_tree_model: Option<&str>) -> String {
    match arch {
        "amd64" | "i386" => cpuinfo_field(cpuinfo, "model name").unwrap_or_else(|| {
            cpuinfo_fallback(cpuinfo, &["vendor_id", "cpu family", "model", "stepping"])
        }),
        "arm64" | "armhf" | "armel" => device_tree_model
            .map(|m| m.trim_end_matches('\0').trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| {
                cpuinfo_fallback(
                    cpuinfo,
                    &[
                        "CPU implementer",
                        "CPU architecture",
                        "CPU variant",
                        "CPU part",
                        "CPU revision",
                    ],
                )
            }),
        _ => cpuinfo_field(cpuinfo, "model name").unwrap_or_else(|| "unknown".to_string()),
    }
}

pub fn cpu_type(arch: &str) -> String {
    let cpuinfo = fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
    let model = fs::read_to_string("/proc/device-tree/model").ok();
    cpu_type_from(arch, &cpuinfo, model.as_deref())
}

/// Probe the running system.
pub fn machine_info() -> MachineInfo {
    let release = ReleaseInfo::detect();
    let architecture = dpkg_arch();
    MachineInfo {
        distribution: release.distribution,
        kernel: kernel_release(),
        series: release.series,
        cpu_type: cpu_type(&architecture),
        architecture,
        desktop: is_desktop().to_string(),
        virt: virt_type(),
        client_version: env!("CARGO_PKG_VERSION").to_string(),
    }
}
