//! `profsession.toml` settings loading.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::{ArchiveFormat, ProfError, ProfResult};

pub const DEFAULT_CONFIG_FILE: &str = "profsession.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub perf: PerfConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    /// Archive written next to the output directory once all steps ran.
    #[serde(default)]
    pub archive: ArchiveFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ToolsConfig {
    /// Explicit executable per tool name, bypassing the search path.
    #[serde(default)]
    pub overrides: BTreeMap<String, PathBuf>,

    /// Directories searched for tools; `$PATH` when unset.
    #[serde(default)]
    pub search_path: Option<Vec<PathBuf>>,

    /// Checkout of Brendan Gregg's FlameGraph scripts.
    #[serde(default = "default_flamegraph_dir")]
    pub flamegraph_dir: Option<PathBuf>,

    #[serde(default = "default_os_release_path")]
    pub os_release_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PerfConfig {
    /// Look for a kernel-matched perf under `linux_tools_root` before trusting `$PATH`.
    #[serde(default = "default_true")]
    pub resolve: bool,

    #[serde(default = "default_linux_tools_root")]
    pub linux_tools_root: PathBuf,

    /// Symlink a mismatched perf into the running kernel's linux-tools directory.
    #[serde(default = "default_true")]
    pub link_fallback: bool,

    /// Run `install_command` when no perf can be found. Off unless the operator opts in.
    #[serde(default)]
    pub install: bool,

    /// `{kernel}` is replaced with the running kernel release.
    #[serde(default = "default_install_command")]
    pub install_command: Vec<String>,

    #[serde(default = "default_perf_frequency")]
    pub frequency: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LimitsConfig {
    #[serde(default = "default_massif_timeout_secs")]
    pub massif_timeout_secs: u64,

    #[serde(default = "default_inspect_timeout_secs")]
    pub inspect_timeout_secs: u64,

    /// Extra time a time-boxed tool gets before the runner kills it.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,

    #[serde(default = "default_strings_head_lines")]
    pub strings_head_lines: usize,

    #[serde(default = "default_top_lines")]
    pub top_lines: usize,
}

fn default_true() -> bool {
    true
}

fn default_flamegraph_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join("FlameGraph"))
}

fn default_os_release_path() -> PathBuf {
    PathBuf::from("/etc/os-release")
}

fn default_linux_tools_root() -> PathBuf {
    PathBuf::from("/usr/lib/linux-tools")
}

fn default_install_command() -> Vec<String> {
    [
        "sudo",
        "-n",
        "apt-get",
        "install",
        "-y",
        "linux-tools-{kernel}",
        "linux-tools-generic",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_perf_frequency() -> u32 {
    99
}

fn default_massif_timeout_secs() -> u64 {
    60
}

fn default_inspect_timeout_secs() -> u64 {
    60
}

fn default_kill_grace_secs() -> u64 {
    10
}

fn default_strings_head_lines() -> usize {
    200
}

fn default_top_lines() -> usize {
    15
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            overrides: BTreeMap::new(),
            search_path: None,
            flamegraph_dir: default_flamegraph_dir(),
            os_release_path: default_os_release_path(),
        }
    }
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            resolve: true,
            linux_tools_root: default_linux_tools_root(),
            link_fallback: true,
            install: false,
            install_command: default_install_command(),
            frequency: default_perf_frequency(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            massif_timeout_secs: default_massif_timeout_secs(),
            inspect_timeout_secs: default_inspect_timeout_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            strings_head_lines: default_strings_head_lines(),
            top_lines: default_top_lines(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> ProfResult<Self> {
        let s = std::fs::read_to_string(path)?;
        Ok(toml::from_str::<Config>(&s)?)
    }

    /// Defaults when the file is missing; unreadable or malformed files are logged and ignored.
    pub fn load_optional(path: &Path) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(ProfError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                Self::default()
            }
            Err(err) => {
                tracing::warn!("failed to load config {}: {err}", path.display());
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("profsession-config-{name}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = temp_dir("missing");
        assert!(matches!(Config::load(&dir.join("nope.toml")), Err(ProfError::Io(_))));
        let cfg = Config::load_optional(&dir.join("nope.toml"));
        assert_eq!(cfg.perf.frequency, 99);
        assert!(cfg.perf.resolve);
        assert!(!cfg.perf.install);
        assert_eq!(cfg.limits.massif_timeout_secs, 60);
        assert_eq!(cfg.archive, ArchiveFormat::TarGz);
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = temp_dir("partial");
        let path = dir.join(DEFAULT_CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
archive = "zip"

[tools]
flamegraph_dir = "/opt/FlameGraph"

[tools.overrides]
nsys = "/opt/nvidia/nsys/bin/nsys"

[perf]
install = true
frequency = 499
"#,
        )
        .expect("write config");

        let cfg = Config::load_optional(&path);
        assert_eq!(cfg.archive, ArchiveFormat::Zip);
        assert_eq!(cfg.tools.flamegraph_dir, Some(PathBuf::from("/opt/FlameGraph")));
        assert_eq!(
            cfg.tools.overrides.get("nsys"),
            Some(&PathBuf::from("/opt/nvidia/nsys/bin/nsys"))
        );
        assert!(cfg.perf.install);
        assert_eq!(cfg.perf.frequency, 499);
        assert_eq!(cfg.perf.linux_tools_root, PathBuf::from("/usr/lib/linux-tools"));
        assert_eq!(cfg.limits.top_lines, 15);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = temp_dir("malformed");
        let path = dir.join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "archive = [not toml").expect("write config");
        assert!(matches!(Config::load(&path), Err(ProfError::Toml(_))));
        let cfg = Config::load_optional(&path);
        assert_eq!(cfg.archive, ArchiveFormat::TarGz);
        assert_eq!(cfg.limits.strings_head_lines, 200);
    }
}
