//! Resolution of a usable `perf` binary before the step sequence starts.
//!
//! Distribution `perf` wrappers exec `<linux-tools>/<kernel release>/perf` and refuse
//! to run when that exact directory is missing, which is common on cloud images
//! whose kernel was upgraded after the tools package was installed.

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};
use std::time::Duration;

use walkdir::WalkDir;

use crate::{
    PerfConfig, ProcessSpec, ProfError, ProfResult, Sink, ToolLocator, is_executable, run,
    run_captured,
};

const PERF: &str = "perf";

/// Kernel release reported when the host cannot be queried.
pub const UNKNOWN_RELEASE: &str = "unknown";
const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PerfResolution {
    FoundExact {
        path: PathBuf,
    },
    FoundFallback {
        path: PathBuf,
        /// Symlink created in the running kernel's linux-tools directory, if any.
        linked: Option<PathBuf>,
    },
    FoundOnPath {
        path: PathBuf,
    },
    Installed {
        path: PathBuf,
    },
    Unavailable {
        install_attempted: bool,
        reason: String,
    },
}

impl PerfResolution {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::FoundExact { path }
            | Self::FoundFallback { path, .. }
            | Self::FoundOnPath { path }
            | Self::Installed { path } => Some(path),
            Self::Unavailable { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::FoundExact { .. } => "found-exact",
            Self::FoundFallback { .. } => "found-fallback",
            Self::FoundOnPath { .. } => "found-on-path",
            Self::Installed { .. } => "installed",
            Self::Unavailable { .. } => "unavailable",
        }
    }
}

#[derive(Debug)]
pub struct PerfResolver<'a> {
    config: &'a PerfConfig,
    locator: &'a ToolLocator,
    kernel_release: String,
    /// Dry runs must not link or install anything.
    side_effects: bool,
}

impl<'a> PerfResolver<'a> {
    pub fn new(
        config: &'a PerfConfig,
        locator: &'a ToolLocator,
        kernel_release: impl Into<String>,
    ) -> Self {
        Self {
            config,
            locator,
            kernel_release: kernel_release.into(),
            side_effects: true,
        }
    }

    pub fn without_side_effects(mut self) -> Self {
        self.side_effects = false;
        self
    }

    pub fn resolve(&self) -> PerfResolution {
        if !self.config.resolve {
            return match self.locator.locate(PERF) {
                Some(path) => PerfResolution::FoundOnPath { path },
                None => PerfResolution::Unavailable {
                    install_attempted: false,
                    reason: "perf not found on the search path".to_string(),
                },
            };
        }

        if let Some(found) = self.search() {
            return found;
        }

        if !self.config.install {
            return PerfResolution::Unavailable {
                install_attempted: false,
                reason: format!(
                    "no perf for kernel {} under {} or on the search path \
                     (installation not enabled)",
                    self.kernel_release,
                    self.config.linux_tools_root.display()
                ),
            };
        }
        if !self.side_effects {
            return PerfResolution::Unavailable {
                install_attempted: false,
                reason: "perf missing; installation skipped in dry run".to_string(),
            };
        }

        if let Err(err) = self.install() {
            tracing::warn!("perf installation failed: {err}");
        }
        match self.search() {
            Some(found) => match found.path() {
                Some(path) => PerfResolution::Installed {
                    path: path.to_path_buf(),
                },
                None => found,
            },
            None => PerfResolution::Unavailable {
                install_attempted: true,
                reason: format!(
                    "perf still missing after installation for kernel {}",
                    self.kernel_release
                ),
            },
        }
    }

    fn search(&self) -> Option<PerfResolution> {
        let exact = self.exact_path();
        if is_executable(&exact) {
            tracing::info!("using kernel-matched perf {}", exact.display());
            return Some(PerfResolution::FoundExact { path: exact });
        }

        match self.fallback_candidates() {
            Ok(candidates) => {
                if let Some(path) = candidates.into_iter().next_back() {
                    let linked = self.link_fallback(&path);
                    tracing::info!("using fallback perf {}", path.display());
                    return Some(PerfResolution::FoundFallback { path, linked });
                }
            }
            Err(err) => tracing::debug!("perf fallback scan failed: {err}"),
        }

        let path = self.locator.locate(PERF)?;
        match run_captured(&path, &["--version"], VERSION_CHECK_TIMEOUT) {
            Ok((outcome, _)) if outcome.success() => Some(PerfResolution::FoundOnPath { path }),
            Ok((outcome, _)) => {
                tracing::warn!(
                    "{} --version exited with {:?}; treating perf as unusable",
                    path.display(),
                    outcome.exit_code
                );
                None
            }
            Err(err) => {
                tracing::warn!("{err}");
                None
            }
        }
    }

    fn exact_path(&self) -> PathBuf {
        self.config
            .linux_tools_root
            .join(&self.kernel_release)
            .join(PERF)
    }

    /// `<root>/*/perf` executables other than the exact match, sorted ascending.
    fn fallback_candidates(&self) -> ProfResult<Vec<PathBuf>> {
        let root = &self.config.linux_tools_root;
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let matcher = perf_matcher()?;
        let exact = self.exact_path();
        let mut out = Vec::new();
        for entry in WalkDir::new(root).min_depth(2).max_depth(2) {
            let entry = entry?;
            let path = entry.path();
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            if matcher.is_match(rel) && path != exact && is_executable(path) {
                out.push(path.to_path_buf());
            }
        }
        out.sort();
        Ok(out)
    }

    #[cfg(unix)]
    fn link_fallback(&self, target: &Path) -> Option<PathBuf> {
        if !self.config.link_fallback || !self.side_effects {
            return None;
        }
        if self.kernel_release == UNKNOWN_RELEASE {
            tracing::warn!("kernel release unknown; not linking {}", target.display());
            return None;
        }
        let link = self.exact_path();
        let result = link
            .parent()
            .map(std::fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|()| {
                if link.symlink_metadata().is_ok() {
                    std::fs::remove_file(&link)?;
                }
                std::os::unix::fs::symlink(target, &link)
            });
        match result {
            Ok(()) => {
                tracing::info!("linked {} -> {}", link.display(), target.display());
                Some(link)
            }
            Err(err) => {
                tracing::warn!("could not link {} -> {}: {err}", link.display(), target.display());
                None
            }
        }
    }

    #[cfg(not(unix))]
    fn link_fallback(&self, _target: &Path) -> Option<PathBuf> {
        None
    }

    fn install(&self) -> ProfResult<()> {
        let argv: Vec<String> = self
            .config
            .install_command
            .iter()
            .map(|a| a.replace("{kernel}", &self.kernel_release))
            .collect();
        let Some((program, args)) = argv.split_first() else {
            return Err(ProfError::Config("perf.install_command is empty".to_string()));
        };
        let program = self
            .locator
            .locate(program)
            .ok_or_else(|| ProfError::Tool(format!("{program} not found, cannot install perf")))?;
        let spec = ProcessSpec::new(program)
            .args(args)
            .stdout(Sink::Null)
            .stderr(Sink::Null)
            .deadline(Some(INSTALL_TIMEOUT));
        tracing::info!("attempting perf installation: {}", spec.display());
        let outcome = run(&spec)?;
        if !outcome.success() {
            return Err(ProfError::Tool(format!(
                "install command exited with {:?}",
                outcome.exit_code
            )));
        }
        Ok(())
    }
}

fn perf_matcher() -> ProfResult<GlobMatcher> {
    let glob = Glob::new("*/perf")
        .map_err(|e| ProfError::InvalidArgument(format!("invalid glob: {e}")))?;
    Ok(glob.compile_matcher())
}

/// Running kernel release, as `uname -r` prints it.
#[cfg(unix)]
pub fn kernel_release() -> String {
    match nix::sys::utsname::uname() {
        Ok(uts) => {
            let release = uts.release().to_string_lossy().trim().to_string();
            if release.is_empty() {
                UNKNOWN_RELEASE.to_string()
            } else {
                release
            }
        }
        Err(err) => {
            tracing::warn!("uname failed: {err}");
            UNKNOWN_RELEASE.to_string()
        }
    }
}

#[cfg(not(unix))]
pub fn kernel_release() -> String {
    UNKNOWN_RELEASE.to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt as _;

    const RELEASE: &str = "6.8.0-1015-aws";

    fn temp_dir(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("profsession-perf-{name}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    fn write_script(path: &Path, body: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(path, format!("#!/bin/sh\n{body}\n")).expect("write");
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    }

    fn perf_config(root: &Path) -> PerfConfig {
        PerfConfig {
            linux_tools_root: root.join("linux-tools"),
            ..PerfConfig::default()
        }
    }

    fn empty_locator() -> ToolLocator {
        ToolLocator::new(Vec::new(), BTreeMap::new())
    }

    #[test]
    fn exact_match_wins_over_fallback() {
        let root = temp_dir("exact");
        let cfg = perf_config(&root);
        write_script(&cfg.linux_tools_root.join(RELEASE).join("perf"), "exit 0");
        write_script(&cfg.linux_tools_root.join("6.5.0-9-aws").join("perf"), "exit 0");

        let locator = empty_locator();
        let res = PerfResolver::new(&cfg, &locator, RELEASE).resolve();
        assert_eq!(
            res,
            PerfResolution::FoundExact {
                path: cfg.linux_tools_root.join(RELEASE).join("perf")
            }
        );
    }

    #[test]
    fn fallback_is_linked_into_kernel_directory() {
        let root = temp_dir("fallback");
        let cfg = perf_config(&root);
        let older = cfg.linux_tools_root.join("6.5.0-9-aws").join("perf");
        let newer = cfg.linux_tools_root.join("6.8.0-1009-aws").join("perf");
        write_script(&older, "exit 0");
        write_script(&newer, "exit 0");

        let locator = empty_locator();
        let res = PerfResolver::new(&cfg, &locator, RELEASE).resolve();
        let link = cfg.linux_tools_root.join(RELEASE).join("perf");
        assert_eq!(
            res,
            PerfResolution::FoundFallback {
                path: newer.clone(),
                linked: Some(link.clone()),
            }
        );
        assert_eq!(std::fs::read_link(&link).expect("symlink"), newer);
    }

    #[test]
    fn unknown_release_is_never_linked() {
        let root = temp_dir("unknown");
        let cfg = perf_config(&root);
        let fallback = cfg.linux_tools_root.join("6.5.0-9-aws").join("perf");
        write_script(&fallback, "exit 0");

        let locator = empty_locator();
        let res = PerfResolver::new(&cfg, &locator, UNKNOWN_RELEASE).resolve();
        assert_eq!(
            res,
            PerfResolution::FoundFallback {
                path: fallback,
                linked: None
            }
        );
        assert!(!cfg.linux_tools_root.join(UNKNOWN_RELEASE).exists());
    }

    #[test]
    fn kernel_release_matches_running_kernel() {
        let release = kernel_release();
        assert_ne!(release, UNKNOWN_RELEASE);
        assert!(!release.contains(char::is_whitespace), "{release:?}");
        if let Ok(proc) = std::fs::read_to_string("/proc/sys/kernel/osrelease") {
            assert_eq!(release, proc.trim());
        }
    }

    #[test]
    fn dry_run_does_not_link() {
        let root = temp_dir("dry");
        let cfg = perf_config(&root);
        let fallback = cfg.linux_tools_root.join("6.5.0-9-aws").join("perf");
        write_script(&fallback, "exit 0");

        let locator = empty_locator();
        let res = PerfResolver::new(&cfg, &locator, RELEASE)
            .without_side_effects()
            .resolve();
        assert_eq!(
            res,
            PerfResolution::FoundFallback {
                path: fallback,
                linked: None
            }
        );
        assert!(!cfg.linux_tools_root.join(RELEASE).exists());
    }

    #[test]
    fn path_perf_must_answer_version_check() {
        let root = temp_dir("path");
        let cfg = perf_config(&root);
        let bin = root.join("bin");
        write_script(&bin.join("perf"), "echo 'WARNING: perf not found for kernel' >&2; exit 2");
        let locator = ToolLocator::new(vec![bin.clone()], BTreeMap::new());

        let res = PerfResolver::new(&cfg, &locator, RELEASE).resolve();
        assert!(matches!(
            res,
            PerfResolution::Unavailable {
                install_attempted: false,
                ..
            }
        ));

        write_script(&bin.join("perf"), "echo 'perf version 6.8'; exit 0");
        let res = PerfResolver::new(&cfg, &locator, RELEASE).resolve();
        assert_eq!(res, PerfResolution::FoundOnPath { path: bin.join("perf") });
    }

    #[test]
    fn install_is_opt_in_and_rechecks() {
        let root = temp_dir("install");
        let mut cfg = perf_config(&root);
        let bin = root.join("bin");
        let marker = root.join("installer-ran");
        let target = cfg.linux_tools_root.join(RELEASE).join("perf");
        write_script(
            &bin.join("fake-apt"),
            &format!(
                "touch {}\nmkdir -p {}\nprintf '#!/bin/sh\\nexit 0\\n' > {}\nchmod 755 {}",
                marker.display(),
                target.parent().expect("parent").display(),
                target.display(),
                target.display()
            ),
        );
        cfg.install_command = vec!["fake-apt".to_string(), "linux-tools-{kernel}".to_string()];
        let locator = ToolLocator::new(vec![bin], BTreeMap::new());

        let res = PerfResolver::new(&cfg, &locator, RELEASE).resolve();
        assert!(matches!(res, PerfResolution::Unavailable { install_attempted: false, .. }));
        assert!(!marker.exists());

        cfg.install = true;
        let res = PerfResolver::new(&cfg, &locator, RELEASE).resolve();
        assert!(marker.exists());
        assert_eq!(res, PerfResolution::Installed { path: target });
    }

    #[test]
    fn failed_install_reports_attempt() {
        let root = temp_dir("install-fail");
        let mut cfg = perf_config(&root);
        let bin = root.join("bin");
        write_script(&bin.join("fake-apt"), "exit 100");
        cfg.install = true;
        cfg.install_command = vec!["fake-apt".to_string()];
        let locator = ToolLocator::new(vec![bin], BTreeMap::new());

        let res = PerfResolver::new(&cfg, &locator, RELEASE).resolve();
        assert!(matches!(res, PerfResolution::Unavailable { install_attempted: true, .. }));
        assert_eq!(res.path(), None);
    }

    #[test]
    fn resolution_disabled_uses_plain_lookup() {
        let root = temp_dir("v1");
        let mut cfg = perf_config(&root);
        cfg.resolve = false;
        write_script(&cfg.linux_tools_root.join(RELEASE).join("perf"), "exit 0");
        let bin = root.join("bin");
        write_script(&bin.join("perf"), "exit 1");
        let locator = ToolLocator::new(vec![bin.clone()], BTreeMap::new());

        let res = PerfResolver::new(&cfg, &locator, RELEASE).resolve();
        assert_eq!(res, PerfResolution::FoundOnPath { path: bin.join("perf") });
    }
}
