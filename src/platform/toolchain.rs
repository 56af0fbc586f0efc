//! External tool lookup (`command -v` semantics).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::ToolsConfig;

#[derive(Debug, Clone, Default)]
pub struct ToolLocator {
    search_path: Vec<PathBuf>,
    overrides: BTreeMap<String, PathBuf>,
}

impl ToolLocator {
    pub fn new(search_path: Vec<PathBuf>, overrides: BTreeMap<String, PathBuf>) -> Self {
        Self {
            search_path,
            overrides,
        }
    }

    /// Search path from the settings file, else `$PATH`.
    pub fn from_config(tools: &ToolsConfig) -> Self {
        let search_path = match &tools.search_path {
            Some(dirs) => dirs.clone(),
            None => std::env::var_os("PATH")
                .map(|p| std::env::split_paths(&p).collect())
                .unwrap_or_default(),
        };
        Self::new(search_path, tools.overrides.clone())
    }

    /// Resolved executable for `name`, or `None` when the tool is not installed.
    ///
    /// Overrides win over the search path. A name containing a path separator
    /// is checked as-is.
    pub fn locate(&self, name: &str) -> Option<PathBuf> {
        if let Some(path) = self.overrides.get(name) {
            return is_executable(path).then(|| path.clone());
        }
        if name.contains(std::path::MAIN_SEPARATOR) {
            let path = PathBuf::from(name);
            return is_executable(&path).then_some(path);
        }
        self.search_path
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| is_executable(candidate))
    }

    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }
}

#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt as _;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt as _;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("profsession-toolchain-{name}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    fn write_file(path: &Path, mode: u32) {
        std::fs::write(path, "#!/bin/sh\nexit 0\n").expect("write");
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).expect("chmod");
    }

    #[test]
    fn locate_searches_path_in_order() {
        let root = temp_dir("order");
        let first = root.join("first");
        let second = root.join("second");
        std::fs::create_dir_all(&first).expect("mkdir");
        std::fs::create_dir_all(&second).expect("mkdir");
        write_file(&second.join("ldd"), 0o755);
        write_file(&first.join("ldd"), 0o644);

        let locator = ToolLocator::new(vec![first, second.clone()], BTreeMap::new());
        assert_eq!(locator.locate("ldd"), Some(second.join("ldd")));
        assert_eq!(locator.locate("nvidia-smi"), None);
    }

    #[test]
    fn override_wins_and_must_be_executable() {
        let root = temp_dir("override");
        let bin = root.join("bin");
        std::fs::create_dir_all(&bin).expect("mkdir");
        write_file(&bin.join("nsys"), 0o755);
        let custom = root.join("custom-nsys");
        write_file(&custom, 0o755);
        let broken = root.join("not-executable");
        write_file(&broken, 0o644);

        let overrides = BTreeMap::from([
            ("nsys".to_string(), custom.clone()),
            ("valgrind".to_string(), broken),
        ]);
        let locator = ToolLocator::new(vec![bin], overrides);
        assert_eq!(locator.locate("nsys"), Some(custom));
        assert_eq!(locator.locate("valgrind"), None);
    }

    #[test]
    fn locate_accepts_explicit_paths() {
        let root = temp_dir("explicit");
        let tool = root.join("time");
        write_file(&tool, 0o755);
        let locator = ToolLocator::default();
        assert_eq!(locator.locate(&tool.to_string_lossy()), Some(tool));
    }
}
