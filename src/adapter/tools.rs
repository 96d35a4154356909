//! Locating external tool installations.
//!
//! Lookup order: explicit override, configured search paths, the MSYS2
//! toolchain (Windows), `PATH`, then common installation prefixes. An explicit
//! override that does not exist is reported missing rather than silently
//! replaced by something found elsewhere.

use crate::config::ToolsConfig;
use crate::log_debug;
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ToolStatus {
    pub name: String,
    pub path: Option<PathBuf>,
}

impl ToolStatus {
    pub fn available(&self) -> bool {
        self.path.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolLocator {
    config: ToolsConfig,
}

fn executable_name(tool: &str) -> String {
    if cfg!(windows) && !tool.ends_with(".exe") {
        format!("{}.exe", tool)
    } else {
        tool.to_string()
    }
}

fn common_prefixes() -> Vec<PathBuf> {
    if cfg!(windows) {
        vec![
            PathBuf::from(r"C:\Program Files\qemu"),
            PathBuf::from(r"C:\msys64\mingw64\bin"),
            PathBuf::from(r"C:\msys64\usr\bin"),
        ]
    } else {
        vec![
            PathBuf::from("/usr/bin"),
            PathBuf::from("/usr/local/bin"),
            PathBuf::from("/opt/homebrew/bin"),
            PathBuf::from("/usr/libexec"),
        ]
    }
}

impl ToolLocator {
    pub fn new(config: ToolsConfig) -> Self {
        Self { config }
    }

    pub fn qemu_img(&self) -> Option<PathBuf> {
        self.locate("qemu-img", self.config.qemu_img.as_deref())
    }

    pub fn qemu_system(&self) -> Option<PathBuf> {
        self.locate("qemu-system-x86_64", self.config.qemu_system.as_deref())
    }

    pub fn locate(&self, tool: &str, override_path: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = override_path {
            return path.is_file().then(|| path.to_path_buf());
        }

        let file = executable_name(tool);
        let mut dirs: Vec<PathBuf> = self.config.search_paths.clone();
        if let Some(root) = self.msys_root() {
            dirs.push(root.join("mingw64").join("bin"));
            dirs.push(root.join("usr").join("bin"));
        }
        if let Some(path) = env::var_os("PATH") {
            dirs.extend(env::split_paths(&path));
        }
        dirs.extend(common_prefixes());

        let found = dirs
            .into_iter()
            .map(|dir| dir.join(&file))
            .find(|candidate| candidate.is_file());
        log_debug!("Locating {}: {:?}", tool, found);
        found
    }

    /// The MSYS2 root, from config, `PATH` entries mentioning msys64/msys2,
    /// or well-known install locations.
    pub fn msys_root(&self) -> Option<PathBuf> {
        if let Some(root) = &self.config.msys_root {
            return root.is_dir().then(|| root.clone());
        }
        if !cfg!(windows) {
            return None;
        }

        if let Some(path) = env::var_os("PATH") {
            for dir in env::split_paths(&path) {
                if let Some(root) = msys_root_from(&dir) {
                    return Some(root);
                }
            }
        }

        let mut candidates = vec![
            PathBuf::from(r"C:\msys64"),
            PathBuf::from(r"D:\msys64"),
            PathBuf::from(r"C:\Program Files\MSYS2"),
            PathBuf::from(r"D:\Program Files\MSYS2"),
        ];
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join("msys64"));
        }
        candidates.into_iter().find(|p| p.is_dir())
    }

    /// Shell used to run MSYS2 launchers, when an MSYS2 root is present.
    pub fn msys_shell(&self) -> Option<PathBuf> {
        self.msys_root()
            .map(|root| root.join("mingw64.exe"))
            .filter(|p| p.is_file())
    }

    pub fn status(&self) -> Vec<ToolStatus> {
        vec![
            ToolStatus {
                name: "qemu-img".to_string(),
                path: self.qemu_img(),
            },
            ToolStatus {
                name: "qemu-system-x86_64".to_string(),
                path: self.qemu_system(),
            },
        ]
    }
}

/// Truncate `dir` at its first msys64/msys2 component.
fn msys_root_from(dir: &Path) -> Option<PathBuf> {
    let mut root = PathBuf::new();
    for component in dir.components() {
        root.push(component);
        let name = component.as_os_str().to_string_lossy().to_lowercase();
        if name == "msys64" || name == "msys2" {
            return root.is_dir().then_some(root);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn missing_override_is_not_replaced() {
        let locator = ToolLocator::new(ToolsConfig {
            qemu_img: Some(PathBuf::from("/nonexistent/qemu-img")),
            ..Default::default()
        });
        assert!(locator.qemu_img().is_none());
    }

    #[test]
    fn search_paths_are_consulted_first() {
        let dir = TempDir::new().unwrap();
        let tool = dir.path().join(executable_name("berth-fake-tool"));
        fs::write(&tool, b"").unwrap();

        let locator = ToolLocator::new(ToolsConfig {
            search_paths: vec![dir.path().to_path_buf()],
            ..Default::default()
        });
        assert_eq!(locator.locate("berth-fake-tool", None), Some(tool));
    }

    #[test]
    fn msys_root_is_cut_at_msys_component() {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("msys64").join("mingw64").join("bin");
        fs::create_dir_all(&bin).unwrap();
        assert_eq!(msys_root_from(&bin), Some(dir.path().join("msys64")));
        assert_eq!(msys_root_from(dir.path()), None);
    }
}
