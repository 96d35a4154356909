use crate::{BerthError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BerthConfig {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub logs: LogsConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

/// Where disk images and VM launcher scripts live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub directory: Option<PathBuf>,
}

impl WorkspaceConfig {
    pub fn resolve_directory(&self) -> PathBuf {
        if let Some(dir) = &self.directory {
            return dir.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("berth")
            .join("disks")
    }
}

/// Overrides for external tool discovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    pub qemu_img: Option<PathBuf>,
    pub qemu_system: Option<PathBuf>,
    /// Extra directories searched before PATH
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,
    /// MSYS2 installation root (Windows hosts)
    pub msys_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Socket or named pipe; local defaults when unset
    pub host: Option<String>,
    #[serde(default = "default_docker_timeout")]
    pub timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            timeout_secs: default_docker_timeout(),
        }
    }
}

fn default_docker_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsConfig {
    #[serde(default = "default_tail")]
    pub default_tail: usize,
    #[serde(default = "default_max_tail")]
    pub max_tail: usize,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            default_tail: default_tail(),
            max_tail: default_max_tail(),
        }
    }
}

fn default_tail() -> usize {
    100
}

fn default_max_tail() -> usize {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_search_limit")]
    pub limit: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            min_chars: default_min_chars(),
            limit: default_search_limit(),
        }
    }
}

fn default_min_chars() -> usize {
    3
}

fn default_search_limit() -> u64 {
    5
}

impl BerthConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let config: BerthConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| BerthError::Config(e.to_string()))?;
        fs::write(path, contents)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.logs.default_tail == 0 || self.logs.default_tail > self.logs.max_tail {
            return Err(BerthError::Config(format!(
                "logs.default_tail must be between 1 and {}",
                self.logs.max_tail
            )));
        }
        if self.search.limit == 0 {
            return Err(BerthError::Config("search.limit must be positive".into()));
        }
        if self.docker.timeout_secs == 0 {
            return Err(BerthError::Config(
                "docker.timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}
