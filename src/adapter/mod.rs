//! External Tool Adapter
//!
//! Narrow interfaces over the Docker Engine API and the QEMU command line
//! tools, so the orchestrator can be exercised without a daemon or hypervisor.
//! Adapters never retry; every failure is returned as a classified
//! [`BerthError`](crate::BerthError).

pub mod docker;
pub mod qemu;
pub mod tools;

use crate::Result;
use crate::job::CancelToken;
use crate::request::PortMapping;
use crate::workspace::DiskFormat;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use docker::{DockerConnector, DockerEngine};
pub use qemu::QemuToolchain;
pub use tools::{ToolLocator, ToolStatus};

/// One step reported by a long-running call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressEvent {
    pub line: Option<String>,
    pub percent: Option<u8>,
}

impl ProgressEvent {
    pub fn line(line: impl Into<String>) -> Self {
        Self {
            line: Some(line.into()),
            percent: None,
        }
    }
}

pub type ProgressFn<'a> = &'a (dyn Fn(ProgressEvent) + Send + Sync);

#[async_trait]
pub trait DockerApi: Send + Sync {
    /// Ping the engine and return its version string.
    async fn health_check(&self) -> Result<String>;

    async fn pull_image(
        &self,
        reference: &str,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<()>;

    /// Build from a context directory holding a `Dockerfile`. Returns the
    /// image id when the engine reports one.
    async fn build_image(
        &self,
        context: &Path,
        tag: &str,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<Option<String>>;

    async fn list_images(&self) -> Result<Vec<ImageInfo>>;

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>>;

    /// Create and start a detached container, returning its id.
    async fn run_container(&self, spec: &RunSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn stop_container(&self, id: &str) -> Result<()>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    async fn remove_image(&self, reference: &str, force: bool) -> Result<()>;

    /// At most the last `tail` lines of combined stdout/stderr.
    async fn fetch_logs(&self, id: &str, tail: usize) -> Result<String>;

    async fn search_images(&self, term: &str, limit: u64) -> Result<Vec<SearchHit>>;
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Create a disk image; the format type is the allow-list.
    async fn create_disk(
        &self,
        path: &Path,
        format: DiskFormat,
        size_gb: u32,
        cancel: &CancelToken,
    ) -> Result<()>;

    /// Write the launcher script for `spec` and start it detached.
    async fn launch_vm(&self, spec: &VmLaunch) -> Result<u32>;

    /// Start an existing launcher script detached.
    async fn start_vm(&self, script: &Path) -> Result<u32>;

    fn tool_status(&self) -> Vec<ToolStatus>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub image: String,
    pub name: Option<String>,
    pub ports: Option<PortMapping>,
    pub command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmLaunch {
    pub name: String,
    pub disk_path: PathBuf,
    pub iso_path: Option<PathBuf>,
    pub memory_mb: u32,
    pub cpu_cores: u32,
    pub script_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    pub tags: Vec<String>,
    pub size: u64,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    /// Engine-provided description, e.g. "Up 3 minutes"
    pub status_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerStatus {
    Running,
    Stopped,
    Paused,
    Restarting,
    Created,
    Dead,
    Unknown,
}

impl ContainerStatus {
    pub fn parse(state: &str) -> Self {
        match state.to_lowercase().as_str() {
            "running" | "up" => ContainerStatus::Running,
            "exited" | "stopped" => ContainerStatus::Stopped,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "created" => ContainerStatus::Created,
            "dead" | "removing" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub name: String,
    pub description: String,
    pub stars: u64,
    pub official: bool,
}

/// Keep the last `tail` lines of `text`, newline-delimited, in order.
pub fn tail_lines(text: &str, tail: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(tail);
    lines[start..].join("\n")
}
