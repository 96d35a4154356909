use crate::error::JobError;
use crate::request::{PortMapping, canonical_reference};
use crate::workspace::DiskFormat;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    CreateDisk,
    LaunchVm,
    StartVm,
    PullImage,
    BuildImage,
    RemoveImage,
    RunContainer,
    StartContainer,
    StopContainer,
    RemoveContainer,
    FetchLogs,
}

impl JobKind {
    /// Kinds sharing a class are mutually exclusive on the same target.
    pub fn class(&self) -> KindClass {
        match self {
            JobKind::CreateDisk => KindClass::Disk,
            JobKind::LaunchVm | JobKind::StartVm => KindClass::Vm,
            JobKind::PullImage | JobKind::BuildImage | JobKind::RemoveImage => KindClass::Image,
            JobKind::RunContainer
            | JobKind::StartContainer
            | JobKind::StopContainer
            | JobKind::RemoveContainer => KindClass::Container,
            JobKind::FetchLogs => KindClass::Logs,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KindClass {
    Disk,
    Vm,
    Image,
    Container,
    Logs,
}

impl fmt::Display for KindClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            KindClass::Disk => "disk",
            KindClass::Vm => "vm",
            KindClass::Image => "image",
            KindClass::Container => "container",
            KindClass::Logs => "logs",
        };
        f.write_str(label)
    }
}

/// Exclusivity key: at most one non-terminal job per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExclusionKey {
    pub class: KindClass,
    pub target: String,
}

impl ExclusionKey {
    pub fn new(class: KindClass, target: impl Into<String>) -> Self {
        Self {
            class,
            target: target.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        match self {
            JobState::Pending => matches!(
                next,
                JobState::Running | JobState::Failed | JobState::Cancelled
            ),
            JobState::Running => next.is_terminal(),
            JobState::Succeeded | JobState::Failed | JobState::Cancelled => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Kind-specific parameters, already validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobParams {
    CreateDisk {
        path: PathBuf,
        format: DiskFormat,
        size_gb: u32,
    },
    LaunchVm {
        name: String,
        disk_path: PathBuf,
        iso_path: Option<PathBuf>,
        memory_mb: u32,
        cpu_cores: u32,
    },
    StartVm {
        name: String,
        script_path: PathBuf,
    },
    PullImage {
        reference: String,
    },
    BuildImage {
        context: PathBuf,
        tag: String,
    },
    RemoveImage {
        reference: String,
        force: bool,
    },
    RunContainer {
        image: String,
        name: Option<String>,
        ports: Option<PortMapping>,
        command: Option<String>,
    },
    StartContainer {
        id: String,
    },
    StopContainer {
        id: String,
    },
    RemoveContainer {
        id: String,
        force: bool,
    },
    FetchLogs {
        id: String,
        tail: usize,
    },
}

impl JobParams {
    pub fn kind(&self) -> JobKind {
        match self {
            JobParams::CreateDisk { .. } => JobKind::CreateDisk,
            JobParams::LaunchVm { .. } => JobKind::LaunchVm,
            JobParams::StartVm { .. } => JobKind::StartVm,
            JobParams::PullImage { .. } => JobKind::PullImage,
            JobParams::BuildImage { .. } => JobKind::BuildImage,
            JobParams::RemoveImage { .. } => JobKind::RemoveImage,
            JobParams::RunContainer { .. } => JobKind::RunContainer,
            JobParams::StartContainer { .. } => JobKind::StartContainer,
            JobParams::StopContainer { .. } => JobKind::StopContainer,
            JobParams::RemoveContainer { .. } => JobKind::RemoveContainer,
            JobParams::FetchLogs { .. } => JobKind::FetchLogs,
        }
    }

    /// The logical resource this job acts on.
    ///
    /// Image targets use the canonical reference. Unnamed container runs are
    /// keyed on their image, so an image cannot be removed while a container
    /// is being created from it.
    pub fn exclusion_key(&self) -> ExclusionKey {
        match self {
            JobParams::CreateDisk { path, .. } => disk_key(path),
            JobParams::LaunchVm { name, .. } | JobParams::StartVm { name, .. } => {
                ExclusionKey::new(KindClass::Vm, name.as_str())
            }
            JobParams::PullImage { reference } | JobParams::RemoveImage { reference, .. } => {
                ExclusionKey::new(KindClass::Image, canonical_reference(reference))
            }
            JobParams::BuildImage { tag, .. } => {
                ExclusionKey::new(KindClass::Image, canonical_reference(tag))
            }
            JobParams::RunContainer { name: Some(name), .. } => {
                ExclusionKey::new(KindClass::Container, name.as_str())
            }
            JobParams::RunContainer { image, name: None, .. } => {
                ExclusionKey::new(KindClass::Image, canonical_reference(image))
            }
            JobParams::StartContainer { id }
            | JobParams::StopContainer { id }
            | JobParams::RemoveContainer { id, .. } => {
                ExclusionKey::new(KindClass::Container, id.as_str())
            }
            JobParams::FetchLogs { id, .. } => ExclusionKey::new(KindClass::Logs, id.as_str()),
        }
    }

    /// Every key held while the job is in flight, primary key first. A VM
    /// launch also holds its disk.
    pub fn exclusion_keys(&self) -> Vec<ExclusionKey> {
        let mut keys = vec![self.exclusion_key()];
        if let JobParams::LaunchVm { disk_path, .. } = self {
            keys.push(disk_key(disk_path));
        }
        keys
    }
}

/// Disks are keyed on their full path.
pub fn disk_key(path: &Path) -> ExclusionKey {
    ExclusionKey::new(KindClass::Disk, path.to_string_lossy())
}

/// Success payload of a terminal job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobResult {
    DiskCreated { path: PathBuf },
    VmLaunched { script: PathBuf, pid: u32 },
    ImagePulled { reference: String },
    ImageBuilt { tag: String, image_id: Option<String> },
    ImageRemoved { reference: String },
    ContainerCreated { id: String },
    ContainerStarted { id: String },
    ContainerStopped { id: String },
    ContainerRemoved { id: String },
    Logs { text: String },
}

impl JobResult {
    pub fn summary(&self) -> String {
        match self {
            JobResult::DiskCreated { path } => format!("Disk created at {}", path.display()),
            JobResult::VmLaunched { script, pid } => {
                format!("VM launched from {} (pid {})", script.display(), pid)
            }
            JobResult::ImagePulled { reference } => format!("Successfully pulled {}", reference),
            JobResult::ImageBuilt { tag, image_id } => match image_id {
                Some(id) => format!("Built image {} ({})", tag, id),
                None => format!("Built image {}", tag),
            },
            JobResult::ImageRemoved { reference } => format!("Removed image {}", reference),
            JobResult::ContainerCreated { id } => {
                format!("Container started: {}", short_id(id))
            }
            JobResult::ContainerStarted { id } => format!("Started container {}", short_id(id)),
            JobResult::ContainerStopped { id } => format!("Stopped container {}", short_id(id)),
            JobResult::ContainerRemoved { id } => format!("Removed container {}", short_id(id)),
            JobResult::Logs { text } => {
                if text.is_empty() {
                    "No logs available".to_string()
                } else {
                    format!("Fetched {} log lines", text.lines().count())
                }
            }
        }
    }
}

pub fn short_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(12)
        .map(|(idx, _)| idx)
        .unwrap_or(id.len());
    &id[..end]
}

/// One tracked external operation. Snapshots handed out by the registry are
/// plain clones; the registry owns the live record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub target: String,
    pub params: JobParams,
    pub state: JobState,
    pub progress: Vec<String>,
    pub percent: Option<u8>,
    pub result: Option<JobResult>,
    pub error: Option<JobError>,
    /// Human-readable message, always set once terminal
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(params: JobParams) -> Self {
        let key = params.exclusion_key();
        Self {
            id: Uuid::new_v4(),
            kind: params.kind(),
            target: key.target,
            params,
            state: JobState::Pending,
            progress: Vec::new(),
            percent: None,
            result: None,
            error: None,
            message: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn exclusion_key(&self) -> ExclusionKey {
        self.params.exclusion_key()
    }

    pub fn exclusion_keys(&self) -> Vec<ExclusionKey> {
        self.params.exclusion_keys()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Owner side of a cooperative cancellation signal.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

/// Worker side of a cooperative cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelToken(watch::Receiver<bool>);

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelToken(rx))
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

impl CancelToken {
    /// A token that never fires.
    pub fn never() -> Self {
        let (_handle, token) = cancel_pair();
        token
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
