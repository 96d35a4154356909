//! Resource Lifecycle Orchestrator
//!
//! Every request goes through the same steps: validate synchronously, register
//! a job (failing fast on an in-flight conflict), hand the work to a Tokio task,
//! and return the job id without waiting. Validation failures never create a
//! job; every later failure lands in the job's terminal error.

use crate::adapter::{
    ContainerInfo, DockerApi, Hypervisor, ImageInfo, ProgressEvent, RunSpec, SearchHit,
    ToolStatus, VmLaunch, tail_lines,
};
use crate::config::{BerthConfig, LogsConfig};
use crate::error::JobError;
use crate::job::{
    CancelToken, ExclusionKey, Job, JobId, JobKind, JobParams, JobResult, JobState, KindClass,
    disk_key,
};
use crate::registry::JobRegistry;
use crate::request::{BuildForm, DiskForm, RunForm, VmForm, validate_name, validate_reference};
use crate::search::{SearchDebouncer, VisibleResults};
use crate::workspace::{DiskInfo, VmDefinition, Workspace};
use crate::{BerthError, Result, log_debug, log_error, log_warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Engine and toolchain availability.
#[derive(Debug)]
pub struct HealthReport {
    pub docker: Result<String>,
    pub tools: Vec<ToolStatus>,
}

impl HealthReport {
    /// Names of the external tools that could not be located.
    pub fn missing_tools(&self) -> Vec<&str> {
        self.tools
            .iter()
            .filter(|tool| !tool.available())
            .map(|tool| tool.name.as_str())
            .collect()
    }
}

pub struct Orchestrator {
    registry: Arc<JobRegistry>,
    docker: Arc<dyn DockerApi>,
    hypervisor: Arc<dyn Hypervisor>,
    workspace: Workspace,
    search: SearchDebouncer,
    search_limit: u64,
    logs: LogsConfig,
    runtime: Handle,
}

impl Orchestrator {
    /// Must be called from within a Tokio runtime; jobs run on it.
    pub fn new(
        config: &BerthConfig,
        docker: Arc<dyn DockerApi>,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| BerthError::Config(format!("no async runtime available: {}", e)))?;
        Ok(Self {
            registry: Arc::new(JobRegistry::new()),
            docker,
            hypervisor,
            workspace: Workspace::new(config.workspace.resolve_directory()),
            search: SearchDebouncer::new(config.search.min_chars),
            search_limit: config.search.limit,
            logs: config.logs.clone(),
            runtime,
        })
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn job(&self, id: JobId) -> Result<Job> {
        self.registry.get(id)
    }

    pub fn jobs(&self, kind: Option<JobKind>, state: Option<JobState>) -> Vec<Job> {
        self.registry.list(kind, state)
    }

    pub fn cancel(&self, id: JobId) -> Result<()> {
        self.registry.cancel(id)
    }

    // Virtual machines and disks

    pub fn create_disk(&self, form: &DiskForm) -> Result<JobId> {
        let params = form.validate(&self.workspace)?;
        self.dispatch(params)
    }

    pub fn launch_vm(&self, form: &VmForm) -> Result<JobId> {
        let params = form.validate(&self.workspace)?;
        self.dispatch(params)
    }

    /// Re-run the launcher of an existing VM.
    pub fn start_vm(&self, name: &str) -> Result<JobId> {
        let name = validate_name("VM name", name)?;
        let vm = self.workspace.find_vm(&name)?;
        self.dispatch(JobParams::StartVm {
            name: vm.name,
            script_path: vm.script,
        })
    }

    pub fn available_disks(&self) -> Result<Vec<DiskInfo>> {
        self.workspace.list_disks()
    }

    pub fn vms(&self) -> Result<Vec<VmDefinition>> {
        self.workspace.list_vms()
    }

    /// Delete a disk by workspace file name or absolute path. Refused while a
    /// job is creating it or launching a VM from it.
    pub fn delete_disk(&self, disk: &str) -> Result<PathBuf> {
        let path = self.workspace.resolve_disk(disk.trim());
        self.ensure_idle(disk_key(&path))?;
        self.workspace.delete_disk(&path)?;
        Ok(path)
    }

    pub fn delete_vm(&self, name: &str) -> Result<()> {
        let name = validate_name("VM name", name)?;
        self.ensure_idle(ExclusionKey::new(KindClass::Vm, name.as_str()))?;
        self.workspace.delete_vm(&name)
    }

    // Images

    pub fn pull_image(&self, reference: &str) -> Result<JobId> {
        let reference = validate_reference(reference)?;
        self.dispatch(JobParams::PullImage { reference })
    }

    pub fn build_image(&self, form: &BuildForm) -> Result<JobId> {
        let params = form.validate()?;
        self.dispatch(params)
    }

    pub fn remove_image(&self, reference: &str, force: bool) -> Result<JobId> {
        let reference = validate_reference(reference)?;
        self.dispatch(JobParams::RemoveImage { reference, force })
    }

    pub fn write_dockerfile(&self, directory: &Path, contents: &str) -> Result<PathBuf> {
        if contents.trim().is_empty() {
            return Err(BerthError::validation("Dockerfile content is empty"));
        }
        self.workspace.write_dockerfile(directory, contents)
    }

    /// Listings are re-queried on every call.
    pub async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        self.docker.list_images().await
    }

    /// Search for `term` on behalf of input `field`. `Ok(None)` means no search
    /// was made or a newer one superseded this result.
    pub async fn search_images(&self, field: &str, term: &str) -> Result<Option<Vec<SearchHit>>> {
        let Some(ticket) = self.search.issue(field, term) else {
            return Ok(None);
        };
        match self.docker.search_images(&ticket.term, self.search_limit).await {
            Ok(hits) => {
                if self.search.complete(&ticket, hits.clone()) {
                    Ok(Some(hits))
                } else {
                    log_debug!("Dropping stale search result for '{}'", ticket.term);
                    Ok(None)
                }
            }
            Err(err) if !self.search.is_current(&ticket) => {
                log_debug!("Ignoring error from stale search '{}': {}", ticket.term, err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub fn visible_search(&self, field: &str) -> Option<VisibleResults> {
        self.search.visible(field)
    }

    // Containers

    pub fn run_container(&self, form: &RunForm) -> Result<JobId> {
        let params = form.validate()?;
        self.dispatch(params)
    }

    pub fn start_container(&self, id: &str) -> Result<JobId> {
        let id = validate_reference(id)?;
        self.dispatch(JobParams::StartContainer { id })
    }

    pub fn stop_container(&self, id: &str) -> Result<JobId> {
        let id = validate_reference(id)?;
        self.dispatch(JobParams::StopContainer { id })
    }

    pub fn remove_container(&self, id: &str, force: bool) -> Result<JobId> {
        let id = validate_reference(id)?;
        self.dispatch(JobParams::RemoveContainer { id, force })
    }

    /// Fetch the last `tail` log lines (configured default when `None`).
    pub fn fetch_logs(&self, id: &str, tail: Option<usize>) -> Result<JobId> {
        let id = validate_reference(id)?;
        let tail = tail.unwrap_or(self.logs.default_tail);
        if tail == 0 || tail > self.logs.max_tail {
            return Err(BerthError::validation(format!(
                "Log tail must be between 1 and {}",
                self.logs.max_tail
            )));
        }
        self.dispatch(JobParams::FetchLogs { id, tail })
    }

    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>> {
        self.docker.list_containers(all).await
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            docker: self.docker.health_check().await,
            tools: self.hypervisor.tool_status(),
        }
    }

    fn ensure_idle(&self, key: ExclusionKey) -> Result<()> {
        match self.registry.active_job(&key) {
            Some(job) => {
                log_warn!("Refusing to act on '{}': job {} in flight", key.target, job);
                Err(BerthError::Conflict {
                    class: key.class.to_string(),
                    target: key.target,
                })
            }
            None => Ok(()),
        }
    }

    fn dispatch(&self, params: JobParams) -> Result<JobId> {
        let submission = self.registry.submit(params.clone())?;
        let worker = Worker {
            registry: self.registry.clone(),
            docker: self.docker.clone(),
            hypervisor: self.hypervisor.clone(),
            workspace: self.workspace.clone(),
        };
        self.runtime
            .spawn(worker.run(submission.id, params, submission.token));
        Ok(submission.id)
    }
}

/// Drives one job to a terminal state.
struct Worker {
    registry: Arc<JobRegistry>,
    docker: Arc<dyn DockerApi>,
    hypervisor: Arc<dyn Hypervisor>,
    workspace: Workspace,
}

impl Worker {
    async fn run(self, id: JobId, params: JobParams, token: CancelToken) {
        if token.is_cancelled() || self.registry.start(id).is_err() {
            // Cancelled while still pending.
            log_debug!("Job {} not started", id);
            return;
        }

        let outcome = self.execute(id, params, &token).await;

        if token.is_cancelled() {
            log_debug!("Job {} was cancelled; discarding outcome", id);
            return;
        }
        let recorded = match outcome {
            Ok(result) => self.registry.complete(id, result),
            Err(err) => self.registry.fail(id, JobError::from(&err)),
        };
        if let Err(err) = recorded {
            if !token.is_cancelled() {
                log_error!("Could not record outcome of job {}: {}", id, err);
            }
        }
    }

    async fn execute(
        &self,
        id: JobId,
        params: JobParams,
        token: &CancelToken,
    ) -> Result<JobResult> {
        let registry = self.registry.clone();
        let progress = move |event: ProgressEvent| {
            if let Some(line) = event.line {
                let _ = registry.update_progress(id, line);
            }
            if let Some(percent) = event.percent {
                let _ = registry.set_percent(id, percent);
            }
        };

        match params {
            JobParams::CreateDisk {
                path,
                format,
                size_gb,
            } => {
                self.hypervisor
                    .create_disk(&path, format, size_gb, token)
                    .await?;
                Ok(JobResult::DiskCreated { path })
            }
            JobParams::LaunchVm {
                name,
                disk_path,
                iso_path,
                memory_mb,
                cpu_cores,
            } => {
                // The disk may have gone away since validation.
                if !disk_path.is_file() {
                    return Err(BerthError::NotFound(format!("disk {}", disk_path.display())));
                }
                let spec = VmLaunch {
                    script_path: self.workspace.launcher_path(&name),
                    name,
                    disk_path,
                    iso_path,
                    memory_mb,
                    cpu_cores,
                };
                let pid = self.hypervisor.launch_vm(&spec).await?;
                Ok(JobResult::VmLaunched {
                    script: spec.script_path,
                    pid,
                })
            }
            JobParams::StartVm { script_path, .. } => {
                let pid = self.hypervisor.start_vm(&script_path).await?;
                Ok(JobResult::VmLaunched {
                    script: script_path,
                    pid,
                })
            }
            JobParams::PullImage { reference } => {
                progress(ProgressEvent::line(format!("Pulling {} ...", reference)));
                self.docker.pull_image(&reference, &progress, token).await?;
                Ok(JobResult::ImagePulled { reference })
            }
            JobParams::BuildImage { context, tag } => {
                let image_id = self
                    .docker
                    .build_image(&context, &tag, &progress, token)
                    .await?;
                Ok(JobResult::ImageBuilt { tag, image_id })
            }
            JobParams::RemoveImage { reference, force } => {
                self.docker.remove_image(&reference, force).await?;
                Ok(JobResult::ImageRemoved { reference })
            }
            JobParams::RunContainer {
                image,
                name,
                ports,
                command,
            } => {
                let spec = RunSpec {
                    image,
                    name,
                    ports,
                    command,
                };
                let id = self.docker.run_container(&spec).await?;
                Ok(JobResult::ContainerCreated { id })
            }
            JobParams::StartContainer { id } => {
                self.docker.start_container(&id).await?;
                Ok(JobResult::ContainerStarted { id })
            }
            JobParams::StopContainer { id } => {
                self.docker.stop_container(&id).await?;
                Ok(JobResult::ContainerStopped { id })
            }
            JobParams::RemoveContainer { id, force } => {
                self.docker.remove_container(&id, force).await?;
                Ok(JobResult::ContainerRemoved { id })
            }
            JobParams::FetchLogs { id, tail } => {
                let text = self.docker.fetch_logs(&id, tail).await?;
                Ok(JobResult::Logs {
                    text: tail_lines(&text, tail),
                })
            }
        }
    }
}
