//! Docker Engine API adapter.
//!
//! [`DockerConnector`] owns the client handle: it connects lazily, can be told
//! to reconnect, and drops its handle when a call reports the daemon
//! unreachable so the next call dials again.

use super::{ContainerInfo, ContainerStatus, DockerApi, ImageInfo, ProgressEvent, ProgressFn};
use super::{RunSpec, SearchHit};
use crate::config::DockerConfig;
use crate::job::CancelToken;
use crate::request::split_reference;
use crate::{BerthError, Result, log_debug, log_info, log_warn};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{
    BuildImageOptions, CreateImageOptions, ListImagesOptions, RemoveImageOptions,
    SearchImagesOptions,
};
use bollard::models::{BuildInfo, CreateImageInfo, HostConfig, PortBinding};
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// What the failing call was doing; decides how a 409 reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Create,
    Remove,
    Build,
    Other,
}

fn classify(err: DockerError, op: Op) -> BerthError {
    match err {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => BerthError::NotFound(message),
            401 | 403 => BerthError::Unauthorized(message),
            409 if op == Op::Remove => BerthError::InUse(message),
            409 => BerthError::Conflict {
                class: "docker".to_string(),
                target: message,
            },
            _ => BerthError::Unknown(message),
        },
        DockerError::DockerStreamError { error } => classify_message(error, op),
        DockerError::IOError { .. }
        | DockerError::HyperResponseError { .. }
        | DockerError::RequestTimeoutError => BerthError::ConnectionFailed(err.to_string()),
        other => BerthError::Unknown(other.to_string()),
    }
}

/// Streamed errors arrive as plain text.
fn classify_message(message: String, op: Op) -> BerthError {
    let lower = message.to_lowercase();
    if lower.contains("not found") || lower.contains("does not exist") {
        BerthError::NotFound(message)
    } else if lower.contains("unauthorized") || lower.contains("authentication required") {
        BerthError::Unauthorized(message)
    } else if op == Op::Build {
        BerthError::Failed(message)
    } else {
        BerthError::Unknown(message)
    }
}

/// Folds the per-chunk pull stream into readable progress: a line only when a
/// layer changes phase, and a percent over the bytes downloaded so far.
#[derive(Debug, Default)]
struct PullProgress {
    phases: HashMap<String, String>,
    downloads: HashMap<String, (i64, i64)>,
    percent: Option<u8>,
}

impl PullProgress {
    fn observe(&mut self, info: &CreateImageInfo) -> Option<ProgressEvent> {
        let mut event = ProgressEvent::default();
        let status = info.status.as_deref().unwrap_or_default();

        match &info.id {
            Some(id) => {
                if !status.is_empty() && self.phases.get(id).map(String::as_str) != Some(status) {
                    self.phases.insert(id.clone(), status.to_string());
                    event.line = Some(format!("{}: {}", id, status));
                }
                if self.track_download(id, status, info) {
                    let (done, total) = self
                        .downloads
                        .values()
                        .fold((0i64, 0i64), |(d, t), (c, n)| (d + c, t + n));
                    let percent = ((done * 100) / total.max(1)).clamp(0, 100) as u8;
                    if self.percent != Some(percent) {
                        self.percent = Some(percent);
                        event.percent = Some(percent);
                    }
                }
            }
            None if !status.is_empty() => event.line = Some(status.to_string()),
            None => {}
        }

        (event.line.is_some() || event.percent.is_some()).then_some(event)
    }

    /// Record byte counts from the download phase only; extraction reports
    /// its own counts, which would otherwise pull the percentage back down.
    fn track_download(&mut self, id: &str, status: &str, info: &CreateImageInfo) -> bool {
        match status {
            "Downloading" => {
                let Some(detail) = &info.progress_detail else {
                    return false;
                };
                match (detail.current, detail.total) {
                    (Some(current), Some(total)) if total > 0 => {
                        self.downloads.insert(id.to_string(), (current.min(total), total));
                        true
                    }
                    _ => false,
                }
            }
            "Download complete" => match self.downloads.get_mut(id) {
                Some((current, total)) => {
                    *current = *total;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }
}

pub struct DockerConnector {
    config: DockerConfig,
    client: Mutex<Option<Docker>>,
}

impl DockerConnector {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
        }
    }

    fn connect(&self) -> Result<Docker> {
        let connected = match &self.config.host {
            Some(host) => Docker::connect_with_socket(
                host,
                self.config.timeout_secs,
                bollard::API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_local_defaults()
                .map(|docker| docker.with_timeout(Duration::from_secs(self.config.timeout_secs))),
        };
        connected.map_err(|e| BerthError::ConnectionFailed(e.to_string()))
    }

    /// The shared client, connecting on first use.
    pub fn client(&self) -> Result<Docker> {
        let mut slot = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(docker) = slot.as_ref() {
            return Ok(docker.clone());
        }
        let docker = self.connect()?;
        log_debug!("Connected to Docker daemon");
        *slot = Some(docker.clone());
        Ok(docker)
    }

    /// Drop the current handle and dial again.
    pub fn reconnect(&self) -> Result<Docker> {
        self.invalidate();
        self.client()
    }

    /// Ping the engine and report its version.
    pub async fn health_check(&self) -> Result<String> {
        let docker = self.client()?;
        self.observe(docker.ping().await, Op::Other)?;
        let version = self.observe(docker.version().await, Op::Other)?;
        Ok(version.version.unwrap_or_else(|| "unknown".to_string()))
    }

    fn invalidate(&self) {
        let mut slot = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }

    /// Classify a call result, forgetting the handle on connection loss.
    fn observe<T>(&self, result: std::result::Result<T, DockerError>, op: Op) -> Result<T> {
        result.map_err(|err| {
            let err = classify(err, op);
            if matches!(err, BerthError::ConnectionFailed(_)) {
                log_warn!("Docker daemon unreachable: {}", err);
                self.invalidate();
            }
            err
        })
    }
}

pub struct DockerEngine {
    connector: DockerConnector,
}

impl DockerEngine {
    pub fn new(connector: DockerConnector) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> &DockerConnector {
        &self.connector
    }

    async fn create_and_start(&self, docker: &Docker, spec: &RunSpec) -> Result<String> {
        let mut config = Config::<String> {
            image: Some(spec.image.clone()),
            cmd: spec
                .command
                .as_ref()
                .map(|c| c.split_whitespace().map(str::to_string).collect()),
            ..Default::default()
        };

        if let Some(ports) = spec.ports {
            let key = format!("{}/tcp", ports.container);
            config.exposed_ports = Some(HashMap::from([(key.clone(), HashMap::new())]));
            config.host_config = Some(HostConfig {
                port_bindings: Some(HashMap::from([(
                    key,
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(ports.host.to_string()),
                    }]),
                )])),
                ..Default::default()
            });
        }

        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let created = self
            .connector
            .observe(docker.create_container(options, config).await, Op::Create)?;
        for warning in &created.warnings {
            log_warn!("Docker: {}", warning);
        }

        self.connector.observe(
            docker
                .start_container(&created.id, None::<StartContainerOptions<String>>)
                .await,
            Op::Other,
        )?;
        Ok(created.id)
    }
}

fn pack_context(context: &Path) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    archive.append_dir_all(".", context)?;
    archive.into_inner()
}

/// Relay one build stream message. An `error` field means the build itself
/// failed; an `aux` id names the resulting image.
fn apply_build_info(info: BuildInfo, progress: ProgressFn<'_>) -> Result<Option<String>> {
    if let Some(error) = info.error {
        return Err(BerthError::Failed(error));
    }
    if let Some(line) = info.stream {
        let line = line.trim_end();
        if !line.is_empty() {
            progress(ProgressEvent::line(line));
        }
    }
    Ok(info.aux.and_then(|aux| aux.id))
}

#[async_trait]
impl DockerApi for DockerEngine {
    async fn health_check(&self) -> Result<String> {
        self.connector.health_check().await
    }

    async fn pull_image(
        &self,
        reference: &str,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let docker = self.connector.client()?;
        let (repo, tag) = split_reference(reference);
        log_info!("Pulling Docker image: {}", reference);

        let options = CreateImageOptions {
            from_image: repo.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        let mut stream = docker.create_image(Some(options), None, None);
        let mut tracker = PullProgress::default();
        let mut cancel = cancel.clone();

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = cancel.cancelled() => {
                    return Err(BerthError::Failed(format!("pull of {} cancelled", reference)));
                }
            };
            let Some(item) = item else { break };
            let info = self.connector.observe(item, Op::Other)?;
            if let Some(event) = tracker.observe(&info) {
                progress(event);
            }
        }

        log_info!("Image pulled: {}", reference);
        Ok(())
    }

    async fn build_image(
        &self,
        context: &Path,
        tag: &str,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<Option<String>> {
        let docker = self.connector.client()?;
        let dir: PathBuf = context.to_path_buf();
        let archive = tokio::task::spawn_blocking(move || pack_context(&dir))
            .await
            .map_err(|e| BerthError::Unknown(e.to_string()))?
            .map_err(|e| BerthError::IoFailure(format!("cannot pack build context: {}", e)))?;

        log_info!("Building image {} from {}", tag, context.display());
        progress(ProgressEvent::line(format!(
            "Building image {} from {}...",
            tag,
            context.display()
        )));

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };
        let mut stream = docker.build_image(options, None, Some(archive.into()));
        let mut image_id = None;
        let mut cancel = cancel.clone();

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = cancel.cancelled() => {
                    return Err(BerthError::Failed(format!("build of {} cancelled", tag)));
                }
            };
            let Some(item) = item else { break };
            let info = self.connector.observe(item, Op::Build)?;
            if let Some(id) = apply_build_info(info, progress)? {
                image_id = Some(id);
            }
        }

        Ok(image_id)
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let docker = self.connector.client()?;
        let options = ListImagesOptions::<String> {
            all: false,
            ..Default::default()
        };
        let images = self
            .connector
            .observe(docker.list_images(Some(options)).await, Op::Other)?;

        Ok(images
            .into_iter()
            .map(|image| ImageInfo {
                id: image.id,
                tags: image.repo_tags,
                size: image.size.max(0) as u64,
                created: chrono::DateTime::from_timestamp(image.created, 0).unwrap_or_default(),
            })
            .collect())
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>> {
        let docker = self.connector.client()?;
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let containers = self
            .connector
            .observe(docker.list_containers(Some(options)).await, Op::Other)?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerInfo {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                status: ContainerStatus::parse(c.state.as_deref().unwrap_or_default()),
                status_text: c.status.unwrap_or_default(),
            })
            .collect())
    }

    async fn run_container(&self, spec: &RunSpec) -> Result<String> {
        let docker = self.connector.client()?;
        log_info!(
            "Starting container {} from image {}",
            spec.name.as_deref().unwrap_or("<unnamed>"),
            spec.image
        );

        match self.create_and_start(&docker, spec).await {
            // Same as `docker run`: fetch a missing image, then create.
            Err(BerthError::NotFound(msg)) if msg.to_lowercase().contains("no such image") => {
                log_info!("Image {} not present locally, pulling", spec.image);
                let quiet = |_: ProgressEvent| {};
                self.pull_image(&spec.image, &quiet, &CancelToken::never())
                    .await?;
                self.create_and_start(&docker, spec).await
            }
            other => other,
        }
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let docker = self.connector.client()?;
        log_info!("Starting container: {}", id);
        self.connector.observe(
            docker
                .start_container(id, None::<StartContainerOptions<String>>)
                .await,
            Op::Other,
        )
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let docker = self.connector.client()?;
        log_info!("Stopping container: {}", id);
        self.connector
            .observe(docker.stop_container(id, None).await, Op::Other)
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let docker = self.connector.client()?;
        log_info!("Removing container: {}", id);
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.connector
            .observe(docker.remove_container(id, Some(options)).await, Op::Remove)
    }

    async fn remove_image(&self, reference: &str, force: bool) -> Result<()> {
        let docker = self.connector.client()?;
        log_info!("Removing image: {}", reference);
        let options = RemoveImageOptions {
            force,
            ..Default::default()
        };
        let deleted = self.connector.observe(
            docker.remove_image(reference, Some(options), None).await,
            Op::Remove,
        )?;
        log_debug!("Removed {} image layers for {}", deleted.len(), reference);
        Ok(())
    }

    async fn fetch_logs(&self, id: &str, tail: usize) -> Result<String> {
        let docker = self.connector.client()?;
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = docker.logs(id, Some(options));
        let mut text = String::new();
        while let Some(item) = stream.next().await {
            let chunk = self.connector.observe(item, Op::Other)?;
            text.push_str(&chunk.to_string());
        }
        Ok(text)
    }

    async fn search_images(&self, term: &str, limit: u64) -> Result<Vec<SearchHit>> {
        let docker = self.connector.client()?;
        let options = SearchImagesOptions {
            term: term.to_string(),
            limit: Some(limit),
            ..Default::default()
        };
        let hits = self
            .connector
            .observe(docker.search_images(options).await, Op::Other)?;

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                Some(SearchHit {
                    name: hit.name?,
                    description: hit.description.unwrap_or_default(),
                    stars: hit.star_count.unwrap_or(0).max(0) as u64,
                    official: hit.is_official.unwrap_or(false),
                })
            })
            .collect())
    }
}
