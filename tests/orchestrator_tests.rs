use async_trait::async_trait;
use berth::adapter::{
    ContainerInfo, DockerApi, Hypervisor, ImageInfo, ProgressEvent, ProgressFn, RunSpec,
    SearchHit, ToolStatus, VmLaunch,
};
use berth::config::BerthConfig;
use berth::job::CancelToken;
use berth::request::{BuildForm, DiskForm, RunForm, VmForm};
use berth::workspace::DiskFormat;
use berth::{
    BerthError, ErrorKind, Job, JobFeed, JobId, JobResult, JobState, Orchestrator, Result,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

/// Blocks a fake call until released or cancelled.
#[derive(Default)]
struct Gate {
    closed: AtomicBool,
    notify: Notify,
}

impl Gate {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn pass(&self, cancel: &CancelToken) -> Result<()> {
        let mut cancel = cancel.clone();
        while self.closed.load(Ordering::SeqCst) {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => {
                    return Err(BerthError::Unknown("interrupted".to_string()));
                }
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeDocker {
    pull_gate: Gate,
    search_gate: Gate,
    pulls: AtomicUsize,
    searches: AtomicUsize,
}

#[async_trait]
impl DockerApi for FakeDocker {
    async fn health_check(&self) -> Result<String> {
        Ok("27.0.0".to_string())
    }

    async fn pull_image(
        &self,
        reference: &str,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        progress(ProgressEvent {
            line: Some(format!("{}: Downloading", reference)),
            percent: Some(50),
        });
        self.pull_gate.pass(cancel).await
    }

    async fn build_image(
        &self,
        context: &Path,
        _tag: &str,
        progress: ProgressFn<'_>,
        _cancel: &CancelToken,
    ) -> Result<Option<String>> {
        let dockerfile = std::fs::read_to_string(context.join("Dockerfile"))?;
        progress(ProgressEvent::line("Step 1/1 : FROM alpine"));
        if dockerfile.contains("RUN false") {
            return Err(BerthError::Failed(
                "The command '/bin/sh -c false' returned a non-zero code: 1".to_string(),
            ));
        }
        Ok(Some("sha256:feedface".to_string()))
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        Ok(Vec::new())
    }

    async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerInfo>> {
        Ok(Vec::new())
    }

    async fn run_container(&self, spec: &RunSpec) -> Result<String> {
        Ok(format!("{}-0123456789abcdef", spec.image))
    }

    async fn start_container(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        Err(BerthError::NotFound(format!("container {}", id)))
    }

    async fn remove_container(&self, _id: &str, _force: bool) -> Result<()> {
        Ok(())
    }

    async fn remove_image(&self, _reference: &str, _force: bool) -> Result<()> {
        Ok(())
    }

    async fn fetch_logs(&self, _id: &str, _tail: usize) -> Result<String> {
        // Ignores `tail` so trimming happens in the orchestrator.
        Ok((1..=500).map(|i| format!("line {}\n", i)).collect())
    }

    async fn search_images(&self, term: &str, _limit: u64) -> Result<Vec<SearchHit>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if term == "postgres" {
            self.search_gate.pass(&CancelToken::never()).await?;
        }
        Ok(vec![SearchHit {
            name: term.to_string(),
            description: String::new(),
            stars: 1,
            official: true,
        }])
    }
}

#[derive(Default)]
struct FakeHypervisor {
    disk_gate: Gate,
    launch_gate: Gate,
    disks_created: AtomicUsize,
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn create_disk(
        &self,
        path: &Path,
        _format: DiskFormat,
        _size_gb: u32,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.disks_created.fetch_add(1, Ordering::SeqCst);
        self.disk_gate.pass(cancel).await?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, b"")?;
        Ok(())
    }

    async fn launch_vm(&self, spec: &VmLaunch) -> Result<u32> {
        self.launch_gate.pass(&CancelToken::never()).await?;
        std::fs::write(&spec.script_path, format!("# {}\n", spec.name))?;
        Ok(4242)
    }

    async fn start_vm(&self, _script: &Path) -> Result<u32> {
        Ok(4243)
    }

    fn tool_status(&self) -> Vec<ToolStatus> {
        vec![
            ToolStatus {
                name: "qemu-img".to_string(),
                path: Some("/usr/bin/qemu-img".into()),
            },
            ToolStatus {
                name: "qemu-system-x86_64".to_string(),
                path: None,
            },
        ]
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    docker: Arc<FakeDocker>,
    hypervisor: Arc<FakeHypervisor>,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = BerthConfig::default();
    config.workspace.directory = Some(dir.path().join("disks"));

    let docker = Arc::new(FakeDocker::default());
    let hypervisor = Arc::new(FakeHypervisor::default());
    let orchestrator = Orchestrator::new(&config, docker.clone(), hypervisor.clone()).unwrap();
    Harness {
        orchestrator: Arc::new(orchestrator),
        docker,
        hypervisor,
        _dir: dir,
    }
}

async fn wait(orchestrator: &Orchestrator, id: JobId) -> Job {
    let mut feed = JobFeed::new(orchestrator.registry().clone());
    tokio::time::timeout(Duration::from_secs(5), feed.wait_for(id, |_| {}))
        .await
        .expect("job did not finish in time")
        .unwrap()
}

async fn until(check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

fn disk_form(name: &str, size: &str, format: &str) -> DiskForm {
    DiskForm {
        name: name.to_string(),
        size_gb: size.to_string(),
        format: format.to_string(),
    }
}

#[tokio::test]
async fn create_disk_runs_to_success() {
    let h = harness();
    let id = h
        .orchestrator
        .create_disk(&disk_form("vm_disk", "10", "qcow2"))
        .unwrap();

    let job = wait(&h.orchestrator, id).await;
    assert_eq!(job.state, JobState::Succeeded);
    assert!(job.started_at.is_some());
    match &job.result {
        Some(JobResult::DiskCreated { path }) => {
            assert!(path.ends_with("vm_disk.qcow2"));
            assert!(path.is_file());
        }
        other => panic!("unexpected result {:?}", other),
    }

    // Terminal snapshots are stable.
    let again = h.orchestrator.job(id).unwrap();
    assert_eq!(again.state, job.state);
    assert_eq!(again.finished_at, job.finished_at);
    assert_eq!(again.message, job.message);
}

#[tokio::test]
async fn invalid_disk_requests_never_create_jobs() {
    let h = harness();
    for (size, format) in [("0", "qcow2"), ("-1", "qcow2"), ("ten", "qcow2"), ("10", "iso")] {
        let err = h
            .orchestrator
            .create_disk(&disk_form("vm_disk", size, format))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{} {}", size, format);
    }

    assert!(h.orchestrator.jobs(None, None).is_empty());
    assert_eq!(h.hypervisor.disks_created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn second_pull_of_same_image_conflicts_until_first_finishes() {
    let h = harness();
    h.docker.pull_gate.close();

    let first = h.orchestrator.pull_image("nginx:latest").unwrap();
    let err = h.orchestrator.pull_image("nginx:latest").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // Different targets are independent.
    let other = h.orchestrator.pull_image("redis:7").unwrap();

    h.docker.pull_gate.open();
    assert_eq!(wait(&h.orchestrator, first).await.state, JobState::Succeeded);
    assert_eq!(wait(&h.orchestrator, other).await.state, JobState::Succeeded);

    let third = h.orchestrator.pull_image("nginx:latest").unwrap();
    let job = wait(&h.orchestrator, third).await;
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.percent, Some(50));
    assert_eq!(
        job.progress.last().map(String::as_str),
        Some("nginx:latest: Downloading")
    );
}

#[tokio::test]
async fn cancelled_pull_releases_its_target() {
    let h = harness();
    h.docker.pull_gate.close();

    let id = h.orchestrator.pull_image("alpine").unwrap();
    let docker = h.docker.clone();
    until(|| docker.pulls.load(Ordering::SeqCst) == 1).await;

    h.orchestrator.cancel(id).unwrap();
    let job = wait(&h.orchestrator, id).await;
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(job.error.map(|e| e.kind), Some(ErrorKind::Cancelled));

    // A late worker outcome must not overwrite the cancellation.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.orchestrator.job(id).unwrap().state, JobState::Cancelled);

    h.docker.pull_gate.open();
    let retry = h.orchestrator.pull_image("alpine").unwrap();
    assert_eq!(wait(&h.orchestrator, retry).await.state, JobState::Succeeded);
}

#[tokio::test]
async fn created_disk_is_listed_and_boots_a_vm() {
    let h = harness();
    let id = h
        .orchestrator
        .create_disk(&disk_form("vm_disk", "20", "qcow2"))
        .unwrap();
    wait(&h.orchestrator, id).await;

    let disks = h.orchestrator.available_disks().unwrap();
    assert_eq!(disks.len(), 1);
    assert_eq!(disks[0].name, "vm_disk");
    assert_eq!(disks[0].format, DiskFormat::Qcow2);

    let launch = h
        .orchestrator
        .launch_vm(&VmForm {
            name: "dev".to_string(),
            disk: "vm_disk.qcow2".to_string(),
            iso: String::new(),
            memory_mb: "2048".to_string(),
            cpu_cores: "2".to_string(),
        })
        .unwrap();
    let job = wait(&h.orchestrator, launch).await;
    assert_eq!(job.state, JobState::Succeeded);
    assert!(matches!(job.result, Some(JobResult::VmLaunched { pid: 4242, .. })));

    let vms = h.orchestrator.vms().unwrap();
    assert_eq!(vms.len(), 1);
    assert_eq!(vms[0].name, "dev");

    let restart = h.orchestrator.start_vm("dev").unwrap();
    assert_eq!(wait(&h.orchestrator, restart).await.state, JobState::Succeeded);
}

#[tokio::test]
async fn launching_on_a_missing_disk_is_not_found() {
    let h = harness();
    let err = h
        .orchestrator
        .launch_vm(&VmForm {
            name: "dev".to_string(),
            disk: "missing.qcow2".to_string(),
            iso: String::new(),
            memory_mb: "1024".to_string(),
            cpu_cores: "1".to_string(),
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(h.orchestrator.jobs(None, None).is_empty());
}

#[tokio::test]
async fn disk_cannot_be_deleted_while_being_created() {
    let h = harness();
    h.hypervisor.disk_gate.close();

    let id = h
        .orchestrator
        .create_disk(&disk_form("scratch", "1", "raw"))
        .unwrap();
    let err = h.orchestrator.delete_disk("scratch.raw").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    h.hypervisor.disk_gate.open();
    wait(&h.orchestrator, id).await;

    let path = h.orchestrator.delete_disk("scratch.raw").unwrap();
    assert!(!path.exists());
    assert!(h.orchestrator.available_disks().unwrap().is_empty());
}

#[tokio::test]
async fn disk_cannot_be_deleted_while_a_vm_launches_from_it() {
    let h = harness();
    let id = h
        .orchestrator
        .create_disk(&disk_form("vm_disk", "10", "qcow2"))
        .unwrap();
    wait(&h.orchestrator, id).await;

    h.hypervisor.launch_gate.close();
    let launch = h
        .orchestrator
        .launch_vm(&VmForm {
            name: "dev".to_string(),
            disk: "vm_disk.qcow2".to_string(),
            iso: String::new(),
            memory_mb: "1024".to_string(),
            cpu_cores: "1".to_string(),
        })
        .unwrap();
    let err = h.orchestrator.delete_disk("vm_disk.qcow2").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    h.hypervisor.launch_gate.open();
    assert_eq!(wait(&h.orchestrator, launch).await.state, JobState::Succeeded);

    let path = h.orchestrator.delete_disk("vm_disk.qcow2").unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn logs_are_trimmed_to_the_default_tail() {
    let h = harness();
    let id = h.orchestrator.fetch_logs("web", None).unwrap();
    let job = wait(&h.orchestrator, id).await;

    let Some(JobResult::Logs { text }) = job.result else {
        panic!("expected logs");
    };
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 100);
    assert_eq!(lines.first(), Some(&"line 401"));
    assert_eq!(lines.last(), Some(&"line 500"));
}

#[tokio::test]
async fn log_tail_out_of_range_is_rejected() {
    let h = harness();
    let err = h.orchestrator.fetch_logs("web", Some(0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn adapter_failures_land_in_the_job() {
    let h = harness();
    let id = h.orchestrator.stop_container("ghost").unwrap();
    let job = wait(&h.orchestrator, id).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error.map(|e| e.kind), Some(ErrorKind::NotFound));
    assert!(job.message.is_some());
}

#[tokio::test]
async fn run_container_validates_port_mapping() {
    let h = harness();
    let err = h
        .orchestrator
        .run_container(&RunForm {
            image: "nginx".to_string(),
            ports: "80".to_string(),
            ..RunForm::default()
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let id = h
        .orchestrator
        .run_container(&RunForm {
            image: "nginx".to_string(),
            name: "web".to_string(),
            ports: "8080:80".to_string(),
            ..RunForm::default()
        })
        .unwrap();
    let job = wait(&h.orchestrator, id).await;
    assert!(matches!(job.result, Some(JobResult::ContainerCreated { .. })));
}

#[tokio::test]
async fn short_search_terms_are_not_sent() {
    let h = harness();
    assert!(h.orchestrator.search_images("image", "ng").await.unwrap().is_none());
    assert_eq!(h.docker.searches.load(Ordering::SeqCst), 0);

    let hits = h.orchestrator.search_images("image", "nginx").await.unwrap();
    assert_eq!(hits.map(|h| h.len()), Some(1));
}

#[tokio::test]
async fn stale_search_results_are_dropped() {
    let h = harness();
    h.docker.search_gate.close();

    let slow = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.search_images("image", "postgres").await })
    };
    let docker = h.docker.clone();
    until(|| docker.searches.load(Ordering::SeqCst) == 1).await;

    let fresh = h.orchestrator.search_images("image", "redis").await.unwrap();
    assert_eq!(fresh.unwrap()[0].name, "redis");

    h.docker.search_gate.open();
    assert!(slow.await.unwrap().unwrap().is_none());

    let visible = h.orchestrator.visible_search("image").unwrap();
    assert_eq!(visible.term, "redis");
}

#[tokio::test]
async fn dockerfile_is_written_into_context() {
    let h = harness();
    let context = TempDir::new().unwrap();
    let path = h
        .orchestrator
        .write_dockerfile(context.path(), "FROM alpine\n")
        .unwrap();
    assert_eq!(std::fs::read_to_string(path).unwrap(), "FROM alpine\n");

    let err = h
        .orchestrator
        .write_dockerfile(context.path(), "   ")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

fn build_context(dockerfile: &str) -> TempDir {
    let context = TempDir::new().unwrap();
    std::fs::write(context.path().join("Dockerfile"), dockerfile).unwrap();
    context
}

#[tokio::test]
async fn build_records_image_id_and_steps() {
    let h = harness();
    let context = build_context("FROM alpine\n");
    let id = h
        .orchestrator
        .build_image(&BuildForm {
            context: context.path().display().to_string(),
            tag: "app:dev".to_string(),
        })
        .unwrap();

    let job = wait(&h.orchestrator, id).await;
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.target, "app:dev");
    assert_eq!(
        job.progress.first().map(String::as_str),
        Some("Step 1/1 : FROM alpine")
    );
    match job.result {
        Some(JobResult::ImageBuilt { tag, image_id }) => {
            assert_eq!(tag, "app:dev");
            assert_eq!(image_id.as_deref(), Some("sha256:feedface"));
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[tokio::test]
async fn failing_build_step_fails_the_job() {
    let h = harness();
    let context = build_context("FROM alpine\nRUN false\n");
    let id = h
        .orchestrator
        .build_image(&BuildForm {
            context: context.path().display().to_string(),
            tag: "app:broken".to_string(),
        })
        .unwrap();

    let job = wait(&h.orchestrator, id).await;
    assert_eq!(job.state, JobState::Failed);
    assert!(job.result.is_none());
    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Failed);
    assert!(error.message.contains("non-zero code"));
}

#[tokio::test]
async fn build_without_tag_never_creates_a_job() {
    let h = harness();
    let context = build_context("FROM alpine\n");
    let err = h
        .orchestrator
        .build_image(&BuildForm {
            context: context.path().display().to_string(),
            tag: " ".to_string(),
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(h.orchestrator.jobs(None, None).is_empty());
}

#[tokio::test]
async fn health_lists_missing_tools() {
    let h = harness();
    let report = h.orchestrator.health().await;
    assert_eq!(report.docker.as_deref().unwrap(), "27.0.0");
    assert_eq!(report.missing_tools(), vec!["qemu-system-x86_64"]);
}
