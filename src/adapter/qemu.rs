use super::tools::{ToolLocator, ToolStatus};
use super::{Hypervisor, VmLaunch};
use crate::job::CancelToken;
use crate::workspace::DiskFormat;
use crate::{BerthError, Result, log_debug, log_error, log_info, log_warn};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// How a launcher script reaches the hypervisor binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LauncherTarget {
    /// Call the binary directly
    Direct(PathBuf),
    /// Run through the MSYS2 mingw64 shell, which puts QEMU on its PATH
    Msys { shell: PathBuf },
}

pub struct QemuToolchain {
    locator: ToolLocator,
}

impl QemuToolchain {
    pub fn new(locator: ToolLocator) -> Self {
        Self { locator }
    }

    fn launcher_target(&self) -> Result<LauncherTarget> {
        if cfg!(windows) {
            if let Some(shell) = self.locator.msys_shell() {
                return Ok(LauncherTarget::Msys { shell });
            }
        }
        self.locator
            .qemu_system()
            .map(LauncherTarget::Direct)
            .ok_or_else(|| BerthError::ToolMissing("qemu-system-x86_64".to_string()))
    }
}

/// Render the launcher script for `spec`: a `sh` script on unix, a batch
/// file on Windows.
pub fn render_launcher(target: &LauncherTarget, spec: &VmLaunch) -> Result<String> {
    if cfg!(windows) {
        render_batch(target, spec)
    } else {
        render_shell(target, spec)
    }
}

fn render_shell(target: &LauncherTarget, spec: &VmLaunch) -> Result<String> {
    let command = command_line(target, spec, shell_quote)?;
    Ok(format!("#!/bin/sh\n# VM {}\nexec {}\n", spec.name, command))
}

fn render_batch(target: &LauncherTarget, spec: &VmLaunch) -> Result<String> {
    let command = command_line(target, spec, batch_quote)?;
    Ok(format!("@echo off\r\nrem VM {}\r\nstart \"\" {}\r\n", spec.name, command))
}

/// The hypervisor command line, with every path passed through `quote`.
fn command_line(
    target: &LauncherTarget,
    spec: &VmLaunch,
    quote: fn(&str) -> Result<String>,
) -> Result<String> {
    let path = |p: &Path| quote(&p.to_string_lossy());
    let mut words = match target {
        LauncherTarget::Direct(qemu) => vec![path(qemu)?],
        LauncherTarget::Msys { shell } => {
            vec![path(shell)?, "qemu-system-x86_64".to_string()]
        }
    };
    words.push("-hda".to_string());
    words.push(path(&spec.disk_path)?);
    match &spec.iso_path {
        Some(iso) => {
            words.push("-cdrom".to_string());
            words.push(path(iso)?);
            words.push("-boot d".to_string());
        }
        None => words.push("-boot c".to_string()),
    }
    words.push(format!("-m {}", spec.memory_mb));
    words.push(format!("-smp {}", spec.cpu_cores));
    Ok(words.join(" "))
}

/// Single-quote for `sh`; nothing inside is expanded.
fn shell_quote(arg: &str) -> Result<String> {
    Ok(format!("'{}'", arg.replace('\'', r"'\''")))
}

/// Double-quote for `cmd`, which still expands `%` and `!` inside quotes and
/// has no escape for `"`, so paths carrying those are refused.
fn batch_quote(arg: &str) -> Result<String> {
    if let Some(c) = arg
        .chars()
        .find(|&c| matches!(c, '"' | '%' | '!' | '^' | '&' | '\r' | '\n'))
    {
        return Err(BerthError::validation(format!(
            "Path '{}' contains '{}', which a batch launcher cannot carry",
            arg,
            c.escape_default()
        )));
    }
    Ok(format!("\"{}\"", arg))
}

fn io_failure(context: &str, err: io::Error) -> BerthError {
    BerthError::IoFailure(format!("{}: {}", context, err))
}

/// Start `script` without waiting on it; the VM outlives this process. The
/// launcher is reaped in the background once it exits.
async fn spawn_detached(script: &Path) -> Result<u32> {
    let mut cmd = if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(script);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg(script);
        cmd
    };
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(windows)]
    {
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        cmd.creation_flags(DETACHED_PROCESS);
    }

    log_debug!("Launcher command: {:?}", cmd);
    let mut child = cmd
        .spawn()
        .map_err(|e| io_failure(&format!("failed to start {}", script.display()), e))?;
    let pid = child
        .id()
        .ok_or_else(|| BerthError::IoFailure(format!("{} exited at once", script.display())))?;

    let script = script.to_path_buf();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => log_debug!("Launcher {} exited with {}", script.display(), status),
            Err(err) => log_warn!("Could not reap launcher {}: {}", script.display(), err),
        }
    });
    Ok(pid)
}

#[async_trait]
impl Hypervisor for QemuToolchain {
    async fn create_disk(
        &self,
        path: &Path,
        format: DiskFormat,
        size_gb: u32,
        cancel: &CancelToken,
    ) -> Result<()> {
        let tool = self
            .locator
            .qemu_img()
            .ok_or_else(|| BerthError::ToolMissing("qemu-img".to_string()))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_failure(&format!("cannot create {}", parent.display()), e))?;
        }

        log_info!(
            "Creating disk {} (format={}, size={}G)",
            path.display(),
            format,
            size_gb
        );

        let child = Command::new(&tool)
            .arg("create")
            .arg("-f")
            .arg(format.as_str())
            .arg(path)
            .arg(format!("{}G", size_gb))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => BerthError::ToolMissing(tool.display().to_string()),
                _ => io_failure("failed to execute qemu-img", e),
            })?;

        let mut cancel = cancel.clone();
        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| io_failure("qemu-img did not finish", e))?
            }
            _ = cancel.cancelled() => {
                log_info!("Disk creation for {} cancelled", path.display());
                return Err(BerthError::Failed("disk creation cancelled".to_string()));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            log_error!("Failed to create disk {}: {}", path.display(), stderr);
            return Err(BerthError::IoFailure(if stderr.is_empty() {
                format!("qemu-img exited with {}", output.status)
            } else {
                stderr
            }));
        }

        log_debug!("Disk created at {}", path.display());
        Ok(())
    }

    async fn launch_vm(&self, spec: &VmLaunch) -> Result<u32> {
        // Resolve the hypervisor before touching the filesystem.
        let target = self.launcher_target()?;

        let script = render_launcher(&target, spec)?;
        tokio::fs::write(&spec.script_path, script)
            .await
            .map_err(|e| io_failure(&format!("cannot write {}", spec.script_path.display()), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o755);
            tokio::fs::set_permissions(&spec.script_path, perms)
                .await
                .map_err(|e| io_failure("cannot mark launcher executable", e))?;
        }

        let pid = spawn_detached(&spec.script_path).await?;
        log_info!(
            "VM '{}' launched from {} with PID {}",
            spec.name,
            spec.script_path.display(),
            pid
        );
        Ok(pid)
    }

    async fn start_vm(&self, script: &Path) -> Result<u32> {
        if !script.is_file() {
            return Err(BerthError::NotFound(format!("launcher {}", script.display())));
        }
        self.launcher_target()?;
        let pid = spawn_detached(script).await?;
        log_info!("Started {} with PID {}", script.display(), pid);
        Ok(pid)
    }

    fn tool_status(&self) -> Vec<ToolStatus> {
        self.locator.status()
    }
}
