#![cfg(unix)]

use berth::ErrorKind;
use berth::adapter::{Hypervisor, QemuToolchain, ToolLocator, VmLaunch};
use berth::config::ToolsConfig;
use berth::job::CancelToken;
use berth::workspace::DiskFormat;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn toolchain(qemu_img: Option<PathBuf>, qemu_system: Option<PathBuf>) -> QemuToolchain {
    QemuToolchain::new(ToolLocator::new(ToolsConfig {
        qemu_img,
        qemu_system,
        ..ToolsConfig::default()
    }))
}

#[tokio::test]
async fn create_disk_invokes_qemu_img() {
    let dir = TempDir::new().unwrap();
    // Arguments: create -f <format> <path> <size>
    let tool = fake_tool(dir.path(), "qemu-img", r#": > "$4""#);
    let qemu = toolchain(Some(tool), None);

    let disk = dir.path().join("disks").join("vm_disk.qcow2");
    qemu.create_disk(&disk, DiskFormat::Qcow2, 10, &CancelToken::never())
        .await
        .unwrap();
    assert!(disk.is_file());
}

#[tokio::test]
async fn qemu_img_failure_reports_stderr() {
    let dir = TempDir::new().unwrap();
    let tool = fake_tool(dir.path(), "qemu-img", "echo 'disk full' >&2; exit 1");
    let qemu = toolchain(Some(tool), None);

    let err = qemu
        .create_disk(
            &dir.path().join("d.raw"),
            DiskFormat::Raw,
            1,
            &CancelToken::never(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoFailure);
    assert!(err.to_string().contains("disk full"));
}

#[tokio::test]
async fn missing_qemu_img_is_tool_missing() {
    let dir = TempDir::new().unwrap();
    let qemu = toolchain(Some(dir.path().join("nope")), None);

    let disk = dir.path().join("d.qcow2");
    let err = qemu
        .create_disk(&disk, DiskFormat::Qcow2, 1, &CancelToken::never())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ToolMissing);
    assert!(!disk.exists());
}

#[tokio::test]
async fn launch_without_hypervisor_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let qemu = toolchain(None, Some(dir.path().join("qemu-system-missing")));

    let spec = VmLaunch {
        name: "dev".to_string(),
        disk_path: dir.path().join("vm_disk.qcow2"),
        iso_path: None,
        memory_mb: 1024,
        cpu_cores: 1,
        script_path: dir.path().join("dev.sh"),
    };
    let err = qemu.launch_vm(&spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ToolMissing);
    assert!(!spec.script_path.exists());
}

#[tokio::test]
async fn launch_writes_executable_script() {
    let dir = TempDir::new().unwrap();
    let qemu_system = fake_tool(dir.path(), "qemu-system-x86_64", "exit 0");
    let qemu = toolchain(None, Some(qemu_system));

    let spec = VmLaunch {
        name: "dev".to_string(),
        disk_path: dir.path().join("vm_disk.qcow2"),
        iso_path: None,
        memory_mb: 512,
        cpu_cores: 1,
        script_path: dir.path().join("dev.sh"),
    };
    let pid = qemu.launch_vm(&spec).await.unwrap();
    assert!(pid > 0);

    let script = fs::read_to_string(&spec.script_path).unwrap();
    assert!(script.starts_with("#!/bin/sh"));
    assert!(script.contains("-m 512"));
    let mode = fs::metadata(&spec.script_path).unwrap().permissions().mode();
    assert_eq!(mode & 0o111, 0o111);
}

async fn wait_for_file(path: &Path) {
    for _ in 0..400 {
        if path.is_file() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never appeared", path.display());
}

#[tokio::test]
async fn launcher_passes_odd_paths_through_untouched() {
    let dir = TempDir::new().unwrap();
    let args = dir.path().join("args");
    let qemu_system = fake_tool(
        dir.path(),
        "qemu-system-x86_64",
        &format!(r#"printf '%s\n' "$@" > '{}'"#, args.display()),
    );
    let qemu = toolchain(None, Some(qemu_system));

    let marker = dir.path().join("marker");
    let iso = dir
        .path()
        .join(format!("x$(touch {})`true`'$HOME.iso", marker.display()));
    let spec = VmLaunch {
        name: "dev".to_string(),
        disk_path: dir.path().join("vm_disk.qcow2"),
        iso_path: Some(iso.clone()),
        memory_mb: 512,
        cpu_cores: 1,
        script_path: dir.path().join("dev.sh"),
    };
    qemu.launch_vm(&spec).await.unwrap();
    wait_for_file(&args).await;
    // Give a partial write time to finish.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let received: Vec<String> = fs::read_to_string(&args)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    assert!(received.contains(&iso.display().to_string()), "{:?}", received);
    assert!(!marker.exists());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn exited_launchers_are_reaped() {
    let dir = TempDir::new().unwrap();
    let qemu_system = fake_tool(dir.path(), "qemu-system-x86_64", "exit 0");
    let qemu = toolchain(None, Some(qemu_system));

    let spec = VmLaunch {
        name: "short".to_string(),
        disk_path: dir.path().join("vm_disk.qcow2"),
        iso_path: None,
        memory_mb: 256,
        cpu_cores: 1,
        script_path: dir.path().join("short.sh"),
    };
    let pid = qemu.launch_vm(&spec).await.unwrap();

    // An unreaped child lingers in /proc as a zombie.
    let proc_entry = PathBuf::from(format!("/proc/{}", pid));
    for _ in 0..500 {
        if !proc_entry.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("launcher {} was never reaped", pid);
}
