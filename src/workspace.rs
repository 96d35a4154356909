//! The workspace directory doubles as the disk and VM database: disk images
//! are discovered by extension, VM definitions by their launcher scripts.

use crate::{BerthError, Result, log_debug, log_info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Vmdk,
    Vhdx,
}

impl DiskFormat {
    pub const ALL: [DiskFormat; 4] = [
        DiskFormat::Qcow2,
        DiskFormat::Raw,
        DiskFormat::Vmdk,
        DiskFormat::Vhdx,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vhdx => "vhdx",
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
    }
}

impl FromStr for DiskFormat {
    type Err = BerthError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "qcow2" => Ok(DiskFormat::Qcow2),
            "raw" => Ok(DiskFormat::Raw),
            "vmdk" => Ok(DiskFormat::Vmdk),
            "vhdx" => Ok(DiskFormat::Vhdx),
            _ => Err(BerthError::InvalidFormat(value.to_string())),
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskInfo {
    pub name: String,
    pub format: DiskFormat,
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmDefinition {
    pub name: String,
    pub script: PathBuf,
}

/// Extension of generated launcher scripts on this host.
pub fn launcher_extension() -> &'static str {
    if cfg!(windows) { "bat" } else { "sh" }
}

pub const DEFAULT_DOCKERFILE: &str = "FROM python:3.12-slim

WORKDIR /app

COPY requirements.txt .
RUN pip install --no-cache-dir -r requirements.txt

COPY src/ .
CMD [\"python\", \"app.py\"]
";

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn disk_path(&self, name: &str, format: DiskFormat) -> PathBuf {
        self.root.join(format!("{}.{}", name, format.as_str()))
    }

    pub fn launcher_path(&self, vm_name: &str) -> PathBuf {
        self.root.join(format!("{}.{}", vm_name, launcher_extension()))
    }

    /// Resolve a disk reference: absolute paths are kept, bare names are
    /// looked up in the workspace.
    pub fn resolve_disk(&self, reference: &str) -> PathBuf {
        let candidate = Path::new(reference);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        }
    }

    /// Disk images in the workspace, sorted by name. A missing directory is an
    /// empty listing.
    pub fn list_disks(&self) -> Result<Vec<DiskInfo>> {
        let mut disks = Vec::new();
        for path in self.entries()? {
            let Some(format) = DiskFormat::from_path(&path) else {
                continue;
            };
            let name = file_stem(&path);
            let size_bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            disks.push(DiskInfo {
                name,
                format,
                path,
                size_bytes,
            });
        }
        disks.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        log_debug!("Found {} disks in {}", disks.len(), self.root.display());
        Ok(disks)
    }

    pub fn list_vms(&self) -> Result<Vec<VmDefinition>> {
        let ext = launcher_extension();
        let mut vms: Vec<VmDefinition> = self
            .entries()?
            .into_iter()
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(ext))
            .map(|script| VmDefinition {
                name: file_stem(&script),
                script,
            })
            .collect();
        vms.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(vms)
    }

    pub fn find_vm(&self, name: &str) -> Result<VmDefinition> {
        let script = self.launcher_path(name);
        if !script.is_file() {
            return Err(BerthError::NotFound(format!("VM '{}'", name)));
        }
        Ok(VmDefinition {
            name: name.to_string(),
            script,
        })
    }

    /// True when `path` is one of the listed disks.
    pub fn has_disk(&self, path: &Path) -> Result<bool> {
        Ok(self.list_disks()?.iter().any(|disk| disk.path == path))
    }

    pub fn delete_disk(&self, path: &Path) -> Result<()> {
        if DiskFormat::from_path(path).is_none() || !path.is_file() {
            return Err(BerthError::NotFound(format!("disk {}", path.display())));
        }
        fs::remove_file(path)?;
        log_info!("Deleted disk {}", path.display());
        Ok(())
    }

    /// Removes the launcher only; the VM's disk is left in place.
    pub fn delete_vm(&self, name: &str) -> Result<()> {
        let vm = self.find_vm(name)?;
        fs::remove_file(&vm.script)?;
        log_info!("Deleted VM definition {}", vm.script.display());
        Ok(())
    }

    pub fn write_dockerfile(&self, directory: &Path, contents: &str) -> Result<PathBuf> {
        if !directory.is_dir() {
            return Err(BerthError::NotFound(format!(
                "directory {}",
                directory.display()
            )));
        }
        let path = directory.join("Dockerfile");
        fs::write(&path, contents)?;
        log_info!("Dockerfile saved to {}", path.display());
        Ok(path)
    }

    fn entries(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_file() {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
