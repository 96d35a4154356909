//! Form-level requests and their synchronous validation.
//!
//! Each form carries raw text the way a front end collects it. Validation runs
//! before any job exists and never touches an external tool.

use crate::job::JobParams;
use crate::workspace::{DiskFormat, Workspace};
use crate::{BerthError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A single `host:container` port publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

pub fn parse_port_mapping(input: &str) -> Result<PortMapping> {
    let invalid = || BerthError::validation("Invalid port format. Use host:container");
    let (host, container) = input.trim().split_once(':').ok_or_else(invalid)?;
    let port = |s: &str| -> Result<u16> {
        match s.trim().parse::<u16>() {
            Ok(p) if p > 0 => Ok(p),
            _ => Err(invalid()),
        }
    };
    Ok(PortMapping {
        host: port(host)?,
        container: port(container)?,
    })
}

pub fn parse_positive(field: &str, value: &str) -> Result<u32> {
    match value.trim().parse::<i64>() {
        Ok(n) if n > 0 && n <= i64::from(u32::MAX) => Ok(n as u32),
        Ok(_) => Err(BerthError::validation(format!(
            "{} must be a positive integer",
            field
        ))),
        Err(_) => Err(BerthError::validation(format!(
            "{} must be a number, got '{}'",
            field,
            value.trim()
        ))),
    }
}

pub fn require_text(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(BerthError::validation(format!("{} is required", field)));
    }
    Ok(trimmed.to_string())
}

/// Names end up in file names, so keep them to a safe alphabet.
pub fn validate_name(field: &str, value: &str) -> Result<String> {
    let name = require_text(field, value)?;
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with('.');
    if !valid {
        return Err(BerthError::validation(format!(
            "{} '{}' contains unsupported characters",
            field, name
        )));
    }
    Ok(name)
}

pub fn validate_reference(value: &str) -> Result<String> {
    let reference = require_text("Image name", value)?;
    if reference.chars().any(char::is_whitespace) {
        return Err(BerthError::validation(format!(
            "Image reference '{}' must not contain whitespace",
            reference
        )));
    }
    Ok(reference)
}

/// Split `repo[:tag]`; the tag defaults to `latest`. Digests pass through
/// with an empty tag.
pub fn split_reference(reference: &str) -> (&str, &str) {
    if reference.contains('@') {
        return (reference, "");
    }
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (reference, "latest"),
    }
}

/// One spelling per image: `nginx`, `nginx:latest`, `library/nginx` and
/// `docker.io/library/nginx:latest` all become `nginx:latest`.
pub fn canonical_reference(reference: &str) -> String {
    let mut name = reference.trim();
    for registry in ["docker.io/", "index.docker.io/", "registry-1.docker.io/"] {
        if let Some(rest) = name.strip_prefix(registry) {
            name = rest;
            break;
        }
    }
    if let Some(rest) = name.strip_prefix("library/") {
        name = rest;
    }
    match split_reference(name) {
        (digest, "") => digest.to_string(),
        (repo, tag) => format!("{}:{}", repo, tag),
    }
}

fn optional(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[derive(Debug, Clone, Default)]
pub struct DiskForm {
    pub name: String,
    pub size_gb: String,
    pub format: String,
}

impl DiskForm {
    pub fn validate(&self, workspace: &Workspace) -> Result<JobParams> {
        let name = validate_name("Disk name", &self.name)?;
        let size_gb = parse_positive("Disk size", &self.size_gb)?;
        let format: DiskFormat = self
            .format
            .parse()
            .map_err(|e: BerthError| BerthError::Validation(e.to_string()))?;

        let path = workspace.disk_path(&name, format);
        if path.exists() {
            return Err(BerthError::validation(format!(
                "Disk {} already exists",
                path.display()
            )));
        }
        Ok(JobParams::CreateDisk {
            path,
            format,
            size_gb,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct VmForm {
    pub name: String,
    /// Disk file name in the workspace, or an absolute path
    pub disk: String,
    pub iso: String,
    pub memory_mb: String,
    pub cpu_cores: String,
}

impl VmForm {
    /// Fails with `NotFound` when the disk is not among the workspace disks.
    pub fn validate(&self, workspace: &Workspace) -> Result<JobParams> {
        let name = validate_name("VM name", &self.name)?;
        let memory_mb = parse_positive("Memory", &self.memory_mb)?;
        let cpu_cores = parse_positive("CPU cores", &self.cpu_cores)?;
        let disk = require_text("Disk", &self.disk)?;

        let iso_path = match optional(&self.iso) {
            Some(iso) => {
                let path = PathBuf::from(iso);
                if !path.is_file() {
                    return Err(BerthError::validation(format!(
                        "ISO file {} does not exist",
                        path.display()
                    )));
                }
                Some(path)
            }
            None => None,
        };

        let disk_path = workspace.resolve_disk(&disk);
        if !workspace.has_disk(&disk_path)? && !(disk_path.is_absolute() && disk_path.is_file())
        {
            return Err(BerthError::NotFound(format!(
                "disk {}",
                disk_path.display()
            )));
        }

        Ok(JobParams::LaunchVm {
            name,
            disk_path,
            iso_path,
            memory_mb,
            cpu_cores,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildForm {
    pub context: String,
    pub tag: String,
}

impl BuildForm {
    pub fn validate(&self) -> Result<JobParams> {
        let context = PathBuf::from(require_text("Dockerfile directory", &self.context)?);
        let tag = validate_reference(&self.tag)?;
        if !context.is_dir() {
            return Err(BerthError::validation(format!(
                "Build context {} is not a directory",
                context.display()
            )));
        }
        Ok(JobParams::BuildImage { context, tag })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunForm {
    pub image: String,
    pub name: String,
    pub ports: String,
    pub command: String,
}

impl RunForm {
    pub fn validate(&self) -> Result<JobParams> {
        let image = validate_reference(&self.image)?;
        let name = match optional(&self.name) {
            Some(name) => Some(validate_name("Container name", &name)?),
            None => None,
        };
        let ports = match optional(&self.ports) {
            Some(ports) => Some(parse_port_mapping(&ports)?),
            None => None,
        };
        Ok(JobParams::RunContainer {
            image,
            name,
            ports,
            command: optional(&self.command),
        })
    }
}
