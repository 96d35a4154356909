use anyhow::{Context, anyhow};
use berth::{
    BerthError, Job, JobFeed, JobId, JobResult, JobState, Orchestrator,
    adapter::{DockerConnector, DockerEngine, QemuToolchain, ToolLocator},
    config::BerthConfig,
    job::short_id,
    logger,
    request::{BuildForm, DiskForm, RunForm, VmForm},
    workspace::DEFAULT_DOCKERFILE,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "berth")]
#[command(about = "Manage Docker images, containers and QEMU virtual machines")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the Berthfile configuration
    #[arg(short, long, default_value = "Berthfile")]
    config: PathBuf,

    /// Override the disk and VM directory
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Virtual disk management
    Disk {
        #[command(subcommand)]
        disk_command: DiskCommands,
    },
    /// Virtual machine management
    Vm {
        #[command(subcommand)]
        vm_command: VmCommands,
    },
    /// Docker image management
    Image {
        #[command(subcommand)]
        image_command: ImageCommands,
    },
    /// Docker container management
    Container {
        #[command(subcommand)]
        container_command: ContainerCommands,
    },
    /// Dockerfile helpers
    Dockerfile {
        #[command(subcommand)]
        dockerfile_command: DockerfileCommands,
    },
    /// Check the Docker daemon and QEMU tools
    Doctor,
}

#[derive(Subcommand)]
enum DiskCommands {
    /// Create a new disk image
    Create {
        /// Disk name (file name without extension)
        name: String,
        /// Size in GB
        #[arg(short, long)]
        size: String,
        /// Disk format (qcow2, raw, vmdk, vhdx)
        #[arg(short, long, default_value = "qcow2")]
        format: String,
    },
    /// List disks in the workspace
    #[command(alias = "ls")]
    List,
    /// Delete a disk image
    Delete {
        /// Disk file name or absolute path
        disk: String,
    },
}

#[derive(Subcommand)]
enum VmCommands {
    /// Create a VM launcher and boot it
    Create {
        /// VM name
        name: String,
        /// Disk file name in the workspace, or an absolute path
        #[arg(long)]
        disk: String,
        /// Installation ISO
        #[arg(long)]
        iso: Option<PathBuf>,
        /// Memory in MB
        #[arg(short, long, default_value = "2048")]
        memory: String,
        /// CPU cores
        #[arg(long, default_value = "2")]
        cpus: String,
    },
    /// List VMs in the workspace
    #[command(alias = "ls")]
    List,
    /// Boot an existing VM
    Start { name: String },
    /// Delete a VM launcher (the disk is kept)
    Delete { name: String },
}

#[derive(Subcommand)]
enum ImageCommands {
    /// Pull an image
    Pull { reference: String },
    /// Build an image from a directory containing a Dockerfile
    Build {
        /// Build context directory
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
        /// Image name:tag
        #[arg(short, long)]
        tag: String,
    },
    /// List local images
    #[command(alias = "ls")]
    List,
    /// Remove an image
    Remove {
        reference: String,
        #[arg(short, long)]
        force: bool,
    },
    /// Search Docker Hub
    Search { term: String },
}

#[derive(Subcommand)]
enum DockerfileCommands {
    /// Write a Dockerfile into a build context directory
    Init {
        /// Target directory
        #[arg(default_value = ".")]
        directory: PathBuf,
        /// Copy contents from this file instead of the built-in template
        #[arg(long)]
        from: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ContainerCommands {
    /// Run a detached container
    Run {
        image: String,
        #[arg(long)]
        name: Option<String>,
        /// Port mapping host:container
        #[arg(short, long)]
        port: Option<String>,
        /// Command to run
        #[arg(long)]
        command: Option<String>,
    },
    /// List containers
    #[command(alias = "ls")]
    List {
        /// Include stopped containers
        #[arg(short, long)]
        all: bool,
    },
    Start { id: String },
    Stop { id: String },
    Remove {
        id: String,
        #[arg(short, long)]
        force: bool,
    },
    /// Show the tail of a container's logs
    Logs {
        id: String,
        #[arg(short, long)]
        tail: Option<usize>,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Follow a submitted job to completion, cancelling it on Ctrl-C.
async fn follow(orchestrator: &Orchestrator, id: JobId, json: bool) -> anyhow::Result<Job> {
    let mut feed = JobFeed::new(orchestrator.registry().clone());
    let job = tokio::select! {
        job = feed.wait_for(id, |line| if !json { println!("  {}", line) }) => job?,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.cancel(id)?;
            orchestrator.job(id)?
        }
    };

    if json {
        print_json(&job)?;
    } else if let Some(JobResult::Logs { text }) = &job.result {
        println!("{}", text);
    } else if let Some(message) = &job.message {
        println!("{}", message);
    }

    match job.state {
        JobState::Succeeded => Ok(job),
        _ => Err(anyhow!(
            "{} failed: {}",
            job.kind,
            job.error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| job.state.to_string())
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        unsafe {
            std::env::set_var("RUST_LOG", "berth=debug");
        }
    }
    logger::init_logger();

    let mut config = BerthConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(dir) = cli.workspace.clone() {
        config.workspace.directory = Some(dir);
    }

    let docker = Arc::new(DockerEngine::new(DockerConnector::new(config.docker.clone())));
    let hypervisor = Arc::new(QemuToolchain::new(ToolLocator::new(config.tools.clone())));
    let orchestrator = Orchestrator::new(&config, docker, hypervisor)?;
    let json = cli.json;

    match cli.command {
        Commands::Disk { disk_command } => match disk_command {
            DiskCommands::Create { name, size, format } => {
                let id = orchestrator.create_disk(&DiskForm {
                    name,
                    size_gb: size,
                    format,
                })?;
                follow(&orchestrator, id, json).await?;
            }
            DiskCommands::List => {
                let disks = orchestrator.available_disks()?;
                if json {
                    return print_json(&disks);
                }
                println!("{:<24} {:<8} {:>14}  PATH", "NAME", "FORMAT", "SIZE");
                println!("{}", "=".repeat(70));
                for disk in disks {
                    println!(
                        "{:<24} {:<8} {:>14}  {}",
                        disk.name,
                        disk.format,
                        disk.size_bytes,
                        disk.path.display()
                    );
                }
            }
            DiskCommands::Delete { disk } => {
                let path = orchestrator.delete_disk(&disk)?;
                println!("Deleted {}", path.display());
            }
        },
        Commands::Vm { vm_command } => match vm_command {
            VmCommands::Create {
                name,
                disk,
                iso,
                memory,
                cpus,
            } => {
                let id = orchestrator.launch_vm(&VmForm {
                    name,
                    disk,
                    iso: iso.map(|p| p.display().to_string()).unwrap_or_default(),
                    memory_mb: memory,
                    cpu_cores: cpus,
                })?;
                follow(&orchestrator, id, json).await?;
            }
            VmCommands::List => {
                let vms = orchestrator.vms()?;
                if json {
                    return print_json(&vms);
                }
                println!("{:<24} LAUNCHER", "NAME");
                println!("{}", "=".repeat(70));
                for vm in vms {
                    println!("{:<24} {}", vm.name, vm.script.display());
                }
            }
            VmCommands::Start { name } => {
                let id = orchestrator.start_vm(&name)?;
                follow(&orchestrator, id, json).await?;
            }
            VmCommands::Delete { name } => {
                orchestrator.delete_vm(&name)?;
                println!("VM '{}' deleted", name);
            }
        },
        Commands::Image { image_command } => match image_command {
            ImageCommands::Pull { reference } => {
                let id = orchestrator.pull_image(&reference)?;
                follow(&orchestrator, id, json).await?;
            }
            ImageCommands::Build { path, tag } => {
                let id = orchestrator.build_image(&BuildForm {
                    context: path.display().to_string(),
                    tag,
                })?;
                follow(&orchestrator, id, json).await?;
            }
            ImageCommands::List => {
                let images = orchestrator.list_images().await?;
                if json {
                    return print_json(&images);
                }
                println!("{:<40} {:<14} {:>12}", "TAG", "ID", "SIZE (MB)");
                println!("{}", "=".repeat(70));
                for image in images {
                    let id = image.id.trim_start_matches("sha256:");
                    let tags = if image.tags.is_empty() {
                        vec!["<none>".to_string()]
                    } else {
                        image.tags.clone()
                    };
                    for tag in tags {
                        println!(
                            "{:<40} {:<14} {:>12.1}",
                            tag,
                            short_id(id),
                            image.size as f64 / (1024.0 * 1024.0)
                        );
                    }
                }
            }
            ImageCommands::Remove { reference, force } => {
                let id = orchestrator.remove_image(&reference, force)?;
                follow(&orchestrator, id, json).await?;
            }
            ImageCommands::Search { term } => {
                let min_chars = config.search.min_chars;
                match orchestrator.search_images("cli", &term).await? {
                    Some(hits) if json => print_json(&hits)?,
                    Some(hits) => {
                        for hit in hits {
                            let official = if hit.official { " [official]" } else { "" };
                            println!("{:<40} {:>7}*{}", hit.name, hit.stars, official);
                        }
                    }
                    None => println!("Search terms need at least {} characters", min_chars),
                }
            }
        },
        Commands::Container { container_command } => match container_command {
            ContainerCommands::Run {
                image,
                name,
                port,
                command,
            } => {
                let id = orchestrator.run_container(&RunForm {
                    image,
                    name: name.unwrap_or_default(),
                    ports: port.unwrap_or_default(),
                    command: command.unwrap_or_default(),
                })?;
                follow(&orchestrator, id, json).await?;
            }
            ContainerCommands::List { all } => {
                let containers = orchestrator.list_containers(all).await?;
                if json {
                    return print_json(&containers);
                }
                println!(
                    "{:<14} {:<24} {:<28} {:<10}",
                    "ID", "NAME", "IMAGE", "STATUS"
                );
                println!("{}", "=".repeat(80));
                for c in containers {
                    println!(
                        "{:<14} {:<24} {:<28} {:<10}",
                        short_id(&c.id),
                        c.name,
                        c.image,
                        c.status_text
                    );
                }
            }
            ContainerCommands::Start { id } => {
                let job = orchestrator.start_container(&id)?;
                follow(&orchestrator, job, json).await?;
            }
            ContainerCommands::Stop { id } => {
                let job = orchestrator.stop_container(&id)?;
                follow(&orchestrator, job, json).await?;
            }
            ContainerCommands::Remove { id, force } => {
                let job = orchestrator.remove_container(&id, force)?;
                follow(&orchestrator, job, json).await?;
            }
            ContainerCommands::Logs { id, tail } => {
                let job = orchestrator.fetch_logs(&id, tail)?;
                follow(&orchestrator, job, json).await?;
            }
        },
        Commands::Dockerfile {
            dockerfile_command: DockerfileCommands::Init { directory, from },
        } => {
            let contents = match from {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => DEFAULT_DOCKERFILE.to_string(),
            };
            let path = orchestrator.write_dockerfile(&directory, &contents)?;
            println!("Dockerfile saved to {}", path.display());
        }
        Commands::Doctor => {
            let report = orchestrator.health().await;
            match &report.docker {
                Ok(version) => println!("Docker daemon: reachable (version {})", version),
                Err(BerthError::ConnectionFailed(msg)) => {
                    println!("Docker daemon: unreachable ({})", msg)
                }
                Err(err) => println!("Docker daemon: error ({})", err),
            }
            for tool in &report.tools {
                match &tool.path {
                    Some(path) => println!("{}: {}", tool.name, path.display()),
                    None => println!("{}: missing", tool.name),
                }
            }
            println!("Workspace: {}", orchestrator.workspace().root().display());

            let missing = report.missing_tools();
            if !missing.is_empty() {
                println!(
                    "Install {} or set its path under [tools] in the Berthfile",
                    missing.join(", ")
                );
            }
        }
    }

    Ok(())
}
