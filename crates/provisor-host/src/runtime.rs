//! Container runtime control plane.

use std::path::Path;

use async_trait::async_trait;
use provisor_core::{ContainerState, PortMapping};
use tracing::{debug, info};

use crate::command::{CommandOutput, HostCommand, HostError};

/// Whether the container daemon answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Reachable,
    /// CLI present, daemon not answering.
    Unreachable,
    /// Runtime CLI missing from the host.
    NotInstalled,
}

/// Parameters for creating a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub ports: PortMapping,
}

/// Create/start/stop/copy-into/exec-in containers and query their status.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<DaemonStatus, HostError>;

    async fn image_present(&self, image: &str) -> Result<bool, HostError>;
    async fn pull(&self, image: &str) -> Result<(), HostError>;
    async fn tag(&self, source: &str, target: &str) -> Result<(), HostError>;
    /// Import images from a `docker save` tarball.
    async fn load(&self, archive: &Path) -> Result<(), HostError>;

    async fn container_state(&self, name: &str) -> Result<ContainerState, HostError>;
    /// Host port that `container_port` is published on, if any.
    async fn published_port(
        &self,
        name: &str,
        container_port: u16,
    ) -> Result<Option<u16>, HostError>;
    /// Create and start a detached container.
    async fn create(&self, spec: &RunSpec) -> Result<(), HostError>;
    async fn start(&self, name: &str) -> Result<(), HostError>;
    async fn stop(&self, name: &str) -> Result<(), HostError>;
    async fn remove(&self, name: &str) -> Result<(), HostError>;

    /// Copy the contents of `src_dir` into `dest` inside the container.
    async fn copy_into(&self, name: &str, src_dir: &Path, dest: &str) -> Result<(), HostError>;
    /// Run a command inside the container. A non-zero exit is not an error.
    async fn exec(&self, name: &str, argv: &[String]) -> Result<CommandOutput, HostError>;
    /// Read a file inside a running container; `None` when it does not exist.
    async fn read_file(&self, name: &str, path: &str) -> Result<Option<String>, HostError>;
    async fn write_file(&self, name: &str, path: &str, contents: &str) -> Result<(), HostError>;
}

/// Docker CLI implementation.
pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn cmd(&self) -> HostCommand {
        HostCommand::new(&self.bin)
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// Arguments for `docker run`.
pub fn run_args(spec: &RunSpec) -> Vec<String> {
    vec![
        "run".into(),
        "-d".into(),
        "--name".into(),
        spec.name.clone(),
        "-p".into(),
        format!("{}:{}", spec.ports.host, spec.ports.container),
        spec.image.clone(),
    ]
}

/// Host port bound to `container_port` in `docker inspect` port bindings
/// (`{"80/tcp":[{"HostIp":"","HostPort":"8080"}]}`).
pub fn parse_port_bindings(output: &str, container_port: u16) -> Option<u16> {
    let bindings: serde_json::Value = serde_json::from_str(output.trim()).ok()?;
    bindings
        .get(format!("{}/tcp", container_port))?
        .as_array()?
        .iter()
        .filter_map(|b| b.get("HostPort")?.as_str())
        .find_map(|port| port.parse().ok())
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ping(&self) -> Result<DaemonStatus, HostError> {
        let output = match self
            .cmd()
            .args(["info", "--format", "{{.ServerVersion}}"])
            .output()
            .await
        {
            Ok(o) => o,
            Err(HostError::NotInstalled { .. }) => return Ok(DaemonStatus::NotInstalled),
            Err(e) => return Err(e),
        };
        if output.success() {
            debug!("Docker daemon reachable (server {})", output.stdout.trim());
            Ok(DaemonStatus::Reachable)
        } else {
            debug!("Docker daemon unreachable: {}", output.stderr.trim());
            Ok(DaemonStatus::Unreachable)
        }
    }

    async fn image_present(&self, image: &str) -> Result<bool, HostError> {
        let output = self.cmd().args(["image", "inspect", image]).output().await?;
        Ok(output.success())
    }

    async fn pull(&self, image: &str) -> Result<(), HostError> {
        info!("Pulling image {}", image);
        self.cmd().args(["pull", image]).checked().await?;
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str) -> Result<(), HostError> {
        self.cmd().args(["tag", source, target]).checked().await?;
        Ok(())
    }

    async fn load(&self, archive: &Path) -> Result<(), HostError> {
        info!("Loading images from {}", archive.display());
        self.cmd()
            .args(["load", "-i"])
            .arg(archive.as_os_str())
            .checked()
            .await?;
        Ok(())
    }

    async fn container_state(&self, name: &str) -> Result<ContainerState, HostError> {
        let output = self
            .cmd()
            .args(["inspect", "-f", "{{.State.Running}}", name])
            .output()
            .await?;
        if !output.success() {
            return Ok(ContainerState::Absent);
        }
        Ok(if output.stdout.trim() == "true" {
            ContainerState::Running
        } else {
            ContainerState::Stopped
        })
    }

    async fn published_port(
        &self,
        name: &str,
        container_port: u16,
    ) -> Result<Option<u16>, HostError> {
        // Bindings from the host config survive a stopped container.
        let output = self
            .cmd()
            .args(["inspect", "-f", "{{json .HostConfig.PortBindings}}", name])
            .output()
            .await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(parse_port_bindings(&output.stdout, container_port))
    }

    async fn create(&self, spec: &RunSpec) -> Result<(), HostError> {
        info!("Creating container {} from {}", spec.name, spec.image);
        self.cmd().args(run_args(spec)).checked().await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), HostError> {
        self.cmd().args(["start", name]).checked().await?;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), HostError> {
        self.cmd().args(["stop", name]).checked().await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), HostError> {
        self.cmd().args(["rm", "-f", name]).checked().await?;
        Ok(())
    }

    async fn copy_into(&self, name: &str, src_dir: &Path, dest: &str) -> Result<(), HostError> {
        // Trailing "/." copies the directory's contents rather than the directory.
        let src = format!("{}/.", src_dir.display());
        self.cmd()
            .args(["cp", src.as_str(), format!("{}:{}", name, dest).as_str()])
            .checked()
            .await?;
        Ok(())
    }

    async fn exec(&self, name: &str, argv: &[String]) -> Result<CommandOutput, HostError> {
        self.cmd()
            .args(["exec", name])
            .args(argv.iter().cloned())
            .output()
            .await
    }

    async fn read_file(&self, name: &str, path: &str) -> Result<Option<String>, HostError> {
        let output = self.cmd().args(["exec", name, "cat", path]).output().await?;
        Ok(output.success().then_some(output.stdout))
    }

    async fn write_file(&self, name: &str, path: &str, contents: &str) -> Result<(), HostError> {
        self.cmd()
            .args(["exec", name, "mkdir", "-p", parent_dir(path)])
            .checked()
            .await?;

        let tmp = tempfile::NamedTempFile::new()?;
        tokio::fs::write(tmp.path(), contents).await?;
        self.cmd()
            .arg("cp")
            .arg(tmp.path().as_os_str())
            .arg(format!("{}:{}", name, path))
            .checked()
            .await?;
        Ok(())
    }
}
