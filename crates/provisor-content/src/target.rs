//! Deployment targets: a running container or a local directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use provisor_core::{ContentMarker, Error, Result, MARKER_PATH};
use provisor_host::ContainerRuntime;
use tracing::{debug, info};

use crate::archive::copy_dir;
use crate::permissions::{chmod_commands, chown_command, normalize_tree};

/// Where a resolved tree ends up.
#[async_trait]
pub trait ContentTarget: Send + Sync {
    fn describe(&self) -> String;

    /// Replace the content root with an exact copy of `src`.
    async fn sync_tree(&self, src: &Path) -> Result<()>;

    /// Apply the 0755/0644 mode policy and, when given, the owner.
    async fn normalize_permissions(&self, owner: Option<&str>) -> Result<()>;

    async fn read_marker(&self) -> Result<Option<ContentMarker>>;
    async fn write_marker(&self, marker: &ContentMarker) -> Result<()>;
}

/// Document root inside a running container, driven through the runtime.
pub struct ContainerTarget {
    runtime: Arc<dyn ContainerRuntime>,
    container: String,
    root: String,
}

impl ContainerTarget {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        container: impl Into<String>,
        root: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            container: container.into(),
            root: root.into(),
        }
    }

    /// Run a command in the container; a non-zero exit is an error string.
    async fn exec(&self, argv: Vec<String>) -> std::result::Result<(), String> {
        let output = self
            .runtime
            .exec(&self.container, &argv)
            .await
            .map_err(|e| e.to_string())?;
        if output.success() {
            Ok(())
        } else {
            Err(format!(
                "`{}` exited with {:?}: {}",
                argv.join(" "),
                output.code,
                output.stderr.trim()
            ))
        }
    }
}

#[async_trait]
impl ContentTarget for ContainerTarget {
    fn describe(&self) -> String {
        format!("{}:{}", self.container, self.root)
    }

    async fn sync_tree(&self, src: &Path) -> Result<()> {
        let transfer = |e: String| Error::Transfer(format!("{}: {}", self.describe(), e));

        self.exec(vec!["mkdir".into(), "-p".into(), self.root.clone()])
            .await
            .map_err(transfer)?;
        self.exec(vec![
            "find".into(),
            self.root.clone(),
            "-mindepth".into(),
            "1".into(),
            "-delete".into(),
        ])
        .await
        .map_err(transfer)?;
        self.runtime
            .copy_into(&self.container, src, &self.root)
            .await
            .map_err(|e| transfer(e.to_string()))?;

        info!("Synced {} into {}", src.display(), self.describe());
        Ok(())
    }

    async fn normalize_permissions(&self, owner: Option<&str>) -> Result<()> {
        for argv in chmod_commands(&self.root) {
            self.exec(argv).await.map_err(Error::PermissionApplyFailed)?;
        }
        if let Some(owner) = owner {
            self.exec(chown_command(&self.root, owner))
                .await
                .map_err(Error::PermissionApplyFailed)?;
        }
        debug!("Normalized permissions under {}", self.describe());
        Ok(())
    }

    async fn read_marker(&self) -> Result<Option<ContentMarker>> {
        let raw = self
            .runtime
            .read_file(&self.container, MARKER_PATH)
            .await
            .map_err(|e| Error::Transfer(e.to_string()))?;
        Ok(raw.as_deref().and_then(ContentMarker::parse))
    }

    async fn write_marker(&self, marker: &ContentMarker) -> Result<()> {
        self.runtime
            .write_file(&self.container, MARKER_PATH, &marker.to_json())
            .await
            .map_err(|e| Error::Transfer(format!("writing marker: {}", e)))
    }
}

/// Local directory target. Ownership is left to the invoking user.
pub struct DirectoryTarget {
    root: PathBuf,
    marker: PathBuf,
}

impl DirectoryTarget {
    pub fn new(root: impl Into<PathBuf>, marker: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            marker: marker.into(),
        }
    }
}

#[async_trait]
impl ContentTarget for DirectoryTarget {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn sync_tree(&self, src: &Path) -> Result<()> {
        let root = self.root.clone();
        let src = src.to_path_buf();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if root.exists() {
                std::fs::remove_dir_all(&root)?;
            }
            copy_dir(&src, &root)
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
        .map_err(|e| Error::Transfer(format!("{}: {}", self.describe(), e)))
    }

    async fn normalize_permissions(&self, owner: Option<&str>) -> Result<()> {
        if let Some(owner) = owner {
            debug!("Owner {} not applied to directory target {}", owner, self.describe());
        }
        normalize_tree(&self.root).map_err(|e| Error::PermissionApplyFailed(e.to_string()))
    }

    async fn read_marker(&self) -> Result<Option<ContentMarker>> {
        match tokio::fs::read_to_string(&self.marker).await {
            Ok(data) => Ok(ContentMarker::parse(&data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_marker(&self, marker: &ContentMarker) -> Result<()> {
        if let Some(parent) = self.marker.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.marker, marker.to_json()).await?;
        Ok(())
    }
}
