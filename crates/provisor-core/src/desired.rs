//! Desired state — the declarative description of a provisioned environment.
//!
//! Loaded once from a JSON document and never mutated afterwards; every
//! component receives it by shared reference.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

/// Target configuration for one provisioned environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredState {
    /// Host packages that must be installed, in install order.
    #[serde(default = "default_packages")]
    pub packages: Vec<String>,
    #[serde(default)]
    pub daemon: DaemonSpec,
    pub image: ImageSpec,
    pub container: ContainerSpec,
    pub content: ContentSpec,
    #[serde(default)]
    pub service: ServiceSpec,
}

/// Container daemon service on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSpec {
    #[serde(default = "default_daemon_service")]
    pub service: String,
}

impl Default for DaemonSpec {
    fn default() -> Self {
        Self {
            service: default_daemon_service(),
        }
    }
}

/// Image the container runs, plus the sources it may come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Image reference the container is created from (e.g. `php:8.2-apache`).
    pub reference: String,
    /// Base images pulled and re-tagged when the reference itself cannot be pulled.
    #[serde(default)]
    pub fallbacks: Vec<String>,
    /// `docker save` tarball imported as the last resort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub name: String,
    pub ports: PortMapping,
}

/// Host → container port publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub host: u16,
    #[serde(default = "default_container_port")]
    pub container: u16,
}

/// Web content and where it lands inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSpec {
    pub source: ContentSource,
    /// Document root inside the container.
    #[serde(default = "default_content_root")]
    pub root: String,
    /// `user:group` applied to the deployed tree. `null` skips chown.
    #[serde(default = "default_owner")]
    pub owner: Option<String>,
}

/// Where the content bundle comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSource {
    /// Local zip archive or directory, used verbatim when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteSource>,
    /// Expected content hash; candidates hashing differently are rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Remote archive URL. `{branch}` is replaced by each branch in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSource {
    pub url: String,
    #[serde(default)]
    pub branches: Vec<String>,
}

/// Service reload commands, run inside the container in order until one succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(default = "default_reload")]
    pub reload: Vec<Vec<String>>,
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            reload: default_reload(),
        }
    }
}

fn default_packages() -> Vec<String> {
    vec!["docker.io".into()]
}
fn default_daemon_service() -> String {
    "docker".into()
}
fn default_container_port() -> u16 {
    80
}
fn default_content_root() -> String {
    "/var/www/html".into()
}
fn default_owner() -> Option<String> {
    Some("www-data:www-data".into())
}
fn default_reload() -> Vec<Vec<String>> {
    vec![
        vec!["apache2ctl".into(), "-k".into(), "graceful".into()],
        vec!["service".into(), "apache2".into(), "reload".into()],
    ]
}

impl DesiredState {
    /// Load and validate a desired state file.
    ///
    /// Relative local paths resolve against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let mut state = Self::from_json(&data)?;
        if let Some(base) = path.parent() {
            state.resolve_paths(base);
        }
        debug!("Loaded desired state for container '{}'", state.container.name);
        Ok(state)
    }

    /// Parse and validate a desired state document.
    pub fn from_json(data: &str) -> Result<Self> {
        let state: Self = serde_json::from_str(data)?;
        state.validate()?;
        Ok(state)
    }

    fn resolve_paths(&mut self, base: &Path) {
        if let Some(local) = self.content.source.local.as_mut() {
            if local.is_relative() {
                *local = base.join(&*local);
            }
        }
        if let Some(archive) = self.image.archive.as_mut() {
            if archive.is_relative() {
                *archive = base.join(&*archive);
            }
        }
    }

    /// Check structural constraints the rest of the pipeline relies on.
    pub fn validate(&self) -> Result<()> {
        if self.image.reference.trim().is_empty() {
            return Err(invalid("image reference is empty"));
        }
        if self.image.fallbacks.iter().any(|f| f.trim().is_empty()) {
            return Err(invalid("image fallback chain contains an empty reference"));
        }
        if !is_valid_container_name(&self.container.name) {
            return Err(invalid(format!(
                "container name '{}' is not a valid name",
                self.container.name
            )));
        }
        if self.container.ports.host == 0 || self.container.ports.container == 0 {
            return Err(invalid("ports must be non-zero"));
        }
        if self.packages.iter().any(|p| p.trim().is_empty()) {
            return Err(invalid("package list contains an empty name"));
        }

        let source = &self.content.source;
        if source.local.is_none() && source.remote.is_none() {
            return Err(invalid("content source needs a local path or a remote URL"));
        }
        if let Some(remote) = &source.remote {
            if remote.url.trim().is_empty() {
                return Err(invalid("remote content URL is empty"));
            }
            if remote.url.contains("{branch}") && remote.branches.is_empty() {
                return Err(invalid("remote URL uses {branch} but no branches are listed"));
            }
        }
        if let Some(pin) = &source.sha256 {
            if pin.len() != 64 || !pin.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(invalid("content sha256 must be 64 hex characters"));
            }
        }
        if !self.content.root.starts_with('/') {
            return Err(invalid("content root must be an absolute path"));
        }
        if self.service.reload.iter().any(|cmd| cmd.is_empty()) {
            return Err(invalid("reload commands must not be empty"));
        }
        Ok(())
    }

    /// Packages in install order with duplicates removed.
    pub fn unique_packages(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for pkg in &self.packages {
            if !seen.contains(&pkg.as_str()) {
                seen.push(pkg.as_str());
            }
        }
        seen
    }
}

impl ContentSource {
    /// Stable fingerprint of the source descriptor and, when the local
    /// artifact exists, of its current bytes.
    ///
    /// Stored in the deployment marker so the next run can tell whether the
    /// deployed content came from this same descriptor and artifact.
    pub fn fingerprint(&self, local_digest: Option<&str>) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        if let Some(digest) = local_digest {
            hasher.update([0u8]);
            hasher.update(digest.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

impl RemoteSource {
    /// Concrete URLs in fallback order, paired with their branch label.
    pub fn urls(&self) -> Vec<(Option<String>, String)> {
        if self.branches.is_empty() || !self.url.contains("{branch}") {
            return vec![(None, self.url.clone())];
        }
        self.branches
            .iter()
            .map(|b| (Some(b.clone()), self.url.replace("{branch}", b)))
            .collect()
    }
}

fn is_valid_container_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidSpec(reason.into())
}
