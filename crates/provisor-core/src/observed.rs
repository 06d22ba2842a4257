//! Observed state — a point-in-time snapshot of the host and container.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Location of the deployment marker inside the target container.
///
/// Lives outside the document root so the web server never serves it.
pub const MARKER_PATH: &str = "/var/lib/provisor/content.json";

/// Lifecycle of the named container as seen by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Absent,
    Stopped,
    Running,
}

/// Record written into the target after a successful deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentMarker {
    pub content_hash: String,
    pub source_fingerprint: String,
    /// Whether the service has been reloaded since this content landed.
    pub reloaded: bool,
    pub deployed_at: String,
}

impl ContentMarker {
    pub fn new(content_hash: impl Into<String>, source_fingerprint: impl Into<String>) -> Self {
        Self {
            content_hash: content_hash.into(),
            source_fingerprint: source_fingerprint.into(),
            reloaded: false,
            deployed_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn parse(data: &str) -> Option<Self> {
        serde_json::from_str(data.trim()).ok()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Snapshot of actual conditions. Re-probed every run, never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedState {
    /// Installed flag per desired package.
    pub packages: BTreeMap<String, bool>,
    pub daemon_reachable: bool,
    pub image_present: bool,
    pub container: ContainerState,
    /// Host port the container's service port is published on.
    pub host_port: Option<u16>,
    /// Deployment marker read from a running container.
    pub content: Option<ContentMarker>,
    /// Digest of the configured local artifact as it is on disk right now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_artifact: Option<String>,
}

impl ObservedState {
    /// A host with nothing provisioned.
    pub fn empty() -> Self {
        Self {
            packages: BTreeMap::new(),
            daemon_reachable: false,
            image_present: false,
            container: ContainerState::Absent,
            host_port: None,
            content: None,
            local_artifact: None,
        }
    }

    pub fn package_installed(&self, name: &str) -> bool {
        self.packages.get(name).copied().unwrap_or(false)
    }

    pub fn container_exists(&self) -> bool {
        self.container != ContainerState::Absent
    }

    pub fn container_running(&self) -> bool {
        self.container == ContainerState::Running
    }

    pub fn deployed_content_hash(&self) -> Option<&str> {
        self.content.as_ref().map(|m| m.content_hash.as_str())
    }
}
