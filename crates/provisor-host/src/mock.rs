//! In-memory host used by tests: a package database, a daemon, an image
//! store, containers with file trees, and a scripted HTTP fetcher.
//!
//! Any operation can be made to fail or hang by its label, e.g.
//! `pull:php:8.2-apache`, `install:docker.io`, `exec:lab-web:apache2ctl`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use provisor_core::{ContainerState, PortMapping};

use crate::command::{CommandOutput, HostError};
use crate::fetch::{ArtifactFetcher, FetchError};
use crate::runtime::{ContainerRuntime, DaemonStatus, RunSpec};
use crate::system::{DaemonStart, HostSystem};

/// A container held by [`MockEnvironment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockContainer {
    pub image: String,
    pub running: bool,
    pub ports: PortMapping,
    /// Absolute path inside the container → file bytes.
    pub files: BTreeMap<String, Vec<u8>>,
    pub permissions_normalized: bool,
    pub owner: Option<String>,
    pub exec_log: Vec<Vec<String>>,
}

#[derive(Debug)]
struct MockState {
    daemon_package: String,
    installed: BTreeSet<String>,
    needs_refresh: BTreeSet<String>,
    index_refreshed: bool,
    daemon_running: bool,
    daemon_comes_up: bool,
    start_methods: BTreeSet<DaemonStart>,
    ping_errors: u32,
    registry: BTreeSet<String>,
    images: BTreeSet<String>,
    archives: BTreeMap<PathBuf, Vec<String>>,
    containers: BTreeMap<String, MockContainer>,
    failing: BTreeSet<String>,
    hanging: BTreeSet<String>,
    calls: Vec<String>,
}

enum Gate {
    Pass,
    Fail(String),
    Hang,
}

/// Shared fake of the host system and the container runtime.
///
/// Clones share state, so one handle can be given to the reconciler while
/// the test keeps another for assertions.
#[derive(Debug, Clone)]
pub struct MockEnvironment {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEnvironment {
    /// A bare host: nothing installed, no daemon, empty registry.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                daemon_package: "docker.io".into(),
                installed: BTreeSet::new(),
                needs_refresh: BTreeSet::new(),
                index_refreshed: false,
                daemon_running: false,
                daemon_comes_up: true,
                start_methods: DaemonStart::ORDER.into_iter().collect(),
                ping_errors: 0,
                registry: BTreeSet::new(),
                images: BTreeSet::new(),
                archives: BTreeMap::new(),
                containers: BTreeMap::new(),
                failing: BTreeSet::new(),
                hanging: BTreeSet::new(),
                calls: Vec::new(),
            })),
        }
    }

    // ---------------------------------------------------------------
    // Setup
    // ---------------------------------------------------------------

    pub fn with_package(self, name: &str) -> Self {
        self.state.lock().installed.insert(name.into());
        self
    }

    /// Package that only installs after the index is refreshed.
    pub fn with_stale_index_for(self, name: &str) -> Self {
        self.state.lock().needs_refresh.insert(name.into());
        self
    }

    /// Daemon package installed and daemon running.
    pub fn with_daemon_running(self) -> Self {
        {
            let mut s = self.state.lock();
            let pkg = s.daemon_package.clone();
            s.installed.insert(pkg);
            s.daemon_running = true;
        }
        self
    }

    /// Start commands succeed but the daemon never answers.
    pub fn with_dead_daemon(self) -> Self {
        self.state.lock().daemon_comes_up = false;
        self
    }

    pub fn with_start_methods(self, methods: &[DaemonStart]) -> Self {
        self.state.lock().start_methods = methods.iter().copied().collect();
        self
    }

    /// The next `count` pings error out instead of answering.
    pub fn with_ping_errors(self, count: u32) -> Self {
        self.state.lock().ping_errors = count;
        self
    }

    pub fn with_registry_image(self, image: &str) -> Self {
        self.state.lock().registry.insert(image.into());
        self
    }

    pub fn with_image(self, image: &str) -> Self {
        self.state.lock().images.insert(image.into());
        self
    }

    pub fn with_archive(self, path: impl Into<PathBuf>, images: &[&str]) -> Self {
        self.state
            .lock()
            .archives
            .insert(path.into(), images.iter().map(|i| i.to_string()).collect());
        self
    }

    pub fn with_container(self, name: &str, image: &str, ports: PortMapping, running: bool) -> Self {
        self.state.lock().containers.insert(
            name.into(),
            MockContainer {
                image: image.into(),
                running,
                ports,
                files: BTreeMap::new(),
                permissions_normalized: false,
                owner: None,
                exec_log: Vec::new(),
            },
        );
        self
    }

    /// Make the operation with this label fail until cleared.
    pub fn fail(&self, op: &str) {
        self.state.lock().failing.insert(op.into());
    }

    /// Make the operation with this label never complete until cleared.
    pub fn hang(&self, op: &str) {
        self.state.lock().hanging.insert(op.into());
    }

    pub fn clear_faults(&self) {
        let mut s = self.state.lock();
        s.failing.clear();
        s.hanging.clear();
    }

    pub fn stop_daemon(&self) {
        self.state.lock().daemon_running = false;
    }

    // ---------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Labels of operations that change host or container state.
    pub fn mutating_calls(&self) -> Vec<String> {
        const MUTATING: &[&str] = &[
            "install:", "refresh", "start-daemon:", "pull:", "tag:", "load:", "create:",
            "start:", "stop:", "remove:", "copy:", "write:",
        ];
        self.calls()
            .into_iter()
            .filter(|c| MUTATING.iter().any(|m| c.starts_with(m)))
            .collect()
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.state.lock().installed.contains(name)
    }

    pub fn daemon_running(&self) -> bool {
        self.state.lock().daemon_running
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.state.lock().images.contains(image)
    }

    pub fn container(&self, name: &str) -> Option<MockContainer> {
        self.state.lock().containers.get(name).cloned()
    }

    // ---------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------

    fn gate(&self, op: &str) -> Gate {
        let mut s = self.state.lock();
        s.calls.push(op.to_string());
        if s.hanging.contains(op) {
            Gate::Hang
        } else if s.failing.contains(op) {
            Gate::Fail(format!("injected failure: {}", op))
        } else {
            Gate::Pass
        }
    }

    async fn enter(&self, op: &str) -> Result<(), HostError> {
        match self.gate(op) {
            Gate::Pass => Ok(()),
            Gate::Fail(reason) => Err(HostError::Rejected(reason)),
            Gate::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    fn with_daemon<T>(
        &self,
        f: impl FnOnce(&mut MockState) -> Result<T, HostError>,
    ) -> Result<T, HostError> {
        let mut s = self.state.lock();
        if !s.daemon_running {
            return Err(HostError::Rejected(
                "Cannot connect to the Docker daemon. Is the docker daemon running?".into(),
            ));
        }
        f(&mut s)
    }

    fn with_running<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut MockContainer) -> Result<T, HostError>,
    ) -> Result<T, HostError> {
        self.with_daemon(|s| match s.containers.get_mut(name) {
            Some(c) if c.running => f(c),
            Some(_) => Err(HostError::Rejected(format!("container {} is not running", name))),
            None => Err(HostError::Rejected(format!("No such container: {}", name))),
        })
    }
}

#[async_trait]
impl HostSystem for MockEnvironment {
    async fn package_installed(&self, name: &str) -> Result<bool, HostError> {
        self.enter(&format!("query:{}", name)).await?;
        Ok(self.state.lock().installed.contains(name))
    }

    async fn refresh_package_index(&self) -> Result<(), HostError> {
        self.enter("refresh").await?;
        self.state.lock().index_refreshed = true;
        Ok(())
    }

    async fn install_package(&self, name: &str) -> Result<(), HostError> {
        self.enter(&format!("install:{}", name)).await?;
        let mut s = self.state.lock();
        if s.needs_refresh.contains(name) && !s.index_refreshed {
            return Err(HostError::Rejected(format!(
                "E: Unable to locate package {}",
                name
            )));
        }
        s.installed.insert(name.into());
        Ok(())
    }

    async fn start_daemon(&self, service: &str, method: DaemonStart) -> Result<(), HostError> {
        self.enter(&format!("start-daemon:{}", method.label())).await?;
        let mut s = self.state.lock();
        if !s.installed.contains(&s.daemon_package) {
            return Err(HostError::Rejected(format!("Unit {}.service not found", service)));
        }
        if !s.start_methods.contains(&method) {
            return Err(HostError::NotInstalled {
                program: method.label().into(),
            });
        }
        if s.daemon_comes_up {
            s.daemon_running = true;
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for MockEnvironment {
    async fn ping(&self) -> Result<DaemonStatus, HostError> {
        self.enter("ping").await?;
        let mut s = self.state.lock();
        if s.ping_errors > 0 {
            s.ping_errors -= 1;
            return Err(HostError::Rejected("docker info: context deadline exceeded".into()));
        }
        Ok(if !s.installed.contains(&s.daemon_package) {
            DaemonStatus::NotInstalled
        } else if s.daemon_running {
            DaemonStatus::Reachable
        } else {
            DaemonStatus::Unreachable
        })
    }

    async fn image_present(&self, image: &str) -> Result<bool, HostError> {
        self.enter(&format!("inspect-image:{}", image)).await?;
        self.with_daemon(|s| Ok(s.images.contains(image)))
    }

    async fn pull(&self, image: &str) -> Result<(), HostError> {
        self.enter(&format!("pull:{}", image)).await?;
        self.with_daemon(|s| {
            if s.registry.contains(image) {
                s.images.insert(image.into());
                Ok(())
            } else {
                Err(HostError::Rejected(format!("manifest for {} not found", image)))
            }
        })
    }

    async fn tag(&self, source: &str, target: &str) -> Result<(), HostError> {
        self.enter(&format!("tag:{}", target)).await?;
        self.with_daemon(|s| {
            if s.images.contains(source) {
                s.images.insert(target.into());
                Ok(())
            } else {
                Err(HostError::Rejected(format!("No such image: {}", source)))
            }
        })
    }

    async fn load(&self, archive: &Path) -> Result<(), HostError> {
        self.enter(&format!("load:{}", archive.display())).await?;
        self.with_daemon(|s| match s.archives.get(archive).cloned() {
            Some(images) => {
                s.images.extend(images);
                Ok(())
            }
            None => Err(HostError::Rejected(format!(
                "open {}: no such file or directory",
                archive.display()
            ))),
        })
    }

    async fn container_state(&self, name: &str) -> Result<ContainerState, HostError> {
        self.enter(&format!("inspect:{}", name)).await?;
        self.with_daemon(|s| {
            Ok(match s.containers.get(name) {
                None => ContainerState::Absent,
                Some(c) if c.running => ContainerState::Running,
                Some(_) => ContainerState::Stopped,
            })
        })
    }

    async fn published_port(
        &self,
        name: &str,
        container_port: u16,
    ) -> Result<Option<u16>, HostError> {
        self.enter(&format!("port:{}", name)).await?;
        self.with_daemon(|s| {
            Ok(s.containers
                .get(name)
                .filter(|c| c.ports.container == container_port)
                .map(|c| c.ports.host))
        })
    }

    async fn create(&self, spec: &RunSpec) -> Result<(), HostError> {
        self.enter(&format!("create:{}", spec.name)).await?;
        self.with_daemon(|s| {
            if s.containers.contains_key(&spec.name) {
                return Err(HostError::Rejected(format!(
                    "Conflict. The container name \"/{}\" is already in use",
                    spec.name
                )));
            }
            if !s.images.contains(&spec.image) {
                return Err(HostError::Rejected(format!(
                    "Unable to find image '{}' locally",
                    spec.image
                )));
            }
            s.containers.insert(
                spec.name.clone(),
                MockContainer {
                    image: spec.image.clone(),
                    running: true,
                    ports: spec.ports,
                    files: BTreeMap::new(),
                    permissions_normalized: false,
                    owner: None,
                    exec_log: Vec::new(),
                },
            );
            Ok(())
        })
    }

    async fn start(&self, name: &str) -> Result<(), HostError> {
        self.enter(&format!("start:{}", name)).await?;
        self.with_daemon(|s| match s.containers.get_mut(name) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(HostError::Rejected(format!("No such container: {}", name))),
        })
    }

    async fn stop(&self, name: &str) -> Result<(), HostError> {
        self.enter(&format!("stop:{}", name)).await?;
        self.with_daemon(|s| match s.containers.get_mut(name) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => Err(HostError::Rejected(format!("No such container: {}", name))),
        })
    }

    async fn remove(&self, name: &str) -> Result<(), HostError> {
        self.enter(&format!("remove:{}", name)).await?;
        self.with_daemon(|s| {
            s.containers.remove(name);
            Ok(())
        })
    }

    async fn copy_into(&self, name: &str, src_dir: &Path, dest: &str) -> Result<(), HostError> {
        self.enter(&format!("copy:{}", name)).await?;
        let files = read_tree(src_dir)?;
        let dest = dest.trim_end_matches('/').to_string();
        self.with_running(name, |c| {
            for (rel, bytes) in files {
                c.files.insert(format!("{}/{}", dest, rel), bytes);
            }
            Ok(())
        })
    }

    async fn exec(&self, name: &str, argv: &[String]) -> Result<CommandOutput, HostError> {
        let program = argv.first().cloned().unwrap_or_default();
        self.enter(&format!("exec:{}:{}", name, program)).await?;
        self.with_running(name, |c| {
            c.exec_log.push(argv.to_vec());
            let args: Vec<&str> = argv.iter().map(String::as_str).collect();
            match args.as_slice() {
                ["find", root, .., "-delete"] => {
                    let prefix = format!("{}/", root.trim_end_matches('/'));
                    c.files.retain(|path, _| !path.starts_with(&prefix));
                }
                ["find", _, "-type", _, "-exec", "chmod", ..] => c.permissions_normalized = true,
                ["chown", "-R", owner, _] => c.owner = Some(owner.to_string()),
                _ => {}
            }
            Ok(CommandOutput {
                code: Some(0),
                ..CommandOutput::default()
            })
        })
    }

    async fn read_file(&self, name: &str, path: &str) -> Result<Option<String>, HostError> {
        self.enter(&format!("read:{}", name)).await?;
        self.with_running(name, |c| {
            Ok(c.files
                .get(path)
                .map(|b| String::from_utf8_lossy(b).into_owned()))
        })
    }

    async fn write_file(&self, name: &str, path: &str, contents: &str) -> Result<(), HostError> {
        self.enter(&format!("write:{}", name)).await?;
        self.with_running(name, |c| {
            c.files.insert(path.into(), contents.as_bytes().to_vec());
            Ok(())
        })
    }
}

/// Relative path → bytes for every file below `root`.
fn read_tree(root: &Path) -> Result<Vec<(String, Vec<u8>)>, HostError> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let rel = path
                    .strip_prefix(root)
                    .map_err(|e| HostError::Rejected(e.to_string()))?
                    .to_string_lossy()
                    .replace('\\', "/");
                out.push((rel, std::fs::read(&path)?));
            }
        }
    }
    out.sort();
    Ok(out)
}

// ---------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------

/// Scripted response for a URL.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Body(Vec<u8>),
    NotFound,
    NetworkError(String),
    Hang,
}

/// Fetcher answering from a URL table. Unknown URLs are "not found".
#[derive(Debug, Clone, Default)]
pub struct MockFetcher {
    responses: Arc<Mutex<BTreeMap<String, MockResponse>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, url: &str, response: MockResponse) -> Self {
        self.responses.lock().insert(url.into(), response);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ArtifactFetcher for MockFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        self.calls.lock().push(url.into());
        let response = self
            .responses
            .lock()
            .get(url)
            .cloned()
            .unwrap_or(MockResponse::NotFound);
        match response {
            MockResponse::Body(bytes) => {
                tokio::fs::write(dest, &bytes).await?;
                Ok(bytes.len() as u64)
            }
            MockResponse::NotFound => Err(FetchError::NotFound { url: url.into() }),
            MockResponse::NetworkError(reason) => Err(FetchError::Network {
                url: url.into(),
                reason,
            }),
            MockResponse::Hang => {
                std::future::pending::<()>().await;
                Err(FetchError::Network {
                    url: url.into(),
                    reason: "unreachable".into(),
                })
            }
        }
    }
}
