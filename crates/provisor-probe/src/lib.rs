//! Probe — builds an [`ObservedState`] snapshot without changing anything.
//!
//! A runtime that answers "daemon not running" is an observation. A query
//! that errors or does not answer is retried; if it keeps failing the probe
//! gives up with `EnvironmentUnavailable`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use provisor_core::{
    ContainerState, ContentMarker, DesiredState, Error, ObservedState, ProvisorConfig, Result,
    MARKER_PATH,
};
use provisor_host::{ContainerRuntime, DaemonStatus, HostError, HostSystem};
use tracing::{debug, info, warn};

pub struct Probe {
    runtime: Arc<dyn ContainerRuntime>,
    host: Arc<dyn HostSystem>,
    retries: u32,
    retry_delay: Duration,
    call_timeout: Duration,
}

impl Probe {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        host: Arc<dyn HostSystem>,
        config: &ProvisorConfig,
    ) -> Self {
        Self {
            runtime,
            host,
            retries: config.daemon_retries,
            retry_delay: config.daemon_retry_delay,
            call_timeout: config.call_timeout,
        }
    }

    /// Observe everything the planner needs for `desired`.
    pub async fn observe(&self, desired: &DesiredState) -> Result<ObservedState> {
        let mut observed = ObservedState::empty();

        for pkg in desired.unique_packages() {
            let installed = self
                .query(&format!("package {}", pkg), || self.host.package_installed(pkg))
                .await?;
            observed.packages.insert(pkg.to_string(), installed);
        }

        observed.local_artifact = provisor_content::local_digest(&desired.content.source).await;

        let status = self.query("daemon", || self.runtime.ping()).await?;
        debug!("Daemon status: {:?}", status);
        if status != DaemonStatus::Reachable {
            info!("Container daemon not reachable; image and container treated as absent");
            return Ok(observed);
        }
        observed.daemon_reachable = true;

        let image = &desired.image.reference;
        observed.image_present = self
            .query(&format!("image {}", image), || self.runtime.image_present(image))
            .await?;

        let name = &desired.container.name;
        observed.container = self
            .query(&format!("container {}", name), || {
                self.runtime.container_state(name)
            })
            .await?;

        if observed.container_exists() {
            let port = desired.container.ports.container;
            observed.host_port = self
                .query(&format!("ports of {}", name), || {
                    self.runtime.published_port(name, port)
                })
                .await?;
        }

        if observed.container == ContainerState::Running {
            let raw = self
                .query(&format!("marker in {}", name), || {
                    self.runtime.read_file(name, MARKER_PATH)
                })
                .await?;
            observed.content = raw.as_deref().and_then(|data| {
                let marker = ContentMarker::parse(data);
                if marker.is_none() {
                    warn!("Ignoring unreadable deployment marker in {}", name);
                }
                marker
            });
        }

        info!(
            "Observed: daemon={} image={} container={:?} port={:?} content={}",
            observed.daemon_reachable,
            observed.image_present,
            observed.container,
            observed.host_port,
            observed.deployed_content_hash().unwrap_or("none"),
        );
        Ok(observed)
    }

    /// Run a read-only query with the bounded retry policy.
    async fn query<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, HostError>>,
    {
        let mut last_error = String::new();
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("no answer within {}ms", self.call_timeout.as_millis())
                }
            }
            warn!(
                "Probe of {} failed (attempt {}/{}): {}",
                what,
                attempt + 1,
                self.retries + 1,
                last_error
            );
        }
        Err(Error::EnvironmentUnavailable(format!(
            "{}: {}",
            what, last_error
        )))
    }
}
