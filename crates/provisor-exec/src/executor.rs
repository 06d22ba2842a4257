//! Executor — strategy lists per action kind.
//!
//! | Action            | Strategies, in order                                  |
//! |-------------------|-------------------------------------------------------|
//! | InstallPackage    | `install`, `refresh-and-install`                      |
//! | StartDaemon       | `systemctl`, `service`, then poll until reachable     |
//! | PullOrBuildImage  | `pull:<image>`, `pull:<fallback>` + tag, `load:<tar>` |
//! | RunContainer      | `start-existing`, `create` / `remove-and-create`      |
//! | DeployContent     | one per content source candidate                      |
//! | ReloadService     | `reload:<command>` for each configured command        |

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use provisor_content::{ContainerTarget, ContentDeployer, ContentTarget};
use provisor_core::{
    Action, ActionResult, ContainerState, ContentSpec, Error, IdempotencyKey, ImageSpec,
    PortMapping, ProvisorConfig, Result,
};
use provisor_host::{
    ArtifactFetcher, ContainerRuntime, DaemonStart, DaemonStatus, HostError, HostSystem, RunSpec,
    StrategyChain,
};
use tracing::{error, info, warn};

/// What a successful action produced besides its attempts.
#[derive(Default)]
struct Applied {
    warnings: Vec<String>,
    content_hash: Option<String>,
}

pub struct Executor {
    runtime: Arc<dyn ContainerRuntime>,
    host: Arc<dyn HostSystem>,
    deployer: ContentDeployer,
    call_timeout: Duration,
    daemon_retries: u32,
    daemon_retry_delay: Duration,
}

impl Executor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        host: Arc<dyn HostSystem>,
        fetcher: Arc<dyn ArtifactFetcher>,
        config: &ProvisorConfig,
    ) -> Self {
        Self {
            runtime,
            host,
            deployer: ContentDeployer::new(fetcher, &config.data_paths),
            call_timeout: config.call_timeout,
            daemon_retries: config.daemon_retries,
            daemon_retry_delay: config.daemon_retry_delay,
        }
    }

    /// Apply one action. Failures are reported in the result, never raised.
    pub async fn apply(&self, action: &Action) -> ActionResult {
        let key = action.key();
        info!("Applying {}", action);
        let mut chain = StrategyChain::new(self.call_timeout);

        let outcome = match action {
            Action::InstallPackage { name } => self.install_package(&key, name, &mut chain).await,
            Action::StartDaemon { service } => self.start_daemon(&key, service, &mut chain).await,
            Action::PullOrBuildImage { image } => self.pull_or_build(&key, image, &mut chain).await,
            Action::RunContainer {
                name,
                image,
                ports,
                recreate,
            } => {
                self.run_container(&key, name, image, *ports, *recreate, &mut chain)
                    .await
            }
            Action::DeployContent { container, content } => {
                self.deploy_content(container, content, &mut chain).await
            }
            Action::ReloadService {
                container,
                commands,
            } => {
                self.reload_service(&key, container, commands, &mut chain)
                    .await
            }
        };

        let attempts = chain.into_attempts();
        match outcome {
            Ok(applied) => {
                let mut result = ActionResult::succeeded(key, attempts);
                result.warnings = applied.warnings;
                result.content_hash = applied.content_hash;
                if result.is_degraded() {
                    warn!(
                        "{} succeeded after {} failed attempt(s)",
                        result.key,
                        result.failed_attempts()
                    );
                } else {
                    info!("{} succeeded", result.key);
                }
                result
            }
            Err(e) => {
                error!("{} failed: {}", key, e);
                ActionResult::failed(key, &e, attempts)
            }
        }
    }

    async fn install_package(
        &self,
        key: &IdempotencyKey,
        name: &str,
        chain: &mut StrategyChain,
    ) -> Result<Applied> {
        if chain
            .attempt("install", self.host.install_package(name))
            .await
            .is_some()
        {
            return Ok(Applied::default());
        }
        let refreshed = chain
            .attempt("refresh-and-install", async {
                self.host.refresh_package_index().await?;
                self.host.install_package(name).await
            })
            .await;
        match refreshed {
            Some(()) => Ok(Applied::default()),
            None => Err(exhausted(key, chain)),
        }
    }

    async fn start_daemon(
        &self,
        key: &IdempotencyKey,
        service: &str,
        chain: &mut StrategyChain,
    ) -> Result<Applied> {
        let mut started = false;
        for method in DaemonStart::ORDER {
            if chain
                .attempt(method.label(), self.host.start_daemon(service, method))
                .await
                .is_some()
            {
                started = true;
                break;
            }
        }
        if !started {
            return Err(exhausted(key, chain));
        }

        for attempt in 0..=self.daemon_retries {
            if attempt > 0 {
                tokio::time::sleep(self.daemon_retry_delay).await;
            }
            match tokio::time::timeout(self.call_timeout, self.runtime.ping()).await {
                Ok(Ok(DaemonStatus::Reachable)) => {
                    info!("Daemon {} is reachable", service);
                    return Ok(Applied::default());
                }
                Ok(Ok(status)) => warn!("Daemon {} not ready yet: {:?}", service, status),
                Ok(Err(e)) => warn!("Daemon {} probe failed: {}", service, e),
                Err(_) => warn!("Daemon {} probe timed out", service),
            }
        }
        Err(Error::EnvironmentUnavailable(format!(
            "daemon {} started but never became reachable ({} checks)",
            service,
            self.daemon_retries + 1
        )))
    }

    async fn pull_or_build(
        &self,
        key: &IdempotencyKey,
        image: &ImageSpec,
        chain: &mut StrategyChain,
    ) -> Result<Applied> {
        let reference = image.reference.as_str();

        let label = format!("pull:{}", reference);
        if chain.attempt(label, self.runtime.pull(reference)).await.is_some() {
            return Ok(Applied::default());
        }

        for fallback in &image.fallbacks {
            let label = format!("pull:{}", fallback);
            let pulled = chain
                .attempt(label, async {
                    self.runtime.pull(fallback).await?;
                    self.runtime.tag(fallback, reference).await
                })
                .await;
            if pulled.is_some() {
                info!("Tagged {} as {}", fallback, reference);
                return Ok(Applied::default());
            }
        }

        if let Some(archive) = &image.archive {
            let label = format!("load:{}", archive.display());
            if chain
                .attempt(label, self.load_archive(archive, reference))
                .await
                .is_some()
            {
                return Ok(Applied::default());
            }
        }

        Err(exhausted(key, chain))
    }

    async fn load_archive(
        &self,
        archive: &Path,
        reference: &str,
    ) -> std::result::Result<(), HostError> {
        self.runtime.load(archive).await?;
        if self.runtime.image_present(reference).await? {
            Ok(())
        } else {
            Err(HostError::Rejected(format!(
                "{} does not contain {}",
                archive.display(),
                reference
            )))
        }
    }

    async fn run_container(
        &self,
        key: &IdempotencyKey,
        name: &str,
        image: &str,
        ports: PortMapping,
        recreate: bool,
        chain: &mut StrategyChain,
    ) -> Result<Applied> {
        let spec = RunSpec {
            name: name.to_string(),
            image: image.to_string(),
            ports,
        };
        let state = self.inspect(name, self.runtime.container_state(name)).await?;
        let exists = state != ContainerState::Absent;

        // A plan made while the daemon was down could not see this port.
        let mut recreate = recreate;
        if exists && !recreate {
            let published = self
                .inspect(name, self.runtime.published_port(name, ports.container))
                .await?;
            if published != Some(ports.host) {
                info!(
                    "{} is published on {:?}, wanted {}; recreating",
                    name, published, ports.host
                );
                recreate = true;
            }
        }

        if exists && !recreate {
            if state == ContainerState::Running {
                return Ok(Applied::default());
            }
            if chain
                .attempt("start-existing", self.runtime.start(name))
                .await
                .is_some()
            {
                return Ok(Applied::default());
            }
        }

        let created = if exists {
            chain
                .attempt("remove-and-create", async {
                    self.runtime.remove(name).await?;
                    self.runtime.create(&spec).await
                })
                .await
        } else {
            chain.attempt("create", self.runtime.create(&spec)).await
        };
        match created {
            Some(()) => Ok(Applied::default()),
            None => Err(exhausted(key, chain)),
        }
    }

    async fn inspect<T>(
        &self,
        name: &str,
        query: impl std::future::Future<Output = std::result::Result<T, HostError>>,
    ) -> Result<T> {
        tokio::time::timeout(self.call_timeout, query)
            .await
            .map_err(|_| {
                Error::EnvironmentUnavailable(format!("inspecting {} timed out", name))
            })?
            .map_err(|e| Error::EnvironmentUnavailable(e.to_string()))
    }

    async fn deploy_content(
        &self,
        container: &str,
        content: &ContentSpec,
        chain: &mut StrategyChain,
    ) -> Result<Applied> {
        let target = ContainerTarget::new(self.runtime.clone(), container, content.root.clone());
        let deployment = self.deployer.deploy(content, &target, chain).await?;
        Ok(Applied {
            warnings: deployment.warnings,
            content_hash: Some(deployment.content_hash),
        })
    }

    async fn reload_service(
        &self,
        key: &IdempotencyKey,
        container: &str,
        commands: &[Vec<String>],
        chain: &mut StrategyChain,
    ) -> Result<Applied> {
        let mut reloaded = false;
        for argv in commands {
            let label = format!("reload:{}", argv.join(" "));
            let ran = chain
                .attempt(label, async {
                    let output = self.runtime.exec(container, argv).await?;
                    if output.success() {
                        Ok(())
                    } else {
                        Err(HostError::Exit {
                            program: argv.first().cloned().unwrap_or_default(),
                            code: output.code,
                            stderr: output.stderr.trim().to_string(),
                        })
                    }
                })
                .await;
            if ran.is_some() {
                reloaded = true;
                break;
            }
        }
        if !reloaded {
            return Err(exhausted(key, chain));
        }

        let mut applied = Applied::default();
        let target = ContainerTarget::new(self.runtime.clone(), container, "/");
        match target.read_marker().await? {
            Some(mut marker) => {
                marker.reloaded = true;
                target.write_marker(&marker).await?;
            }
            None => {
                let warning = format!("no deployment marker in {} to flag as reloaded", container);
                warn!("{}", warning);
                applied.warnings.push(warning);
            }
        }
        Ok(applied)
    }
}

fn exhausted(key: &IdempotencyKey, chain: &StrategyChain) -> Error {
    Error::StrategiesExhausted {
        action: key.to_string(),
        attempts: chain.attempts().len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provisor_core::{
        ActionStatus, AttemptOutcome, ContentMarker, ContentSource, ErrorKind, MARKER_PATH,
    };
    use provisor_host::{MockEnvironment, MockFetcher};

    struct Harness {
        _dir: tempfile::TempDir,
        env: MockEnvironment,
        executor: Executor,
    }

    fn harness(env: MockEnvironment) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = ProvisorConfig::for_testing(dir.path().join("data")).unwrap();
        let executor = Executor::new(
            Arc::new(env.clone()),
            Arc::new(env.clone()),
            Arc::new(MockFetcher::new()),
            &config,
        );
        Harness {
            _dir: dir,
            env,
            executor,
        }
    }

    fn ports() -> PortMapping {
        PortMapping {
            host: 8080,
            container: 80,
        }
    }

    fn labels(result: &ActionResult) -> Vec<&str> {
        result.attempts.iter().map(|a| a.strategy.as_str()).collect()
    }

    fn image(fallbacks: &[&str], archive: Option<&str>) -> Action {
        Action::PullOrBuildImage {
            image: ImageSpec {
                reference: "php:8.2-apache".into(),
                fallbacks: fallbacks.iter().map(|f| f.to_string()).collect(),
                archive: archive.map(Into::into),
            },
        }
    }

    fn run(recreate: bool) -> Action {
        Action::RunContainer {
            name: "lab-web".into(),
            image: "php:8.2-apache".into(),
            ports: ports(),
            recreate,
        }
    }

    fn running() -> MockEnvironment {
        MockEnvironment::new()
            .with_daemon_running()
            .with_image("php:8.2-apache")
            .with_container("lab-web", "php:8.2-apache", ports(), true)
    }

    #[tokio::test]
    async fn test_install_refreshes_index_on_failure() {
        let h = harness(MockEnvironment::new().with_stale_index_for("unzip"));
        let result = h
            .executor
            .apply(&Action::InstallPackage {
                name: "unzip".into(),
            })
            .await;
        assert_eq!(result.status, ActionStatus::Succeeded);
        assert_eq!(labels(&result), vec!["install", "refresh-and-install"]);
        assert!(result.is_degraded());
        assert!(h.env.is_installed("unzip"));
    }

    #[tokio::test]
    async fn test_install_exhausted() {
        let env = MockEnvironment::new();
        env.fail("install:unzip");
        let h = harness(env);
        let result = h
            .executor
            .apply(&Action::InstallPackage {
                name: "unzip".into(),
            })
            .await;
        assert!(matches!(
            result.status,
            ActionStatus::Failed {
                kind: ErrorKind::StrategiesExhausted,
                ..
            }
        ));
        assert_eq!(result.attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_daemon_falls_back_to_service() {
        let env = MockEnvironment::new()
            .with_package("docker.io")
            .with_start_methods(&[DaemonStart::Service]);
        let h = harness(env);
        let result = h
            .executor
            .apply(&Action::StartDaemon {
                service: "docker".into(),
            })
            .await;
        assert_eq!(result.status, ActionStatus::Succeeded);
        assert_eq!(labels(&result), vec!["systemctl", "service"]);
        assert!(h.env.daemon_running());
    }

    #[tokio::test]
    async fn test_daemon_never_reachable_is_environment_unavailable() {
        let env = MockEnvironment::new()
            .with_package("docker.io")
            .with_dead_daemon();
        let h = harness(env);
        let result = h
            .executor
            .apply(&Action::StartDaemon {
                service: "docker".into(),
            })
            .await;
        assert!(matches!(
            result.status,
            ActionStatus::Failed {
                kind: ErrorKind::EnvironmentUnavailable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_pull_falls_back_to_base_image_and_tags() {
        let env = MockEnvironment::new()
            .with_daemon_running()
            .with_registry_image("php:apache");
        let h = harness(env);
        let result = h
            .executor
            .apply(&image(&["php:8-apache", "php:apache"], None))
            .await;
        assert_eq!(result.status, ActionStatus::Succeeded);
        assert_eq!(
            labels(&result),
            vec!["pull:php:8.2-apache", "pull:php:8-apache", "pull:php:apache"]
        );
        assert!(h.env.has_image("php:8.2-apache"));
    }

    #[tokio::test]
    async fn test_pull_timeout_is_not_fatal() {
        let env = MockEnvironment::new()
            .with_daemon_running()
            .with_registry_image("php:apache");
        env.hang("pull:php:8.2-apache");
        let h = harness(env);
        let result = h.executor.apply(&image(&["php:apache"], None)).await;
        assert_eq!(result.status, ActionStatus::Succeeded);
        assert!(matches!(
            result.attempts[0].outcome,
            AttemptOutcome::TimedOut { .. }
        ));
    }

    #[tokio::test]
    async fn test_archive_is_last_resort() {
        let env = MockEnvironment::new()
            .with_daemon_running()
            .with_archive("/srv/php.tar", &["php:8.2-apache"]);
        let h = harness(env);
        let result = h
            .executor
            .apply(&image(&["php:apache"], Some("/srv/php.tar")))
            .await;
        assert_eq!(result.status, ActionStatus::Succeeded);
        assert_eq!(result.attempts.last().unwrap().strategy, "load:/srv/php.tar");
        assert!(h.env.has_image("php:8.2-apache"));
    }

    #[tokio::test]
    async fn test_archive_without_image_fails() {
        let env = MockEnvironment::new()
            .with_daemon_running()
            .with_archive("/srv/other.tar", &["nginx:latest"]);
        let h = harness(env);
        let result = h.executor.apply(&image(&[], Some("/srv/other.tar"))).await;
        assert!(result.is_failed());
    }

    #[tokio::test]
    async fn test_create_when_absent_is_not_degraded() {
        let env = MockEnvironment::new()
            .with_daemon_running()
            .with_image("php:8.2-apache");
        let h = harness(env);
        let result = h.executor.apply(&run(false)).await;
        assert_eq!(labels(&result), vec!["create"]);
        assert!(!result.is_degraded());
        let c = h.env.container("lab-web").unwrap();
        assert!(c.running);
        assert_eq!(c.ports.host, 8080);
    }

    #[tokio::test]
    async fn test_stopped_container_is_started() {
        let env = MockEnvironment::new()
            .with_daemon_running()
            .with_image("php:8.2-apache")
            .with_container("lab-web", "php:8.2-apache", ports(), false);
        let h = harness(env);
        let result = h.executor.apply(&run(false)).await;
        assert_eq!(labels(&result), vec!["start-existing"]);
        assert!(h.env.container("lab-web").unwrap().running);
    }

    #[tokio::test]
    async fn test_broken_container_is_recreated() {
        let env = MockEnvironment::new()
            .with_daemon_running()
            .with_image("php:8.2-apache")
            .with_container("lab-web", "php:8.2-apache", ports(), false);
        env.fail("start:lab-web");
        let h = harness(env);
        let result = h.executor.apply(&run(false)).await;
        assert_eq!(labels(&result), vec!["start-existing", "remove-and-create"]);
        assert!(result.is_degraded());
    }

    #[tokio::test]
    async fn test_recreate_replaces_port_mapping() {
        let env = MockEnvironment::new()
            .with_daemon_running()
            .with_image("php:8.2-apache")
            .with_container(
                "lab-web",
                "php:8.2-apache",
                PortMapping {
                    host: 9090,
                    container: 80,
                },
                true,
            );
        let h = harness(env);
        let result = h.executor.apply(&run(true)).await;
        assert_eq!(labels(&result), vec!["remove-and-create"]);
        assert_eq!(h.env.container("lab-web").unwrap().ports.host, 8080);
    }

    #[tokio::test]
    async fn test_stopped_container_on_wrong_port_is_recreated() {
        let env = MockEnvironment::new()
            .with_daemon_running()
            .with_image("php:8.2-apache")
            .with_container(
                "lab-web",
                "php:8.2-apache",
                PortMapping {
                    host: 9090,
                    container: 80,
                },
                false,
            );
        let h = harness(env);
        let result = h.executor.apply(&run(false)).await;
        assert_eq!(labels(&result), vec!["remove-and-create"]);
        let c = h.env.container("lab-web").unwrap();
        assert!(c.running);
        assert_eq!(c.ports.host, 8080);
    }

    #[tokio::test]
    async fn test_deploy_reports_hash() {
        let h = harness(running());
        let site = h._dir.path().join("site");
        std::fs::create_dir_all(&site).unwrap();
        std::fs::write(site.join("index.html"), "<h1>lab</h1>").unwrap();

        let result = h
            .executor
            .apply(&Action::DeployContent {
                container: "lab-web".into(),
                content: ContentSpec {
                    source: ContentSource {
                        local: Some(site.clone()),
                        remote: None,
                        sha256: None,
                    },
                    root: "/var/www/html".into(),
                    owner: Some("www-data:www-data".into()),
                },
            })
            .await;
        assert_eq!(result.status, ActionStatus::Succeeded);
        assert_eq!(
            result.content_hash.as_deref(),
            Some(provisor_content::tree_hash(&site).unwrap().as_str())
        );
    }

    #[tokio::test]
    async fn test_unresolved_content_fails_action() {
        let h = harness(running());
        let result = h
            .executor
            .apply(&Action::DeployContent {
                container: "lab-web".into(),
                content: ContentSpec {
                    source: ContentSource {
                        local: Some("/nonexistent/site.zip".into()),
                        remote: None,
                        sha256: None,
                    },
                    root: "/var/www/html".into(),
                    owner: None,
                },
            })
            .await;
        assert!(matches!(
            result.status,
            ActionStatus::Failed {
                kind: ErrorKind::ContentUnresolved,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_reload_falls_back_and_flags_marker() {
        let env = running();
        env.write_file("lab-web", MARKER_PATH, &ContentMarker::new("h", "f").to_json())
            .await
            .unwrap();
        env.fail("exec:lab-web:apache2ctl");
        let h = harness(env);

        let result = h
            .executor
            .apply(&Action::ReloadService {
                container: "lab-web".into(),
                commands: vec![
                    vec!["apache2ctl".into(), "-k".into(), "graceful".into()],
                    vec!["service".into(), "apache2".into(), "reload".into()],
                ],
            })
            .await;
        assert_eq!(result.status, ActionStatus::Succeeded);
        assert_eq!(
            labels(&result),
            vec!["reload:apache2ctl -k graceful", "reload:service apache2 reload"]
        );

        let raw = h.env.read_file("lab-web", MARKER_PATH).await.unwrap().unwrap();
        assert!(ContentMarker::parse(&raw).unwrap().reloaded);
    }
}
