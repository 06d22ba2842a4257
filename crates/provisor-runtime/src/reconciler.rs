//! Reconciler — one run of probe → plan → execute.

use std::sync::Arc;
use std::time::Duration;

use provisor_core::{
    Action, ActionKind, ActionResult, ActionStatus, ContainerState, DesiredState, Error,
    ObservedState, ProvisorConfig, Result,
};
use provisor_exec::Executor;
use provisor_host::{ArtifactFetcher, ContainerRuntime, DaemonStatus, HostSystem};
use provisor_probe::Probe;
use tracing::{debug, error, info, warn};

use crate::journal::RunJournal;
use crate::types::*;

pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    probe: Probe,
    executor: Executor,
    journal: RunJournal,
    cancel: CancelToken,
    call_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        host: Arc<dyn HostSystem>,
        fetcher: Arc<dyn ArtifactFetcher>,
        config: &ProvisorConfig,
    ) -> Self {
        Self {
            probe: Probe::new(runtime.clone(), host.clone(), config),
            executor: Executor::new(runtime.clone(), host, fetcher, config),
            journal: RunJournal::new(&config.data_paths.run_log),
            cancel: CancelToken::new(),
            call_timeout: config.call_timeout,
            runtime,
        }
    }

    /// Handle that stops the run at the next action boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn journal(&self) -> &RunJournal {
        &self.journal
    }

    /// Current state, read-only.
    pub async fn observe(&self, desired: &DesiredState) -> Result<ObservedState> {
        self.probe.observe(desired).await
    }

    /// Actions a run would apply right now, without applying them.
    pub async fn plan(&self, desired: &DesiredState) -> Result<Vec<Action>> {
        let observed = self.probe.observe(desired).await?;
        Ok(provisor_plan::plan(desired, &observed))
    }

    /// Drive the environment to `desired`.
    ///
    /// Steps that are already satisfied are reported as skipped. The run stops
    /// at the first failed action; whatever succeeded before it stays in place
    /// for the next run to build on.
    pub async fn reconcile(&self, desired: &DesiredState) -> FinalState {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = chrono::Utc::now().to_rfc3339();
        info!("Run {} for container {}", run_id, desired.container.name);

        let mut run = Run {
            id: run_id,
            phase: RunPhase::Unprovisioned,
            results: Vec::new(),
        };

        run.advance(RunPhase::Probing);
        let observed = match self.probe.observe(desired).await {
            Ok(o) => o,
            Err(e) => return self.finish(run, started_at, None, Some(RunError::from(&e))),
        };

        run.advance(RunPhase::Planning);
        let planned = provisor_plan::plan(desired, &observed);
        info!("{} action(s) planned", planned.len());
        for action in &planned {
            debug!("  {}", action);
        }

        run.advance(RunPhase::Executing);
        let mut planned = planned.into_iter().peekable();
        let mut content_hash = observed.deployed_content_hash().map(str::to_string);

        for step in provisor_plan::full_sequence(desired) {
            let action = match planned.next_if(|p| p.key() == step.key()) {
                Some(action) => action,
                None => {
                    let result = ActionResult::skipped(step.key());
                    self.record(&run.id, &result);
                    run.results.push(result);
                    continue;
                }
            };

            if self.cancel.is_cancelled() {
                warn!("Run {} cancelled before {}", run.id, action.key());
                let err = RunError::from(&Error::Cancelled);
                return self.finish(run, started_at, content_hash, Some(err));
            }

            let result = self.executor.apply(&action).await;
            self.record(&run.id, &result);
            if action.kind() == ActionKind::DeployContent && result.content_hash.is_some() {
                content_hash = result.content_hash.clone();
            }

            let failure = match &result.status {
                ActionStatus::Failed { kind, reason } => Some(RunError {
                    kind: *kind,
                    message: format!("{}: {}", result.key, reason),
                }),
                _ => None,
            };
            run.results.push(result);

            if failure.is_some() {
                return self.finish(run, started_at, content_hash, failure);
            }
        }

        self.finish(run, started_at, content_hash, None)
    }

    /// Stop the container if it is running. Returns whether anything was stopped.
    pub async fn stop(&self, desired: &DesiredState) -> Result<bool> {
        let name = &desired.container.name;
        let status = self.timed(self.runtime.ping()).await?;
        if status != DaemonStatus::Reachable {
            info!("Daemon not reachable; nothing to stop");
            return Ok(false);
        }
        match self.timed(self.runtime.container_state(name)).await? {
            ContainerState::Running => {
                self.timed(self.runtime.stop(name)).await?;
                info!("Stopped container {}", name);
                Ok(true)
            }
            state => {
                info!("Container {} is {:?}; nothing to stop", name, state);
                Ok(false)
            }
        }
    }

    async fn timed<T>(
        &self,
        fut: impl std::future::Future<Output = std::result::Result<T, provisor_host::HostError>>,
    ) -> Result<T> {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| Error::EnvironmentUnavailable("container runtime did not answer".into()))?
            .map_err(|e| Error::EnvironmentUnavailable(e.to_string()))
    }

    fn record(&self, run_id: &str, result: &ActionResult) {
        if let Err(e) = self.journal.append(run_id, result) {
            warn!("Failed to journal {}: {}", result.key, e);
        }
    }

    fn finish(
        &self,
        mut run: Run,
        started_at: String,
        content_hash: Option<String>,
        error: Option<RunError>,
    ) -> FinalState {
        match &error {
            Some(e) => {
                error!("Run {} failed: {} ({})", run.id, e.message, e.kind);
                run.advance(RunPhase::Failed);
            }
            None => {
                run.advance(RunPhase::Deployed);
                info!(
                    "Run {} deployed: {} applied, {} skipped",
                    run.id,
                    run.results.iter().filter(|r| !r.is_skipped()).count(),
                    run.results.iter().filter(|r| r.is_skipped()).count()
                );
            }
        }

        let warnings = run
            .results
            .iter()
            .flat_map(|r| r.warnings.iter().cloned())
            .collect();

        FinalState {
            run_id: run.id,
            phase: run.phase,
            results: run.results,
            content_hash,
            error,
            warnings,
            started_at,
            finished_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// In-flight run bookkeeping.
struct Run {
    id: String,
    phase: RunPhase,
    results: Vec<ActionResult>,
}

impl Run {
    fn advance(&mut self, next: RunPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "invalid phase change {:?} -> {:?}",
            self.phase,
            next
        );
        debug!("Run {}: {:?} -> {:?}", self.id, self.phase, next);
        self.phase = next;
    }
}
