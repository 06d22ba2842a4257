//! Actions derived from a state diff, and the results of applying them.

use serde::{Deserialize, Serialize};

use crate::desired::{ContentSpec, ImageSpec, PortMapping};
use crate::error::{Error, ErrorKind};

/// Kind of change an action performs, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    InstallPackage,
    StartDaemon,
    PullOrBuildImage,
    RunContainer,
    DeployContent,
    ReloadService,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InstallPackage => write!(f, "install-package"),
            Self::StartDaemon => write!(f, "start-daemon"),
            Self::PullOrBuildImage => write!(f, "pull-or-build-image"),
            Self::RunContainer => write!(f, "run-container"),
            Self::DeployContent => write!(f, "deploy-content"),
            Self::ReloadService => write!(f, "reload-service"),
        }
    }
}

/// Identity of an action: applying two actions with the same key has the
/// same effect as applying one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub kind: ActionKind,
    pub target: String,
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.target)
    }
}

/// A single idempotent unit of change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Action {
    InstallPackage {
        name: String,
    },
    StartDaemon {
        service: String,
    },
    PullOrBuildImage {
        image: ImageSpec,
    },
    RunContainer {
        name: String,
        image: String,
        ports: PortMapping,
        /// Remove the existing container first (its port mapping is wrong).
        recreate: bool,
    },
    DeployContent {
        container: String,
        content: ContentSpec,
    },
    ReloadService {
        container: String,
        commands: Vec<Vec<String>>,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::InstallPackage { .. } => ActionKind::InstallPackage,
            Self::StartDaemon { .. } => ActionKind::StartDaemon,
            Self::PullOrBuildImage { .. } => ActionKind::PullOrBuildImage,
            Self::RunContainer { .. } => ActionKind::RunContainer,
            Self::DeployContent { .. } => ActionKind::DeployContent,
            Self::ReloadService { .. } => ActionKind::ReloadService,
        }
    }

    pub fn key(&self) -> IdempotencyKey {
        let target = match self {
            Self::InstallPackage { name } => name.clone(),
            Self::StartDaemon { service } => service.clone(),
            Self::PullOrBuildImage { image } => image.reference.clone(),
            Self::RunContainer { name, .. } => name.clone(),
            Self::DeployContent { container, .. } => container.clone(),
            Self::ReloadService { container, .. } => container.clone(),
        };
        IdempotencyKey {
            kind: self.kind(),
            target,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RunContainer {
                name,
                ports,
                recreate: true,
                ..
            } => write!(f, "run-container:{name} (recreate, {}:{})", ports.host, ports.container),
            Self::RunContainer { name, ports, .. } => {
                write!(f, "run-container:{name} ({}:{})", ports.host, ports.container)
            }
            other => write!(f, "{}", other.key()),
        }
    }
}

/// How one strategy attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { reason: String },
    #[serde(rename_all = "camelCase")]
    TimedOut { after_ms: u64 },
}

/// One strategy tried while applying an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyAttempt {
    pub strategy: String,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

impl StrategyAttempt {
    pub fn succeeded(&self) -> bool {
        self.outcome == AttemptOutcome::Succeeded
    }
}

/// Final status of an action within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ActionStatus {
    Succeeded,
    /// Already satisfied; the planner omitted it.
    Skipped,
    Failed { kind: ErrorKind, reason: String },
}

/// Outcome of applying (or skipping) one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub key: IdempotencyKey,
    #[serde(flatten)]
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<StrategyAttempt>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl ActionResult {
    pub fn skipped(key: IdempotencyKey) -> Self {
        Self {
            key,
            status: ActionStatus::Skipped,
            attempts: Vec::new(),
            warnings: Vec::new(),
            content_hash: None,
        }
    }

    pub fn succeeded(key: IdempotencyKey, attempts: Vec<StrategyAttempt>) -> Self {
        Self {
            key,
            status: ActionStatus::Succeeded,
            attempts,
            warnings: Vec::new(),
            content_hash: None,
        }
    }

    pub fn failed(key: IdempotencyKey, error: &Error, attempts: Vec<StrategyAttempt>) -> Self {
        Self {
            key,
            status: ActionStatus::Failed {
                kind: error.kind(),
                reason: error.to_string(),
            },
            attempts,
            warnings: Vec::new(),
            content_hash: None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.status == ActionStatus::Skipped
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, ActionStatus::Failed { .. })
    }

    /// Succeeded, but only after at least one strategy failed or timed out.
    pub fn is_degraded(&self) -> bool {
        self.status == ActionStatus::Succeeded && self.attempts.iter().any(|a| !a.succeeded())
    }

    pub fn failed_attempts(&self) -> usize {
        self.attempts.iter().filter(|a| !a.succeeded()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_action(recreate: bool) -> Action {
        Action::RunContainer {
            name: "lab-web".into(),
            image: "php:8.2-apache".into(),
            ports: PortMapping {
                host: 8080,
                container: 80,
            },
            recreate,
        }
    }

    #[test]
    fn test_key_ignores_payload() {
        assert_eq!(run_action(false).key(), run_action(true).key());
        assert_eq!(run_action(false).key().to_string(), "run-container:lab-web");
    }

    #[test]
    fn test_kind_order_is_dependency_order() {
        assert!(ActionKind::InstallPackage < ActionKind::StartDaemon);
        assert!(ActionKind::StartDaemon < ActionKind::PullOrBuildImage);
        assert!(ActionKind::PullOrBuildImage < ActionKind::RunContainer);
        assert!(ActionKind::RunContainer < ActionKind::DeployContent);
        assert!(ActionKind::DeployContent < ActionKind::ReloadService);
    }

    #[test]
    fn test_degraded_detection() {
        let key = run_action(false).key();
        let result = ActionResult::succeeded(
            key,
            vec![
                StrategyAttempt {
                    strategy: "start-existing".into(),
                    outcome: AttemptOutcome::Failed {
                        reason: "no such container".into(),
                    },
                },
                StrategyAttempt {
                    strategy: "create".into(),
                    outcome: AttemptOutcome::Succeeded,
                },
            ],
        );
        assert!(result.is_degraded());
        assert_eq!(result.failed_attempts(), 1);
    }

    #[test]
    fn test_result_json_shape() {
        let result = ActionResult::failed(
            IdempotencyKey {
                kind: ActionKind::DeployContent,
                target: "lab-web".into(),
            },
            &Error::ContentUnresolved { attempts: 2 },
            vec![StrategyAttempt {
                strategy: "remote:main".into(),
                outcome: AttemptOutcome::TimedOut { after_ms: 500 },
            }],
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "contentUnresolved");
        assert_eq!(json["key"]["kind"], "deployContent");
        assert_eq!(json["attempts"][0]["outcome"], "timedOut");
        assert_eq!(json["attempts"][0]["afterMs"], 500);
    }
}
