//! Runtime types.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use provisor_core::{ActionResult, Error, ErrorKind};
use serde::Serialize;

/// Phase of a single provisioning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Unprovisioned,
    Probing,
    Planning,
    Executing,
    /// Every planned action succeeded.
    Deployed,
    /// Terminal for the run; nothing is rolled back.
    Failed,
}

impl RunPhase {
    pub fn can_transition_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (self, next),
            (Unprovisioned, Probing)
                | (Probing, Planning)
                | (Probing, Failed)
                | (Planning, Executing)
                | (Planning, Failed)
                | (Executing, Deployed)
                | (Executing, Failed)
        )
    }
}

/// Process exit classification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitClass {
    Success,
    /// Deployed, but something needed a fallback or raised a warning.
    Partial,
    Failure,
}

impl ExitClass {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Partial => 2,
        }
    }
}

/// Error that ended a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for RunError {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Outcome of `reconcile`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalState {
    pub run_id: String,
    pub phase: RunPhase,
    pub results: Vec<ActionResult>,
    /// Hash of the content now in the target, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub warnings: Vec<String>,
    pub started_at: String,
    pub finished_at: String,
}

impl FinalState {
    pub fn is_deployed(&self) -> bool {
        self.phase == RunPhase::Deployed
    }

    pub fn executed(&self) -> usize {
        self.results.iter().filter(|r| !r.is_skipped()).count()
    }

    pub fn skipped(&self) -> usize {
        self.results.iter().filter(|r| r.is_skipped()).count()
    }

    pub fn exit_class(&self) -> ExitClass {
        if self.phase != RunPhase::Deployed {
            ExitClass::Failure
        } else if !self.warnings.is_empty() || self.results.iter().any(ActionResult::is_degraded) {
            ExitClass::Partial
        } else {
            ExitClass::Success
        }
    }
}

/// Cooperative cancellation flag, checked between actions.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
