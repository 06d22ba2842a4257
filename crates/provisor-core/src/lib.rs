//! Provisor Core — desired/observed state model, actions, errors, configuration.

pub mod action;
pub mod config;
pub mod desired;
pub mod error;
pub mod observed;

pub use action::{
    Action, ActionKind, ActionResult, ActionStatus, AttemptOutcome, IdempotencyKey,
    StrategyAttempt,
};
pub use config::{DataPaths, ProvisorConfig};
pub use desired::{
    ContainerSpec, ContentSource, ContentSpec, DaemonSpec, DesiredState, ImageSpec, PortMapping,
    RemoteSource, ServiceSpec,
};
pub use error::{Error, ErrorKind, Result, Severity};
pub use observed::{ContainerState, ContentMarker, ObservedState, MARKER_PATH};
