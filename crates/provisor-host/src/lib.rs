//! Host collaborators — container runtime, package manager, artifact fetch.
//!
//! Each collaborator is a trait with a real implementation that shells out
//! (docker, apt-get, systemctl) or talks HTTP, plus an in-memory mock used by
//! the test suites of every downstream crate. `StrategyChain` runs ordered
//! fallback strategies with a bounded timeout per attempt.

pub mod command;
pub mod fetch;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod runtime;
pub mod strategy;
pub mod system;

pub use command::{CommandOutput, HostCommand, HostError};
pub use fetch::{ArtifactFetcher, FetchError, HttpFetcher};
#[cfg(any(test, feature = "mock"))]
pub use mock::{MockContainer, MockEnvironment, MockFetcher, MockResponse};
pub use runtime::{ContainerRuntime, DaemonStatus, DockerCli, RunSpec};
pub use strategy::StrategyChain;
pub use system::{AptHost, DaemonStart, HostSystem};
