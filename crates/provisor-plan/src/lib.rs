//! Planner — turns the gap between desired and observed state into an
//! ordered list of actions.
//!
//! Pure and deterministic: no I/O, no clock, no randomness. Steps the
//! observed state already satisfies are left out of the plan entirely.

use provisor_core::{Action, ContainerState, DesiredState, ObservedState};
use tracing::debug;

/// Ordered actions that take `observed` to `desired`.
///
/// Order always follows the dependency chain: packages, daemon, image,
/// container, content, reload.
pub fn plan(desired: &DesiredState, observed: &ObservedState) -> Vec<Action> {
    let mut actions = Vec::new();

    for pkg in desired.unique_packages() {
        if !observed.package_installed(pkg) {
            actions.push(Action::InstallPackage { name: pkg.into() });
        }
    }

    if !observed.daemon_reachable {
        actions.push(Action::StartDaemon {
            service: desired.daemon.service.clone(),
        });
    }

    if !observed.image_present {
        actions.push(Action::PullOrBuildImage {
            image: desired.image.clone(),
        });
    }

    let ports = desired.container.ports;
    let port_wrong = observed.container_exists() && observed.host_port != Some(ports.host);
    let run_needed = match observed.container {
        ContainerState::Absent | ContainerState::Stopped => true,
        ContainerState::Running => port_wrong,
    };
    if run_needed {
        actions.push(Action::RunContainer {
            name: desired.container.name.clone(),
            image: desired.image.reference.clone(),
            ports,
            recreate: port_wrong,
        });
    }

    let deploy_needed = run_needed || content_stale(desired, observed);
    if deploy_needed {
        actions.push(Action::DeployContent {
            container: desired.container.name.clone(),
            content: desired.content.clone(),
        });
    }

    let reload_pending = observed.content.as_ref().is_some_and(|m| !m.reloaded);
    if deploy_needed || reload_pending {
        actions.push(Action::ReloadService {
            container: desired.container.name.clone(),
            commands: desired.service.reload.clone(),
        });
    }

    debug!("Planned {} action(s)", actions.len());
    actions
}

/// Every step of the chain, as if nothing were satisfied yet.
pub fn full_sequence(desired: &DesiredState) -> Vec<Action> {
    plan(desired, &ObservedState::empty())
}

fn content_stale(desired: &DesiredState, observed: &ObservedState) -> bool {
    let Some(marker) = &observed.content else {
        return true;
    };
    let fingerprint = desired
        .content
        .source
        .fingerprint(observed.local_artifact.as_deref());
    if marker.source_fingerprint != fingerprint {
        return true;
    }
    match &desired.content.source.sha256 {
        Some(pin) => !pin.eq_ignore_ascii_case(&marker.content_hash),
        None => false,
    }
}
