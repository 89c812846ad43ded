//! Health gate for staging containers.
//!
//! One inspection maps to one `HealthState`; the async driver in the
//! engine client loops inspect, evaluate, sleep until a verdict or the
//! deadline. Containers without a healthcheck pass after staying in the
//! `running` state for a continuous grace period.

use std::time::Duration;

use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum, HealthStatusEnum};

/// How long a container without a healthcheck must stay running before it
/// counts as healthy.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Not running yet, no healthcheck defined.
    Starting,
    /// Running, no healthcheck defined; grace timer applies.
    Running,
    /// Healthcheck defined, no verdict from the engine yet.
    HealthStarting,
    Healthy,
    Unhealthy,
    Exited,
    /// The container disappeared between polls.
    Gone,
}

/// Classify one inspection snapshot.
pub fn observe(inspect: &ContainerInspectResponse) -> HealthState {
    let status = inspect.state.as_ref().and_then(|s| s.status);
    if matches!(
        status,
        Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD)
    ) {
        return HealthState::Exited;
    }
    let has_healthcheck = inspect
        .config
        .as_ref()
        .and_then(|c| c.healthcheck.as_ref())
        .and_then(|h| h.test.as_ref())
        .is_some_and(|test| !test.is_empty());
    if has_healthcheck {
        let health = inspect
            .state
            .as_ref()
            .and_then(|s| s.health.as_ref())
            .and_then(|h| h.status);
        match health {
            Some(HealthStatusEnum::HEALTHY) => HealthState::Healthy,
            Some(HealthStatusEnum::UNHEALTHY) => HealthState::Unhealthy,
            _ => HealthState::HealthStarting,
        }
    } else if status == Some(ContainerStateStatusEnum::RUNNING) {
        HealthState::Running
    } else {
        HealthState::Starting
    }
}
