//! Update detection for monitored containers.
//!
//! Version strategies consult the registry's tag list and fall back to a
//! digest probe when it yields nothing; the digest strategy re-pulls the
//! current reference and compares image digests. Everything except
//! cancellation is folded into a `CheckOutcome` so the orchestrator never
//! sees a raw engine error.

use tokio_util::sync::CancellationToken;

use crate::engine::{ContainerEngine, EngineError, MonitoredContainer};
use crate::registry::TagSource;
use crate::version::find_newest;

/// A replacement plan produced by the detector. The new image has already
/// been pulled when the plan is handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePlan {
    pub current_digest: String,
    pub new_digest: String,
    pub new_image_reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    NoUpdate {
        current_digest: String,
    },
    UpdateFound(UpdatePlan),
    Failed {
        current_digest: String,
        reason: String,
    },
}

pub struct Detector<'a> {
    engine: &'a dyn ContainerEngine,
    registry: &'a dyn TagSource,
}

impl<'a> Detector<'a> {
    pub fn new(engine: &'a dyn ContainerEngine, registry: &'a dyn TagSource) -> Self {
        Self { engine, registry }
    }

    /// Decide whether `container` has an available update. The only error
    /// that escapes is cancellation; every other failure becomes
    /// `CheckOutcome::Failed`.
    pub async fn check(
        &self,
        container: &MonitoredContainer,
        cancel: &CancellationToken,
    ) -> Result<CheckOutcome, EngineError> {
        let strategy = container.strategy();
        if strategy.requires_registry_query() {
            let tags = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                tags = self.registry.tags(&container.image_reference) => tags,
            };
            if tags.is_empty() {
                log::debug!(
                    "No tags listed for {}, falling back to a digest probe",
                    container.image_reference
                );
            } else if let Some(newest) = find_newest(
                &container.tag(),
                tags.iter().map(String::as_str),
                strategy,
            ) {
                let new_reference = format!("{}:{}", container.repository(), newest);
                return self.pull_candidate(container, &new_reference, cancel).await;
            }
        }
        self.check_digest(container, cancel).await
    }

    /// Pull the strategy-selected reference and plan the switch to it.
    async fn pull_candidate(
        &self,
        container: &MonitoredContainer,
        new_reference: &str,
        cancel: &CancellationToken,
    ) -> Result<CheckOutcome, EngineError> {
        log::info!(
            "Container {} can move from {} to {new_reference}",
            container.name,
            container.image_reference
        );
        match self.engine.pull(new_reference, cancel).await {
            Ok(new_digest) if digest_eq(&new_digest, &container.image_digest) => {
                // A retagged build of the image we already run.
                Ok(CheckOutcome::NoUpdate {
                    current_digest: container.image_digest.clone(),
                })
            }
            Ok(new_digest) => Ok(CheckOutcome::UpdateFound(UpdatePlan {
                current_digest: container.image_digest.clone(),
                new_digest,
                new_image_reference: new_reference.to_string(),
            })),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => Ok(failed(container, e)),
        }
    }

    /// Digest path: re-pull the current reference and compare.
    async fn check_digest(
        &self,
        container: &MonitoredContainer,
        cancel: &CancellationToken,
    ) -> Result<CheckOutcome, EngineError> {
        match self.engine.pull(&container.image_reference, cancel).await {
            Ok(latest_digest) if digest_eq(&latest_digest, &container.image_digest) => {
                Ok(CheckOutcome::NoUpdate {
                    current_digest: container.image_digest.clone(),
                })
            }
            Ok(latest_digest) => Ok(CheckOutcome::UpdateFound(UpdatePlan {
                current_digest: container.image_digest.clone(),
                new_digest: latest_digest,
                new_image_reference: container.image_reference.clone(),
            })),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => Ok(failed(container, e)),
        }
    }
}

fn digest_eq(left: &str, right: &str) -> bool {
    left.eq_ignore_ascii_case(right)
}

fn failed(container: &MonitoredContainer, error: EngineError) -> CheckOutcome {
    CheckOutcome::Failed {
        current_digest: container.image_digest.clone(),
        reason: format!("Failed to pull image: {error}"),
    }
}
