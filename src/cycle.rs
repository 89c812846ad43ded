//! One sequential pass over all monitored containers.

use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::detector::{CheckOutcome, Detector};
use crate::engine::ContainerEngine;
use crate::registry::TagSource;
use crate::replace::Replacer;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleCounters {
    pub checked: u32,
    pub updated: u32,
    pub failed: u32,
}

/// Run one check cycle: enumerate monitored containers and, per container,
/// detect and apply updates. Never fails; a cancelled cycle returns the
/// counters accumulated so far.
pub async fn run_cycle(
    engine: &dyn ContainerEngine,
    registry: &dyn TagSource,
    config: &AgentConfig,
    cancel: &CancellationToken,
) -> CycleCounters {
    let mut counters = CycleCounters::default();

    let containers = match engine.list_monitored(&config.enable_label, cancel).await {
        Ok(containers) => containers,
        Err(e) => {
            log::error!("Failed to list monitored containers: {e}");
            return counters;
        }
    };
    if containers.is_empty() {
        log::info!("No containers with label {}=true found", config.enable_label);
        return counters;
    }

    let detector = Detector::new(engine, registry);
    let replacer = Replacer::new(engine, config);

    for container in &containers {
        if cancel.is_cancelled() {
            log::warn!("Check cycle cancelled");
            break;
        }
        counters.checked += 1;
        log::debug!(
            "Checking container {} ({})",
            container.name,
            container.image_reference
        );

        let outcome = match detector.check(container, cancel).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => {
                log::warn!("Check cycle cancelled");
                break;
            }
            Err(e) => {
                log::error!("Check of container {} failed: {e}", container.name);
                counters.failed += 1;
                continue;
            }
        };

        match outcome {
            CheckOutcome::NoUpdate { .. } => {
                log::debug!("Container {} is up to date", container.name);
            }
            CheckOutcome::Failed { reason, .. } => {
                log::warn!("Check of container {} failed: {reason}", container.name);
                counters.failed += 1;
            }
            CheckOutcome::UpdateFound(plan) => {
                log::info!(
                    "Update available for {}: {} -> {}",
                    container.name,
                    container.image_reference,
                    plan.new_image_reference
                );
                match replacer.execute(container, &plan, cancel).await {
                    Ok(true) => counters.updated += 1,
                    Ok(false) => counters.failed += 1,
                    Err(e) if e.is_cancelled() => {
                        log::warn!("Check cycle cancelled during replacement");
                        break;
                    }
                    Err(e) => {
                        log::error!("Replacement of {} failed: {e}", container.name);
                        counters.failed += 1;
                    }
                }
            }
        }
    }

    log::info!(
        "Cycle finished: {} checked, {} updated, {} failed",
        counters.checked,
        counters.updated,
        counters.failed
    );
    counters
}
