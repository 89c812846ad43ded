//! Rolling and legacy container replacement.
//!
//! Rolling mode proves the new image with an unpublished staging container
//! behind the health gate before the original is touched. Legacy mode is
//! the plain stop-remove-recreate sequence. Both preserve the inspected
//! configuration verbatim apart from the image reference.

use std::collections::HashMap;

use bollard::models::{EndpointSettings, HostConfig};
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::detector::UpdatePlan;
use crate::engine::{ContainerEngine, EngineError, MonitoredContainer};

/// Suffix appended to the original name for the staging probe.
pub const STAGING_SUFFIX: &str = "-relay-staging";

pub struct Replacer<'a> {
    engine: &'a dyn ContainerEngine,
    config: &'a AgentConfig,
}

impl<'a> Replacer<'a> {
    pub fn new(engine: &'a dyn ContainerEngine, config: &'a AgentConfig) -> Self {
        Self { engine, config }
    }

    /// Replace `container` with one running the plan's image. `Ok(success)`;
    /// the only error that escapes is cancellation.
    pub async fn execute(
        &self,
        container: &MonitoredContainer,
        plan: &UpdatePlan,
        cancel: &CancellationToken,
    ) -> Result<bool, EngineError> {
        if self.config.rolling_update {
            self.rolling(container, plan, cancel).await
        } else {
            self.legacy(container, plan, cancel).await
        }
    }

    async fn rolling(
        &self,
        container: &MonitoredContainer,
        plan: &UpdatePlan,
        cancel: &CancellationToken,
    ) -> Result<bool, EngineError> {
        let snapshot = match self.engine.inspect(&container.id, cancel).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                log::error!("Failed to inspect container {}: {e}", container.name);
                return Ok(false);
            }
        };

        let mut new_config = snapshot.config.clone();
        new_config.image = Some(plan.new_image_reference.clone());

        let staging_name = format!("{}{STAGING_SUFFIX}", container.name);
        let timeout = container
            .healthcheck_timeout_override()
            .unwrap_or(self.config.healthcheck_timeout);

        let staging_id = match self
            .engine
            .create_staging_and_start(
                &staging_name,
                new_config.clone(),
                staging_host_config(&snapshot.host_config),
                fresh_endpoints(&snapshot.networks),
                cancel,
            )
            .await
        {
            Ok(id) => id,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                log::error!(
                    "Failed to start staging container {staging_name} for {}: {e}",
                    container.name
                );
                return Ok(false);
            }
        };

        let healthy = match self
            .engine
            .wait_healthy(&staging_id, timeout, self.config.healthcheck_interval, cancel)
            .await
        {
            Ok(healthy) => healthy,
            Err(e) if e.is_cancelled() => {
                // The original is still running; only the probe needs
                // cleaning before the cancellation propagates.
                self.discard_staging(&staging_id).await;
                return Err(e);
            }
            Err(e) => {
                log::error!("Health wait for {staging_name} failed: {e}");
                self.discard_staging(&staging_id).await;
                return Ok(false);
            }
        };

        if !healthy {
            log::warn!(
                "Staging container for {} did not become healthy, keeping the old container",
                container.name
            );
            self.discard_staging(&staging_id).await;
            return Ok(false);
        }

        // Switchover. From here on the original is going away; failures
        // below leave no running workload and are only logged.
        if let Err(e) = self.engine.stop(&container.id, cancel).await {
            if e.is_cancelled() {
                self.discard_staging(&staging_id).await;
                return Err(e);
            }
            log::error!("Failed to stop container {}: {e}", container.name);
            self.discard_staging(&staging_id).await;
            return Ok(false);
        }
        if let Err(e) = self.engine.remove(&container.id, cancel).await {
            if e.is_cancelled() {
                return Err(e);
            }
            log::error!(
                "Container {} is stopped but could not be removed: {e}",
                container.name
            );
            self.discard_staging(&staging_id).await;
            return Ok(false);
        }

        // The probe served its purpose; the replacement gets the original
        // name and the original port bindings.
        match self.engine.force_remove(&staging_id, cancel).await {
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => log::warn!("Failed to remove staging container {staging_name}: {e}"),
            Ok(()) => {}
        }

        match self
            .engine
            .create_and_start(
                &container.name,
                new_config,
                snapshot.host_config.clone(),
                fresh_endpoints(&snapshot.networks),
                cancel,
            )
            .await
        {
            Ok(_) => {
                log::info!(
                    "Replaced container {} with image {}",
                    container.name,
                    plan.new_image_reference
                );
                self.cleanup_image(container).await;
                Ok(true)
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                log::error!(
                    "Container {} ({}) was removed but the replacement failed to start: {e}",
                    container.name,
                    container.id
                );
                Ok(false)
            }
        }
    }

    async fn legacy(
        &self,
        container: &MonitoredContainer,
        plan: &UpdatePlan,
        cancel: &CancellationToken,
    ) -> Result<bool, EngineError> {
        let snapshot = match self.engine.inspect(&container.id, cancel).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                log::error!("Failed to inspect container {}: {e}", container.name);
                return Ok(false);
            }
        };
        let mut new_config = snapshot.config.clone();
        new_config.image = Some(plan.new_image_reference.clone());

        if let Err(e) = self.engine.stop(&container.id, cancel).await {
            if e.is_cancelled() {
                return Err(e);
            }
            log::error!("Failed to stop container {}: {e}", container.name);
            return Ok(false);
        }
        if let Err(e) = self.engine.remove(&container.id, cancel).await {
            if e.is_cancelled() {
                return Err(e);
            }
            log::error!("Failed to remove container {}: {e}", container.name);
            return Ok(false);
        }
        match self
            .engine
            .create_and_start(
                &container.name,
                new_config,
                snapshot.host_config.clone(),
                snapshot.networks.clone(),
                cancel,
            )
            .await
        {
            Ok(_) => {
                log::info!(
                    "Recreated container {} with image {}",
                    container.name,
                    plan.new_image_reference
                );
                self.cleanup_image(container).await;
                Ok(true)
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                log::error!(
                    "Container {} ({}) was removed but the replacement failed to start: {e}",
                    container.name,
                    container.id
                );
                Ok(false)
            }
        }
    }

    /// Remove the staging probe with a fresh token so cleanup still runs
    /// when the cycle's token is already cancelled.
    async fn discard_staging(&self, staging_id: &str) {
        let cleanup = CancellationToken::new();
        if let Err(e) = self.engine.force_remove(staging_id, &cleanup).await {
            log::warn!("Failed to remove staging container {staging_id}: {e}");
        }
    }

    async fn cleanup_image(&self, container: &MonitoredContainer) {
        if !self.config.cleanup_images {
            return;
        }
        let cleanup = CancellationToken::new();
        if let Err(e) = self
            .engine
            .remove_image(&container.image_digest, &cleanup)
            .await
        {
            log::warn!("Failed to remove old image {}: {e}", container.image_digest);
        }
    }
}

/// Endpoint settings for a fresh container on the same networks: keep
/// aliases, network id, driver options, links and requested IPAM config;
/// drop the addresses the engine assigned to the old container.
fn fresh_endpoints(
    networks: &HashMap<String, EndpointSettings>,
) -> HashMap<String, EndpointSettings> {
    networks
        .iter()
        .map(|(name, endpoint)| {
            (
                name.clone(),
                EndpointSettings {
                    ipam_config: endpoint.ipam_config.clone(),
                    links: endpoint.links.clone(),
                    aliases: endpoint.aliases.clone(),
                    network_id: endpoint.network_id.clone(),
                    driver_opts: endpoint.driver_opts.clone(),
                    ..Default::default()
                },
            )
        })
        .collect()
}

/// The probe keeps every host-config field except the two that publish
/// ports; binding them would collide with the still-running original.
fn staging_host_config(original: &HostConfig) -> HostConfig {
    let mut host_config = original.clone();
    host_config.port_bindings = None;
    host_config.publish_all_ports = Some(false);
    host_config
}
