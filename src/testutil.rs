//! Scriptable engine and registry doubles shared by the component tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bollard::models::{
    ContainerConfig, EndpointSettings, HostConfig, PortBinding, RestartPolicy,
    RestartPolicyNameEnum,
};
use tokio_util::sync::CancellationToken;

use crate::detector::UpdatePlan;
use crate::engine::{ContainerEngine, ContainerSnapshot, EngineError, MonitoredContainer};
use crate::registry::TagSource;

pub fn monitored(
    id: &str,
    name: &str,
    image_reference: &str,
    image_digest: &str,
    labels: &[(&str, &str)],
) -> MonitoredContainer {
    MonitoredContainer {
        id: id.to_string(),
        name: name.to_string(),
        image_reference: image_reference.to_string(),
        image_digest: image_digest.to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

pub fn plan(current: &str, new: &str, reference: &str) -> UpdatePlan {
    UpdatePlan {
        current_digest: current.to_string(),
        new_digest: new.to_string(),
        new_image_reference: reference.to_string(),
    }
}

/// A snapshot that exercises the interesting host-config fields: published
/// ports, binds, a memory limit, a restart policy and a named network.
pub fn snapshot_with_ports() -> ContainerSnapshot {
    let mut port_bindings = HashMap::new();
    port_bindings.insert(
        "80/tcp".to_string(),
        Some(vec![PortBinding {
            host_ip: None,
            host_port: Some("8080".to_string()),
        }]),
    );
    let mut networks = HashMap::new();
    networks.insert(
        "bridge".to_string(),
        EndpointSettings {
            network_id: Some("net-bridge".to_string()),
            ip_address: Some("172.17.0.2".to_string()),
            ..Default::default()
        },
    );
    ContainerSnapshot {
        config: ContainerConfig {
            image: Some("nginx:latest".to_string()),
            env: Some(vec!["TZ=UTC".to_string()]),
            labels: Some(HashMap::from([(
                "relay.enable".to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        },
        host_config: HostConfig {
            port_bindings: Some(port_bindings),
            publish_all_ports: Some(false),
            binds: Some(vec!["/srv/data:/data".to_string()]),
            memory: Some(512 * 1024 * 1024),
            network_mode: Some("bridge".to_string()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        },
        networks,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    List,
    Inspect(String),
    Pull(String),
    CreateStaging { name: String },
    Create { name: String },
    Stop(String),
    Remove(String),
    ForceRemove(String),
    WaitHealthy(String),
    RemoveImage(String),
}

#[derive(Debug, Clone)]
pub struct CreateRecord {
    pub name: String,
    pub staging: bool,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    pub networks: HashMap<String, EndpointSettings>,
}

fn engine_failure(message: &str) -> EngineError {
    EngineError::Api(bollard::errors::Error::DockerResponseServerError {
        status_code: 500,
        message: message.to_string(),
    })
}

#[derive(Default)]
pub struct MockEngine {
    containers: Vec<MonitoredContainer>,
    snapshots: HashMap<String, ContainerSnapshot>,
    pulls: HashMap<String, Result<String, String>>,
    healthy: bool,
    listing_fails: bool,
    cancel_on_wait: bool,
    token: CancellationToken,
    calls: Mutex<Vec<EngineCall>>,
    created: Mutex<Vec<CreateRecord>>,
    counter: Mutex<u32>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_container(mut self, container: MonitoredContainer) -> Self {
        self.containers.push(container);
        self
    }

    pub fn with_snapshot(mut self, id: &str, snapshot: ContainerSnapshot) -> Self {
        self.snapshots.insert(id.to_string(), snapshot);
        self
    }

    pub fn with_pull(mut self, reference: &str, result: Result<&str, &str>) -> Self {
        self.pulls.insert(
            reference.to_string(),
            result.map(str::to_string).map_err(str::to_string),
        );
        self
    }

    pub fn with_healthy(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    pub fn fail_listing(mut self) -> Self {
        self.listing_fails = true;
        self
    }

    /// Cancel the engine's token when `wait_healthy` is first reached,
    /// simulating a shutdown arriving mid-replacement.
    pub fn cancel_on_wait_healthy(mut self) -> Self {
        self.cancel_on_wait = true;
        self
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().expect("Poisoned mutex").clone()
    }

    pub fn created(&self) -> Vec<CreateRecord> {
        self.created.lock().expect("Poisoned mutex").clone()
    }

    /// References pulled, in call order.
    pub fn pulled(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::Pull(reference) => Some(reference),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().expect("Poisoned mutex").push(call);
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut counter = self.counter.lock().expect("Poisoned mutex");
        *counter += 1;
        format!("{prefix}-{}", *counter)
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn list_monitored(
        &self,
        _enable_label_key: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<MonitoredContainer>, EngineError> {
        self.record(EngineCall::List);
        if self.listing_fails {
            return Err(engine_failure("listing failed"));
        }
        Ok(self.containers.clone())
    }

    async fn inspect(
        &self,
        id: &str,
        _cancel: &CancellationToken,
    ) -> Result<ContainerSnapshot, EngineError> {
        self.record(EngineCall::Inspect(id.to_string()));
        Ok(self.snapshots.get(id).cloned().unwrap_or_default())
    }

    async fn pull(
        &self,
        image_reference: &str,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        self.record(EngineCall::Pull(image_reference.to_string()));
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match self.pulls.get(image_reference) {
            Some(Ok(digest)) => Ok(digest.clone()),
            Some(Err(message)) => Err(engine_failure(message)),
            None => Err(engine_failure("pull not scripted")),
        }
    }

    async fn local_image_digest(
        &self,
        image_reference: &str,
        _cancel: &CancellationToken,
    ) -> Result<Option<String>, EngineError> {
        Ok(self
            .pulls
            .get(image_reference)
            .and_then(|result| result.as_ref().ok())
            .cloned())
    }

    async fn create_and_start(
        &self,
        name: &str,
        config: ContainerConfig,
        host_config: HostConfig,
        networks: HashMap<String, EndpointSettings>,
        _cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        self.record(EngineCall::Create {
            name: name.to_string(),
        });
        self.created.lock().expect("Poisoned mutex").push(CreateRecord {
            name: name.to_string(),
            staging: false,
            config,
            host_config,
            networks,
        });
        Ok(self.next_id("new"))
    }

    async fn create_staging_and_start(
        &self,
        staging_name: &str,
        config: ContainerConfig,
        host_config: HostConfig,
        networks: HashMap<String, EndpointSettings>,
        _cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        self.record(EngineCall::CreateStaging {
            name: staging_name.to_string(),
        });
        self.created.lock().expect("Poisoned mutex").push(CreateRecord {
            name: staging_name.to_string(),
            staging: true,
            config,
            host_config,
            networks,
        });
        Ok(self.next_id("staging"))
    }

    async fn stop(&self, id: &str, _cancel: &CancellationToken) -> Result<(), EngineError> {
        self.record(EngineCall::Stop(id.to_string()));
        Ok(())
    }

    async fn remove(&self, id: &str, _cancel: &CancellationToken) -> Result<(), EngineError> {
        self.record(EngineCall::Remove(id.to_string()));
        Ok(())
    }

    async fn force_remove(
        &self,
        id: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::ForceRemove(id.to_string()));
        Ok(())
    }

    async fn wait_healthy(
        &self,
        id: &str,
        _timeout: Duration,
        _poll_interval: Duration,
        _cancel: &CancellationToken,
    ) -> Result<bool, EngineError> {
        self.record(EngineCall::WaitHealthy(id.to_string()));
        if self.cancel_on_wait {
            self.token.cancel();
            return Err(EngineError::Cancelled);
        }
        Ok(self.healthy)
    }

    async fn remove_image(
        &self,
        digest: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::RemoveImage(digest.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockRegistry {
    tags: HashMap<String, Vec<String>>,
    queries: Mutex<Vec<String>>,
}

impl MockRegistry {
    pub fn with_tags(image_reference: &str, tags: &[&str]) -> Self {
        let mut registry = Self::default();
        registry.tags.insert(
            image_reference.to_string(),
            tags.iter().map(|t| t.to_string()).collect(),
        );
        registry
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().expect("Poisoned mutex").clone()
    }
}

#[async_trait]
impl TagSource for MockRegistry {
    async fn tags(&self, image_reference: &str) -> Vec<String> {
        self.queries
            .lock()
            .expect("Poisoned mutex")
            .push(image_reference.to_string());
        self.tags.get(image_reference).cloned().unwrap_or_default()
    }
}
