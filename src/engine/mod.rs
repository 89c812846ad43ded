//! Container engine client.
//!
//! `ContainerEngine` is the narrow surface the detector, the replacement
//! engine and the orchestrator run against; `DockerEngine` implements it
//! with bollard over the local socket or a configured endpoint. Every
//! operation races the cycle's cancellation token so a shutdown never
//! waits on a slow engine call.

pub mod health;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, RemoveImageOptions};
use bollard::models::{
    ContainerConfig, ContainerInspectResponse, ContainerSummary, EndpointSettings, HostConfig,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::credentials::CredentialStore;
use crate::image::{registry_parts, ImageRef};
use crate::version::UpdateStrategy;

use self::health::HealthState;

/// Label carrying the per-container update strategy.
pub const STRATEGY_LABEL: &str = "relay.update";
/// Label overriding the global healthcheck timeout, in seconds.
pub const HEALTHCHECK_TIMEOUT_LABEL: &str = "relay.healthcheck.timeout";

const STOP_TIMEOUT_SECS: i64 = 10;
const FORCE_STOP_TIMEOUT_SECS: i64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine API error: {0}")]
    Api(#[from] bollard::errors::Error),
    #[error("container {0} has no configuration in its inspect response")]
    MissingConfig(String),
    #[error("no local digest for {0} after pull")]
    MissingDigest(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

/// One workload selected for monitoring. Built from a listing, immutable
/// for the rest of the cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredContainer {
    pub id: String,
    pub name: String,
    pub image_reference: String,
    pub image_digest: String,
    pub labels: HashMap<String, String>,
}

impl MonitoredContainer {
    /// Listings occasionally carry half-populated entries (e.g. while a
    /// container is being removed); those are not monitorable.
    fn from_summary(summary: ContainerSummary) -> Option<Self> {
        let id = summary.id.filter(|v| !v.is_empty())?;
        let name = summary
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|name| name.trim_start_matches('/').to_string())
            .filter(|name| !name.is_empty())?;
        let image_reference = summary.image.filter(|v| !v.is_empty())?;
        let image_digest = summary.image_id.filter(|v| !v.is_empty())?;
        Some(Self {
            id,
            name,
            image_reference,
            image_digest,
            labels: summary.labels.unwrap_or_default(),
        })
    }

    pub fn repository(&self) -> String {
        ImageRef::parse(&self.image_reference).repository
    }

    pub fn tag(&self) -> String {
        ImageRef::parse(&self.image_reference).tag
    }

    pub fn strategy(&self) -> UpdateStrategy {
        UpdateStrategy::from_label(self.labels.get(STRATEGY_LABEL).map(String::as_str))
    }

    /// Zero, negative or non-integer label values are ignored.
    pub fn healthcheck_timeout_override(&self) -> Option<Duration> {
        self.labels
            .get(HEALTHCHECK_TIMEOUT_LABEL)
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
    }
}

/// The full configuration of an inspected container, cloneable so the
/// replacement engine can derive variants without touching the original.
#[derive(Debug, Clone, Default)]
pub struct ContainerSnapshot {
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    pub networks: HashMap<String, EndpointSettings>,
}

/// Operations the update core needs from the container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Running containers carrying `<enable_label_key>=true`.
    async fn list_monitored(
        &self,
        enable_label_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<MonitoredContainer>, EngineError>;

    async fn inspect(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<ContainerSnapshot, EngineError>;

    /// Pull the reference and return the resulting local image digest.
    async fn pull(
        &self,
        image_reference: &str,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError>;

    async fn local_image_digest(
        &self,
        image_reference: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, EngineError>;

    async fn create_and_start(
        &self,
        name: &str,
        config: ContainerConfig,
        host_config: HostConfig,
        networks: HashMap<String, EndpointSettings>,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError>;

    /// Same as `create_and_start`; the caller passes a host config with
    /// port bindings stripped so the staging probe never collides with the
    /// original's published ports.
    async fn create_staging_and_start(
        &self,
        staging_name: &str,
        config: ContainerConfig,
        host_config: HostConfig,
        networks: HashMap<String, EndpointSettings>,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError>;

    /// Graceful stop with a bounded kill timeout.
    async fn stop(&self, id: &str, cancel: &CancellationToken) -> Result<(), EngineError>;

    /// Remove a stopped container, keeping anonymous volumes.
    async fn remove(&self, id: &str, cancel: &CancellationToken) -> Result<(), EngineError>;

    /// Best-effort stop then forced remove; "not found" is not an error.
    async fn force_remove(&self, id: &str, cancel: &CancellationToken)
        -> Result<(), EngineError>;

    /// Poll the container until the health gate reaches a verdict or the
    /// deadline passes. `Ok(false)` covers unhealthy, exited, vanished and
    /// timed out.
    async fn wait_healthy(
        &self,
        id: &str,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool, EngineError>;

    /// Remove an image by digest; "in use" is not an error.
    async fn remove_image(&self, digest: &str, cancel: &CancellationToken)
        -> Result<(), EngineError>;
}

pub struct DockerEngine {
    docker: Docker,
    credentials: Arc<CredentialStore>,
}

impl DockerEngine {
    pub fn connect(
        config: &AgentConfig,
        credentials: Arc<CredentialStore>,
    ) -> Result<Self, EngineError> {
        let timeout = config.engine_timeout.as_secs();
        let docker = match config.engine_host.as_deref() {
            None => Docker::connect_with_local_defaults()?,
            Some(host)
                if host.starts_with("tcp://")
                    || host.starts_with("http://")
                    || host.starts_with("https://") =>
            {
                Docker::connect_with_http(host, timeout, API_DEFAULT_VERSION)?
            }
            Some(host) => Docker::connect_with_unix(host, timeout, API_DEFAULT_VERSION)?,
        };
        Ok(Self {
            docker,
            credentials,
        })
    }

    async fn create_and_start_inner(
        &self,
        name: &str,
        config: ContainerConfig,
        host_config: HostConfig,
        networks: HashMap<String, EndpointSettings>,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let mut create: Config<String> = config.into();
        create.host_config = Some(host_config);
        create.networking_config = Some(NetworkingConfig {
            endpoints_config: networks,
        });
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let created = race(cancel, self.docker.create_container(Some(options), create)).await?;
        race(
            cancel,
            self.docker
                .start_container(&created.id, None::<StartContainerOptions<String>>),
        )
        .await?;
        Ok(created.id)
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list_monitored(
        &self,
        enable_label_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<MonitoredContainer>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("status".to_string(), vec!["running".to_string()]);
        filters.insert(
            "label".to_string(),
            vec![format!("{enable_label_key}=true")],
        );
        let options = ListContainersOptions::<String> {
            filters,
            ..Default::default()
        };
        let summaries = race(cancel, self.docker.list_containers(Some(options))).await?;
        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            match MonitoredContainer::from_summary(summary) {
                Some(container) => containers.push(container),
                None => log::warn!("Skipping a monitored container with incomplete listing data"),
            }
        }
        Ok(containers)
    }

    async fn inspect(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<ContainerSnapshot, EngineError> {
        let response = race(
            cancel,
            self.docker
                .inspect_container(id, None::<InspectContainerOptions>),
        )
        .await?;
        snapshot_from_inspect(id, response)
    }

    async fn pull(
        &self,
        image_reference: &str,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let image = ImageRef::parse(image_reference);
        let (host, _) = registry_parts(&image.repository);
        let creds = self.credentials.lookup(&host);
        let auth = creds.has_credentials().then(|| DockerCredentials {
            username: creds.username.clone(),
            password: creds.password.clone(),
            serveraddress: Some(host),
            ..Default::default()
        });
        let options = CreateImageOptions {
            from_image: image.repository.clone(),
            tag: image.tag.clone(),
            ..Default::default()
        };
        log::debug!("Pulling {image_reference}");
        let mut progress = self.docker.create_image(Some(options), None, auth);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                item = progress.next() => match item {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                }
            }
        }
        self.local_image_digest(image_reference, cancel)
            .await?
            .ok_or_else(|| EngineError::MissingDigest(image_reference.to_string()))
    }

    async fn local_image_digest(
        &self,
        image_reference: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, EngineError> {
        match race(cancel, self.docker.inspect_image(image_reference)).await {
            Ok(image) => Ok(image.id),
            Err(EngineError::Api(e)) if status_error(&e, 404) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_and_start(
        &self,
        name: &str,
        config: ContainerConfig,
        host_config: HostConfig,
        networks: HashMap<String, EndpointSettings>,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        log::info!("Creating container {name}");
        self.create_and_start_inner(name, config, host_config, networks, cancel)
            .await
    }

    async fn create_staging_and_start(
        &self,
        staging_name: &str,
        config: ContainerConfig,
        host_config: HostConfig,
        networks: HashMap<String, EndpointSettings>,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        log::info!("Creating staging container {staging_name}");
        self.create_and_start_inner(staging_name, config, host_config, networks, cancel)
            .await
    }

    async fn stop(&self, id: &str, cancel: &CancellationToken) -> Result<(), EngineError> {
        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        race(cancel, self.docker.stop_container(id, Some(options))).await
    }

    async fn remove(&self, id: &str, cancel: &CancellationToken) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: false,
            v: false,
            link: false,
        };
        race(cancel, self.docker.remove_container(id, Some(options))).await
    }

    async fn force_remove(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let stop = StopContainerOptions {
            t: FORCE_STOP_TIMEOUT_SECS,
        };
        if let Err(e) = race(cancel, self.docker.stop_container(id, Some(stop))).await {
            if e.is_cancelled() {
                return Err(e);
            }
            log::debug!("Best-effort stop of {id} failed: {e}");
        }
        let remove = RemoveContainerOptions {
            force: true,
            v: false,
            link: false,
        };
        match race(cancel, self.docker.remove_container(id, Some(remove))).await {
            Ok(()) => Ok(()),
            Err(EngineError::Api(e)) if status_error(&e, 404) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn wait_healthy(
        &self,
        id: &str,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool, EngineError> {
        let deadline = Instant::now() + timeout;
        let mut grace_start: Option<Instant> = None;
        loop {
            let state = match race(
                cancel,
                self.docker
                    .inspect_container(id, None::<InspectContainerOptions>),
            )
            .await
            {
                Ok(inspect) => health::observe(&inspect),
                Err(EngineError::Api(e)) if status_error(&e, 404) => HealthState::Gone,
                Err(e) => return Err(e),
            };
            match state {
                HealthState::Healthy => return Ok(true),
                HealthState::Unhealthy | HealthState::Exited | HealthState::Gone => {
                    log::warn!("Container {id} failed the health gate: {state:?}");
                    return Ok(false);
                }
                HealthState::Running => {
                    let since = *grace_start.get_or_insert_with(Instant::now);
                    if since.elapsed() >= health::GRACE_PERIOD {
                        return Ok(true);
                    }
                }
                HealthState::Starting | HealthState::HealthStarting => grace_start = None,
            }
            if Instant::now() >= deadline {
                log::warn!("Timed out waiting for container {id} to become healthy");
                return Ok(false);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    async fn remove_image(
        &self,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let options = RemoveImageOptions {
            force: false,
            noprune: false,
        };
        match race(cancel, self.docker.remove_image(digest, Some(options), None)).await {
            Ok(_) => Ok(()),
            Err(EngineError::Api(e)) if status_error(&e, 409) => {
                log::debug!("Image {digest} is still in use, keeping it");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn snapshot_from_inspect(
    id: &str,
    response: ContainerInspectResponse,
) -> Result<ContainerSnapshot, EngineError> {
    let config = response
        .config
        .ok_or_else(|| EngineError::MissingConfig(id.to_string()))?;
    Ok(ContainerSnapshot {
        config,
        host_config: response.host_config.unwrap_or_default(),
        networks: response
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default(),
    })
}

/// Race an engine call against cancellation.
async fn race<T, F>(cancel: &CancellationToken, operation: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, bollard::errors::Error>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        result = operation => result.map_err(EngineError::from),
    }
}

fn status_error(error: &bollard::errors::Error, status: u16) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError { status_code, .. }
            if *status_code == status
    )
}
