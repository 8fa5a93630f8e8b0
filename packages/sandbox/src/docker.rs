// ABOUTME: Docker-backed substrate implementation using bollard
// ABOUTME: Owns image pulls, the private bridge network, container lifecycle, and raw log retrieval

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::models::HostConfig;
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use tracing::{debug, info};

use crate::logs::encode_frame;
use crate::substrate::{Result, Sandbox, SandboxSpec, SandboxState, Substrate, SubstrateError};

const PROJECT_LABEL: &str = "project";
const PROJECT_NAME: &str = "penguinwhisk";
const MANAGED_LABEL: &str = "managed";
const INVOKER_LABEL: &str = "invoker";
const RUNTIME_LABEL: &str = "penguinwhisk.runtime";

/// How long `start` polls inspection before giving up.
const START_DEADLINE: Duration = Duration::from_secs(30);
const START_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Resource defaults applied when a spec does not override them.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub memory_mb: i64,
    pub cpu_shares: i64,
}

/// Docker-backed [`Substrate`].
pub struct DockerSubstrate {
    docker: Docker,
    network_name: String,
    container_prefix: String,
    invoker_id: String,
    limits: ResourceLimits,
}

impl DockerSubstrate {
    /// Connect to the daemon at `host` and verify it responds.
    pub async fn connect(
        host: &str,
        network_name: &str,
        container_prefix: &str,
        invoker_id: &str,
        limits: ResourceLimits,
    ) -> Result<Self> {
        let docker = if host.starts_with("unix://") {
            Docker::connect_with_socket(host, 120, API_DEFAULT_VERSION)
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_socket_defaults()
        }
        .map_err(|e| SubstrateError::Unavailable(e.to_string()))?;

        docker
            .ping()
            .await
            .map_err(|e| SubstrateError::Unavailable(e.to_string()))?;

        info!(network = %network_name, prefix = %container_prefix, "connected to Docker daemon");

        Ok(Self {
            docker,
            network_name: network_name.to_string(),
            container_prefix: container_prefix.to_string(),
            invoker_id: invoker_id.to_string(),
            limits,
        })
    }

    fn labels(&self) -> HashMap<String, String> {
        HashMap::from([
            (PROJECT_LABEL.to_string(), PROJECT_NAME.to_string()),
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (INVOKER_LABEL.to_string(), self.invoker_id.clone()),
        ])
    }

    async fn pull_image_if_needed(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => {
                debug!(image = %image, "image already present");
                return Ok(());
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => {
                return Err(SubstrateError::ImagePull {
                    image: image.to_string(),
                    reason: e.to_string(),
                })
            }
        }

        info!(image = %image, "pulling image");

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(|e| SubstrateError::ImagePull {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
            if let Some(error) = info.error {
                return Err(SubstrateError::ImagePull {
                    image: image.to_string(),
                    reason: error,
                });
            }
        }

        info!(image = %image, "image pulled");
        Ok(())
    }

    fn state_from_str(state: &str) -> SandboxState {
        match state {
            "created" => SandboxState::Created,
            "running" => SandboxState::Running,
            "removing" => SandboxState::Removed,
            _ => SandboxState::Stopped,
        }
    }
}

#[async_trait]
impl Substrate for DockerSubstrate {
    async fn ensure_network(&self) -> Result<()> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![self.network_name.clone()]);

        let existing = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await
            .map_err(|e| SubstrateError::Network(e.to_string()))?;

        if !existing.is_empty() {
            debug!(network = %self.network_name, "network already exists");
            return Ok(());
        }

        let options = CreateNetworkOptions {
            name: self.network_name.clone(),
            driver: "bridge".to_string(),
            attachable: true,
            labels: self.labels(),
            ..Default::default()
        };

        self.docker
            .create_network(options)
            .await
            .map_err(|e| SubstrateError::Network(e.to_string()))?;

        info!(network = %self.network_name, "created bridge network");
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<Sandbox> {
        self.pull_image_if_needed(&spec.image).await?;

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let memory = if spec.memory_bytes > 0 {
            spec.memory_bytes
        } else {
            self.limits.memory_mb * 1024 * 1024
        };

        let host_config = HostConfig {
            memory: Some(memory),
            cpu_shares: Some(self.limits.cpu_shares),
            network_mode: Some(self.network_name.clone()),
            auto_remove: Some(false),
            ..Default::default()
        };

        let mut labels = self.labels();
        labels.insert(RUNTIME_LABEL.to_string(), spec.image.clone());

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports: Some(HashMap::from([(
                "8080/tcp".to_string(),
                HashMap::new(),
            )])),
            labels: Some(labels),
            stop_timeout: Some(spec.stop_timeout.as_secs() as i64),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = format!(
            "{}-{}",
            self.container_prefix,
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| SubstrateError::Create(e.to_string()))?;

        info!(id = %short_id(&response.id), name = %name, image = %spec.image, "sandbox created");

        Ok(Sandbox {
            id: response.id,
            addr: String::new(),
            state: SandboxState::Created,
            runtime_kind: spec.image.clone(),
            created_at: Utc::now(),
        })
    }

    async fn start(&self, id: &str) -> Result<String> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SubstrateError::Start {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        let deadline = tokio::time::Instant::now() + START_DEADLINE;
        loop {
            let inspect = self
                .docker
                .inspect_container(id, None)
                .await
                .map_err(|e| SubstrateError::Inspect {
                    id: id.to_string(),
                    reason: e.to_string(),
                })?;

            let running = inspect
                .state
                .as_ref()
                .and_then(|s| s.running)
                .unwrap_or(false);

            if running {
                let addr = inspect
                    .network_settings
                    .and_then(|ns| ns.networks)
                    .and_then(|mut nets| nets.remove(&self.network_name))
                    .and_then(|ep| ep.ip_address)
                    .filter(|ip| !ip.is_empty())
                    .ok_or_else(|| SubstrateError::Start {
                        id: id.to_string(),
                        reason: format!("no address on network {}", self.network_name),
                    })?;

                info!(id = %short_id(id), addr = %addr, "sandbox started");
                return Ok(addr);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(SubstrateError::StartTimeout(id.to_string(), START_DEADLINE));
            }
            tokio::time::sleep(START_POLL_INTERVAL).await;
        }
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(id = %short_id(id), "sandbox already stopped");
                Ok(())
            }
            Err(e) => Err(SubstrateError::Stop {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => {
                info!(id = %short_id(id), "sandbox removed");
                Ok(())
            }
            // Already removed.
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(id = %short_id(id), "sandbox already removed");
                Ok(())
            }
            Err(e) => Err(SubstrateError::Remove {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn raw_logs(&self, id: &str, since: DateTime<Utc>) -> Result<Vec<u8>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            // The daemon filter is second-granular; the collector drops any
            // earlier lines by their embedded timestamps.
            since: since.timestamp(),
            timestamps: true,
            follow: false,
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut raw = Vec::new();

        // bollard hands back demultiplexed chunks; re-encode them into the
        // daemon's frame format so the collector owns the single parser.
        while let Some(chunk) = stream.next().await {
            let output = chunk.map_err(|e| SubstrateError::Logs(e.to_string()))?;
            match output {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    encode_frame(1, &message, &mut raw);
                }
                LogOutput::StdErr { message } => {
                    encode_frame(2, &message, &mut raw);
                }
                LogOutput::StdIn { .. } => {}
            }
        }

        Ok(raw)
    }

    async fn list_sandboxes(&self, extra: &HashMap<String, String>) -> Result<Vec<Sandbox>> {
        let mut label_filters = vec![
            format!("{}={}", PROJECT_LABEL, PROJECT_NAME),
            format!("{}={}", INVOKER_LABEL, self.invoker_id),
        ];
        for (k, v) in extra {
            label_filters.push(format!("{}={}", k, v));
        }

        let mut filters = HashMap::new();
        filters.insert("label".to_string(), label_filters);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| SubstrateError::Unavailable(e.to_string()))?;

        let mut sandboxes = Vec::with_capacity(containers.len());
        for c in containers {
            let Some(id) = c.id else { continue };

            let addr = c
                .network_settings
                .and_then(|ns| ns.networks)
                .and_then(|mut nets| nets.remove(&self.network_name))
                .and_then(|ep| ep.ip_address)
                .unwrap_or_default();

            sandboxes.push(Sandbox {
                id,
                addr,
                state: Self::state_from_str(c.state.as_deref().unwrap_or("")),
                runtime_kind: c
                    .labels
                    .and_then(|mut l| l.remove(RUNTIME_LABEL))
                    .unwrap_or_else(|| c.image.unwrap_or_default()),
                created_at: Utc
                    .timestamp_opt(c.created.unwrap_or_default(), 0)
                    .single()
                    .unwrap_or_else(Utc::now),
            });
        }

        Ok(sandboxes)
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}
