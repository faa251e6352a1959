//! Docker implementation of the container engine
//!
//! This is the only module that knows Docker's wire types and error texts;
//! everything it returns is translated into [`EngineError`] and
//! [`ContainerInfo`].

use crate::engine::{ContainerInfo, ContainerParams, Engine, EngineError};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::ImportImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, PortMap};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use hyper::body::Bytes;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Seconds Docker waits between SIGTERM and SIGKILL on stop
const STOP_GRACE_SECS: i64 = 10;

/// Container engine backed by a Docker daemon
pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Connect to the Docker daemon and make sure `network` exists
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(docker_host: Option<&str>, network: &str) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host)
                .map_err(|e| anyhow::anyhow!("Failed to connect to Docker at '{}': {}", host, e))?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!("Failed to connect to Docker via DOCKER_HOST='{}': {}", host, e)
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                e
            )
        })?;
        debug!("Connected to Docker daemon");

        let engine = Self { client };
        engine.ensure_network(network).await?;
        Ok(engine)
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let socket_paths = [
            "/var/run/docker.sock".to_string(),
            format!("{}/.docker/run/docker.sock", home),
            format!("{}/.colima/default/docker.sock", home),
        ];

        for path in socket_paths.iter().filter(|p| Path::new(p).exists()) {
            if let Ok(client) = Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                if client.ping().await.is_ok() {
                    debug!(path, "Using Docker socket");
                    return Ok(client);
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon: {}. \
                 Set DOCKER_HOST or engine.docker_host in the configuration.",
                e
            )
        })
    }

    /// Create the bridge network if it does not exist yet
    async fn ensure_network(&self, network: &str) -> anyhow::Result<()> {
        match self.client.inspect_network::<String>(network, None).await {
            Ok(_) => {
                debug!(network, "Network already exists");
                return Ok(());
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(e.into()),
        }

        info!(network, "Creating Docker network");
        self.client
            .create_network(CreateNetworkOptions {
                name: network,
                driver: "bridge",
                ..Default::default()
            })
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create Docker network '{}': {}", network, e))?;
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInspectResponse, EngineError> {
        self.client
            .inspect_container(container_id, None)
            .await
            .map_err(|e| map_error(e, container_id))
    }

    /// Resolve the ID behind an image reference
    async fn image_id(&self, reference: &str) -> Result<String, EngineError> {
        let image = self
            .client
            .inspect_image(reference)
            .await
            .map_err(|e| map_error(e, reference))?;
        Ok(image.id.unwrap_or_default())
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn import_image(&self, archive: &Path) -> Result<String, EngineError> {
        let contents = tokio::fs::read(archive).await.map_err(|e| {
            EngineError::Api(format!("cannot read image archive {}: {}", archive.display(), e))
        })?;

        let mut stream = self.client.import_image(
            ImportImageOptions { quiet: true },
            Bytes::from(contents),
            None,
        );

        let mut loaded: Option<LoadedImage> = None;
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| EngineError::Api(format!("image load failed: {}", e)))?;
            if let Some(error) = info.error {
                return Err(EngineError::Api(format!("image load failed: {}", error)));
            }
            if let Some(line) = info.stream.as_deref() {
                debug!(line = line.trim_end(), "Image load progress");
                if let Some(image) = parse_loaded_image(line) {
                    loaded = Some(image);
                }
            }
        }

        match loaded {
            Some(LoadedImage::Id(id)) => Ok(id),
            Some(LoadedImage::Reference(reference)) => self.image_id(&reference).await,
            None => Ok(String::new()),
        }
    }

    async fn create_container(&self, params: &ContainerParams) -> Result<String, EngineError> {
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(params.port.clone(), HashMap::new());

        let host_config = HostConfig {
            network_mode: Some(params.network.clone()),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(params.image.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            labels: Some(params.labels.clone()),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: params.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 409,
                    ref message,
                } => match parse_name_conflict(message) {
                    Some(container_id) => EngineError::NameConflict {
                        name: params.name.clone(),
                        container_id,
                    },
                    None => EngineError::Api(message.clone()),
                },
                other => map_error(other, &params.image),
            })?;

        for warning in &response.warnings {
            warn!(container_name = %params.name, warning, "Docker create warning");
        }
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), EngineError> {
        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_error(e, container_id))
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), EngineError> {
        let options = StopContainerOptions { t: STOP_GRACE_SECS };
        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id, "Container was already stopped");
                Ok(())
            }
            Err(e) => Err(map_error(e, container_id)),
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.client
            .remove_container(container_id, Some(options))
            .await
            .map_err(|e| map_error(e, container_id))
    }

    async fn container_info(&self, container_id: &str) -> Result<ContainerInfo, EngineError> {
        let inspect = self.inspect(container_id).await?;
        Ok(container_info_from_inspect(inspect))
    }

    async fn container_logs(&self, container_id: &str, tail: usize) -> Result<String, EngineError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.logs(container_id, Some(options));
        let mut output = String::new();
        while let Some(result) = stream.next().await {
            match result.map_err(|e| map_error(e, container_id))? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(output)
    }

    async fn find_container(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("name".to_string(), vec![name.to_string()])]),
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| map_error(e, name))?;

        // The name filter matches substrings; keep the exact match only.
        let wanted = format!("/{}", name);
        let id = containers.into_iter().find_map(|c| {
            let exact = c
                .names
                .as_ref()
                .map(|names| names.iter().any(|n| n == &wanted))
                .unwrap_or(false);
            if exact {
                c.id
            } else {
                None
            }
        });

        match id {
            Some(id) => match self.container_info(&id).await {
                Ok(info) => Ok(Some(info)),
                Err(EngineError::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            },
            None => Ok(None),
        }
    }

    async fn network_ip(&self, container_id: &str, network: &str) -> Result<String, EngineError> {
        let inspect = self.inspect(container_id).await?;
        Ok(inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|mut networks| networks.remove(network))
            .and_then(|endpoint| endpoint.ip_address)
            .unwrap_or_default())
    }
}

fn map_error(err: bollard::errors::Error, subject: &str) -> EngineError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound(subject.to_string()),
        other => EngineError::Api(other.to_string()),
    }
}

/// Extract the colliding container ID from Docker's 409 create message
///
/// `Conflict. The container name "/app" is already in use by container "3f2a...". ...`
pub fn parse_name_conflict(message: &str) -> Option<String> {
    let marker = "by container \"";
    let start = message.find(marker)? + marker.len();
    let rest = &message[start..];
    let end = rest.find('"')?;
    let id = rest[..end].trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

#[derive(Debug, PartialEq)]
enum LoadedImage {
    Id(String),
    Reference(String),
}

/// Recognize the final line of `docker load` output
fn parse_loaded_image(line: &str) -> Option<LoadedImage> {
    let line = line.trim();
    if let Some(id) = line.strip_prefix("Loaded image ID:") {
        Some(LoadedImage::Id(id.trim().to_string()))
    } else {
        line.strip_prefix("Loaded image:")
            .map(|reference| LoadedImage::Reference(reference.trim().to_string()))
    }
}

fn format_ports(ports: &PortMap) -> Vec<String> {
    let mut rendered: Vec<String> = ports
        .iter()
        .map(|(port, bindings)| {
            let published: Vec<String> = bindings
                .iter()
                .flatten()
                .map(|b| {
                    format!(
                        "{}:{}",
                        b.host_ip.as_deref().unwrap_or("0.0.0.0"),
                        b.host_port.as_deref().unwrap_or("")
                    )
                })
                .collect();
            if published.is_empty() {
                port.clone()
            } else {
                format!("{} -> {}", port, published.join(", "))
            }
        })
        .collect();
    rendered.sort();
    rendered
}

fn container_info_from_inspect(inspect: ContainerInspectResponse) -> ContainerInfo {
    let state = inspect.state.unwrap_or_default();
    let running = state.running.unwrap_or(false);
    let started_at = state
        .started_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));

    let settings = inspect.network_settings.unwrap_or_default();
    let ports = settings.ports.as_ref().map(format_ports).unwrap_or_default();
    let networks = settings
        .networks
        .unwrap_or_default()
        .into_iter()
        .map(|(name, endpoint)| (name, endpoint.ip_address.unwrap_or_default()))
        .collect();

    ContainerInfo {
        id: inspect.id.unwrap_or_default(),
        name: inspect
            .name
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string(),
        state: state.status.map(|s| s.to_string()).unwrap_or_default(),
        running,
        started_at,
        ports,
        labels: inspect.config.and_then(|c| c.labels).unwrap_or_default(),
        networks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{
        ContainerConfig, ContainerState, ContainerStateStatusEnum, EndpointSettings,
        NetworkSettings, PortBinding,
    };

    #[test]
    fn test_parse_name_conflict() {
        let message = "Conflict. The container name \"/app\" is already in use by container \
                       \"3f2a9c0d11e4\". You have to remove (or rename) that container to be able to reuse that name.";
        assert_eq!(parse_name_conflict(message), Some("3f2a9c0d11e4".to_string()));
        assert_eq!(parse_name_conflict("Conflict. something else"), None);
        assert_eq!(parse_name_conflict("in use by container \"\""), None);
    }

    #[test]
    fn test_parse_loaded_image() {
        assert_eq!(
            parse_loaded_image("Loaded image ID: sha256:abc123\n"),
            Some(LoadedImage::Id("sha256:abc123".to_string()))
        );
        assert_eq!(
            parse_loaded_image("Loaded image: app:latest\n"),
            Some(LoadedImage::Reference("app:latest".to_string()))
        );
        assert_eq!(parse_loaded_image("Loading layer 1/3"), None);
    }

    #[test]
    fn test_format_ports() {
        let ports: PortMap = HashMap::from([
            ("9000/udp".to_string(), None),
            (
                "8080/tcp".to_string(),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some("32768".to_string()),
                }]),
            ),
        ]);
        assert_eq!(
            format_ports(&ports),
            vec!["8080/tcp -> 0.0.0.0:32768".to_string(), "9000/udp".to_string()]
        );
    }

    #[test]
    fn test_container_info_from_inspect() {
        let inspect = ContainerInspectResponse {
            id: Some("abc123".to_string()),
            name: Some("/app".to_string()),
            state: Some(ContainerState {
                status: Some(ContainerStateStatusEnum::RUNNING),
                running: Some(true),
                started_at: Some("2024-05-01T10:00:00.123456789Z".to_string()),
                ..Default::default()
            }),
            config: Some(ContainerConfig {
                labels: Some(HashMap::from([(
                    "deploygate.https".to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                networks: Some(HashMap::from([(
                    "deploygate".to_string(),
                    EndpointSettings {
                        ip_address: Some("10.0.0.9".to_string()),
                        ..Default::default()
                    },
                )])),
                ..Default::default()
            }),
            ..Default::default()
        };

        let info = container_info_from_inspect(inspect);
        assert_eq!(info.id, "abc123");
        assert_eq!(info.name, "app");
        assert_eq!(info.state, "running");
        assert!(info.running);
        assert!(info.started_at.is_some());
        assert_eq!(info.networks.get("deploygate").map(String::as_str), Some("10.0.0.9"));
        assert_eq!(info.labels.get("deploygate.https").map(String::as_str), Some("true"));
    }
}
