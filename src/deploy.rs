//! Deployment orchestrator
//!
//! Drives one deploy request through
//! `Validate -> CheckConflict -> Import -> CreateContainer -> StartContainer`
//! and then hands the running container to the route reconciler. A container
//! created by this module is either left running and routed, or removed and
//! confirmed gone before the error is returned.

use crate::config::Config;
use crate::db::{Database, DeploymentRecord, Protocol, RouteWrite};
use crate::engine::{with_deadline, ContainerInfo, ContainerParams, EngineError, SharedEngine};
use crate::error::{DeployError, DeployResponse};
use crate::importer::ImageImporter;
use crate::proxy::SharedProxy;
use crate::reconcile::RouteReconciler;
use chrono::Utc;
use hyper::StatusCode;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Label carrying the domain a container was deployed for
pub const LABEL_DOMAIN: &str = "deploygate.domain";
/// Label carrying the image name the client pushed
pub const LABEL_IMAGE: &str = "deploygate.image";
/// Marks containers created by deploygate
pub const LABEL_MANAGED: &str = "deploygate.managed";

/// Pipeline stage, reported with engine failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStage {
    Validate,
    CheckConflict,
    Import,
    CreateContainer,
    StartContainer,
    ResolveAddress,
    Reconcile,
    StopContainer,
    RemoveContainer,
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeployStage::Validate => "validate",
            DeployStage::CheckConflict => "conflict check",
            DeployStage::Import => "image import",
            DeployStage::CreateContainer => "container create",
            DeployStage::StartContainer => "container start",
            DeployStage::ResolveAddress => "address resolution",
            DeployStage::Reconcile => "route reconcile",
            DeployStage::StopContainer => "container stop",
            DeployStage::RemoveContainer => "container remove",
        };
        f.write_str(name)
    }
}

// ==================== Request Normalization ====================

/// Normalize a port to `<number>/<tcp|udp>`
pub fn normalize_port(raw: &str) -> Result<String, DeployError> {
    let raw = raw.trim();
    let (number, proto) = match raw.split_once('/') {
        Some((number, proto)) => (number, proto.to_ascii_lowercase()),
        None => (raw, "tcp".to_string()),
    };

    if proto != "tcp" && proto != "udp" {
        return Err(DeployError::Validation(format!(
            "port '{}' has unsupported protocol '{}'",
            raw, proto
        )));
    }

    match number.parse::<u16>() {
        Ok(port) if port > 0 => Ok(format!("{}/{}", port, proto)),
        _ => Err(DeployError::Validation(format!(
            "port '{}' is not a number between 1 and 65535",
            raw
        ))),
    }
}

/// Normalize a target domain to carry an `http://` or `https://` scheme
///
/// A domain without a scheme gets `https://`.
pub fn normalize_domain(raw: &str) -> Result<String, DeployError> {
    let raw = raw.trim().to_ascii_lowercase();
    if raw.is_empty() {
        return Err(DeployError::Validation("target domain is empty".to_string()));
    }

    let normalized = match raw.split_once("://") {
        Some(("http", _)) | Some(("https", _)) => raw.clone(),
        Some((scheme, _)) => {
            return Err(DeployError::Validation(format!(
                "target domain '{}' has unsupported scheme '{}'",
                raw, scheme
            )))
        }
        None => format!("https://{}", raw),
    };

    if bare_domain(&normalized).is_empty() {
        return Err(DeployError::Validation(format!(
            "target domain '{}' has no host",
            raw
        )));
    }
    Ok(normalized)
}

/// Routing key for a domain: scheme and path removed, lower-cased
pub fn bare_domain(domain: &str) -> String {
    let without_scheme = domain
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(domain);
    without_scheme
        .split('/')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Container name for a domain: its leftmost DNS label
pub fn container_name_for_domain(domain: &str) -> Result<String, DeployError> {
    let bare = bare_domain(domain);
    let host = bare.split(':').next().unwrap_or_default();
    let label = host.split('.').next().unwrap_or_default();

    let valid = label
        .chars()
        .next()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false)
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');

    if valid {
        Ok(label.to_string())
    } else {
        Err(DeployError::Validation(format!(
            "cannot derive a container name from domain '{}'",
            domain
        )))
    }
}

/// One validated deployment attempt
#[derive(Debug, Clone, PartialEq)]
pub struct DeployRequest {
    /// `<number>/<tcp|udp>`
    pub port: String,
    /// Target domain with scheme
    pub target_domain: String,
    pub image_name: String,
    /// Set once the image is imported
    pub image_id: Option<String>,
    pub container_name: String,
    pub container_port: u16,
}

impl DeployRequest {
    /// Validate and normalize raw request values
    pub fn new(port: &str, target_domain: &str, image_name: &str) -> Result<Self, DeployError> {
        let image_name = image_name.trim();
        if image_name.is_empty() {
            return Err(DeployError::Validation("image name is empty".to_string()));
        }

        let port = normalize_port(port)?;
        let target_domain = normalize_domain(target_domain)?;
        let container_name = container_name_for_domain(&target_domain)?;
        let container_port = port
            .split('/')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or_default();

        Ok(Self {
            port,
            target_domain,
            image_name: image_name.to_string(),
            image_id: None,
            container_name,
            container_port,
        })
    }

    /// Routing key for this request
    pub fn domain_key(&self) -> String {
        bare_domain(&self.target_domain)
    }
}

// ==================== Results ====================

/// What a caller needs to decide how to resolve a name collision
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub domain: String,
    #[serde(rename = "containerID")]
    pub container_id: String,
    pub container_name: String,
    pub state: String,
    pub ports: String,
    pub running_time: String,
}

impl ConflictReport {
    pub fn from_container(domain: &str, info: &ContainerInfo) -> Self {
        Self {
            domain: domain.to_string(),
            container_id: info.id.clone(),
            container_name: info.name.clone(),
            state: info.state.clone(),
            ports: info.ports_display(),
            running_time: info.running_time(Utc::now()),
        }
    }
}

/// A deployed and routed container
#[derive(Debug, Clone, Serialize)]
pub struct DeployOutcome {
    pub domain: String,
    pub container_id: String,
    pub container_name: String,
    pub image_id: String,
    pub container_ip: String,
    pub port: String,
    pub protocol: Protocol,
    pub route: RouteWrite,
    /// Whether the reloaded proxy table showed the new address
    pub verified: bool,
}

impl DeployOutcome {
    pub fn response(&self) -> DeployResponse {
        let verb = if self.route.is_insert() { "Deployed" } else { "Redeployed" };
        let mut response = DeployResponse::ok(
            StatusCode::OK,
            format!("{} {} to {}", verb, self.container_name, self.domain),
        );
        response.domain = Some(self.domain.clone());
        response.container_id = Some(self.container_id.clone());
        response.container_name = Some(self.container_name.clone());
        response.state = Some("running".to_string());
        response.ports = Some(self.port.clone());
        response
    }
}

// ==================== Orchestrator ====================

/// Timeouts and retry policy for the orchestrator
#[derive(Debug, Clone)]
pub struct DeploySettings {
    pub network: String,
    pub engine_timeout: Duration,
    pub db_timeout: Duration,
    pub log_tail_lines: usize,
    pub rollback_attempts: u32,
    pub rollback_delay: Duration,
}

impl DeploySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            network: config.engine.network.clone(),
            engine_timeout: config.engine.call_timeout(),
            db_timeout: config.database.call_timeout(),
            log_tail_lines: config.engine.log_tail_lines,
            rollback_attempts: config.deploy.rollback_attempts.max(1),
            rollback_delay: config.deploy.rollback_delay(),
        }
    }
}

pub struct Orchestrator {
    engine: SharedEngine,
    importer: ImageImporter,
    reconciler: RouteReconciler,
    db: Database,
    settings: DeploySettings,
}

impl Orchestrator {
    pub fn new(engine: SharedEngine, db: Database, proxy: SharedProxy, config: &Config) -> Self {
        let importer = ImageImporter::new(
            engine.clone(),
            config.engine.staging_dir(),
            config.engine.call_timeout(),
        );
        let reconciler = RouteReconciler::new(engine.clone(), db.clone(), proxy, config);
        Self {
            engine,
            importer,
            reconciler,
            db,
            settings: DeploySettings::from_config(config),
        }
    }

    /// Deploy an assembled image archive and record the attempt
    pub async fn deploy(
        &self,
        request: DeployRequest,
        archive: Vec<u8>,
    ) -> Result<DeployOutcome, DeployError> {
        let mut request = request;
        let result = self.run(&mut request, archive).await;
        self.record(&request, &result).await;
        result
    }

    async fn run(
        &self,
        request: &mut DeployRequest,
        archive: Vec<u8>,
    ) -> Result<DeployOutcome, DeployError> {
        let domain = request.target_domain.clone();
        let name = request.container_name.clone();
        let timeout = self.settings.engine_timeout;

        // CheckConflict
        let existing = with_deadline("container lookup", timeout, self.engine.find_container(&name))
            .await
            .map_err(|e| DeployError::engine(DeployStage::CheckConflict, e))?;
        if let Some(info) = existing {
            info!(domain = %domain, container_id = %info.id, state = %info.state, "Container name already taken");
            return Err(DeployError::Conflict(Box::new(ConflictReport::from_container(
                &domain, &info,
            ))));
        }

        // Import
        let image_id = self.importer.import(archive).await?;
        request.image_id = Some(image_id.clone());

        // CreateContainer
        let params = ContainerParams {
            name: name.clone(),
            image: image_id.clone(),
            port: request.port.clone(),
            network: self.settings.network.clone(),
            labels: HashMap::from([
                (LABEL_DOMAIN.to_string(), domain.clone()),
                (LABEL_IMAGE.to_string(), request.image_name.clone()),
                (LABEL_MANAGED.to_string(), "true".to_string()),
            ]),
        };
        let container_id =
            match with_deadline("container create", timeout, self.engine.create_container(&params)).await {
                Ok(id) => id,
                Err(EngineError::NameConflict { name, container_id }) => {
                    return Err(self.race_conflict(&domain, &name, &container_id).await);
                }
                Err(e) => return Err(DeployError::engine(DeployStage::CreateContainer, e)),
            };
        info!(domain = %domain, container_id = %container_id, container_name = %name, "Container created");

        // StartContainer
        if let Err(start_error) =
            with_deadline("container start", timeout, self.engine.start_container(&container_id)).await
        {
            error!(container_id = %container_id, error = %start_error, "Container failed to start");
            let logs = self.capture_logs(&container_id).await;
            return Err(match self.rollback(&container_id).await {
                Ok(()) => DeployError::StartFailed {
                    container_id,
                    source: start_error,
                    logs,
                },
                Err(rollback_error) => DeployError::RollbackFailed {
                    container_id,
                    cause: start_error.to_string(),
                    rollback_error,
                },
            });
        }
        info!(domain = %domain, container_id = %container_id, "Container started");

        // Best effort; the reconciler re-resolves unusable addresses
        let container_ip = match with_deadline(
            "network inspect",
            timeout,
            self.engine.network_ip(&container_id, &self.settings.network),
        )
        .await
        {
            Ok(ip) => ip,
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "Could not read container address");
                String::new()
            }
        };

        let reconciled = match self
            .reconciler
            .reconcile(&container_id, &container_ip, request.container_port, &domain)
            .await
        {
            Ok(reconciled) => reconciled,
            Err(e) => {
                error!(domain = %domain, container_id = %container_id, error = %e, "Route reconcile failed");
                if let Err(rollback_error) = self.rollback(&container_id).await {
                    return Err(DeployError::RollbackFailed {
                        container_id,
                        cause: e.to_string(),
                        rollback_error,
                    });
                }
                return Err(e);
            }
        };

        Ok(DeployOutcome {
            domain,
            container_id,
            container_name: name,
            image_id,
            container_ip: reconciled.container_ip,
            port: request.port.clone(),
            protocol: reconciled.protocol,
            route: reconciled.write,
            verified: reconciled.verified,
        })
    }

    /// Build the conflict report for a create that lost a naming race
    async fn race_conflict(&self, domain: &str, name: &str, container_id: &str) -> DeployError {
        warn!(domain, container_name = name, container_id, "Container name taken during create");
        let info = with_deadline(
            "container inspect",
            self.settings.engine_timeout,
            self.engine.container_info(container_id),
        )
        .await;

        let report = match info {
            Ok(info) => ConflictReport::from_container(domain, &info),
            Err(e) => {
                debug!(container_id, error = %e, "Could not inspect conflicting container");
                ConflictReport {
                    domain: domain.to_string(),
                    container_id: container_id.to_string(),
                    container_name: name.to_string(),
                    state: "unknown".to_string(),
                    ports: String::new(),
                    running_time: "unknown".to_string(),
                }
            }
        };
        DeployError::Conflict(Box::new(report))
    }

    async fn capture_logs(&self, container_id: &str) -> Option<String> {
        match with_deadline(
            "container logs",
            self.settings.engine_timeout,
            self.engine.container_logs(container_id, self.settings.log_tail_lines),
        )
        .await
        {
            Ok(logs) => {
                for line in logs.lines().filter(|l| !l.trim().is_empty()) {
                    warn!(target: "container", container_id, "{}", line);
                }
                Some(logs)
            }
            Err(e) => {
                warn!(container_id, error = %e, "Failed to fetch container logs");
                None
            }
        }
    }

    /// Remove a container and confirm it is gone, retrying on failure
    ///
    /// Returns the last failure when the container cannot be confirmed gone.
    async fn rollback(&self, container_id: &str) -> Result<(), String> {
        let timeout = self.settings.engine_timeout;
        let attempts = self.settings.rollback_attempts;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match with_deadline("container remove", timeout, self.engine.remove_container(container_id)).await {
                Err(e) if !e.is_not_found() => last_error = e.to_string(),
                _ => {
                    match with_deadline("container inspect", timeout, self.engine.container_info(container_id))
                        .await
                    {
                        Err(e) if e.is_not_found() => {
                            info!(container_id, attempt, "Rolled back container");
                            return Ok(());
                        }
                        Ok(info) => {
                            last_error = format!("container still present in state '{}'", info.state);
                        }
                        Err(e) => last_error = e.to_string(),
                    }
                }
            }

            warn!(container_id, attempt, attempts, error = %last_error, "Rollback attempt failed");
            if attempt < attempts {
                tokio::time::sleep(self.settings.rollback_delay).await;
            }
        }

        error!(container_id, error = %last_error, "Rollback failed");
        Err(last_error)
    }

    async fn record(&self, request: &DeployRequest, result: &Result<DeployOutcome, DeployError>) {
        let (status, message, container_id) = match result {
            Ok(outcome) => (
                "succeeded",
                outcome.response().message,
                Some(outcome.container_id.clone()),
            ),
            Err(e) => {
                let container_id = match e {
                    DeployError::StartFailed { container_id, .. }
                    | DeployError::RollbackFailed { container_id, .. } => Some(container_id.clone()),
                    _ => None,
                };
                ("failed", e.to_string(), container_id)
            }
        };

        let record = DeploymentRecord {
            id: Uuid::new_v4().to_string(),
            domain: request.domain_key(),
            image_name: request.image_name.clone(),
            image_id: request.image_id.clone(),
            container_id,
            status: status.to_string(),
            message,
            created_at: String::new(),
        };

        if let Err(e) = self
            .db
            .call(self.settings.db_timeout, move |db| db.record_deployment(&record))
            .await
        {
            warn!(domain = %request.domain_key(), error = %e, "Failed to record deployment");
        }
    }

    // ==================== Conflict Resolution ====================

    async fn lookup(&self, name: &str, stage: DeployStage) -> Result<ContainerInfo, DeployError> {
        with_deadline(
            "container lookup",
            self.settings.engine_timeout,
            self.engine.find_container(name),
        )
        .await
        .map_err(|e| DeployError::engine(stage, e))?
        .ok_or_else(|| DeployError::NotFound(format!("container '{}'", name)))
    }

    /// Stop the container with this name
    pub async fn stop_container(&self, name: &str) -> Result<ContainerInfo, DeployError> {
        let info = self.lookup(name, DeployStage::StopContainer).await?;
        with_deadline(
            "container stop",
            self.settings.engine_timeout,
            self.engine.stop_container(&info.id),
        )
        .await
        .map_err(|e| DeployError::engine(DeployStage::StopContainer, e))?;
        info!(container_id = %info.id, container_name = name, "Container stopped");
        Ok(info)
    }

    /// Force-remove the container with this name and confirm it is gone
    pub async fn remove_container(&self, name: &str) -> Result<ContainerInfo, DeployError> {
        let info = self.lookup(name, DeployStage::RemoveContainer).await?;
        self.rollback(&info.id).await.map_err(|reason| {
            DeployError::engine(DeployStage::RemoveContainer, EngineError::Api(reason))
        })?;
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_port() {
        assert_eq!(normalize_port("8080").unwrap(), "8080/tcp");
        assert_eq!(normalize_port(" 53/UDP ").unwrap(), "53/udp");
        assert_eq!(normalize_port("443/tcp").unwrap(), "443/tcp");

        for bad in ["", "0", "65536", "http", "80/sctp", "80/"] {
            assert!(
                matches!(normalize_port(bad), Err(DeployError::Validation(_))),
                "expected '{}' to be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(
            normalize_domain("app.test.example").unwrap(),
            "https://app.test.example"
        );
        assert_eq!(
            normalize_domain("http://App.Test.Example").unwrap(),
            "http://app.test.example"
        );
        assert_eq!(
            normalize_domain("https://app.test.example").unwrap(),
            "https://app.test.example"
        );
        assert!(normalize_domain("").is_err());
        assert!(normalize_domain("ftp://app.test.example").is_err());
        assert!(normalize_domain("https://").is_err());
    }

    #[test]
    fn test_bare_domain() {
        assert_eq!(bare_domain("https://app.test.example"), "app.test.example");
        assert_eq!(bare_domain("http://app.test.example/api"), "app.test.example");
        assert_eq!(bare_domain("app.test.example"), "app.test.example");
    }

    #[test]
    fn test_container_name_for_domain() {
        assert_eq!(container_name_for_domain("https://app.test.example").unwrap(), "app");
        assert_eq!(container_name_for_domain("http://API.example.com:8443/x").unwrap(), "api");
        assert_eq!(container_name_for_domain("localhost").unwrap(), "localhost");
        assert!(container_name_for_domain("https://.example.com").is_err());
        assert!(container_name_for_domain("https://-bad.example.com").is_err());
        assert!(container_name_for_domain("https://my_app.example.com").is_err());
    }

    #[test]
    fn test_deploy_request_normalizes() {
        let request = DeployRequest::new("8080", "app.test.example", "app:latest").unwrap();
        assert_eq!(request.port, "8080/tcp");
        assert_eq!(request.target_domain, "https://app.test.example");
        assert_eq!(request.container_name, "app");
        assert_eq!(request.container_port, 8080);
        assert_eq!(request.domain_key(), "app.test.example");
        assert!(request.image_id.is_none());
    }

    #[test]
    fn test_deploy_request_requires_image_name() {
        let err = DeployRequest::new("8080", "app.test.example", "  ").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_conflict_report_from_container() {
        let info = ContainerInfo {
            id: "abc123".to_string(),
            name: "app".to_string(),
            state: "running".to_string(),
            running: true,
            started_at: Some(Utc::now() - chrono::Duration::seconds(3725)),
            ports: vec!["8080/tcp".to_string()],
            ..Default::default()
        };

        let report = ConflictReport::from_container("https://app.test.example", &info);
        assert_eq!(report.container_id, "abc123");
        assert_eq!(report.container_name, "app");
        assert_eq!(report.ports, "8080/tcp");
        assert!(report.running_time.starts_with("1h 2m"));
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(
            DeployError::engine(DeployStage::Import, EngineError::Api("bad tar".into())).to_string(),
            "image import failed: bad tar"
        );
    }
}
