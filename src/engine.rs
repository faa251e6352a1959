//! Container engine interface
//!
//! The deploy pipeline talks to the container runtime only through the
//! [`Engine`] trait. The Docker implementation lives in [`crate::docker`];
//! tests drive the pipeline with in-process fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Errors returned by an [`Engine`]
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// No container (or image) with this ID or name
    #[error("not found: {0}")]
    NotFound(String),

    /// Creation rejected because another container already owns the name
    #[error("container name '{name}' is already in use by container {container_id}")]
    NameConflict { name: String, container_id: String },

    /// The call did not finish within its deadline
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The engine answered, but with something unusable
    #[error("invalid engine response: {0}")]
    InvalidResponse(String),

    /// Any other engine failure
    #[error("{0}")]
    Api(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

/// Parameters for creating a container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerParams {
    /// Container name (derived from the target domain)
    pub name: String,
    /// Image ID or reference to run
    pub image: String,
    /// Exposed port in `<port>/<proto>` form
    pub port: String,
    /// Network the container joins
    pub network: String,
    pub labels: HashMap<String, String>,
}

/// Snapshot of a container as reported by the engine
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub id: String,
    /// Name without the leading slash Docker reports
    pub name: String,
    /// Engine state string (running, exited, created, ...)
    pub state: String,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    /// Port mappings rendered as `8080/tcp` or `8080/tcp -> 0.0.0.0:32768`
    pub ports: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Network name -> IP address
    pub networks: HashMap<String, String>,
}

impl ContainerInfo {
    /// Human-readable uptime, e.g. `2h 13m 5s`
    pub fn running_time(&self, now: DateTime<Utc>) -> String {
        match (self.running, self.started_at) {
            (true, Some(started)) => format_uptime((now - started).to_std().unwrap_or_default()),
            _ => "not running".to_string(),
        }
    }

    pub fn ports_display(&self) -> String {
        self.ports.join(", ")
    }
}

/// Render a duration compactly, omitting leading zero units
pub fn format_uptime(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if days > 0 || hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if days > 0 || hours > 0 || minutes > 0 {
        parts.push(format!("{}m", minutes));
    }
    parts.push(format!("{}s", seconds));
    parts.join(" ")
}

/// Container runtime operations used by the deploy pipeline
///
/// Every call may block for a long time; callers wrap them in
/// [`with_deadline`] and never hold a lock across one.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Load an image archive and return its image ID
    async fn import_image(&self, archive: &Path) -> Result<String, EngineError>;

    /// Create (but do not start) a container, returning its ID
    async fn create_container(&self, params: &ContainerParams) -> Result<String, EngineError>;

    async fn start_container(&self, container_id: &str) -> Result<(), EngineError>;

    async fn stop_container(&self, container_id: &str) -> Result<(), EngineError>;

    /// Force-remove a container
    async fn remove_container(&self, container_id: &str) -> Result<(), EngineError>;

    /// Inspect a container by ID or name; `NotFound` when it does not exist
    async fn container_info(&self, container_id: &str) -> Result<ContainerInfo, EngineError>;

    /// Last `tail` lines of combined stdout/stderr
    async fn container_logs(&self, container_id: &str, tail: usize) -> Result<String, EngineError>;

    /// Find the container whose name is exactly `name`
    async fn find_container(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError>;

    /// IP address of the container on `network`; empty when not attached yet
    async fn network_ip(&self, container_id: &str, network: &str) -> Result<String, EngineError>;
}

pub type SharedEngine = Arc<dyn Engine>;

/// Run an engine call with a deadline
pub async fn with_deadline<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout {
            operation,
            after: limit,
        }),
    }
}
