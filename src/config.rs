use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the deploy server
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Route store location
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Container engine connection and call limits
    #[serde(default)]
    pub engine: EngineConfig,

    /// Chunked transfer limits and garbage collection
    #[serde(default)]
    pub transfers: TransferConfig,

    /// Deployment rollback behavior
    #[serde(default)]
    pub deploy: DeployConfig,

    /// Route reconciliation behavior
    #[serde(default)]
    pub routes: RouteConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port for the deploy API (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bearer token required on every mutating endpoint
    /// If not set, a random token is generated at startup and logged
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            auth_token: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// SQLite file holding the route table
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Deadline for a single route store call
    #[serde(default = "default_database_timeout")]
    pub call_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            call_timeout_secs: default_database_timeout(),
        }
    }
}

impl DatabaseConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Docker daemon endpoint (unix:///path or tcp://host:port)
    pub docker_host: Option<String>,

    /// Network every deployed container joins
    #[serde(default = "default_network")]
    pub network: String,

    /// Deadline for a single engine call
    #[serde(default = "default_engine_timeout")]
    pub call_timeout_secs: u64,

    /// Directory for staged image archives (default: system temp dir)
    pub staging_dir: Option<String>,

    /// Number of log lines fetched when a container fails to start
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            network: default_network(),
            call_timeout_secs: default_engine_timeout(),
            staging_dir: None,
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransferConfig {
    /// How often abandoned transfers are swept (default: 5 minutes)
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,

    /// Age after which an incomplete transfer is evicted (default: 30 minutes)
    #[serde(default = "default_transfer_timeout")]
    pub timeout_secs: u64,

    /// Largest accepted chunk body in bytes
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,

    /// Largest accepted image archive in bytes
    #[serde(default = "default_max_total_size")]
    pub max_total_size: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            gc_interval_secs: default_gc_interval(),
            timeout_secs: default_transfer_timeout(),
            max_chunk_size: default_max_chunk_size(),
            max_total_size: default_max_total_size(),
        }
    }
}

impl TransferConfig {
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeployConfig {
    /// Remove-and-verify attempts after a failed start
    #[serde(default = "default_rollback_attempts")]
    pub rollback_attempts: u32,

    /// Pause between rollback attempts in milliseconds
    #[serde(default = "default_retry_delay")]
    pub rollback_delay_ms: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            rollback_attempts: default_rollback_attempts(),
            rollback_delay_ms: default_retry_delay(),
        }
    }
}

impl DeployConfig {
    pub fn rollback_delay(&self) -> Duration {
        Duration::from_millis(self.rollback_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouteConfig {
    /// Network inspections before giving up on a stale container address
    #[serde(default = "default_ip_resolve_attempts")]
    pub ip_resolve_attempts: u32,

    /// Pause between network inspections in milliseconds
    #[serde(default = "default_retry_delay")]
    pub ip_resolve_delay_ms: u64,

    /// Container label that marks TLS termination as expected downstream
    #[serde(default = "default_tls_label")]
    pub tls_label: String,

    /// Path prefix written on every route
    #[serde(default = "default_route_path")]
    pub path: String,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            ip_resolve_attempts: default_ip_resolve_attempts(),
            ip_resolve_delay_ms: default_retry_delay(),
            tls_label: default_tls_label(),
            path: default_route_path(),
        }
    }
}

impl RouteConfig {
    pub fn ip_resolve_delay(&self) -> Duration {
        Duration::from_millis(self.ip_resolve_delay_ms)
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_database_path() -> String {
    "./deploygate.db".to_string()
}

fn default_database_timeout() -> u64 {
    10
}

fn default_network() -> String {
    "deploygate".to_string()
}

fn default_engine_timeout() -> u64 {
    60
}

fn default_log_tail_lines() -> usize {
    50
}

fn default_gc_interval() -> u64 {
    300
}

fn default_transfer_timeout() -> u64 {
    1800
}

fn default_max_chunk_size() -> u64 {
    64 * 1024 * 1024
}

fn default_max_total_size() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_rollback_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    500
}

fn default_ip_resolve_attempts() -> u32 {
    5
}

fn default_tls_label() -> String {
    "deploygate.https".to_string()
}

fn default_route_path() -> String {
    "/".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.database.call_timeout_secs == 0 {
            errors.push("database.call_timeout_secs must be non-zero".to_string());
        }
        if self.engine.network.trim().is_empty() {
            errors.push("engine.network must not be empty".to_string());
        }
        if self.engine.call_timeout_secs == 0 {
            errors.push("engine.call_timeout_secs must be non-zero".to_string());
        }
        if self.transfers.gc_interval_secs == 0 {
            errors.push("transfers.gc_interval_secs must be non-zero".to_string());
        }
        if self.transfers.timeout_secs == 0 {
            errors.push("transfers.timeout_secs must be non-zero".to_string());
        }
        if self.transfers.max_chunk_size == 0 {
            errors.push("transfers.max_chunk_size must be non-zero".to_string());
        }
        if self.transfers.max_chunk_size > self.transfers.max_total_size {
            errors.push(format!(
                "transfers.max_chunk_size ({}) exceeds transfers.max_total_size ({})",
                self.transfers.max_chunk_size, self.transfers.max_total_size
            ));
        }
        if self.deploy.rollback_attempts == 0 {
            errors.push("deploy.rollback_attempts must be at least 1".to_string());
        }
        if self.routes.ip_resolve_attempts == 0 {
            errors.push("routes.ip_resolve_attempts must be at least 1".to_string());
        }
        if !self.routes.path.starts_with('/') {
            errors.push(format!("routes.path must start with '/': {}", self.routes.path));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 9090
bind = "127.0.0.1"
auth_token = "secret"

[database]
path = "/var/lib/deploygate/routes.db"

[engine]
docker_host = "unix:///var/run/docker.sock"
network = "overlay-net"
call_timeout_secs = 30

[transfers]
gc_interval_secs = 60
timeout_secs = 600

[routes]
ip_resolve_attempts = 10
tls_label = "example.tls"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.database.path, "/var/lib/deploygate/routes.db");
        assert_eq!(config.engine.network, "overlay-net");
        assert_eq!(config.engine.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.transfers.gc_interval(), Duration::from_secs(60));
        assert_eq!(config.transfers.timeout(), Duration::from_secs(600));
        assert_eq!(config.routes.ip_resolve_attempts, 10);
        assert_eq!(config.routes.tls_label, "example.tls");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert!(config.server.auth_token.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_transfer_config() {
        let transfers = TransferConfig::default();
        assert_eq!(transfers.gc_interval(), Duration::from_secs(300));
        assert_eq!(transfers.timeout(), Duration::from_secs(1800));
        assert_eq!(transfers.max_chunk_size, 64 * 1024 * 1024);
    }

    #[test]
    fn test_default_engine_and_routes() {
        let engine = EngineConfig::default();
        assert_eq!(engine.network, "deploygate");
        assert_eq!(engine.call_timeout(), Duration::from_secs(60));
        assert_eq!(engine.log_tail_lines, 50);
        assert_eq!(engine.staging_dir(), std::env::temp_dir());

        let routes = RouteConfig::default();
        assert_eq!(routes.ip_resolve_attempts, 5);
        assert_eq!(routes.ip_resolve_delay(), Duration::from_millis(500));
        assert_eq!(routes.tls_label, "deploygate.https");
        assert_eq!(routes.path, "/");

        let deploy = DeployConfig::default();
        assert_eq!(deploy.rollback_attempts, 3);
        assert_eq!(deploy.rollback_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_validate_port_nonzero() {
        let config: Config = toml::from_str("[server]\nport = 0\n").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("server.port"));
    }

    #[test]
    fn test_validate_chunk_larger_than_total() {
        let config: Config = toml::from_str(
            "[transfers]\nmax_chunk_size = 2048\nmax_total_size = 1024\n",
        )
        .unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_chunk_size"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[deploy]
rollback_attempts = 0

[routes]
ip_resolve_attempts = 0
path = "api"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("rollback_attempts"));
        assert!(err.contains("ip_resolve_attempts"));
        assert!(err.contains("routes.path"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploygate.toml");
        std::fs::write(&path, "[engine]\nnetwork = \"apps\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.engine.network, "apps");

        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }
}
