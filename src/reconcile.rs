//! Route reconciler
//!
//! Points a domain at a freshly started container: picks the protocol,
//! makes sure the container address is routable, writes the route in one
//! transaction and reloads the proxy.

use crate::config::Config;
use crate::db::{Database, NewRoute, Protocol, RouteWrite};
use crate::deploy::{bare_domain, DeployStage};
use crate::engine::{with_deadline, EngineError, SharedEngine};
use crate::error::DeployError;
use crate::proxy::{ProxyRoute, SharedProxy};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Route write result handed back to the orchestrator
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub domain: String,
    pub protocol: Protocol,
    pub container_ip: String,
    pub write: RouteWrite,
    /// Whether the reloaded proxy table matched what was written
    pub verified: bool,
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub network: String,
    pub tls_label: String,
    pub path: String,
    pub ip_resolve_attempts: u32,
    pub ip_resolve_delay: Duration,
    pub engine_timeout: Duration,
    pub db_timeout: Duration,
}

impl ReconcileSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            network: config.engine.network.clone(),
            tls_label: config.routes.tls_label.clone(),
            path: config.routes.path.clone(),
            ip_resolve_attempts: config.routes.ip_resolve_attempts.max(1),
            ip_resolve_delay: config.routes.ip_resolve_delay(),
            engine_timeout: config.engine.call_timeout(),
            db_timeout: config.database.call_timeout(),
        }
    }
}

/// An address the proxy cannot forward to
///
/// Known approximation: only the sentinels seen in practice are caught,
/// not every malformed address.
pub fn is_unusable_address(ip: &str, container_id: &str) -> bool {
    let ip = ip.trim();
    ip.is_empty() || ip == container_id || ip.eq_ignore_ascii_case("localhost")
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

pub struct RouteReconciler {
    engine: SharedEngine,
    db: Database,
    proxy: SharedProxy,
    settings: ReconcileSettings,
}

impl RouteReconciler {
    pub fn new(engine: SharedEngine, db: Database, proxy: SharedProxy, config: &Config) -> Self {
        Self::with_settings(engine, db, proxy, ReconcileSettings::from_config(config))
    }

    pub fn with_settings(
        engine: SharedEngine,
        db: Database,
        proxy: SharedProxy,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            engine,
            db,
            proxy,
            settings,
        }
    }

    /// Insert or update the route for `target_domain` and reload the proxy
    pub async fn reconcile(
        &self,
        container_id: &str,
        container_ip: &str,
        container_port: u16,
        target_domain: &str,
    ) -> Result<ReconcileOutcome, DeployError> {
        let domain = bare_domain(target_domain);
        if domain.is_empty() {
            return Err(DeployError::Validation(format!(
                "target domain '{}' has no host",
                target_domain
            )));
        }

        let protocol = self.infer_protocol(container_id, target_domain).await;

        let container_ip = if is_unusable_address(container_ip, container_id) {
            warn!(
                container_id,
                container_ip,
                network = %self.settings.network,
                "Container address unusable, re-resolving"
            );
            self.resolve_address(container_id).await?
        } else {
            container_ip.to_string()
        };

        let route = NewRoute {
            domain: domain.clone(),
            container_id: container_id.to_string(),
            container_ip: container_ip.clone(),
            container_port,
            protocol,
            path: self.settings.path.clone(),
        };

        let write = {
            let route = route.clone();
            self.db
                .call(self.settings.db_timeout, move |db| db.upsert_route(&route))
                .await
                .map_err(|e| DeployError::persistence(&domain, e))?
        };

        match &write {
            RouteWrite::Inserted { id } => {
                info!(domain = %domain, route_id = id, container_ip = %container_ip, %protocol, "Route inserted");
                let proxy_route = ProxyRoute {
                    domain: route.domain,
                    container_id: route.container_id,
                    container_ip: route.container_ip,
                    container_port: route.container_port,
                    protocol: route.protocol,
                    path: route.path,
                };
                if let Err(e) = self.proxy.add_route(&proxy_route).await {
                    warn!(domain = %domain, error = %e, "Proxy did not accept new route");
                }
            }
            RouteWrite::Updated { id, previous_ip } => {
                info!(
                    domain = %domain,
                    route_id = id,
                    previous_ip = %previous_ip,
                    container_ip = %container_ip,
                    "Route updated"
                );
            }
        }

        let verified = self.reload_and_verify(&domain, &container_ip).await;

        Ok(ReconcileOutcome {
            domain,
            protocol,
            container_ip,
            write,
            verified,
        })
    }

    /// `https` for an explicit https scheme, else the container's TLS label, else `http`
    async fn infer_protocol(&self, container_id: &str, target_domain: &str) -> Protocol {
        if target_domain
            .trim()
            .to_ascii_lowercase()
            .starts_with("https://")
        {
            return Protocol::Https;
        }

        match with_deadline(
            "container inspect",
            self.settings.engine_timeout,
            self.engine.container_info(container_id),
        )
        .await
        {
            Ok(info) => {
                let wants_tls = info
                    .labels
                    .get(&self.settings.tls_label)
                    .map(|v| is_truthy(v))
                    .unwrap_or(false);
                if wants_tls {
                    debug!(container_id, label = %self.settings.tls_label, "TLS requested by container label");
                    Protocol::Https
                } else {
                    Protocol::Http
                }
            }
            Err(e) => {
                warn!(container_id, error = %e, "Could not read container labels, assuming http");
                Protocol::Http
            }
        }
    }

    /// Ask the engine for the container's address until it is usable
    async fn resolve_address(&self, container_id: &str) -> Result<String, DeployError> {
        let attempts = self.settings.ip_resolve_attempts;
        let mut last_error: Option<EngineError> = None;

        for attempt in 1..=attempts {
            match with_deadline(
                "network inspect",
                self.settings.engine_timeout,
                self.engine.network_ip(container_id, &self.settings.network),
            )
            .await
            {
                Ok(ip) if !is_unusable_address(&ip, container_id) => {
                    info!(container_id, container_ip = %ip, attempt, "Resolved container address");
                    return Ok(ip);
                }
                Ok(ip) => {
                    debug!(container_id, container_ip = %ip, attempt, "Container address still unusable");
                    last_error = None;
                }
                Err(e) => {
                    warn!(container_id, attempt, error = %e, "Network inspect failed");
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.settings.ip_resolve_delay).await;
            }
        }

        let source = last_error.unwrap_or_else(|| {
            EngineError::InvalidResponse(format!(
                "no usable address on network '{}' after {} attempts",
                self.settings.network, attempts
            ))
        });
        Err(DeployError::engine(DeployStage::ResolveAddress, source))
    }

    /// Reload the proxy and check it serves `container_ip` for `domain`
    async fn reload_and_verify(&self, domain: &str, container_ip: &str) -> bool {
        if let Err(e) = self.proxy.reload().await {
            warn!(domain, error = %e, "Proxy reload failed");
            return false;
        }

        match self.proxy.routes().await.get(domain) {
            Some(route) if route.container_ip == container_ip => true,
            Some(route) => {
                warn!(
                    domain,
                    expected = container_ip,
                    actual = %route.container_ip,
                    "Reloaded route points at a different address"
                );
                false
            }
            None => {
                warn!(domain, "Reloaded route table has no entry for domain");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_unusable_address() {
        assert!(is_unusable_address("", "abc"));
        assert!(is_unusable_address("  ", "abc"));
        assert!(is_unusable_address("abc", "abc"));
        assert!(is_unusable_address("localhost", "abc"));
        assert!(is_unusable_address("LOCALHOST", "abc"));
        assert!(!is_unusable_address("10.0.0.9", "abc"));
        // Not a validator: loopback IPs pass
        assert!(!is_unusable_address("127.0.0.1", "abc"));
    }

    #[test]
    fn test_is_truthy() {
        for value in ["true", "TRUE", "1", "yes", " on "] {
            assert!(is_truthy(value), "{}", value);
        }
        for value in ["false", "0", "", "no", "enabled"] {
            assert!(!is_truthy(value), "{}", value);
        }
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.routes.ip_resolve_attempts = 0;
        let settings = ReconcileSettings::from_config(&config);
        assert_eq!(settings.ip_resolve_attempts, 1);
        assert_eq!(settings.tls_label, "deploygate.https");
        assert_eq!(settings.path, "/");
        assert_eq!(settings.network, "deploygate");
    }
}
