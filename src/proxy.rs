//! Proxy collaborator
//!
//! The reverse-proxy data plane consumes an in-memory domain -> upstream
//! map. [`RouteTable`] is that map: it is rebuilt from the route store on
//! every reload and records which domains need a certificate.

use crate::db::{Database, Protocol, RouteRecord};
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A route as the data plane sees it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyRoute {
    pub domain: String,
    pub container_id: String,
    pub container_ip: String,
    pub container_port: u16,
    pub protocol: Protocol,
    pub path: String,
}

impl ProxyRoute {
    /// Upstream address the proxy forwards to
    pub fn upstream(&self) -> String {
        format!("{}:{}", self.container_ip, self.container_port)
    }
}

impl TryFrom<RouteRecord> for ProxyRoute {
    type Error = anyhow::Error;

    fn try_from(record: RouteRecord) -> anyhow::Result<Self> {
        Ok(Self {
            protocol: record.protocol.parse()?,
            domain: record.domain_name,
            container_id: record.container_id,
            container_ip: record.container_ip,
            container_port: record.container_port,
            path: record.path,
        })
    }
}

/// Operations the deploy pipeline needs from the reverse proxy
#[async_trait]
pub trait Proxy: Send + Sync {
    /// Register a newly created route (starts certificate acquisition for https)
    async fn add_route(&self, route: &ProxyRoute) -> anyhow::Result<()>;

    /// Rebuild the in-memory table from the route store, returning the route count
    async fn reload(&self) -> anyhow::Result<usize>;

    /// Current in-memory table keyed by bare domain
    async fn routes(&self) -> HashMap<String, ProxyRoute>;
}

pub type SharedProxy = Arc<dyn Proxy>;

/// In-process route table backed by the route store
pub struct RouteTable {
    db: Database,
    db_timeout: Duration,
    routes: RwLock<HashMap<String, ProxyRoute>>,
    certificate_requests: Mutex<BTreeSet<String>>,
}

impl RouteTable {
    pub fn new(db: Database, db_timeout: Duration) -> Self {
        Self {
            db,
            db_timeout,
            routes: RwLock::new(HashMap::new()),
            certificate_requests: Mutex::new(BTreeSet::new()),
        }
    }

    /// Domains waiting for a certificate, in sorted order
    pub fn pending_certificates(&self) -> Vec<String> {
        self.certificate_requests.lock().iter().cloned().collect()
    }

    /// Look up the upstream for a request host
    pub fn resolve(&self, host: &str) -> Option<ProxyRoute> {
        let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
        self.routes.read().get(&host).cloned()
    }
}

#[async_trait]
impl Proxy for RouteTable {
    async fn add_route(&self, route: &ProxyRoute) -> anyhow::Result<()> {
        debug!(domain = %route.domain, upstream = %route.upstream(), "Adding route");
        self.routes.write().insert(route.domain.clone(), route.clone());

        if route.protocol == Protocol::Https {
            let added = self.certificate_requests.lock().insert(route.domain.clone());
            if added {
                info!(domain = %route.domain, "Certificate requested");
            }
        }
        Ok(())
    }

    async fn reload(&self) -> anyhow::Result<usize> {
        let records = self
            .db
            .call(self.db_timeout, |db| db.list_routes())
            .await
            .context("Failed to load routes")?;

        let mut table = HashMap::with_capacity(records.len());
        for record in records {
            let domain = record.domain_name.clone();
            match ProxyRoute::try_from(record) {
                Ok(route) => {
                    table.insert(domain, route);
                }
                Err(e) => warn!(domain = %domain, error = %e, "Skipping unreadable route"),
            }
        }

        let count = table.len();
        *self.routes.write() = table;
        debug!(routes = count, "Route table reloaded");
        Ok(count)
    }

    async fn routes(&self) -> HashMap<String, ProxyRoute> {
        self.routes.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewRoute;

    fn new_route(domain: &str, ip: &str, protocol: Protocol) -> NewRoute {
        NewRoute {
            domain: domain.to_string(),
            container_id: "c1".to_string(),
            container_ip: ip.to_string(),
            container_port: 8080,
            protocol,
            path: "/".to_string(),
        }
    }

    #[tokio::test]
    async fn test_reload_reflects_store() {
        let db = Database::open_in_memory().unwrap();
        let table = RouteTable::new(db.clone(), Duration::from_secs(5));

        db.upsert_route(&new_route("app.test.example", "10.0.0.5", Protocol::Http))
            .unwrap();
        assert_eq!(table.reload().await.unwrap(), 1);
        assert_eq!(
            table.resolve("APP.test.example:443").unwrap().upstream(),
            "10.0.0.5:8080"
        );

        db.upsert_route(&new_route("app.test.example", "10.0.0.9", Protocol::Http))
            .unwrap();
        table.reload().await.unwrap();
        assert_eq!(
            table.routes().await["app.test.example"].container_ip,
            "10.0.0.9"
        );

        db.delete_route("app.test.example").unwrap();
        assert_eq!(table.reload().await.unwrap(), 0);
        assert!(table.resolve("app.test.example").is_none());
    }

    #[tokio::test]
    async fn test_https_route_requests_certificate() {
        let db = Database::open_in_memory().unwrap();
        let table = RouteTable::new(db, Duration::from_secs(5));

        let route = ProxyRoute {
            domain: "secure.test.example".to_string(),
            container_id: "c1".to_string(),
            container_ip: "10.0.0.5".to_string(),
            container_port: 443,
            protocol: Protocol::Https,
            path: "/".to_string(),
        };
        table.add_route(&route).await.unwrap();
        table.add_route(&route).await.unwrap();

        let plain = ProxyRoute {
            domain: "plain.test.example".to_string(),
            protocol: Protocol::Http,
            ..route
        };
        table.add_route(&plain).await.unwrap();

        assert_eq!(table.pending_certificates(), vec!["secure.test.example".to_string()]);
        assert_eq!(table.routes().await.len(), 2);
    }
}
