//! Shared fixtures: an in-process engine and a wired-up pipeline

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use deploygate::config::Config;
use deploygate::db::Database;
use deploygate::deploy::Orchestrator;
use deploygate::engine::{ContainerInfo, ContainerParams, Engine, EngineError, SharedEngine};
use deploygate::proxy::{RouteTable, SharedProxy};
use deploygate::transfer::{ChunkMetadata, TransferLimits, TransferStore};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const NETWORK: &str = "deploygate";

#[derive(Default)]
struct EngineState {
    containers: HashMap<String, ContainerInfo>,
    created: Vec<ContainerParams>,
    imported: Vec<Vec<u8>>,
    calls: Vec<String>,
    next_id: u32,
    import_result: Option<Result<String, EngineError>>,
    start_error: Option<EngineError>,
    hang_start: Option<Duration>,
    stuck_removals: u32,
    next_ip: Option<String>,
    queued_ips: VecDeque<String>,
    image_labels: HashMap<String, String>,
    race_on_create: Option<ContainerInfo>,
    logs: String,
}

/// Engine fake that keeps containers in a map
///
/// Behaves like a real engine for names and IDs: creating a second
/// container with a taken name fails with `NameConflict`.
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<EngineState>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a container the deploy did not create
    pub fn add_container(&self, info: ContainerInfo) {
        self.state.lock().containers.insert(info.id.clone(), info);
    }

    pub fn set_import_result(&self, result: Result<String, EngineError>) {
        self.state.lock().import_result = Some(result);
    }

    pub fn fail_start(&self, error: EngineError) {
        self.state.lock().start_error = Some(error);
    }

    pub fn hang_start(&self, duration: Duration) {
        self.state.lock().hang_start = Some(duration);
    }

    /// The next `count` removals report success but leave the container behind
    pub fn set_stuck_removals(&self, count: u32) {
        self.state.lock().stuck_removals = count;
    }

    /// Address given to the next created container
    pub fn set_next_ip(&self, ip: &str) {
        self.state.lock().next_ip = Some(ip.to_string());
    }

    /// Answers for upcoming network inspections, before the container's own address
    pub fn queue_ips(&self, ips: &[&str]) {
        self.state
            .lock()
            .queued_ips
            .extend(ips.iter().map(|ip| ip.to_string()));
    }

    /// Labels the image contributes to every container created from it
    pub fn set_image_labels(&self, labels: &[(&str, &str)]) {
        self.state.lock().image_labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
    }

    /// Another deploy grabs the name between the conflict check and create
    pub fn race_on_create(&self, info: ContainerInfo) {
        self.state.lock().race_on_create = Some(info);
    }

    pub fn set_logs(&self, logs: &str) {
        self.state.lock().logs = logs.to_string();
    }

    pub fn containers(&self) -> Vec<ContainerInfo> {
        self.state.lock().containers.values().cloned().collect()
    }

    pub fn created(&self) -> Vec<ContainerParams> {
        self.state.lock().created.clone()
    }

    pub fn imported(&self) -> Vec<Vec<u8>> {
        self.state.lock().imported.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(operation))
            .count()
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }
}

/// Running container fixture
pub fn running_container(id: &str, name: &str, uptime: Duration) -> ContainerInfo {
    ContainerInfo {
        id: id.to_string(),
        name: name.to_string(),
        state: "running".to_string(),
        running: true,
        started_at: Some(Utc::now() - chrono::Duration::from_std(uptime).unwrap()),
        ports: vec!["8080/tcp".to_string()],
        labels: HashMap::new(),
        networks: HashMap::from([(NETWORK.to_string(), "10.0.0.2".to_string())]),
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn import_image(&self, archive: &Path) -> Result<String, EngineError> {
        let contents = std::fs::read(archive)
            .map_err(|e| EngineError::Api(format!("cannot read archive: {}", e)))?;
        let mut state = self.state.lock();
        state.calls.push("import".to_string());
        state.imported.push(contents);
        state
            .import_result
            .clone()
            .unwrap_or_else(|| Ok("sha256:0123456789ab".to_string()))
    }

    async fn create_container(&self, params: &ContainerParams) -> Result<String, EngineError> {
        let mut state = self.state.lock();
        state.calls.push(format!("create {}", params.name));

        if let Some(racer) = state.race_on_create.take() {
            state.containers.insert(racer.id.clone(), racer);
        }

        if let Some(existing) = state.containers.values().find(|c| c.name == params.name) {
            return Err(EngineError::NameConflict {
                name: params.name.clone(),
                container_id: existing.id.clone(),
            });
        }

        state.next_id += 1;
        let next_id = state.next_id;
        let id = format!("container{:04}", next_id);
        let ip = state
            .next_ip
            .take()
            .unwrap_or_else(|| format!("10.0.0.{}", 100 + next_id));

        let mut labels = state.image_labels.clone();
        labels.extend(params.labels.clone());

        state.containers.insert(
            id.clone(),
            ContainerInfo {
                id: id.clone(),
                name: params.name.clone(),
                state: "created".to_string(),
                running: false,
                started_at: None,
                ports: vec![params.port.clone()],
                labels,
                networks: HashMap::from([(params.network.clone(), ip)]),
            },
        );
        state.created.push(params.clone());
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), EngineError> {
        self.record(format!("start {}", container_id));

        let hang = self.state.lock().hang_start;
        if let Some(duration) = hang {
            tokio::time::sleep(duration).await;
        }

        let mut state = self.state.lock();
        if let Some(error) = state.start_error.clone() {
            return Err(error);
        }
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| EngineError::NotFound(container_id.to_string()))?;
        container.state = "running".to_string();
        container.running = true;
        container.started_at = Some(Utc::now());
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.calls.push(format!("stop {}", container_id));
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| EngineError::NotFound(container_id.to_string()))?;
        container.state = "exited".to_string();
        container.running = false;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.calls.push(format!("remove {}", container_id));
        if state.stuck_removals > 0 {
            state.stuck_removals -= 1;
            return Ok(());
        }
        state
            .containers
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(container_id.to_string()))
    }

    async fn container_info(&self, container_id: &str) -> Result<ContainerInfo, EngineError> {
        let state = self.state.lock();
        state
            .containers
            .get(container_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(container_id.to_string()))
    }

    async fn container_logs(&self, container_id: &str, _tail: usize) -> Result<String, EngineError> {
        let mut state = self.state.lock();
        state.calls.push(format!("logs {}", container_id));
        Ok(state.logs.clone())
    }

    async fn find_container(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError> {
        let mut state = self.state.lock();
        state.calls.push(format!("find {}", name));
        Ok(state.containers.values().find(|c| c.name == name).cloned())
    }

    async fn network_ip(&self, container_id: &str, network: &str) -> Result<String, EngineError> {
        let mut state = self.state.lock();
        state.calls.push(format!("network {}", container_id));
        if let Some(ip) = state.queued_ips.pop_front() {
            return Ok(ip);
        }
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| EngineError::NotFound(container_id.to_string()))?;
        Ok(container.networks.get(network).cloned().unwrap_or_default())
    }
}

/// Config with short retry delays and a private staging directory
pub fn test_config(staging_dir: &Path) -> Config {
    let mut config = Config::default();
    config.engine.staging_dir = Some(staging_dir.to_string_lossy().into_owned());
    config.engine.network = NETWORK.to_string();
    config.deploy.rollback_delay_ms = 1;
    config.routes.ip_resolve_delay_ms = 1;
    config
}

/// Pipeline wired against the mock engine and an in-memory route store
pub struct Harness {
    pub engine: Arc<MockEngine>,
    pub db: Database,
    pub routes: Arc<RouteTable>,
    pub transfers: Arc<TransferStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub config: Config,
    pub staging: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let staging = tempfile::tempdir().unwrap();
        let mut config = test_config(staging.path());
        adjust(&mut config);

        let engine = MockEngine::new();
        let db = Database::open_in_memory().unwrap();
        let routes = Arc::new(RouteTable::new(db.clone(), config.database.call_timeout()));
        let shared_engine: SharedEngine = engine.clone();
        let proxy: SharedProxy = routes.clone();
        let orchestrator = Arc::new(Orchestrator::new(shared_engine, db.clone(), proxy, &config));
        let transfers = Arc::new(TransferStore::new(TransferLimits::from(&config.transfers)));

        Self {
            engine,
            db,
            routes,
            transfers,
            orchestrator,
            config,
            staging,
        }
    }

    pub fn staging_is_empty(&self) -> bool {
        std::fs::read_dir(self.staging.path()).unwrap().next().is_none()
    }
}

pub fn chunk_metadata(
    transfer_id: &str,
    chunk_number: u32,
    total_chunks: u32,
    chunk_size: usize,
    total_size: usize,
) -> ChunkMetadata {
    ChunkMetadata {
        chunk_number,
        total_chunks,
        chunk_size: chunk_size as u64,
        total_size: total_size as u64,
        image_name: "app:latest".to_string(),
        transfer_id: transfer_id.to_string(),
    }
}

/// Split `data` into `parts` chunks with their metadata
pub fn split_chunks(transfer_id: &str, data: &[u8], parts: usize) -> Vec<(ChunkMetadata, Vec<u8>)> {
    let size = data.len().div_ceil(parts);
    data.chunks(size)
        .enumerate()
        .map(|(i, chunk)| {
            (
                chunk_metadata(transfer_id, i as u32, parts as u32, chunk.len(), data.len()),
                chunk.to_vec(),
            )
        })
        .collect()
}
