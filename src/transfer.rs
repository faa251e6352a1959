//! Chunked image transfers
//!
//! Clients push an image archive as a sequence of HTTP requests, each carrying
//! one chunk plus a JSON metadata header. [`TransferStore`] buffers the chunks
//! per transfer ID until every index `0..total_chunks` has arrived, then hands
//! back the archive in index order. Abandoned transfers are evicted by
//! [`gc_loop`].
//!
//! All state sits behind one mutex. Critical sections are map operations
//! only; nothing does I/O while holding it.

use crate::config::TransferConfig;
use crate::error::{DeployError, IntegrityFailure};
use hyper::body::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per-chunk metadata sent by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub chunk_number: u32,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub total_size: u64,
    pub image_name: String,
    #[serde(rename = "transferID")]
    pub transfer_id: String,
}

impl ChunkMetadata {
    /// Parse the metadata header value
    pub fn parse(raw: &str) -> Result<Self, DeployError> {
        let metadata: ChunkMetadata = serde_json::from_str(raw)
            .map_err(|e| DeployError::Validation(format!("malformed chunk metadata: {}", e)))?;
        metadata.validate()?;
        Ok(metadata)
    }

    pub fn validate(&self) -> Result<(), DeployError> {
        if self.transfer_id.trim().is_empty() {
            return Err(DeployError::Validation("transferID must not be empty".to_string()));
        }
        if self.total_chunks == 0 {
            return Err(DeployError::Validation(format!(
                "transfer {}: totalChunks must be at least 1",
                self.transfer_id
            )));
        }
        if self.chunk_number >= self.total_chunks {
            return Err(DeployError::integrity(
                &self.transfer_id,
                IntegrityFailure::ChunkOutOfRange {
                    chunk: self.chunk_number,
                    total_chunks: self.total_chunks,
                },
            ));
        }
        Ok(())
    }
}

/// One in-flight chunked upload
#[derive(Debug)]
pub struct Transfer {
    pub transfer_id: String,
    pub total_chunks: u32,
    pub total_size: u64,
    pub image_name: String,
    received: HashMap<u32, Bytes>,
    pub started_at: Instant,
}

impl Transfer {
    fn new(metadata: &ChunkMetadata, now: Instant) -> Self {
        Self {
            transfer_id: metadata.transfer_id.clone(),
            total_chunks: metadata.total_chunks,
            total_size: metadata.total_size,
            image_name: metadata.image_name.clone(),
            received: HashMap::new(),
            started_at: now,
        }
    }

    /// A later chunk must describe the same transfer as the first one did
    fn check_consistent(&self, metadata: &ChunkMetadata) -> Result<(), IntegrityFailure> {
        if metadata.total_chunks != self.total_chunks {
            return Err(IntegrityFailure::MetadataMismatch(format!(
                "totalChunks {} != {}",
                metadata.total_chunks, self.total_chunks
            )));
        }
        if metadata.total_size != self.total_size {
            return Err(IntegrityFailure::MetadataMismatch(format!(
                "totalSize {} != {}",
                metadata.total_size, self.total_size
            )));
        }
        if metadata.image_name != self.image_name {
            return Err(IntegrityFailure::MetadataMismatch(format!(
                "imageName '{}' != '{}'",
                metadata.image_name, self.image_name
            )));
        }
        Ok(())
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.received.values().map(|c| c.len() as u64).sum()
    }

    /// The sole completeness predicate: one stored chunk per expected index
    pub fn is_complete(&self) -> bool {
        self.received.len() == self.total_chunks as usize
    }

    fn first_missing(&self) -> Option<u32> {
        (0..self.total_chunks).find(|i| !self.received.contains_key(i))
    }

    fn into_bytes(self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.total_size as usize);
        for i in 0..self.total_chunks {
            if let Some(chunk) = self.received.get(&i) {
                buffer.extend_from_slice(chunk);
            }
        }
        buffer
    }
}

/// Result of storing one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAck {
    pub transfer_id: String,
    pub chunk_number: u32,
    pub received: usize,
    pub total_chunks: u32,
    pub complete: bool,
}

/// Snapshot for the transfers endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub active: usize,
    pub buffered_bytes: u64,
}

/// Size limits applied before anything is buffered
#[derive(Debug, Clone, Copy)]
pub struct TransferLimits {
    pub max_chunk_size: u64,
    pub max_total_size: u64,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

impl From<&TransferConfig> for TransferLimits {
    fn from(config: &TransferConfig) -> Self {
        Self {
            max_chunk_size: config.max_chunk_size,
            max_total_size: config.max_total_size,
        }
    }
}

/// Shared store of in-flight transfers
#[derive(Debug)]
pub struct TransferStore {
    transfers: Mutex<HashMap<String, Transfer>>,
    limits: TransferLimits,
}

impl TransferStore {
    pub fn new(limits: TransferLimits) -> Self {
        Self {
            transfers: Mutex::new(HashMap::new()),
            limits,
        }
    }

    /// Validate and buffer one chunk
    ///
    /// The first chunk for a transfer ID creates the transfer; later chunks
    /// append to it. Re-sending an index replaces the buffered bytes.
    pub fn submit_chunk(&self, metadata: &ChunkMetadata, data: Bytes) -> Result<ChunkAck, DeployError> {
        metadata.validate()?;
        let transfer_id = metadata.transfer_id.as_str();
        let chunk = metadata.chunk_number;

        if metadata.total_size > self.limits.max_total_size {
            return Err(DeployError::Validation(format!(
                "transfer {}: totalSize {} exceeds limit of {} bytes",
                transfer_id, metadata.total_size, self.limits.max_total_size
            )));
        }
        if data.is_empty() {
            return Err(DeployError::integrity(transfer_id, IntegrityFailure::EmptyChunk { chunk }));
        }
        if data.len() as u64 > self.limits.max_chunk_size {
            return Err(DeployError::Validation(format!(
                "transfer {}: chunk {} is {} bytes, limit is {}",
                transfer_id,
                chunk,
                data.len(),
                self.limits.max_chunk_size
            )));
        }
        if data.len() as u64 != metadata.chunk_size {
            return Err(DeployError::integrity(
                transfer_id,
                IntegrityFailure::ChunkSizeMismatch {
                    chunk,
                    declared: metadata.chunk_size,
                    actual: data.len() as u64,
                },
            ));
        }

        let now = Instant::now();
        let mut transfers = self.transfers.lock();
        let buffered = match transfers.get(transfer_id) {
            Some(existing) => {
                existing
                    .check_consistent(metadata)
                    .map_err(|failure| DeployError::integrity(transfer_id, failure))?;
                let replaced = existing.received.get(&chunk).map_or(0, |c| c.len() as u64);
                existing.buffered_bytes() - replaced
            }
            None => 0,
        };
        let projected = buffered + data.len() as u64;
        if projected > metadata.total_size {
            return Err(DeployError::integrity(
                transfer_id,
                IntegrityFailure::ExceedsDeclaredSize {
                    chunk,
                    buffered: projected,
                    declared: metadata.total_size,
                },
            ));
        }
        let transfer = transfers
            .entry(transfer_id.to_string())
            .or_insert_with(|| Transfer::new(metadata, now));

        if transfer.received.insert(chunk, data).is_some() {
            debug!(transfer_id, chunk, "Replaced previously received chunk");
        }

        let ack = ChunkAck {
            transfer_id: transfer_id.to_string(),
            chunk_number: chunk,
            received: transfer.received_count(),
            total_chunks: transfer.total_chunks,
            complete: transfer.is_complete(),
        };
        drop(transfers);

        debug!(
            transfer_id,
            chunk,
            received = ack.received,
            total = ack.total_chunks,
            "Stored chunk"
        );
        if ack.complete {
            info!(transfer_id, chunks = ack.total_chunks, "Transfer complete");
        }

        Ok(ack)
    }

    /// True iff the transfer exists and holds one chunk per expected index
    pub fn is_complete(&self, transfer_id: &str) -> bool {
        self.transfers
            .lock()
            .get(transfer_id)
            .map(Transfer::is_complete)
            .unwrap_or(false)
    }

    pub fn contains(&self, transfer_id: &str) -> bool {
        self.transfers.lock().contains_key(transfer_id)
    }

    /// Concatenate a transfer's chunks in index order and drop the transfer
    ///
    /// Checks every index and the total size itself rather than trusting the
    /// completeness count. On failure the transfer stays in the store until
    /// the garbage collector evicts it.
    pub fn assemble(&self, transfer_id: &str) -> Result<Vec<u8>, DeployError> {
        let transfer = {
            let mut transfers = self.transfers.lock();
            let transfer = transfers
                .get(transfer_id)
                .ok_or_else(|| DeployError::integrity(transfer_id, IntegrityFailure::UnknownTransfer))?;

            if let Some(missing) = transfer.first_missing() {
                return Err(DeployError::integrity(transfer_id, IntegrityFailure::MissingChunk(missing)));
            }

            let actual: u64 = (0..transfer.total_chunks)
                .filter_map(|i| transfer.received.get(&i))
                .map(|c| c.len() as u64)
                .sum();
            if actual != transfer.total_size {
                return Err(DeployError::integrity(
                    transfer_id,
                    IntegrityFailure::TotalSizeMismatch {
                        expected: transfer.total_size,
                        actual,
                    },
                ));
            }

            transfers.remove(transfer_id)
        };

        let transfer = transfer
            .ok_or_else(|| DeployError::integrity(transfer_id, IntegrityFailure::UnknownTransfer))?;
        let bytes = transfer.into_bytes();
        info!(transfer_id, bytes = bytes.len(), "Transfer assembled");
        Ok(bytes)
    }

    /// Drop a transfer regardless of its state
    pub fn remove(&self, transfer_id: &str) -> bool {
        self.transfers.lock().remove(transfer_id).is_some()
    }

    /// Evict transfers started more than `timeout` ago
    pub fn evict_expired(&self, timeout: Duration) -> usize {
        self.evict_expired_at(Instant::now(), timeout)
    }

    pub fn evict_expired_at(&self, now: Instant, timeout: Duration) -> usize {
        let mut transfers = self.transfers.lock();
        let before = transfers.len();
        transfers.retain(|transfer_id, transfer| {
            let expired = now.saturating_duration_since(transfer.started_at) > timeout;
            if expired {
                warn!(
                    transfer_id,
                    received = transfer.received_count(),
                    total = transfer.total_chunks,
                    "Evicting abandoned transfer"
                );
            }
            !expired
        });
        before - transfers.len()
    }

    pub fn stats(&self) -> TransferStats {
        let transfers = self.transfers.lock();
        TransferStats {
            active: transfers.len(),
            buffered_bytes: transfers.values().map(Transfer::buffered_bytes).sum(),
        }
    }
}

/// Periodically evict abandoned transfers until shutdown
pub async fn gc_loop(
    store: Arc<TransferStore>,
    interval: Duration,
    timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let evicted = store.evict_expired(timeout);
                if evicted > 0 {
                    info!(evicted, "Transfer garbage collection");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("Transfer garbage collector stopped");
                    break;
                }
            }
        }
    }
}
