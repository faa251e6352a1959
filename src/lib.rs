//! Deploygate - push a container image in chunks, get a routed service back
//!
//! This library provides:
//! - Reassembly of images uploaded as ordered HTTP chunks
//! - Image import and container start with conflict detection and verified rollback
//! - Proxy route reconciliation that updates a domain's route in place on redeploy
//! - Garbage collection of abandoned transfers

pub mod config;
pub mod db;
pub mod deploy;
pub mod docker;
pub mod engine;
pub mod error;
pub mod importer;
pub mod proxy;
pub mod reconcile;
pub mod server;
pub mod transfer;
