//! mongo-exporter-core: collector engine for the MongoDB exporter.
//!
//! Provides:
//! - `client`: upstream client trait and the MongoDB driver implementation
//! - `collector`: diagnostic collectors and their shared context
//! - `registry`: fan-out engine and the `prometheus` registry adapter
//! - `manager`: collector lifecycle and shutdown
//! - `config`, `policy`, `labels`: resolved collector configuration
//! - `metric`, `document`, `value`: descriptors, samples and reply decoding
//! - `mock`: scripted in-memory client for tests

pub mod client;
pub mod collector;
pub mod config;
pub mod document;
pub mod labels;
pub mod manager;
pub mod metric;
pub mod mock;
pub mod policy;
pub mod registry;
pub mod value;

pub use client::{ClientError, DiagnosticClient, MongoClient};
pub use collector::{MetricCollector, ShutdownSignal};
pub use config::CollectorConfig;
pub use manager::{CollectorManager, ExporterError};
pub use registry::{CollectReport, CollectorFault, FanOut, PrometheusBridge};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
