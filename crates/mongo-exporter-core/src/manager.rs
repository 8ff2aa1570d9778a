//! Lifecycle of the collector set.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::client::{ClientError, DiagnosticClient};
use crate::collector::{CollectorContext, ShutdownSignal, Timeouts, default_collectors};
use crate::config::CollectorConfig;
use crate::labels::InvalidLabelName;
use crate::registry::{FanOut, PrometheusBridge};

/// Error type for building the collector set.
#[derive(Debug)]
pub enum ExporterError {
    /// A configured static label is not a valid label name.
    InvalidLabel(InvalidLabelName),
    /// A descriptor was rejected by the metrics library.
    Descriptor(prometheus::Error),
    /// `initialize` was called twice.
    AlreadyInitialized,
    /// The manager has been shut down.
    ShutDown,
}

impl std::fmt::Display for ExporterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExporterError::InvalidLabel(e) => write!(f, "custom labels: {}", e),
            ExporterError::Descriptor(e) => write!(f, "metric descriptor: {}", e),
            ExporterError::AlreadyInitialized => write!(f, "collectors already initialized"),
            ExporterError::ShutDown => write!(f, "collector manager is shut down"),
        }
    }
}

impl std::error::Error for ExporterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExporterError::InvalidLabel(e) => Some(e),
            ExporterError::Descriptor(e) => Some(e),
            _ => None,
        }
    }
}

impl From<InvalidLabelName> for ExporterError {
    fn from(e: InvalidLabelName) -> Self {
        ExporterError::InvalidLabel(e)
    }
}

impl From<prometheus::Error> for ExporterError {
    fn from(e: prometheus::Error) -> Self {
        ExporterError::Descriptor(e)
    }
}

/// Owns the fan-out and the shutdown signal shared with every collector.
pub struct CollectorManager {
    client: Arc<dyn DiagnosticClient>,
    config: CollectorConfig,
    timeouts: Timeouts,
    shutdown: ShutdownSignal,
    fan_out: Arc<FanOut>,
    initialized: AtomicBool,
}

impl CollectorManager {
    pub fn new(client: Arc<dyn DiagnosticClient>, config: CollectorConfig) -> Self {
        let shutdown = ShutdownSignal::new();
        Self {
            client,
            config,
            timeouts: Timeouts::default(),
            fan_out: Arc::new(FanOut::new(shutdown.clone())),
            shutdown,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Builds the default collector set and registers it with the fan-out.
    ///
    /// Every collector is registered regardless of the enablement policy;
    /// disabled ones return immediately from `collect`.
    pub fn initialize(&self) -> Result<(), ExporterError> {
        if self.shutdown.is_triggered() {
            return Err(ExporterError::ShutDown);
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(ExporterError::AlreadyInitialized);
        }

        let ctx = CollectorContext::new(Arc::clone(&self.client), &self.config)
            .inspect_err(|_| self.initialized.store(false, Ordering::SeqCst))?
            .with_shutdown(self.shutdown.clone())
            .with_timeouts(self.timeouts);
        let collectors = default_collectors(&ctx, &self.config)
            .inspect_err(|_| self.initialized.store(false, Ordering::SeqCst))?;

        let policy = self.config.policy();
        for collector in collectors {
            if !policy.is_enabled(collector.name()) {
                debug!(collector = collector.name(), "collector disabled by policy");
            }
            self.fan_out.add(collector);
        }
        info!(collectors = self.fan_out.len(), "collectors initialized");
        Ok(())
    }

    pub fn fan_out(&self) -> &Arc<FanOut> {
        &self.fan_out
    }

    /// A registry adapter over the fan-out. Call after [`initialize`](Self::initialize).
    pub fn bridge(&self) -> PrometheusBridge {
        PrometheusBridge::new(Arc::clone(&self.fan_out))
    }

    /// Round-trip to the server, refused once shut down.
    pub fn ping(&self, timeout: Duration) -> Result<(), ClientError> {
        if self.shutdown.is_triggered() {
            return Err(ClientError::Cancelled);
        }
        self.client.ping(timeout)
    }

    /// Stops new cycles and new upstream queries. In-flight queries run to
    /// completion or to their own timeout.
    pub fn shutdown(&self) {
        if self.shutdown.is_triggered() {
            warn!("collector manager already shut down");
            return;
        }
        self.shutdown.trigger();
        info!("collector manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_triggered()
    }
}
