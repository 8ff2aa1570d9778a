//! Diagnostic collectors for a MongoDB deployment.
//!
//! Each collector owns a fixed descriptor table, issues its own upstream
//! queries through a shared [`CollectorContext`] and translates the loosely
//! typed replies into [`Sample`](crate::metric::Sample)s.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       FanOut (registry)                      │
//! │   one scoped thread per collector, panics caught per thread  │
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────────┐          │
//! │  │ ServerStatus │ │  ReplicaSet  │ │   Profile    │  ...     │
//! │  │  DescSet     │ │  DescSet     │ │  DescSet     │          │
//! │  └──────┬───────┘ └──────┬───────┘ └──────┬───────┘          │
//! │         └────────────────┼────────────────┘                  │
//! │                          │                                   │
//! │                ┌─────────▼─────────┐      ┌────────────────┐ │
//! │                │ CollectorContext  │─────►│ SampleSink     │ │
//! │                │ policy, labels,   │      │ (mpsc sender)  │ │
//! │                │ shutdown, timeout │      └────────────────┘ │
//! │                └─────────┬─────────┘                         │
//! └──────────────────────────┼───────────────────────────────────┘
//!                            │
//!                 ┌──────────▼──────────┐
//!                 │  DiagnosticClient   │ (trait)
//!                 └──────────┬──────────┘
//!                  ┌─────────┴─────────┐
//!           ┌──────▼──────┐     ┌──────▼──────┐
//!           │ MongoClient │     │ MockClient  │
//!           │ (driver)    │     │ (testing)   │
//!           └─────────────┘     └─────────────┘
//! ```
//!
//! # Failure semantics
//!
//! A collector never returns an error. A failed query is logged and the
//! collector returns early with whatever it already emitted; absent or
//! wrong-typed fields are skipped silently.
//!
//! # Usage
//!
//! ```
//! use std::sync::{Arc, mpsc};
//! use mongo_exporter_core::collector::{CollectorContext, MetricCollector, ServerStatusCollector};
//! use mongo_exporter_core::config::CollectorConfig;
//! use mongo_exporter_core::metric::SampleSink;
//! use mongo_exporter_core::mock::MockClient;
//!
//! let ctx = CollectorContext::new(Arc::new(MockClient::standalone()), &CollectorConfig::default()).unwrap();
//! let collector = ServerStatusCollector::new(ctx).unwrap();
//! let (tx, rx) = mpsc::channel();
//! collector.collect(&SampleSink::new(tx));
//! assert!(rx.try_iter().count() > 0);
//! ```

mod collstats;
mod compatibility;
mod connection_pool;
mod cursors;
mod index_stats;
mod lock_metrics;
mod locks;
mod operation_metrics;
mod profile;
mod query_executor;
mod replica_set;
mod server_status;
mod sharding;
mod storage_stats;
mod wiredtiger;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mongodb::bson::{Document, doc};
use prometheus::core::Desc;
use tracing::{debug, error};

use crate::client::{ClientError, DiagnosticClient, FindOptions};
use crate::config::CollectorConfig;
use crate::labels::{InstanceLabels, InvalidLabelName, StaticLabels};
use crate::metric::SampleSink;
use crate::policy::EnablementPolicy;

pub use collstats::CollStatsCollector;
pub use compatibility::CompatibilityCollector;
pub use connection_pool::ConnectionPoolCollector;
pub use cursors::CursorsCollector;
pub use index_stats::IndexStatsCollector;
pub use lock_metrics::LockMetricsCollector;
pub use locks::LocksCollector;
pub use operation_metrics::OperationMetricsCollector;
pub use profile::ProfileCollector;
pub use query_executor::QueryExecutorCollector;
pub use replica_set::ReplicaSetCollector;
pub use server_status::ServerStatusCollector;
pub use sharding::ShardingCollector;
pub use storage_stats::StorageStatsCollector;
pub use wiredtiger::WiredTigerCollector;

/// Per-query timeout for single-command collectors.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-query timeout for collectors that walk databases or directories.
pub const EXTENDED_TIMEOUT: Duration = Duration::from_secs(15);

/// Databases never walked by per-database collectors.
const SYSTEM_DATABASES: [&str; 3] = ["admin", "config", "local"];

/// A named source of metrics.
///
/// `collect` is called at most once at a time per instance; the fan-out runs
/// each registered collector on its own thread once per cycle.
pub trait MetricCollector: Send + Sync {
    /// Stable identifier, also the name matched by the enablement policy.
    fn name(&self) -> &str;

    /// Every descriptor this collector may emit. No I/O.
    fn describe(&self) -> Vec<Desc>;

    /// Queries the server and sends observations into `sink`.
    fn collect(&self, sink: &SampleSink);
}

/// Cooperative cancellation flag shared by the manager, the fan-out and every
/// collector context.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Query timeouts handed to collectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub default: Duration,
    pub extended: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            default: DEFAULT_TIMEOUT,
            extended: EXTENDED_TIMEOUT,
        }
    }
}

/// Everything a collector shares with its siblings.
///
/// Cheap to clone; every query method refuses to run once shutdown has been
/// triggered.
#[derive(Clone)]
pub struct CollectorContext {
    client: Arc<dyn DiagnosticClient>,
    policy: Arc<EnablementPolicy>,
    statics: StaticLabels,
    shutdown: ShutdownSignal,
    timeouts: Timeouts,
}

impl CollectorContext {
    pub fn new(
        client: Arc<dyn DiagnosticClient>,
        config: &CollectorConfig,
    ) -> Result<Self, InvalidLabelName> {
        Ok(Self {
            client,
            policy: Arc::new(config.policy()),
            statics: config.static_labels()?,
            shutdown: ShutdownSignal::new(),
            timeouts: Timeouts::default(),
        })
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.policy.is_enabled(name)
    }

    pub fn any_enabled(&self, names: &[&str]) -> bool {
        self.policy.any_enabled(names)
    }

    pub fn statics(&self) -> &StaticLabels {
        &self.statics
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn client(&self) -> &Arc<dyn DiagnosticClient> {
        &self.client
    }

    /// Labels derived from a snapshot, static labels merged last.
    pub fn labels_for(&self, snapshot: &Document) -> InstanceLabels {
        InstanceLabels::from_snapshot(snapshot, &self.statics)
    }

    /// Labels for collectors without a topology-bearing snapshot.
    pub fn unknown_labels(&self) -> InstanceLabels {
        InstanceLabels::unknown(&self.statics)
    }

    fn guard(&self) -> Result<(), ClientError> {
        if self.shutdown.is_triggered() {
            return Err(ClientError::Cancelled);
        }
        Ok(())
    }

    pub fn run_command(
        &self,
        database: &str,
        command: Document,
        timeout: Duration,
    ) -> Result<Document, ClientError> {
        self.guard()?;
        self.client.run_command(database, command, timeout)
    }

    /// `serverStatus` on `admin`.
    pub fn server_status(&self, timeout: Duration) -> Result<Document, ClientError> {
        self.run_command("admin", doc! { "serverStatus": 1 }, timeout)
    }

    /// Non-system databases in listing order.
    pub fn user_databases(&self, timeout: Duration) -> Result<Vec<String>, ClientError> {
        self.guard()?;
        Ok(self
            .client
            .list_database_names(timeout)?
            .into_iter()
            .filter(|db| !should_skip_database(db))
            .collect())
    }

    /// Non-system collections of `database` in listing order.
    pub fn user_collections(
        &self,
        database: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, ClientError> {
        self.guard()?;
        Ok(self
            .client
            .list_collection_names(database, timeout)?
            .into_iter()
            .filter(|c| !should_skip_collection(c))
            .collect())
    }

    pub fn find(
        &self,
        database: &str,
        collection: &str,
        filter: Document,
        options: FindOptions,
        timeout: Duration,
    ) -> Result<Vec<Document>, ClientError> {
        self.guard()?;
        self.client
            .find(database, collection, filter, options, timeout)
    }

    pub fn aggregate(
        &self,
        database: &str,
        collection: &str,
        pipeline: Vec<Document>,
        timeout: Duration,
    ) -> Result<Vec<Document>, ClientError> {
        self.guard()?;
        self.client
            .aggregate(database, collection, pipeline, timeout)
    }
}

/// `admin`, `config` and `local` hold no user data.
pub fn should_skip_database(name: &str) -> bool {
    SYSTEM_DATABASES.contains(&name)
}

/// `system.*` collections, but not a collection literally named `system.`.
pub fn should_skip_collection(name: &str) -> bool {
    name.len() > "system.".len() && name.starts_with("system.")
}

/// Logs a failed query at error level, or at debug level when the failure
/// only means the exporter is shutting down.
pub(crate) fn log_failure(collector: &str, what: &str, err: &ClientError) {
    if matches!(err, ClientError::Cancelled) {
        debug!(collector, error = %err, "{} skipped", what);
    } else {
        error!(collector, error = %err, "failed to {}", what);
    }
}

/// Builds every collector with the given context and configuration.
///
/// The list is not filtered by the enablement policy; each collector checks
/// the policy at the top of `collect`.
pub fn default_collectors(
    ctx: &CollectorContext,
    config: &CollectorConfig,
) -> Result<Vec<Arc<dyn MetricCollector>>, prometheus::Error> {
    let collectors: Vec<Arc<dyn MetricCollector>> = vec![
        Arc::new(ServerStatusCollector::new(ctx.clone())?),
        Arc::new(ReplicaSetCollector::new(ctx.clone())?),
        Arc::new(WiredTigerCollector::new(ctx.clone())?),
        Arc::new(LocksCollector::new(ctx.clone())?),
        Arc::new(LockMetricsCollector::new(ctx.clone())?),
        Arc::new(IndexStatsCollector::new(ctx.clone(), config)?),
        Arc::new(StorageStatsCollector::new(ctx.clone())?),
        Arc::new(QueryExecutorCollector::new(ctx.clone())?),
        Arc::new(OperationMetricsCollector::new(ctx.clone())?),
        Arc::new(CollStatsCollector::new(ctx.clone(), config)?),
        Arc::new(CursorsCollector::new(ctx.clone())?),
        Arc::new(ProfileCollector::new(ctx.clone(), config)?),
        Arc::new(ConnectionPoolCollector::new(ctx.clone(), config)?),
        Arc::new(ShardingCollector::new(ctx.clone(), config)?),
        Arc::new(CompatibilityCollector::new(ctx.clone())?),
    ];
    Ok(collectors)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers shared by collector tests.

    use std::collections::HashMap;
    use std::sync::{Arc, mpsc};

    use super::*;
    use crate::metric::Sample;
    use crate::mock::MockClient;

    pub fn context(mock: MockClient) -> (CollectorContext, Arc<MockClient>) {
        context_with(mock, &CollectorConfig::default())
    }

    pub fn context_with(
        mock: MockClient,
        config: &CollectorConfig,
    ) -> (CollectorContext, Arc<MockClient>) {
        let mock = Arc::new(mock);
        let client: Arc<dyn DiagnosticClient> = mock.clone();
        let ctx = CollectorContext::new(client, config).unwrap();
        (ctx, mock)
    }

    pub fn run(collector: &dyn MetricCollector) -> Vec<Sample> {
        let (tx, rx) = mpsc::channel();
        collector.collect(&SampleSink::new(tx));
        rx.try_iter().collect()
    }

    /// Value of the single sample named `name` whose labels include `labels`.
    pub fn value(samples: &[Sample], name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let matching: Vec<_> = samples
            .iter()
            .filter(|s| s.name() == name)
            .filter(|s| labels.iter().all(|(k, v)| s.label(k) == Some(*v)))
            .collect();
        match matching.as_slice() {
            [one] => Some(one.value),
            _ => None,
        }
    }

    pub fn count(samples: &[Sample], name: &str) -> usize {
        samples.iter().filter(|s| s.name() == name).count()
    }

    pub fn disabled(name: &str) -> CollectorConfig {
        CollectorConfig {
            disabled_metrics: vec![name.to_string()],
            ..CollectorConfig::default()
        }
    }

    pub fn with_collector_settings(name: &str, value: serde_json::Value) -> CollectorConfig {
        let mut collectors = HashMap::new();
        collectors.insert(name.to_string(), value);
        CollectorConfig {
            collectors,
            ..CollectorConfig::default()
        }
    }
}
