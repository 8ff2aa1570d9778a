//! Lock acquisition statistics per lock type and mode.
//!
//! Modern servers report `locks.<LockType>.<field>.<mode>` server-wide;
//! those series carry `database="global"`. Older servers nest the same shape
//! under each database name, which is kept as the `database` label.

use mongodb::bson::Document;
use prometheus::core::Desc;

use super::{CollectorContext, MetricCollector, log_failure};
use crate::client::ClientError;
use crate::document::{get_doc, get_number, sub_documents};
use crate::labels::InstanceLabels;
use crate::metric::{DescSet, SampleSink};

const NAME: &str = "locks";

/// `database` label for server-wide lock statistics.
const GLOBAL_SCOPE: &str = "global";

const LOCK_TYPES: [&str; 7] = [
    "ParallelBatchWriterMode",
    "ReplicationStateTransition",
    "Global",
    "Database",
    "Collection",
    "Mutex",
    "Metadata",
];

const LOCK_MODES: [(&str, &str); 4] = [
    ("R", "read"),
    ("W", "write"),
    ("r", "intent_read"),
    ("w", "intent_write"),
];

/// Descriptor key and lock-section field, per metric.
const FIELDS: [(&str, &str); 4] = [
    ("held", "acquireCount"),
    ("waiting", "acquireWaitCount"),
    ("time_acquiring", "timeAcquiringMicros"),
    ("deadlocks", "deadlockCount"),
];

pub struct LocksCollector {
    ctx: CollectorContext,
    descs: DescSet,
}

impl LocksCollector {
    pub fn new(ctx: CollectorContext) -> Result<Self, prometheus::Error> {
        let labels = ["database", "lock_type"];
        let mut d = DescSet::new(ctx.statics());
        d.counter(
            "time_acquiring",
            "mongodb_locks_time_acquiring_microseconds_total",
            "Time spent acquiring locks in microseconds",
            &labels,
        )?;
        d.counter(
            "held",
            "mongodb_locks_held_total",
            "Number of times locks were acquired",
            &labels,
        )?;
        d.gauge(
            "waiting",
            "mongodb_locks_waiting_total",
            "Number of lock acquisitions that had to wait",
            &labels,
        )?;
        d.counter(
            "deadlocks",
            "mongodb_locks_deadlock_total",
            "Number of deadlocks",
            &labels,
        )?;
        Ok(Self { ctx, descs: d })
    }

    fn scrape(&self, sink: &SampleSink) -> Result<(), ClientError> {
        let status = self.ctx.server_status(self.ctx.timeouts().default)?;
        let Some(locks) = get_doc(&status, &["locks"]) else {
            return Ok(());
        };
        let labels = self.ctx.labels_for(&status);

        self.emit_scope(locks, GLOBAL_SCOPE, &labels, sink);
        for (scope, section) in sub_documents(locks) {
            if LOCK_TYPES.contains(&scope) {
                continue;
            }
            self.emit_scope(section, scope, &labels, sink);
        }
        Ok(())
    }

    /// Emits every lock type × mode found in `section`.
    fn emit_scope(
        &self,
        section: &Document,
        database: &str,
        labels: &InstanceLabels,
        sink: &SampleSink,
    ) {
        for lock_type in LOCK_TYPES {
            let Some(lock) = get_doc(section, &[lock_type]) else {
                continue;
            };
            for (key, field) in FIELDS {
                let Some(counts) = get_doc(lock, &[field]) else {
                    continue;
                };
                for (mode, mode_label) in LOCK_MODES {
                    let lock_label = format!("{}_{}", lock_type, mode_label);
                    self.descs.emit_opt(
                        sink,
                        key,
                        get_number(counts, &[mode]),
                        labels,
                        &[database, lock_label.as_str()],
                    );
                }
            }
        }
    }
}

impl MetricCollector for LocksCollector {
    fn name(&self) -> &str {
        NAME
    }

    fn describe(&self) -> Vec<Desc> {
        self.descs.descs()
    }

    fn collect(&self, sink: &SampleSink) {
        if !self.ctx.is_enabled(NAME) {
            return;
        }
        if let Err(e) = self.scrape(sink) {
            log_failure(NAME, "collect lock metrics", &e);
        }
    }
}
