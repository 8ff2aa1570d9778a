//! Slow-operation metrics aggregated from each database's `system.profile`.
//!
//! Every cycle reads the profile entries logged between the previous cycle
//! and now, so counters are per-window deltas rather than running totals.
//! The first window reaches one hour back.
//!
//! With `max_entries_per_cycle` set, entries are read oldest first. A database
//! whose window was cut short resumes just after its last entry read, so a
//! backlog drains over the following cycles.
//!
//! Entries are grouped by (operation, collection) within one database before
//! anything is emitted.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mongodb::bson::{self, Bson, Document, doc};
use prometheus::core::Desc;
use tracing::debug;

use super::{CollectorContext, MetricCollector, log_failure};
use crate::client::{ClientError, FindOptions};
use crate::config::CollectorConfig;
use crate::document::{get_doc, get_number, get_str, sub_documents};
use crate::labels::InstanceLabels;
use crate::metric::{DescSet, SampleSink};

const NAME: &str = "profile";

const PROFILE_COLLECTION: &str = "system.profile";

const STORAGE_STATS: [&str; 8] = [
    "data_read",
    "data_written",
    "index_read",
    "index_written",
    "cache_hits",
    "cache_misses",
    "pages_read",
    "pages_written",
];

/// Command document keys that are arguments, not the command name.
const COMMAND_ARGUMENTS: [&str; 3] = ["filter", "sort", "projection"];

#[derive(Debug, Default, Clone, PartialEq)]
struct LockStat {
    acquire_count: f64,
    acquire_wait_count: f64,
    time_acquiring_micros: f64,
}

/// Totals for one (operation, collection) group within a window.
#[derive(Debug, Default, Clone, PartialEq)]
struct OperationStats {
    count: u64,
    total_millis: f64,
    docs_examined: f64,
    docs_returned: f64,
    keys_examined: f64,
    response_length: f64,
    write_conflicts: f64,
    cpu_micros: f64,
    locks: BTreeMap<String, LockStat>,
    storage: BTreeMap<&'static str, f64>,
}

impl OperationStats {
    fn add(&mut self, entry: &Document) {
        self.count += 1;
        self.total_millis += get_number(entry, &["millis"]).unwrap_or(0.0);

        let exec = |field: &str, fallback: &str| {
            get_number(entry, &["execStats", field]).or_else(|| get_number(entry, &[fallback]))
        };
        self.docs_examined += exec("totalDocsExamined", "docsExamined").unwrap_or(0.0);
        self.docs_returned += exec("totalDocsReturned", "nreturned").unwrap_or(0.0);
        self.keys_examined += exec("totalKeysExamined", "keysExamined").unwrap_or(0.0);

        self.response_length += get_number(entry, &["responseLength"]).unwrap_or(0.0);
        self.write_conflicts += get_number(entry, &["writeConflicts"]).unwrap_or(0.0);
        self.cpu_micros += get_number(entry, &["cpuNanos"]).unwrap_or(0.0) / 1000.0;

        if let Some(locks) = get_doc(entry, &["locks"]) {
            for (lock_type, info) in sub_documents(locks) {
                let stat = self.locks.entry(lock_type.to_string()).or_default();
                stat.acquire_count += read_write(info, "acquireCount");
                stat.acquire_wait_count += read_write(info, "acquireWaitCount");
                stat.time_acquiring_micros += read_write(info, "timeAcquiringMicros");
            }
        }

        if let Some(storage) = get_doc(entry, &["storage"]) {
            for name in STORAGE_STATS {
                if let Some(v) = get_number(storage, &[name]) {
                    *self.storage.entry(name).or_default() += v;
                }
            }
        }
    }
}

/// Sum of the intent-shared and intent-exclusive modes of a lock field.
fn read_write(info: &Document, field: &str) -> f64 {
    ["r", "w"]
        .iter()
        .filter_map(|mode| get_number(info, &[field, mode]))
        .sum()
}

/// `op`, or the command name for entries that only carry a command document.
fn operation_type(entry: &Document) -> String {
    if let Some(op) = get_str(entry, &["op"]) {
        return op.to_string();
    }
    get_doc(entry, &["command"])
        .and_then(|command| {
            command
                .keys()
                .find(|key| !COMMAND_ARGUMENTS.contains(&key.as_str()))
        })
        .cloned()
        .unwrap_or_else(|| "unknown".to_string())
}

/// Collection part of `ns`. Commands are logged against `<db>.$cmd`; for
/// those the collection named by the command itself is used when present.
fn collection_name(entry: &Document) -> String {
    let Some(ns) = get_str(entry, &["ns"]) else {
        return "unknown".to_string();
    };
    let collection = match ns.split_once('.') {
        Some((_, collection)) => collection,
        None => ns,
    };
    if collection == "$cmd" {
        let target = get_doc(entry, &["command"]).and_then(|command| match command.iter().next() {
            Some((_, Bson::String(target))) => Some(target.clone()),
            _ => None,
        });
        if let Some(target) = target {
            return target;
        }
    }
    collection.to_string()
}

/// Start of the next read window.
#[derive(Debug, Clone, PartialEq)]
struct Watermark {
    since: DateTime<Utc>,
    /// Databases still behind `since` after a capped read.
    behind: BTreeMap<String, DateTime<Utc>>,
}

impl Watermark {
    fn start(&self, db: &str) -> DateTime<Utc> {
        self.behind.get(db).copied().unwrap_or(self.since)
    }
}

pub struct ProfileCollector {
    ctx: CollectorContext,
    descs: DescSet,
    max_entries: Option<usize>,
    /// Held for the whole cycle; `collect` never runs concurrently with
    /// itself on one instance.
    watermark: Mutex<Watermark>,
}

impl ProfileCollector {
    pub fn new(ctx: CollectorContext, config: &CollectorConfig) -> Result<Self, prometheus::Error> {
        let op_labels = ["database", "operation", "collection"];
        let lock_labels = ["database", "operation", "collection", "lock_type"];
        let mut d = DescSet::new(ctx.statics());
        d.counter(
            "slow_operations",
            "mongodb_profile_slow_operations_total",
            "Total number of slow operations by type",
            &op_labels,
        )?;
        d.gauge(
            "duration",
            "mongodb_profile_operations_duration_seconds",
            "Average duration of profiled operations in seconds",
            &op_labels,
        )?;
        d.counter(
            "examined_docs",
            "mongodb_profile_operations_examined_docs",
            "Number of documents examined by profiled operations",
            &op_labels,
        )?;
        d.counter(
            "docs_returned",
            "mongodb_profile_operations_docs_returned",
            "Number of documents returned by profiled operations",
            &op_labels,
        )?;
        d.counter(
            "keys_examined",
            "mongodb_profile_operations_keys_examined",
            "Number of index keys examined by profiled operations",
            &op_labels,
        )?;
        d.counter(
            "response_length",
            "mongodb_profile_operations_response_length_bytes",
            "Response length in bytes for profiled operations",
            &op_labels,
        )?;
        d.counter(
            "locks_acquired",
            "mongodb_profile_operations_locks_acquired",
            "Number of locks acquired during profiled operations",
            &lock_labels,
        )?;
        d.counter(
            "lock_wait",
            "mongodb_profile_operations_lock_wait_time_microseconds",
            "Time spent waiting for locks during profiled operations in microseconds",
            &lock_labels,
        )?;
        d.counter(
            "plan_summary",
            "mongodb_profile_plan_summary_total",
            "Total number of operations by execution plan summary",
            &["database", "plan_summary"],
        )?;
        d.counter(
            "write_conflicts",
            "mongodb_profile_write_conflicts_total",
            "Total number of write conflicts in profiled operations",
            &op_labels,
        )?;
        d.counter(
            "storage_stats",
            "mongodb_profile_storage_stats_total",
            "Storage engine statistics from profiled operations",
            &["database", "operation", "collection", "storage_stat"],
        )?;
        d.counter(
            "cpu_time",
            "mongodb_profile_cpu_time_microseconds",
            "CPU time used by profiled operations in microseconds",
            &op_labels,
        )?;
        Ok(Self {
            ctx,
            descs: d,
            max_entries: config.limit_setting(NAME, "max_entries_per_cycle"),
            watermark: Mutex::new(Watermark {
                since: Utc::now() - ChronoDuration::hours(1),
                behind: BTreeMap::new(),
            }),
        })
    }

    fn scrape(&self, sink: &SampleSink) -> Result<(), ClientError> {
        let mut watermark = match self.watermark.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let timeout = self.ctx.timeouts().extended;
        let labels = self.ctx.unknown_labels();
        let until = Utc::now();

        let databases = self.ctx.user_databases(timeout)?;
        let mut behind = BTreeMap::new();
        for db in databases {
            let since = watermark.start(&db);
            match self.collect_database(&db, since, until, &labels, sink) {
                Ok(Some(resume)) => {
                    debug!(collector = NAME, database = %db, resume = %resume, "profile read capped");
                    behind.insert(db, resume);
                }
                Ok(None) => {}
                Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
                Err(e) => debug!(collector = NAME, database = %db, error = %e, "failed to read profile"),
            }
        }
        *watermark = Watermark { since: until, behind };
        Ok(())
    }

    fn collect_database(
        &self,
        db: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        labels: &InstanceLabels,
        sink: &SampleSink,
    ) -> Result<Option<DateTime<Utc>>, ClientError> {
        let timeout = self.ctx.timeouts().extended;
        let status = self.ctx.run_command(db, doc! { "profile": -1 }, timeout)?;
        if get_number(&status, &["was"]) == Some(0.0) {
            return Ok(None);
        }

        let filter = doc! {
            "ts": {
                "$gte": bson::DateTime::from_millis(since.timestamp_millis()),
                "$lt": bson::DateTime::from_millis(until.timestamp_millis()),
            },
        };
        let options = FindOptions {
            sort: Some(doc! { "ts": 1 }),
            limit: self.max_entries.map(|n| n as i64),
        };
        let entries = self
            .ctx
            .find(db, PROFILE_COLLECTION, filter, options, timeout)?;
        self.emit_entries(db, &entries, labels, sink);
        Ok(self.resume_after(&entries))
    }

    /// Start of the next window for a read that hit the cap: one millisecond
    /// past the newest entry read, the resolution of `ts`.
    fn resume_after(&self, entries: &[Document]) -> Option<DateTime<Utc>> {
        let limit = self.max_entries?;
        if limit == 0 || entries.len() < limit {
            return None;
        }
        let last = entries.last()?.get_datetime("ts").ok()?;
        DateTime::from_timestamp_millis(last.timestamp_millis() + 1)
    }

    fn emit_entries(&self, db: &str, entries: &[Document], labels: &InstanceLabels, sink: &SampleSink) {
        let mut operations: BTreeMap<(String, String), OperationStats> = BTreeMap::new();
        let mut plans: BTreeMap<&str, u64> = BTreeMap::new();
        for entry in entries {
            operations
                .entry((operation_type(entry), collection_name(entry)))
                .or_default()
                .add(entry);
            if let Some(plan) = get_str(entry, &["planSummary"]) {
                *plans.entry(plan).or_default() += 1;
            }
        }

        let d = &self.descs;
        for ((op, coll), stats) in &operations {
            let extra = [db, op.as_str(), coll.as_str()];
            d.emit(sink, "slow_operations", stats.count as f64, labels, &extra);
            if stats.count == 0 {
                continue;
            }
            d.emit(
                sink,
                "duration",
                stats.total_millis / stats.count as f64 / 1000.0,
                labels,
                &extra,
            );
            let positive = [
                ("examined_docs", stats.docs_examined),
                ("docs_returned", stats.docs_returned),
                ("keys_examined", stats.keys_examined),
                ("response_length", stats.response_length),
                ("write_conflicts", stats.write_conflicts),
                ("cpu_time", stats.cpu_micros),
            ];
            for (key, v) in positive {
                if v > 0.0 {
                    d.emit(sink, key, v, labels, &extra);
                }
            }
            for (lock_type, lock) in &stats.locks {
                let lock_extra = [db, op.as_str(), coll.as_str(), lock_type.as_str()];
                if lock.acquire_count > 0.0 {
                    d.emit(sink, "locks_acquired", lock.acquire_count, labels, &lock_extra);
                }
                if lock.acquire_wait_count > 0.0 {
                    d.emit(sink, "lock_wait", lock.time_acquiring_micros, labels, &lock_extra);
                }
            }
            for (name, v) in &stats.storage {
                d.emit(sink, "storage_stats", *v, labels, &[db, op.as_str(), coll.as_str(), *name]);
            }
        }

        for (plan, n) in plans {
            d.emit(sink, "plan_summary", n as f64, labels, &[db, plan]);
        }
    }
}

impl MetricCollector for ProfileCollector {
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
            log_failure(NAME, "list databases for profiling", &e);
        }
    }
}
