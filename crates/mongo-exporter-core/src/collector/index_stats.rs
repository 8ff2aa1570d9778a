//! Index sizes, access counts and unused-index detection for every
//! non-system collection.
//!
//! Access counts come from the `indexAccesses` section of `collStats` when
//! the server provides it, otherwise from a `$indexStats` aggregation.
//!
//! There is no reliable last-access timestamp in either source. An index with
//! no recorded access is reported unused with a fixed one-year
//! `unused_duration_hours`; the value only means "no access observed since the
//! counters were last reset".

use std::collections::BTreeMap;

use chrono::Utc;
use mongodb::bson::{Document, doc};
use prometheus::core::Desc;
use tracing::{debug, warn};

use super::{CollectorContext, MetricCollector, log_failure};
use crate::client::ClientError;
use crate::config::CollectorConfig;
use crate::document::{documents, get_array, get_doc, get_number, get_str};
use crate::labels::InstanceLabels;
use crate::metric::{DescSet, SampleSink};

const NAME: &str = "index_stats";

/// Reported for indexes without any recorded access.
pub const UNUSED_SENTINEL_HOURS: f64 = 8760.0;

const INDEX_OPS: [(&str, &str); 3] = [("builds", "build"), ("drops", "drop"), ("reindexes", "reindex")];

pub struct IndexStatsCollector {
    ctx: CollectorContext,
    descs: DescSet,
    max_indexes: Option<usize>,
}

impl IndexStatsCollector {
    pub fn new(ctx: CollectorContext, config: &CollectorConfig) -> Result<Self, prometheus::Error> {
        let labels = ["database", "collection", "index"];
        let mut d = DescSet::new(ctx.statics());
        d.gauge(
            "size",
            "mongodb_index_size_bytes",
            "Size of the index in bytes",
            &labels,
        )?;
        d.counter(
            "accesses",
            "mongodb_index_accesses_total",
            "Number of times the index has been accessed",
            &labels,
        )?;
        d.gauge(
            "miss_ratio",
            "mongodb_index_miss_ratio",
            "Ratio of index misses to total accesses",
            &labels,
        )?;
        d.counter(
            "ops",
            "mongodb_index_ops_total",
            "Number of operations on the index",
            &["database", "collection", "index", "type"],
        )?;
        d.gauge(
            "usage_status",
            "mongodb_index_usage_status",
            "Index usage status (1=used, 0=unused)",
            &labels,
        )?;
        d.gauge(
            "last_access_time",
            "mongodb_index_last_access_time",
            "Last time the index was seen in use (Unix timestamp)",
            &labels,
        )?;
        d.gauge(
            "access_frequency",
            "mongodb_index_access_frequency",
            "Index accesses recorded by the server",
            &labels,
        )?;
        d.gauge(
            "unused_duration_hours",
            "mongodb_index_unused_duration_hours",
            "Hours since last index access; 8760 when no access was ever recorded",
            &labels,
        )?;
        Ok(Self {
            ctx,
            descs: d,
            max_indexes: config.limit_setting(NAME, "max_indexes_per_collection"),
        })
    }

    fn scrape(&self, sink: &SampleSink) -> Result<(), ClientError> {
        let timeout = self.ctx.timeouts().default;
        let labels = self.ctx.unknown_labels();

        for db in self.ctx.user_databases(timeout)? {
            let collections = match self.ctx.user_collections(&db, timeout) {
                Ok(collections) => collections,
                Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
                Err(e) => {
                    log_failure(NAME, &format!("list collections of {}", db), &e);
                    continue;
                }
            };
            for coll in collections {
                match self
                    .ctx
                    .run_command(&db, doc! { "collStats": coll.as_str() }, timeout)
                {
                    Ok(stats) => self.emit_collection(&db, &coll, &stats, &labels, sink),
                    Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
                    Err(e) => {
                        debug!(
                            collector = NAME,
                            database = %db,
                            collection = %coll,
                            error = %e,
                            "failed to get collection stats"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn emit_collection(
        &self,
        db: &str,
        coll: &str,
        stats: &Document,
        labels: &InstanceLabels,
        sink: &SampleSink,
    ) {
        let d = &self.descs;
        let now = Utc::now().timestamp() as f64;

        let mut sizes: Vec<(&str, f64)> = get_doc(stats, &["indexSizes"])
            .map(|sizes| {
                sizes
                    .iter()
                    .filter_map(|(name, v)| crate::value::numeric(v).map(|s| (name.as_str(), s)))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(max) = self.max_indexes {
            sizes.truncate(max);
        }

        let accesses = match get_doc(stats, &["indexAccesses"]) {
            Some(section) => accesses_from_stats(section),
            None => self.accesses_from_aggregation(db, coll),
        };

        for (index, size) in &sizes {
            d.emit(sink, "size", *size, labels, &[db, coll, *index]);
        }

        for (index, access) in &accesses {
            if !sizes.iter().any(|(name, _)| name == index) && self.max_indexes.is_some() {
                continue;
            }
            let extra = [db, coll, index.as_str()];
            d.emit_opt(sink, "accesses", access.ops, labels, &extra);
            d.emit_opt(sink, "miss_ratio", access.miss_ratio, labels, &extra);
            if let Some(ops) = access.ops.filter(|ops| *ops > 0.0) {
                d.emit(sink, "usage_status", 1.0, labels, &extra);
                d.emit(sink, "last_access_time", now, labels, &extra);
                d.emit(sink, "access_frequency", ops, labels, &extra);
            }
        }

        for (index, _) in &sizes {
            let used = accesses
                .get(*index)
                .and_then(|a| a.ops)
                .is_some_and(|ops| ops > 0.0);
            if used {
                continue;
            }
            let extra = [db, coll, *index];
            d.emit(sink, "usage_status", 0.0, labels, &extra);
            d.emit(sink, "unused_duration_hours", UNUSED_SENTINEL_HOURS, labels, &extra);
            d.emit(sink, "last_access_time", 0.0, labels, &extra);
            d.emit(sink, "access_frequency", 0.0, labels, &extra);
        }

        if let Some(index_stats) = get_array(stats, &["indexStats"]) {
            for entry in documents(index_stats) {
                let Some(index) = get_str(entry, &["name"]) else {
                    warn!(collector = NAME, database = %db, collection = %coll, "invalid index name");
                    continue;
                };
                for (field, kind) in INDEX_OPS {
                    d.emit_opt(
                        sink,
                        "ops",
                        get_number(entry, &[field]),
                        labels,
                        &[db, coll, index, kind],
                    );
                }
            }
        }
    }

    fn accesses_from_aggregation(&self, db: &str, coll: &str) -> BTreeMap<String, IndexAccess> {
        let pipeline = vec![doc! { "$indexStats": {} }];
        match self
            .ctx
            .aggregate(db, coll, pipeline, self.ctx.timeouts().default)
        {
            Ok(rows) => rows
                .iter()
                .filter_map(|row| {
                    let name = get_str(row, &["name"])?;
                    Some((
                        name.to_string(),
                        IndexAccess {
                            ops: get_number(row, &["accesses", "ops"]),
                            miss_ratio: None,
                        },
                    ))
                })
                .collect(),
            Err(e) => {
                debug!(collector = NAME, database = %db, collection = %coll, error = %e, "index usage unavailable");
                BTreeMap::new()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct IndexAccess {
    ops: Option<f64>,
    miss_ratio: Option<f64>,
}

fn accesses_from_stats(section: &Document) -> BTreeMap<String, IndexAccess> {
    section
        .iter()
        .filter_map(|(name, v)| {
            let access = v.as_document()?;
            Some((
                name.clone(),
                IndexAccess {
                    ops: get_number(access, &["ops"]),
                    miss_ratio: get_number(access, &["missRatio"]),
                },
            ))
        })
        .collect()
}

impl MetricCollector for IndexStatsCollector {
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
            log_failure(NAME, "list databases", &e);
        }
    }
}
