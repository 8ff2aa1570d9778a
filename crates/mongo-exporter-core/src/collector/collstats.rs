//! Detailed per-collection statistics for an allow-list of namespaces.
//!
//! The allow-list comes from the `monitored_collections` setting of the
//! `collstats` (or `collection_stats`) collector section. An empty list or a
//! `*` entry selects every non-system collection. The collector answers to
//! either name in the enablement lists.

use mongodb::bson::{Document, doc};
use prometheus::core::Desc;
use tracing::debug;

use super::{CollectorContext, MetricCollector, log_failure};
use crate::client::ClientError;
use crate::config::{CollectorConfig, MonitoredCollections};
use crate::document::{get_bool, get_doc, get_number};
use crate::labels::InstanceLabels;
use crate::metric::{DescSet, SampleSink};
use crate::value::flag;

const NAME: &str = "collstats";
const ALIAS: &str = "collection_stats";

const BASIC: [(&str, &str); 6] = [
    ("size", "size"),
    ("storageSize", "storage_size"),
    ("avgObjSize", "avg_obj_size"),
    ("count", "count"),
    ("nindexes", "indexes_count"),
    ("totalIndexSize", "total_index_size"),
];

const CAPPED: [(&str, &str); 2] = [("max", "max_documents"), ("maxSize", "max_size")];

const LATENCY_OPS: [&str; 3] = ["reads", "writes", "commands"];

const READ_CONCERN_LEVELS: [&str; 5] = ["local", "available", "majority", "linearizable", "snapshot"];

pub struct CollStatsCollector {
    ctx: CollectorContext,
    descs: DescSet,
    monitored: MonitoredCollections,
}

impl CollStatsCollector {
    pub fn new(ctx: CollectorContext, config: &CollectorConfig) -> Result<Self, prometheus::Error> {
        let coll = ["database", "collection"];
        let mut d = DescSet::new(ctx.statics());
        d.gauge(
            "size",
            "mongodb_collstats_size_bytes",
            "The total size of all records in the collection in bytes",
            &coll,
        )?;
        d.gauge(
            "storage_size",
            "mongodb_collstats_storage_size_bytes",
            "Total amount of storage allocated to the collection in bytes",
            &coll,
        )?;
        d.gauge(
            "avg_obj_size",
            "mongodb_collstats_avg_obj_size_bytes",
            "Average object size in the collection in bytes",
            &coll,
        )?;
        d.gauge(
            "count",
            "mongodb_collstats_count",
            "Number of documents in the collection",
            &coll,
        )?;
        d.gauge(
            "indexes_count",
            "mongodb_collstats_indexes_count",
            "Number of indexes in the collection",
            &coll,
        )?;
        d.gauge(
            "total_index_size",
            "mongodb_collstats_total_index_size_bytes",
            "Total size of all indexes in the collection in bytes",
            &coll,
        )?;
        d.gauge(
            "index_size",
            "mongodb_collstats_index_size_bytes",
            "Size of specific index in bytes",
            &["database", "collection", "index"],
        )?;
        d.gauge(
            "capped",
            "mongodb_collstats_capped",
            "Whether the collection is capped (1) or not (0)",
            &coll,
        )?;
        d.gauge(
            "max_documents",
            "mongodb_collstats_max_documents",
            "Maximum number of documents in capped collection",
            &coll,
        )?;
        d.gauge(
            "max_size",
            "mongodb_collstats_max_size_bytes",
            "Maximum size of capped collection in bytes",
            &coll,
        )?;
        d.gauge(
            "wt_cache",
            "mongodb_collstats_wiredtiger_cache_bytes",
            "WiredTiger cache usage for collection in bytes",
            &coll,
        )?;
        d.gauge(
            "wt_checkpoint",
            "mongodb_collstats_wiredtiger_block_checkpoint_bytes",
            "WiredTiger block manager checkpoint bytes for collection",
            &coll,
        )?;
        d.gauge(
            "wt_compression",
            "mongodb_collstats_wiredtiger_compression_ratio",
            "WiredTiger compression ratio for collection",
            &coll,
        )?;
        d.counter(
            "ops",
            "mongodb_collstats_ops_total",
            "Total number of operations performed on the collection",
            &["database", "collection", "operation"],
        )?;
        d.gauge(
            "latency",
            "mongodb_collstats_latency_microseconds",
            "Average latency for operations on the collection in microseconds",
            &["database", "collection", "operation"],
        )?;
        d.counter(
            "read_concern",
            "mongodb_collstats_read_concern_counters",
            "Read concern usage counters for collection",
            &["database", "collection", "read_concern"],
        )?;

        let monitored = config.monitored_collections();
        debug!(collector = NAME, monitored = ?monitored, "collection stats configuration");
        Ok(Self {
            ctx,
            descs: d,
            monitored,
        })
    }

    fn scrape(&self, sink: &SampleSink) -> Result<(), ClientError> {
        let timeout = self.ctx.timeouts().extended;
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
                if !self.monitored.matches(&db, &coll) {
                    continue;
                }
                match self
                    .ctx
                    .run_command(&db, doc! { "collStats": coll.as_str() }, timeout)
                {
                    Ok(stats) => self.emit_collection(&db, &coll, &stats, &labels, sink),
                    Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
                    Err(e) => debug!(
                        collector = NAME,
                        database = %db,
                        collection = %coll,
                        error = %e,
                        "failed to get collection stats"
                    ),
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
        let extra = [db, coll];

        for (field, key) in BASIC {
            d.emit_opt(sink, key, get_number(stats, &[field]), labels, &extra);
        }
        if let Some(capped) = get_bool(stats, &["capped"]) {
            d.emit(sink, "capped", flag(capped), labels, &extra);
            if capped {
                for (field, key) in CAPPED {
                    d.emit_opt(sink, key, get_number(stats, &[field]), labels, &extra);
                }
            }
        }

        if let Some(sizes) = get_doc(stats, &["indexSizes"]) {
            for (index, size) in sizes {
                d.emit_opt(
                    sink,
                    "index_size",
                    crate::value::numeric(size),
                    labels,
                    &[db, coll, index.as_str()],
                );
            }
        }

        if let Some(wt) = get_doc(stats, &["wiredTiger"]) {
            d.emit_opt(
                sink,
                "wt_cache",
                get_number(wt, &["cache", "bytes currently in the cache"]),
                labels,
                &extra,
            );
            d.emit_opt(
                sink,
                "wt_checkpoint",
                get_number(wt, &["block-manager", "checkpoint size"]),
                labels,
                &extra,
            );
            d.emit_opt(
                sink,
                "wt_compression",
                get_number(wt, &["compression", "compression ratio"]),
                labels,
                &extra,
            );
        }

        if let Some(latency) = get_doc(stats, &["latencyStats"]) {
            for op in LATENCY_OPS {
                let Some(ops) = get_number(latency, &[op, "ops"]).filter(|ops| *ops > 0.0) else {
                    continue;
                };
                d.emit(sink, "ops", ops, labels, &[db, coll, op]);
                d.emit_opt(
                    sink,
                    "latency",
                    get_number(latency, &[op, "latency"]).map(|total| total / ops),
                    labels,
                    &[db, coll, op],
                );
            }
        }

        if let Some(read_concern) = get_doc(stats, &["readConcern"]) {
            for level in READ_CONCERN_LEVELS {
                d.emit_opt(
                    sink,
                    "read_concern",
                    get_number(read_concern, &[level]),
                    labels,
                    &[db, coll, level],
                );
            }
        }
    }
}

impl MetricCollector for CollStatsCollector {
    fn name(&self) -> &str {
        NAME
    }

    fn describe(&self) -> Vec<Desc> {
        self.descs.descs()
    }

    fn collect(&self, sink: &SampleSink) {
        if !self.ctx.any_enabled(&[NAME, ALIAS]) {
            return;
        }
        if let Err(e) = self.scrape(sink) {
            log_failure(NAME, "list databases", &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::testing::*;
    use crate::mock::{MockCall, MockClient};
    use serde_json::json;

    fn collect_with(mock: MockClient, config: &CollectorConfig) -> (Vec<crate::metric::Sample>, Vec<MockCall>) {
        let (ctx, mock) = context_with(mock, config);
        let samples = run(&CollStatsCollector::new(ctx, config).unwrap());
        (samples, mock.calls())
    }

    #[test]
    fn test_all_collections_by_default() {
        let (samples, _) = collect_with(MockClient::standalone(), &CollectorConfig::default());
        let orders = [("database", "shop"), ("collection", "orders")];

        assert_eq!(value(&samples, "mongodb_collstats_count", &orders), Some(1_000.0));
        assert_eq!(value(&samples, "mongodb_collstats_indexes_count", &orders), Some(2.0));
        assert_eq!(value(&samples, "mongodb_collstats_capped", &orders), Some(0.0));
        assert_eq!(count(&samples, "mongodb_collstats_max_documents"), 0);
        assert_eq!(count(&samples, "mongodb_collstats_index_size_bytes"), 4);
        assert_eq!(
            value(&samples, "mongodb_collstats_wiredtiger_cache_bytes", &orders),
            Some(8_192.0)
        );
        assert_eq!(count(&samples, "mongodb_collstats_count"), 2);
    }

    #[test]
    fn test_latency_is_averaged_and_idle_ops_skipped() {
        let (samples, _) = collect_with(MockClient::standalone(), &CollectorConfig::default());
        let reads = [("collection", "orders"), ("operation", "reads")];
        assert_eq!(value(&samples, "mongodb_collstats_ops_total", &reads), Some(30.0));
        assert_eq!(
            value(&samples, "mongodb_collstats_latency_microseconds", &reads),
            Some(50.0)
        );
        assert_eq!(
            value(
                &samples,
                "mongodb_collstats_ops_total",
                &[("collection", "orders"), ("operation", "commands")]
            ),
            None
        );
    }

    #[test]
    fn test_monitored_allow_list() {
        let config = with_collector_settings(
            "collection_stats",
            json!({ "monitored_collections": "shop.users" }),
        );
        let (samples, calls) = collect_with(MockClient::standalone(), &config);
        assert!(samples.iter().all(|s| s.label("collection") == Some("users")));
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, MockCall::Command { name, .. } if name == "collStats"))
                .count(),
            1
        );
    }

    #[test]
    fn test_enabled_by_alias() {
        let config = CollectorConfig {
            enabled_metrics: vec!["collection_stats".into()],
            ..Default::default()
        };
        let (samples, _) = collect_with(MockClient::standalone(), &config);
        assert!(!samples.is_empty());

        let config = CollectorConfig {
            enabled_metrics: vec!["server_status".into()],
            ..Default::default()
        };
        let (samples, calls) = collect_with(MockClient::standalone(), &config);
        assert!(samples.is_empty());
        assert!(calls.is_empty());
    }

    #[test]
    fn test_capped_collection() {
        let mut mock = MockClient::new();
        mock.add_collection("logs", "events");
        mock.add_command(
            "logs",
            "collStats",
            doc! {
                "capped": true,
                "max": 5_000_i64,
                "maxSize": 1_048_576_i64,
                "readConcern": { "majority": 3_i64 },
                "wiredTiger": { "compression": { "compression ratio": 2.5 } },
            },
        );
        let (samples, _) = collect_with(mock, &CollectorConfig::default());
        assert_eq!(value(&samples, "mongodb_collstats_capped", &[]), Some(1.0));
        assert_eq!(value(&samples, "mongodb_collstats_max_documents", &[]), Some(5_000.0));
        assert_eq!(
            value(&samples, "mongodb_collstats_max_size_bytes", &[]),
            Some(1_048_576.0)
        );
        assert_eq!(
            value(
                &samples,
                "mongodb_collstats_read_concern_counters",
                &[("read_concern", "majority")]
            ),
            Some(3.0)
        );
        assert_eq!(
            value(&samples, "mongodb_collstats_wiredtiger_compression_ratio", &[]),
            Some(2.5)
        );
    }
}
