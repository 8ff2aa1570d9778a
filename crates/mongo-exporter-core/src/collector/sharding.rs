//! Cluster topology as seen from a `mongos` router.
//!
//! `isMaster` decides everything: a process that does not answer with
//! `msg: "isdbgrid"` is not a router, and the collector stays silent.

use mongodb::bson::{Document, doc};
use prometheus::core::Desc;
use tracing::{debug, warn};

use super::{CollectorContext, MetricCollector, log_failure};
use crate::client::{ClientError, FindOptions};
use crate::config::CollectorConfig;
use crate::document::{get_bool, get_number, get_str};
use crate::labels::InstanceLabels;
use crate::metric::{DescSet, SampleSink};
use crate::value::flag;

const NAME: &str = "sharding";

const ROUTER_MSG: &str = "isdbgrid";

const MIGRATION_EVENTS: [&str; 3] = ["moveChunk.from", "moveChunk.to", "moveChunk.commit"];
const SPLIT_EVENTS: [&str; 2] = ["split", "multi-split"];
const FAILED_MIGRATION_EVENT: &str = "moveChunk.error";

type Section = fn(&ShardingCollector, &InstanceLabels, &SampleSink) -> Result<(), ClientError>;

/// Splits `db.collection` at the first dot.
fn parse_namespace(ns: &str) -> (&str, &str) {
    ns.split_once('.').unwrap_or((ns, ""))
}

pub struct ShardingCollector {
    ctx: CollectorContext,
    descs: DescSet,
    chunk_distribution: bool,
    migration_history: bool,
}

impl ShardingCollector {
    pub fn new(ctx: CollectorContext, config: &CollectorConfig) -> Result<Self, prometheus::Error> {
        let mut d = DescSet::new(ctx.statics());
        d.gauge(
            "mongos_up",
            "mongodb_mongos_up",
            "Whether the mongos instance is up",
            &[],
        )?;
        d.gauge(
            "shards",
            "mongodb_shards_total",
            "Total number of shards in the cluster",
            &[],
        )?;
        d.gauge(
            "chunks",
            "mongodb_shard_chunks_total",
            "Total number of chunks per shard",
            &["database", "collection", "shard_name"],
        )?;
        d.gauge(
            "balancer_enabled",
            "mongodb_balancer_enabled",
            "Whether the balancer is enabled (1) or disabled (0)",
            &[],
        )?;
        d.gauge(
            "balancer_running",
            "mongodb_balancer_running",
            "Whether the balancer is currently running (1) or not (0)",
            &[],
        )?;
        d.counter(
            "migrations",
            "mongodb_balancer_migrations_total",
            "Total number of chunk migrations",
            &["type"],
        )?;
        d.gauge(
            "shard_databases",
            "mongodb_shard_databases_total",
            "Number of databases on each shard",
            &["shard_name", "shard_host"],
        )?;
        d.gauge(
            "sharded_collections",
            "mongodb_sharded_collections_total",
            "Total number of sharded collections in the cluster",
            &[],
        )?;
        d.counter(
            "migrations_failed",
            "mongodb_chunk_migrations_failed_total",
            "Total number of failed chunk migrations",
            &[],
        )?;
        d.counter(
            "splits",
            "mongodb_chunk_splits_total",
            "Total number of chunk splits",
            &[],
        )?;
        Ok(Self {
            ctx,
            descs: d,
            chunk_distribution: config.bool_setting(NAME, "collect_chunk_distribution", true),
            migration_history: config.bool_setting(NAME, "collect_migration_history", true),
        })
    }

    fn scrape(&self, sink: &SampleSink) -> Result<(), ClientError> {
        let timeout = self.ctx.timeouts().extended;
        let is_master = self
            .ctx
            .run_command("admin", doc! { "isMaster": 1 }, timeout)?;
        if get_str(&is_master, &["msg"]) != Some(ROUTER_MSG) {
            debug!(collector = NAME, "not a mongos instance, skipping sharding metrics");
            return Ok(());
        }

        let labels = self.ctx.labels_for(&is_master);
        self.descs.emit(sink, "mongos_up", 1.0, &labels, &[]);

        // Sections are independent; a failed one is logged and skipped.
        let sections: [(&str, bool, Section); 5] = [
            ("query config.shards", true, Self::collect_shards),
            ("get balancer status", true, Self::collect_balancer),
            ("aggregate chunks", self.chunk_distribution, Self::collect_chunks),
            ("query config.collections", true, Self::collect_sharded_collections),
            ("aggregate config.changelog", self.migration_history, Self::collect_migrations),
        ];
        for (what, enabled, section) in sections {
            if !enabled {
                continue;
            }
            match section(self, &labels, sink) {
                Ok(()) => {}
                Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
                Err(e) => log_failure(NAME, what, &e),
            }
        }
        Ok(())
    }

    fn collect_shards(&self, labels: &InstanceLabels, sink: &SampleSink) -> Result<(), ClientError> {
        let timeout = self.ctx.timeouts().extended;
        let shards = self.ctx.find(
            "config",
            "shards",
            Document::new(),
            FindOptions::default(),
            timeout,
        )?;
        self.descs
            .emit(sink, "shards", shards.len() as f64, labels, &[]);

        for shard in &shards {
            let (Some(name), Some(host)) = (get_str(shard, &["_id"]), get_str(shard, &["host"])) else {
                warn!(collector = NAME, shard = ?shard, "invalid shard data");
                continue;
            };
            let databases = self.ctx.find(
                "config",
                "databases",
                doc! { "primary": name },
                FindOptions::default(),
                timeout,
            )?;
            self.descs.emit(
                sink,
                "shard_databases",
                databases.len() as f64,
                labels,
                &[name, host],
            );
        }
        Ok(())
    }

    fn collect_balancer(&self, labels: &InstanceLabels, sink: &SampleSink) -> Result<(), ClientError> {
        let status = self.ctx.run_command(
            "admin",
            doc! { "balancerStatus": 1 },
            self.ctx.timeouts().extended,
        )?;
        self.descs.emit_opt(
            sink,
            "balancer_enabled",
            get_str(&status, &["mode"]).map(|mode| flag(mode != "off")),
            labels,
            &[],
        );
        self.descs.emit_opt(
            sink,
            "balancer_running",
            get_bool(&status, &["inBalancerRound"]).map(flag),
            labels,
            &[],
        );
        Ok(())
    }

    fn collect_chunks(&self, labels: &InstanceLabels, sink: &SampleSink) -> Result<(), ClientError> {
        let pipeline = vec![doc! {
            "$group": {
                "_id": { "ns": "$ns", "shard": "$shard" },
                "count": { "$sum": 1 },
            },
        }];
        let groups = self
            .ctx
            .aggregate("config", "chunks", pipeline, self.ctx.timeouts().extended)?;
        for group in &groups {
            let ns = get_str(group, &["_id", "ns"]);
            let shard = get_str(group, &["_id", "shard"]);
            let count = get_number(group, &["count"]);
            let (Some(ns), Some(shard), Some(count)) = (ns, shard, count) else {
                continue;
            };
            let (db, coll) = parse_namespace(ns);
            self.descs
                .emit(sink, "chunks", count, labels, &[db, coll, shard]);
        }
        Ok(())
    }

    fn collect_sharded_collections(
        &self,
        labels: &InstanceLabels,
        sink: &SampleSink,
    ) -> Result<(), ClientError> {
        let collections = self.ctx.find(
            "config",
            "collections",
            Document::new(),
            FindOptions::default(),
            self.ctx.timeouts().extended,
        )?;
        self.descs.emit(
            sink,
            "sharded_collections",
            collections.len() as f64,
            labels,
            &[],
        );
        Ok(())
    }

    /// Migration, split and failure counts from the changelog. Older
    /// clusters may not have the collection at all.
    fn collect_migrations(&self, labels: &InstanceLabels, sink: &SampleSink) -> Result<(), ClientError> {
        let events: Vec<&str> = MIGRATION_EVENTS
            .iter()
            .chain(SPLIT_EVENTS.iter())
            .copied()
            .chain([FAILED_MIGRATION_EVENT])
            .collect();
        let pipeline = vec![
            doc! { "$match": { "what": { "$in": events } } },
            doc! { "$group": { "_id": "$what", "count": { "$sum": 1 } } },
        ];
        let groups = match self.ctx.aggregate(
            "config",
            "changelog",
            pipeline,
            self.ctx.timeouts().extended,
        ) {
            Ok(groups) => groups,
            Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
            Err(e) => {
                debug!(collector = NAME, error = %e, "failed to query config.changelog");
                return Ok(());
            }
        };

        let mut splits = 0.0;
        let mut failed = 0.0;
        for group in &groups {
            let (Some(what), Some(count)) = (get_str(group, &["_id"]), get_number(group, &["count"])) else {
                continue;
            };
            if MIGRATION_EVENTS.contains(&what) {
                self.descs.emit(sink, "migrations", count, labels, &[what]);
            } else if SPLIT_EVENTS.contains(&what) {
                splits += count;
            } else if what == FAILED_MIGRATION_EVENT {
                failed += count;
            }
        }
        self.descs.emit(sink, "splits", splits, labels, &[]);
        self.descs.emit(sink, "migrations_failed", failed, labels, &[]);
        Ok(())
    }
}

impl MetricCollector for ShardingCollector {
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
            log_failure(NAME, "run isMaster command", &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::testing::*;
    use crate::mock::{MockCall, MockClient};
    use serde_json::json;

    #[test]
    fn test_not_a_router() {
        let (ctx, mock) = context(MockClient::standalone());
        let samples = run(&ShardingCollector::new(ctx, &CollectorConfig::default()).unwrap());
        assert!(samples.is_empty());
        assert_eq!(mock.calls().len(), 1);
    }

    #[test]
    fn test_router_topology() {
        let (ctx, _) = context(MockClient::mongos_router());
        let samples = run(&ShardingCollector::new(ctx, &CollectorConfig::default()).unwrap());

        assert_eq!(value(&samples, "mongodb_mongos_up", &[]), Some(1.0));
        assert_eq!(value(&samples, "mongodb_shards_total", &[]), Some(2.0));
        assert_eq!(
            value(
                &samples,
                "mongodb_shard_databases_total",
                &[("shard_name", "shard0"), ("shard_host", "shard0/db1:27018,db2:27018")]
            ),
            Some(2.0)
        );
        assert_eq!(
            value(&samples, "mongodb_shard_databases_total", &[("shard_name", "shard1")]),
            Some(1.0)
        );
        assert_eq!(value(&samples, "mongodb_balancer_enabled", &[]), Some(1.0));
        assert_eq!(value(&samples, "mongodb_balancer_running", &[]), Some(0.0));
        assert_eq!(value(&samples, "mongodb_sharded_collections_total", &[]), Some(2.0));
    }

    #[test]
    fn test_chunks_and_migrations() {
        let (ctx, _) = context(MockClient::mongos_router());
        let samples = run(&ShardingCollector::new(ctx, &CollectorConfig::default()).unwrap());
        assert_eq!(
            value(
                &samples,
                "mongodb_shard_chunks_total",
                &[("database", "shop"), ("collection", "orders"), ("shard_name", "shard1")]
            ),
            Some(10.0)
        );
        assert_eq!(
            value(
                &samples,
                "mongodb_balancer_migrations_total",
                &[("type", "moveChunk.from")]
            ),
            Some(5.0)
        );
        assert_eq!(value(&samples, "mongodb_chunk_splits_total", &[]), Some(0.0));
        assert_eq!(value(&samples, "mongodb_chunk_migrations_failed_total", &[]), Some(0.0));
    }

    #[test]
    fn test_optional_sections_can_be_disabled() {
        let config = with_collector_settings(
            NAME,
            json!({ "collect_chunk_distribution": false, "collect_migration_history": false }),
        );
        let (ctx, mock) = context_with(MockClient::mongos_router(), &config);
        let samples = run(&ShardingCollector::new(ctx, &config).unwrap());
        assert_eq!(count(&samples, "mongodb_shard_chunks_total"), 0);
        assert_eq!(count(&samples, "mongodb_balancer_migrations_total"), 0);
        assert!(!mock.calls().iter().any(|c| matches!(c, MockCall::Aggregate { .. })));
        assert_eq!(value(&samples, "mongodb_shards_total", &[]), Some(2.0));
    }

    #[test]
    fn test_failed_section_does_not_stop_others() {
        let mut mock = MockClient::mongos_router();
        mock.fail_command("admin", "balancerStatus", ClientError::command("unauthorized"));
        mock.fail_aggregate("config", "changelog", ClientError::command("ns not found"));
        let (ctx, _) = context(mock);
        let samples = run(&ShardingCollector::new(ctx, &CollectorConfig::default()).unwrap());
        assert_eq!(count(&samples, "mongodb_balancer_enabled"), 0);
        assert_eq!(count(&samples, "mongodb_chunk_splits_total"), 0);
        assert_eq!(count(&samples, "mongodb_shard_chunks_total"), 2);
        assert_eq!(value(&samples, "mongodb_sharded_collections_total", &[]), Some(2.0));
    }

    #[test]
    fn test_parse_namespace() {
        assert_eq!(parse_namespace("shop.orders.archive"), ("shop", "orders.archive"));
        assert_eq!(parse_namespace("shop"), ("shop", ""));
    }
}
