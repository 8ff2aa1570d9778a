//! Query executor scan counters and, where the server reports it, plan
//! cache activity.

use mongodb::bson::Document;
use prometheus::core::Desc;

use super::{CollectorContext, MetricCollector, log_failure};
use crate::client::ClientError;
use crate::document::{get_doc, get_number};
use crate::labels::InstanceLabels;
use crate::metric::{DescSet, SampleSink};

const NAME: &str = "query_executor";

/// Plan cache field and descriptor key.
const PLAN_CACHE: [(&str, &str); 5] = [
    ("hits", "plan_cache_hits"),
    ("misses", "plan_cache_misses"),
    ("evictions", "plan_cache_evictions"),
    ("entries", "plan_cache_entries"),
    ("size", "plan_cache_size"),
];

pub struct QueryExecutorCollector {
    ctx: CollectorContext,
    descs: DescSet,
}

impl QueryExecutorCollector {
    pub fn new(ctx: CollectorContext) -> Result<Self, prometheus::Error> {
        let mut d = DescSet::new(ctx.statics());
        d.counter(
            "total",
            "mongodb_metrics_query_executor_total",
            "Total number of query executor operations",
            &[],
        )?;
        d.counter(
            "scanned",
            "mongodb_metrics_query_executor_scanned_total",
            "Total number of index keys scanned by the query executor",
            &[],
        )?;
        d.counter(
            "scanned_objects",
            "mongodb_metrics_query_executor_scanned_objects_total",
            "Total number of documents scanned by the query executor",
            &[],
        )?;
        d.counter(
            "plan_cache_hits",
            "mongodb_metrics_query_executor_plan_cache_hits_total",
            "Plan cache hits",
            &[],
        )?;
        d.counter(
            "plan_cache_misses",
            "mongodb_metrics_query_executor_plan_cache_misses_total",
            "Plan cache misses",
            &[],
        )?;
        d.counter(
            "plan_cache_evictions",
            "mongodb_metrics_query_executor_plan_cache_evictions_total",
            "Plan cache evictions",
            &[],
        )?;
        d.gauge(
            "plan_cache_entries",
            "mongodb_metrics_query_executor_plan_cache_entries",
            "Entries currently in the plan cache",
            &[],
        )?;
        d.gauge(
            "plan_cache_size",
            "mongodb_metrics_query_executor_plan_cache_size_bytes",
            "Plan cache size in bytes",
            &[],
        )?;
        Ok(Self { ctx, descs: d })
    }

    fn scrape(&self, sink: &SampleSink) -> Result<(), ClientError> {
        let status = self.ctx.server_status(self.ctx.timeouts().default)?;
        let labels = self.ctx.labels_for(&status);
        let d = &self.descs;

        if let Some(executor) = get_doc(&status, &["metrics", "queryExecutor"]) {
            let scanned = get_number(executor, &["scanned"]);
            // Historically exported as the executor total; kept for dashboards.
            d.emit_opt(sink, "total", scanned, &labels, &[]);
            d.emit_opt(sink, "scanned", scanned, &labels, &[]);
            d.emit_opt(
                sink,
                "scanned_objects",
                get_number(executor, &["scannedObjects"]),
                &labels,
                &[],
            );
        }

        let plan_cache = get_doc(&status, &["metrics", "queryExecutor", "planCache"])
            .or_else(|| get_doc(&status, &["metrics", "query", "planCache"]));
        if let Some(plan_cache) = plan_cache {
            self.emit_plan_cache(plan_cache, &labels, sink);
        }
        Ok(())
    }

    fn emit_plan_cache(&self, plan_cache: &Document, labels: &InstanceLabels, sink: &SampleSink) {
        for (field, key) in PLAN_CACHE {
            self.descs
                .emit_opt(sink, key, get_number(plan_cache, &[field]), labels, &[]);
        }
    }
}

impl MetricCollector for QueryExecutorCollector {
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
            log_failure(NAME, "collect query executor metrics", &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::testing::*;
    use crate::mock::MockClient;
    use mongodb::bson::doc;

    #[test]
    fn test_scan_counters() {
        let (ctx, _) = context(MockClient::standalone());
        let samples = run(&QueryExecutorCollector::new(ctx).unwrap());
        assert_eq!(
            value(&samples, "mongodb_metrics_query_executor_scanned_total", &[]),
            Some(1_000.0)
        );
        assert_eq!(
            value(&samples, "mongodb_metrics_query_executor_total", &[]),
            Some(1_000.0)
        );
        assert_eq!(
            value(&samples, "mongodb_metrics_query_executor_scanned_objects_total", &[]),
            Some(2_500.0)
        );
        assert_eq!(samples.len(), 3);
    }

    #[test]
    fn test_plan_cache_locations() {
        let mut mock = MockClient::new();
        mock.add_command(
            "admin",
            "serverStatus",
            doc! {
                "metrics": {
                    "query": {
                        "planCache": { "hits": 40_i64, "misses": 8_i64, "size": 4_096_i64 },
                    },
                },
            },
        );
        let (ctx, _) = context(mock);
        let samples = run(&QueryExecutorCollector::new(ctx).unwrap());
        assert_eq!(samples.len(), 3);
        assert_eq!(
            value(&samples, "mongodb_metrics_query_executor_plan_cache_hits_total", &[]),
            Some(40.0)
        );
        assert_eq!(
            value(&samples, "mongodb_metrics_query_executor_plan_cache_size_bytes", &[]),
            Some(4_096.0)
        );

        let mut mock = MockClient::new();
        mock.add_command(
            "admin",
            "serverStatus",
            doc! {
                "metrics": {
                    "queryExecutor": {
                        "scanned": 1_i64,
                        "planCache": { "entries": 3_i32, "evictions": 2_i64 },
                    },
                },
            },
        );
        let (ctx, _) = context(mock);
        let samples = run(&QueryExecutorCollector::new(ctx).unwrap());
        assert_eq!(
            value(&samples, "mongodb_metrics_query_executor_plan_cache_entries", &[]),
            Some(3.0)
        );
        assert_eq!(
            value(&samples, "mongodb_metrics_query_executor_plan_cache_evictions_total", &[]),
            Some(2.0)
        );
    }

    #[test]
    fn test_failure_emits_nothing() {
        let mut mock = MockClient::new();
        mock.fail_command("admin", "serverStatus", ClientError::Timeout("serverStatus".into()));
        let (ctx, _) = context(mock);
        assert!(run(&QueryExecutorCollector::new(ctx).unwrap()).is_empty());
    }
}
