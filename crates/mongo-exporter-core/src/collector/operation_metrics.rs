//! `metrics.operation` counters from `serverStatus`, one family per key.

use prometheus::core::Desc;

use super::{CollectorContext, MetricCollector, log_failure};
use crate::client::ClientError;
use crate::document::{get_doc, get_number};
use crate::metric::{DescSet, SampleSink};

const NAME: &str = "operation_metrics";

/// Status field, descriptor key and metric name, help text.
const OPERATIONS: [(&str, &str, &str); 8] = [
    (
        "fastmod",
        "mongodb_metrics_operation_fastmod_total",
        "Total number of fast modify operations",
    ),
    (
        "idhack",
        "mongodb_metrics_operation_idhack_total",
        "Total number of ID hack operations",
    ),
    (
        "scanAndOrder",
        "mongodb_metrics_operation_scan_and_order_total",
        "Total number of scan and order operations",
    ),
    (
        "writeConflicts",
        "mongodb_metrics_operation_write_conflicts_total",
        "Total number of write conflicts",
    ),
    (
        "commits",
        "mongodb_metrics_operation_commits_total",
        "Total number of commits",
    ),
    (
        "rollbacks",
        "mongodb_metrics_operation_rollbacks_total",
        "Total number of rollbacks",
    ),
    (
        "applyOps",
        "mongodb_metrics_operation_apply_ops_total",
        "Total number of apply operations",
    ),
    (
        "commands",
        "mongodb_metrics_operation_commands_total",
        "Total number of commands",
    ),
];

pub struct OperationMetricsCollector {
    ctx: CollectorContext,
    descs: DescSet,
}

impl OperationMetricsCollector {
    pub fn new(ctx: CollectorContext) -> Result<Self, prometheus::Error> {
        let mut d = DescSet::new(ctx.statics());
        for (field, name, help) in OPERATIONS {
            d.counter(field, name, help, &[])?;
        }
        Ok(Self { ctx, descs: d })
    }

    fn scrape(&self, sink: &SampleSink) -> Result<(), ClientError> {
        let status = self.ctx.server_status(self.ctx.timeouts().default)?;
        let Some(operation) = get_doc(&status, &["metrics", "operation"]) else {
            return Ok(());
        };
        let labels = self.ctx.labels_for(&status);
        for (field, _, _) in OPERATIONS {
            self.descs
                .emit_opt(sink, field, get_number(operation, &[field]), &labels, &[]);
        }
        Ok(())
    }
}

impl MetricCollector for OperationMetricsCollector {
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
            log_failure(NAME, "get server status for operation metrics", &e);
        }
    }
}
