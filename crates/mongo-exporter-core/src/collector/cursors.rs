//! Cursor counts from `serverStatus`, cursor memory and batch sizes
//! aggregated over `currentOp`, and the configured cursor timeout.

use mongodb::bson::{Document, doc};
use prometheus::core::Desc;
use tracing::debug;

use super::{CollectorContext, MetricCollector, log_failure};
use crate::client::ClientError;
use crate::document::{documents, get_array, get_doc, get_number};
use crate::labels::InstanceLabels;
use crate::metric::{DescSet, SampleSink};

const NAME: &str = "cursors";

const OPEN_TYPES: [(&str, &str); 3] = [
    ("noTimeout", "no_timeout"),
    ("pinned", "pinned"),
    ("total", "total"),
];

pub struct CursorsCollector {
    ctx: CollectorContext,
    descs: DescSet,
}

impl CursorsCollector {
    pub fn new(ctx: CollectorContext) -> Result<Self, prometheus::Error> {
        let mut d = DescSet::new(ctx.statics());
        d.gauge(
            "open",
            "mongodb_cursors_open",
            "Number of open cursors by type",
            &["cursor_type"],
        )?;
        d.counter(
            "timed_out",
            "mongodb_cursors_timed_out_total",
            "Total number of cursors that have timed out since the server was started",
            &[],
        )?;
        d.gauge(
            "timeout_seconds",
            "mongodb_cursor_timeout_seconds",
            "Current cursor timeout value in seconds",
            &[],
        )?;
        d.counter(
            "killed",
            "mongodb_cursors_killed_total",
            "Total number of cursors killed by operation",
            &["operation"],
        )?;
        d.counter(
            "created",
            "mongodb_cursors_created_total",
            "Total number of cursors created since server start",
            &[],
        )?;
        d.gauge(
            "memory_usage",
            "mongodb_cursor_memory_usage_bytes",
            "Total memory usage by open cursors in bytes",
            &[],
        )?;
        d.counter(
            "getmore",
            "mongodb_cursor_getmore_operations_total",
            "Total number of getMore operations performed",
            &[],
        )?;
        d.gauge(
            "batch_size_avg",
            "mongodb_cursor_batch_size_avg",
            "Average batch size of cursor operations",
            &[],
        )?;
        d.gauge(
            "pinned",
            "mongodb_pinned_cursors",
            "Number of pinned cursors",
            &[],
        )?;
        Ok(Self { ctx, descs: d })
    }

    fn scrape(&self, sink: &SampleSink) -> Result<(), ClientError> {
        let status = self.ctx.server_status(self.ctx.timeouts().default)?;
        let labels = self.ctx.labels_for(&status);

        self.emit_status(&status, &labels, sink);
        self.collect_current_op(&labels, sink)?;
        self.collect_timeout_setting(&labels, sink)
    }

    fn emit_status(&self, status: &Document, labels: &InstanceLabels, sink: &SampleSink) {
        let d = &self.descs;
        if let Some(cursor) = get_doc(status, &["metrics", "cursor"]) {
            d.emit_opt(sink, "timed_out", get_number(cursor, &["timedOut"]), labels, &[]);
            d.emit_opt(sink, "created", get_number(cursor, &["totalOpened"]), labels, &[]);
            if let Some(open) = get_doc(cursor, &["open"]) {
                for (field, kind) in OPEN_TYPES {
                    d.emit_opt(sink, "open", get_number(open, &[field]), labels, &[kind]);
                }
                d.emit_opt(sink, "pinned", get_number(open, &["pinned"]), labels, &[]);
            }
            d.emit_opt(
                sink,
                "killed",
                get_number(cursor, &["totalKilled"]),
                labels,
                &["timeout"],
            );
        }

        let getmore = get_number(status, &["metrics", "operation", "getmore"])
            .or_else(|| get_number(status, &["opcounters", "getmore"]));
        d.emit_opt(sink, "getmore", getmore, labels, &[]);

        d.emit_opt(
            sink,
            "killed",
            get_number(status, &["opcounters", "killcursors"]),
            labels,
            &["killcursors_command"],
        );
    }

    /// Sums memory and averages batch size over every in-progress operation
    /// that holds a cursor.
    fn collect_current_op(&self, labels: &InstanceLabels, sink: &SampleSink) -> Result<(), ClientError> {
        let reply = match self.ctx.run_command(
            "admin",
            doc! { "currentOp": 1, "$all": true },
            self.ctx.timeouts().default,
        ) {
            Ok(reply) => reply,
            Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
            Err(e) => {
                debug!(collector = NAME, error = %e, "failed to run currentOp for cursor metrics");
                return Ok(());
            }
        };
        let Some(inprog) = get_array(&reply, &["inprog"]) else {
            return Ok(());
        };

        let mut memory = 0.0;
        let mut batch_total = 0.0;
        let mut batches = 0usize;
        for cursor in documents(inprog).filter_map(|op| get_doc(op, &["cursor"])) {
            memory += get_number(cursor, &["memUsage"]).unwrap_or(0.0);
            if let Some(batch) = get_number(cursor, &["batchSize"]) {
                batch_total += batch;
                batches += 1;
            }
        }

        if memory > 0.0 {
            self.descs.emit(sink, "memory_usage", memory, labels, &[]);
        }
        if batches > 0 {
            self.descs
                .emit(sink, "batch_size_avg", batch_total / batches as f64, labels, &[]);
        }
        Ok(())
    }

    /// `cursorTimeoutMillis`, or `clientCursorMonitorFrequencySecs` on
    /// servers that reject the former.
    fn collect_timeout_setting(&self, labels: &InstanceLabels, sink: &SampleSink) -> Result<(), ClientError> {
        let timeout = self.ctx.timeouts().default;
        let params = match self.ctx.run_command(
            "admin",
            doc! { "getParameter": 1, "cursorTimeoutMillis": 1 },
            timeout,
        ) {
            Ok(params) => params,
            Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
            Err(e) => {
                debug!(collector = NAME, error = %e, "failed to get cursor timeout parameter");
                match self.ctx.run_command(
                    "admin",
                    doc! { "getParameter": 1, "clientCursorMonitorFrequencySecs": 1 },
                    timeout,
                ) {
                    Ok(params) => params,
                    Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
                    Err(_) => return Ok(()),
                }
            }
        };

        let seconds = get_number(&params, &["cursorTimeoutMillis"])
            .map(|millis| millis / 1000.0)
            .or_else(|| get_number(&params, &["clientCursorMonitorFrequencySecs"]));
        self.descs
            .emit_opt(sink, "timeout_seconds", seconds, labels, &[]);
        Ok(())
    }
}

impl MetricCollector for CursorsCollector {
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
            log_failure(NAME, "collect cursor metrics", &e);
        }
    }
}
