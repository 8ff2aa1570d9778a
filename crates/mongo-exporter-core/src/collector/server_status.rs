//! Core `serverStatus` counters: uptime, connections, memory, network,
//! opcounters and document operations.

use mongodb::bson::Document;
use prometheus::core::Desc;

use super::{CollectorContext, MetricCollector, log_failure};
use crate::client::ClientError;
use crate::document::{get_doc, get_number};
use crate::metric::{DescSet, SampleSink};

const NAME: &str = "server_status";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

const CONNECTION_STATES: [(&str, &str); 4] = [
    ("current", "current"),
    ("available", "available"),
    ("active", "active"),
    ("totalCreated", "total_created"),
];

const CONNECTION_METRICS: [(&str, &str); 4] = [
    ("awaitingTopology", "awaiting_topology"),
    ("pending", "pending"),
    ("rejected", "rejected"),
    ("timedOut", "timed_out"),
];

/// `mem` fields are reported in megabytes.
const MEMORY_TYPES: [(&str, &str); 4] = [
    ("resident", "resident"),
    ("virtual", "virtual"),
    ("mapped", "mapped"),
    ("mappedWithJournal", "mapped_with_journal"),
];

const EXTRA_INFO: [(&str, &str); 3] = [
    ("heap_usage_bytes", "heap_usage"),
    ("page_faults", "page_faults"),
    ("freeMonitoringStatus", "free_monitoring_status"),
];

const NETWORK: [(&str, &str); 2] = [("bytesIn", "in"), ("bytesOut", "out")];

const DOCUMENT_OPS: [&str; 4] = ["deleted", "inserted", "returned", "updated"];

pub struct ServerStatusCollector {
    ctx: CollectorContext,
    descs: DescSet,
}

impl ServerStatusCollector {
    pub fn new(ctx: CollectorContext) -> Result<Self, prometheus::Error> {
        let mut d = DescSet::new(ctx.statics());
        d.gauge(
            "uptime",
            "mongodb_instance_uptime_seconds",
            "The uptime of the MongoDB instance in seconds",
            &[],
        )?;
        d.gauge(
            "connections",
            "mongodb_connections",
            "The current connections metrics",
            &["state"],
        )?;
        d.gauge(
            "memory",
            "mongodb_memory_bytes",
            "The current memory usage in bytes",
            &["type"],
        )?;
        d.gauge(
            "extra_info",
            "mongodb_extra_info",
            "Extra information metrics",
            &["type"],
        )?;
        d.counter(
            "network",
            "mongodb_network_bytes_total",
            "Network traffic metrics",
            &["direction"],
        )?;
        d.counter(
            "opcounters",
            "mongodb_op_counters_total",
            "Operation counters",
            &["type"],
        )?;
        d.counter(
            "document",
            "mongodb_metrics_document_total",
            "Document operation metrics",
            &["type"],
        )?;
        d.counter(
            "connections_metrics",
            "mongodb_connections_metrics",
            "Connections metrics",
            &["type"],
        )?;
        d.counter(
            "page_faults",
            "mongodb_page_faults_total",
            "Page fault statistics",
            &[],
        )?;
        Ok(Self { ctx, descs: d })
    }

    fn scrape(&self, sink: &SampleSink) -> Result<(), ClientError> {
        let status = self.ctx.server_status(self.ctx.timeouts().default)?;
        self.emit_status(&status, sink);
        Ok(())
    }

    fn emit_status(&self, status: &Document, sink: &SampleSink) {
        let d = &self.descs;
        let labels = self.ctx.labels_for(status);

        d.emit_opt(sink, "uptime", get_number(status, &["uptime"]), &labels, &[]);

        if let Some(connections) = get_doc(status, &["connections"]) {
            for (field, state) in CONNECTION_STATES {
                d.emit_opt(
                    sink,
                    "connections",
                    get_number(connections, &[field]),
                    &labels,
                    &[state],
                );
            }
            if let Some(metrics) = get_doc(connections, &["metrics"]) {
                for (field, kind) in CONNECTION_METRICS {
                    d.emit_opt(
                        sink,
                        "connections_metrics",
                        get_number(metrics, &[field]),
                        &labels,
                        &[kind],
                    );
                }
            }
        }

        if let Some(mem) = get_doc(status, &["mem"]) {
            for (field, kind) in MEMORY_TYPES {
                let bytes = get_number(mem, &[field]).map(|mb| mb * BYTES_PER_MB);
                d.emit_opt(sink, "memory", bytes, &labels, &[kind]);
            }
        }

        if let Some(extra) = get_doc(status, &["extra_info"]) {
            d.emit_opt(
                sink,
                "page_faults",
                get_number(extra, &["page_faults"]),
                &labels,
                &[],
            );
            for (field, kind) in EXTRA_INFO {
                d.emit_opt(
                    sink,
                    "extra_info",
                    get_number(extra, &[field]),
                    &labels,
                    &[kind],
                );
            }
        }

        if let Some(network) = get_doc(status, &["network"]) {
            for (field, direction) in NETWORK {
                d.emit_opt(
                    sink,
                    "network",
                    get_number(network, &[field]),
                    &labels,
                    &[direction],
                );
            }
        }

        if let Some(opcounters) = get_doc(status, &["opcounters"]) {
            for (op, value) in opcounters {
                d.emit_opt(
                    sink,
                    "opcounters",
                    crate::value::numeric(value),
                    &labels,
                    &[op.as_str()],
                );
            }
        }

        if let Some(document) = get_doc(status, &["metrics", "document"]) {
            for op in DOCUMENT_OPS {
                d.emit_opt(sink, "document", get_number(document, &[op]), &labels, &[op]);
            }
        }
    }
}

impl MetricCollector for ServerStatusCollector {
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
            log_failure(NAME, "get server status", &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use crate::collector::testing::*;
    use crate::mock::MockClient;
    use mongodb::bson::doc;

    #[test]
    fn test_server_status_end_to_end() {
        let mut mock = MockClient::new();
        mock.add_command(
            "admin",
            "serverStatus",
            doc! {
                "host": "test-host",
                "uptime": 3600.0,
                "connections": { "current": 10_i32 },
                "mem": { "resident": 104_857_600_i64 },
            },
        );
        let (ctx, _) = context(mock);
        let collector = ServerStatusCollector::new(ctx).unwrap();
        let samples = run(&collector);

        assert_eq!(
            value(&samples, "mongodb_instance_uptime_seconds", &[("instance", "test-host")]),
            Some(3600.0)
        );
        assert_eq!(
            value(&samples, "mongodb_connections", &[("state", "current")]),
            Some(10.0)
        );
        assert_eq!(
            value(&samples, "mongodb_memory_bytes", &[("type", "resident")]),
            Some(104_857_600.0 * 1024.0 * 1024.0)
        );
        assert_eq!(samples.len(), 3);
    }

    #[test]
    fn test_server_status_full_snapshot() {
        let (ctx, _) = context(MockClient::standalone());
        let collector = ServerStatusCollector::new(ctx).unwrap();
        let samples = run(&collector);

        assert_eq!(
            value(&samples, "mongodb_connections", &[("state", "total_created")]),
            Some(120.0)
        );
        assert_eq!(value(&samples, "mongodb_page_faults_total", &[]), Some(42.0));
        assert_eq!(
            value(&samples, "mongodb_extra_info", &[("type", "heap_usage")]),
            Some(5_000_000.0)
        );
        assert_eq!(
            value(&samples, "mongodb_network_bytes_total", &[("direction", "out")]),
            Some(2_000_000.0)
        );
        assert_eq!(count(&samples, "mongodb_op_counters_total"), 7);
        assert_eq!(
            value(&samples, "mongodb_op_counters_total", &[("type", "killcursors")]),
            Some(2.0)
        );
        assert_eq!(count(&samples, "mongodb_metrics_document_total"), 4);
        assert_eq!(
            value(&samples, "mongodb_memory_bytes", &[("type", "virtual")]),
            Some(2048.0 * 1024.0 * 1024.0)
        );
    }

    #[test]
    fn test_negative_and_wrong_typed_fields_are_skipped() {
        let mut mock = MockClient::new();
        mock.add_command(
            "admin",
            "serverStatus",
            doc! {
                "uptime": "3600",
                "connections": { "current": -1_i32, "available": 5_i32 },
            },
        );
        let (ctx, _) = context(mock);
        let samples = run(&ServerStatusCollector::new(ctx).unwrap());
        assert_eq!(samples.len(), 1);
        assert_eq!(
            value(&samples, "mongodb_connections", &[("state", "available"), ("instance", "unknown")]),
            Some(5.0)
        );
    }

    #[test]
    fn test_query_failure_emits_nothing() {
        let mut mock = MockClient::new();
        mock.fail_command("admin", "serverStatus", ClientError::Timeout("10s".into()));
        let (ctx, _) = context(mock);
        assert!(run(&ServerStatusCollector::new(ctx).unwrap()).is_empty());
    }

    #[test]
    fn test_disabled_by_policy() {
        let (ctx, mock) = context_with(MockClient::standalone(), &disabled(NAME));
        assert!(run(&ServerStatusCollector::new(ctx).unwrap()).is_empty());
        assert!(mock.calls().is_empty());
    }
}
