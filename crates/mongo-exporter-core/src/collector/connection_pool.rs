//! Server-side connection accounting and pool statistics.
//!
//! The `connections` section of `serverStatus` is reported as pool
//! `default`. Servers that also report named pools under
//! `metrics.connectionPool` (or a top-level `connectionPool`) get one series
//! per pool. With `collect_per_host_metrics` enabled, in-progress operations
//! from `currentOp` are counted per client host.

use std::collections::BTreeMap;

use mongodb::bson::{Document, doc};
use prometheus::core::Desc;
use tracing::debug;

use super::{CollectorContext, MetricCollector, log_failure};
use crate::client::ClientError;
use crate::config::CollectorConfig;
use crate::document::{documents, get_array, get_doc, get_number, get_str, sub_documents};
use crate::labels::InstanceLabels;
use crate::metric::{DescSet, SampleSink};

const NAME: &str = "connection_pool";

const DEFAULT_POOL: &str = "default";

/// Pool document field and descriptor key.
const POOL_FIELDS: [(&str, &str); 9] = [
    ("currentCheckedOut", "checked_out"),
    ("currentAvailable", "checked_in"),
    ("currentCreated", "current_created"),
    ("maxPoolSize", "max_size"),
    ("minPoolSize", "min_size"),
    ("totalCreated", "total_created"),
    ("totalDestroyed", "total_destroyed"),
    ("waitQueueSize", "wait_queue_size"),
    ("waitQueueTimeouts", "wait_queue_timeouts"),
];

const POOL_TIMINGS: [(&str, &str); 2] = [
    ("avgWaitTimeMs", "wait_time"),
    ("avgCheckoutTimeMs", "checkout_time"),
];

const NETWORK_ERRORS: [(&str, &str); 3] = [
    ("errors", "network_error"),
    ("timeouts", "network_timeout"),
    ("compressionErrors", "compression_error"),
];

pub struct ConnectionPoolCollector {
    ctx: CollectorContext,
    descs: DescSet,
    per_host: bool,
}

impl ConnectionPoolCollector {
    pub fn new(ctx: CollectorContext, config: &CollectorConfig) -> Result<Self, prometheus::Error> {
        let pool = ["pool_name"];
        let mut d = DescSet::new(ctx.statics());
        d.gauge(
            "checked_out",
            "mongodb_connection_pool_current_checked_out",
            "The number of connections currently checked out of the pool",
            &pool,
        )?;
        d.gauge(
            "checked_in",
            "mongodb_connection_pool_current_checked_in",
            "The number of connections currently available in the pool",
            &pool,
        )?;
        d.gauge(
            "current_created",
            "mongodb_connection_pool_current_created",
            "The total number of connections currently created in the pool",
            &pool,
        )?;
        d.gauge(
            "max_size",
            "mongodb_connection_pool_max_size",
            "Maximum number of connections in the pool",
            &pool,
        )?;
        d.gauge(
            "min_size",
            "mongodb_connection_pool_min_size",
            "Minimum number of connections in the pool",
            &pool,
        )?;
        d.counter(
            "total_created",
            "mongodb_connection_pool_total_created",
            "Total number of connections created since startup",
            &pool,
        )?;
        d.counter(
            "total_destroyed",
            "mongodb_connection_pool_total_destroyed",
            "Total number of connections destroyed since startup",
            &pool,
        )?;
        d.counter(
            "requests",
            "mongodb_connection_pool_requests_total",
            "Total number of connection requests",
            &["pool_name", "result"],
        )?;
        d.gauge(
            "wait_queue_size",
            "mongodb_connection_pool_wait_queue_size",
            "Current number of operations waiting for a connection",
            &pool,
        )?;
        d.counter(
            "wait_queue_timeouts",
            "mongodb_connection_pool_wait_queue_timeout_total",
            "Total number of connection wait queue timeouts",
            &pool,
        )?;
        d.gauge(
            "wait_time",
            "mongodb_connection_pool_wait_time_milliseconds",
            "Average time spent waiting for connections in milliseconds",
            &pool,
        )?;
        d.gauge(
            "checkout_time",
            "mongodb_connection_pool_checkout_time_milliseconds",
            "Average time to checkout a connection in milliseconds",
            &pool,
        )?;
        d.counter(
            "errors",
            "mongodb_connection_errors_total",
            "Total number of connection errors by type",
            &["error_type", "host"],
        )?;
        d.gauge(
            "host_operations",
            "mongodb_connection_active_operations",
            "In-progress operations per client host",
            &["host"],
        )?;
        Ok(Self {
            ctx,
            descs: d,
            per_host: config.bool_setting(NAME, "collect_per_host_metrics", true),
        })
    }

    fn scrape(&self, sink: &SampleSink) -> Result<(), ClientError> {
        let status = self.ctx.server_status(self.ctx.timeouts().extended)?;
        let labels = self.ctx.labels_for(&status);

        if let Some(connections) = get_doc(&status, &["connections"]) {
            self.emit_server_connections(connections, &labels, sink);
        }
        let pools = get_doc(&status, &["metrics", "connectionPool"])
            .or_else(|| get_doc(&status, &["connectionPool"]));
        if let Some(pools) = pools {
            for (pool, stats) in sub_documents(pools) {
                self.emit_pool(pool, stats, &labels, sink);
            }
        }
        self.emit_errors(&status, &labels, sink);

        if self.per_host {
            self.collect_per_host(&labels, sink)?;
        }
        Ok(())
    }

    fn emit_server_connections(&self, connections: &Document, labels: &InstanceLabels, sink: &SampleSink) {
        let d = &self.descs;
        let current = get_number(connections, &["current"]);
        let available = get_number(connections, &["available"]);
        d.emit_opt(sink, "checked_out", current, labels, &[DEFAULT_POOL]);
        d.emit_opt(sink, "checked_in", available, labels, &[DEFAULT_POOL]);
        if let (Some(current), Some(available)) = (current, available) {
            d.emit(sink, "current_created", current + available, labels, &[DEFAULT_POOL]);
        }
        d.emit_opt(
            sink,
            "total_created",
            get_number(connections, &["totalCreated"]),
            labels,
            &[DEFAULT_POOL],
        );
    }

    fn emit_pool(&self, pool: &str, stats: &Document, labels: &InstanceLabels, sink: &SampleSink) {
        let d = &self.descs;
        for (field, key) in POOL_FIELDS.iter().chain(POOL_TIMINGS.iter()) {
            d.emit_opt(sink, key, get_number(stats, &[*field]), labels, &[pool]);
        }
        d.emit_opt(
            sink,
            "requests",
            get_number(stats, &["requestsSuccessful"]),
            labels,
            &[pool, "success"],
        );
        d.emit_opt(
            sink,
            "requests",
            get_number(stats, &["requestsFailed"]),
            labels,
            &[pool, "failed"],
        );
    }

    fn emit_errors(&self, status: &Document, labels: &InstanceLabels, sink: &SampleSink) {
        let d = &self.descs;
        d.emit_opt(
            sink,
            "errors",
            get_number(status, &["metrics", "cursor", "timedOut"]),
            labels,
            &["timeout", "unknown"],
        );
        if let Some(network) = get_doc(status, &["metrics", "network"]) {
            for (field, kind) in NETWORK_ERRORS {
                d.emit_opt(sink, "errors", get_number(network, &[field]), labels, &[kind, "unknown"]);
            }
        }
    }

    fn collect_per_host(&self, labels: &InstanceLabels, sink: &SampleSink) -> Result<(), ClientError> {
        let reply = match self.ctx.run_command(
            "admin",
            doc! { "currentOp": 1, "$all": true },
            self.ctx.timeouts().extended,
        ) {
            Ok(reply) => reply,
            Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
            Err(e) => {
                debug!(collector = NAME, error = %e, "failed to get current operations for connection analysis");
                return Ok(());
            }
        };
        let Some(inprog) = get_array(&reply, &["inprog"]) else {
            return Ok(());
        };

        let mut per_host: BTreeMap<&str, u64> = BTreeMap::new();
        for client in documents(inprog).filter_map(|op| get_str(op, &["client"])) {
            *per_host.entry(client_host(client)).or_default() += 1;
        }
        for (host, n) in per_host {
            self.descs
                .emit(sink, "host_operations", n as f64, labels, &[host]);
        }
        Ok(())
    }
}

/// Host part of a `host:port` client address; IPv6 addresses keep their
/// brackets.
fn client_host(client: &str) -> &str {
    match client.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            if host.contains(':') && !host.ends_with(']') {
                client
            } else {
                host
            }
        }
        _ => client,
    }
}

impl MetricCollector for ConnectionPoolCollector {
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
            log_failure(NAME, "collect connection pool metrics", &e);
        }
    }
}
