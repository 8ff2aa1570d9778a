//! WiredTiger storage-engine section of `serverStatus`.

use mongodb::bson::Document;
use prometheus::core::Desc;

use super::{CollectorContext, MetricCollector, log_failure};
use crate::client::ClientError;
use crate::document::{get_doc, get_number, sub_documents};
use crate::metric::{DescSet, SampleSink};

const NAME: &str = "wiredtiger";

const CACHE_PAGES: [(&str, &str); 4] = [
    ("pages currently held in the cache", "total"),
    ("tracked dirty pages in the cache", "dirty"),
    ("pages read into cache", "read"),
    ("pages written from cache", "written"),
];

const CACHE_EVICTIONS: [(&str, &str); 2] = [
    ("unmodified pages evicted", "clean"),
    ("modified pages evicted", "dirty"),
];

const BLOCK_MANAGER: [(&str, &str); 4] = [
    ("blocks read", "read"),
    ("blocks written", "written"),
    ("bytes read", "bytes_read"),
    ("bytes written", "bytes_written"),
];

const CURSOR_SCANS: [(&str, &str); 3] = [
    ("cursor next calls", "next"),
    ("cursor prev calls", "prev"),
    ("cursor search calls", "search"),
];

pub struct WiredTigerCollector {
    ctx: CollectorContext,
    descs: DescSet,
}

impl WiredTigerCollector {
    pub fn new(ctx: CollectorContext) -> Result<Self, prometheus::Error> {
        let mut d = DescSet::new(ctx.statics());
        d.gauge(
            "cache_max_bytes",
            "mongodb_wiredtiger_cache_max_bytes",
            "Maximum bytes configured for cache",
            &[],
        )?;
        d.gauge(
            "cache_used_bytes",
            "mongodb_wiredtiger_cache_used_bytes",
            "Bytes currently in cache",
            &[],
        )?;
        d.gauge(
            "cache_dirty_bytes",
            "mongodb_wiredtiger_cache_dirty_bytes",
            "Bytes currently dirty in cache",
            &[],
        )?;
        d.gauge(
            "cache_pages",
            "mongodb_wiredtiger_cache_pages",
            "Number of pages by state",
            &["type"],
        )?;
        d.counter(
            "cache_evicted_total",
            "mongodb_wiredtiger_cache_evicted_total",
            "Pages evicted from cache",
            &["mode"],
        )?;
        d.gauge(
            "io_total",
            "mongodb_wiredtiger_io_total",
            "Read/write transaction tickets available and in use",
            &["type"],
        )?;
        d.counter(
            "scan_total",
            "mongodb_wiredtiger_scan_total",
            "Cursor scan operations",
            &["type"],
        )?;
        d.counter(
            "block_operations_total",
            "mongodb_wiredtiger_block_operations_total",
            "Block operations",
            &["type"],
        )?;
        Ok(Self { ctx, descs: d })
    }

    fn scrape(&self, sink: &SampleSink) -> Result<(), ClientError> {
        let status = self.ctx.server_status(self.ctx.timeouts().default)?;
        // Other storage engines have no section; nothing to report.
        let Some(wt) = get_doc(&status, &["wiredTiger"]) else {
            return Ok(());
        };
        self.emit_engine(&status, wt, sink);
        Ok(())
    }

    fn emit_engine(&self, status: &Document, wt: &Document, sink: &SampleSink) {
        let d = &self.descs;
        let labels = self.ctx.labels_for(status);

        if let Some(cache) = get_doc(wt, &["cache"]) {
            let field = |name: &str| get_number(cache, &[name]);
            d.emit_opt(sink, "cache_max_bytes", field("maximum bytes configured"), &labels, &[]);
            d.emit_opt(sink, "cache_used_bytes", field("bytes currently in the cache"), &labels, &[]);
            d.emit_opt(
                sink,
                "cache_dirty_bytes",
                field("tracked dirty bytes in the cache"),
                &labels,
                &[],
            );
            for (name, kind) in CACHE_PAGES {
                d.emit_opt(sink, "cache_pages", field(name), &labels, &[kind]);
            }
            for (name, mode) in CACHE_EVICTIONS {
                d.emit_opt(sink, "cache_evicted_total", field(name), &labels, &[mode]);
            }
        }

        if let Some(block) = get_doc(wt, &["block-manager"]) {
            for (name, kind) in BLOCK_MANAGER {
                d.emit_opt(
                    sink,
                    "block_operations_total",
                    get_number(block, &[name]),
                    &labels,
                    &[kind],
                );
            }
        }

        if let Some(cursor) = get_doc(wt, &["cursor"]) {
            for (name, kind) in CURSOR_SCANS {
                d.emit_opt(sink, "scan_total", get_number(cursor, &[name]), &labels, &[kind]);
            }
        }

        // Tickets moved out of the engine section in 7.0.
        let tickets = get_doc(wt, &["concurrentTransactions"])
            .or_else(|| get_doc(status, &["queues", "execution"]));
        if let Some(tickets) = tickets {
            for (kind, ticket) in sub_documents(tickets) {
                d.emit_opt(
                    sink,
                    "io_total",
                    get_number(ticket, &["available"]),
                    &labels,
                    &[format!("{}_available", kind).as_str()],
                );
                d.emit_opt(
                    sink,
                    "io_total",
                    get_number(ticket, &["out"]),
                    &labels,
                    &[format!("{}_used", kind).as_str()],
                );
            }
        }
    }
}

impl MetricCollector for WiredTigerCollector {
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
            log_failure(NAME, "collect WiredTiger metrics", &e);
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
    fn test_cache_and_block_manager() {
        let (ctx, _) = context(MockClient::standalone());
        let samples = run(&WiredTigerCollector::new(ctx).unwrap());

        assert_eq!(
            value(&samples, "mongodb_wiredtiger_cache_max_bytes", &[]),
            Some(1_073_741_824.0)
        );
        assert_eq!(
            value(&samples, "mongodb_wiredtiger_cache_dirty_bytes", &[]),
            Some(1_048_576.0)
        );
        assert_eq!(count(&samples, "mongodb_wiredtiger_cache_pages"), 4);
        assert_eq!(
            value(&samples, "mongodb_wiredtiger_cache_evicted_total", &[("mode", "clean")]),
            Some(80.0)
        );
        assert_eq!(
            value(
                &samples,
                "mongodb_wiredtiger_block_operations_total",
                &[("type", "bytes_written")]
            ),
            Some(3_276_800.0)
        );
    }

    #[test]
    fn test_ticket_types_are_iterated() {
        let (ctx, _) = context(MockClient::standalone());
        let samples = run(&WiredTigerCollector::new(ctx).unwrap());
        assert_eq!(count(&samples, "mongodb_wiredtiger_io_total"), 4);
        assert_eq!(
            value(&samples, "mongodb_wiredtiger_io_total", &[("type", "read_available")]),
            Some(127.0)
        );
        assert_eq!(
            value(&samples, "mongodb_wiredtiger_io_total", &[("type", "read_used")]),
            Some(1.0)
        );
    }

    #[test]
    fn test_tickets_from_execution_queues() {
        let mut mock = MockClient::new();
        mock.add_command(
            "admin",
            "serverStatus",
            doc! {
                "wiredTiger": {
                    "cursor": { "cursor next calls": 9_i64 },
                },
                "queues": {
                    "execution": {
                        "write": { "out": 2_i32, "available": 6_i32 },
                    },
                },
            },
        );
        let (ctx, _) = context(mock);
        let samples = run(&WiredTigerCollector::new(ctx).unwrap());
        assert_eq!(
            value(&samples, "mongodb_wiredtiger_io_total", &[("type", "write_used")]),
            Some(2.0)
        );
        assert_eq!(
            value(&samples, "mongodb_wiredtiger_scan_total", &[("type", "next")]),
            Some(9.0)
        );
        assert_eq!(samples.len(), 3);
    }

    #[test]
    fn test_other_engine_emits_nothing() {
        let mut mock = MockClient::new();
        mock.add_command("admin", "serverStatus", doc! { "storageEngine": { "name": "inMemory" } });
        let (ctx, _) = context(mock);
        assert!(run(&WiredTigerCollector::new(ctx).unwrap()).is_empty());
    }
}
