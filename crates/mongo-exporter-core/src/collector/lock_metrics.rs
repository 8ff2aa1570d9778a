//! Coarse lock totals: global intent-shared counters plus database and
//! collection acquisition time.
//!
//! Overlaps with [`LocksCollector`](super::LocksCollector), which breaks the
//! same section down per lock type and mode. Gated by its own name,
//! `lock_metrics`, so dashboards can keep just one of the two.

use mongodb::bson::Document;
use prometheus::core::Desc;

use super::{CollectorContext, MetricCollector, log_failure};
use crate::client::ClientError;
use crate::document::{get_doc, get_number};
use crate::metric::{DescSet, SampleSink};

const NAME: &str = "lock_metrics";

pub struct LockMetricsCollector {
    ctx: CollectorContext,
    descs: DescSet,
}

impl LockMetricsCollector {
    pub fn new(ctx: CollectorContext) -> Result<Self, prometheus::Error> {
        let mut d = DescSet::new(ctx.statics());
        d.counter(
            "time_global",
            "mongodb_locks_time_acquiring_global_microseconds_total",
            "Total time spent acquiring global locks in microseconds",
            &[],
        )?;
        d.counter(
            "time_database",
            "mongodb_locks_time_acquiring_database_microseconds_total",
            "Total time spent acquiring database locks in microseconds",
            &[],
        )?;
        d.counter(
            "time_collection",
            "mongodb_locks_time_acquiring_collection_microseconds_total",
            "Total time spent acquiring collection locks in microseconds",
            &[],
        )?;
        d.counter(
            "deadlocks",
            "mongodb_locks_deadlock_count_total",
            "Total number of deadlocks",
            &[],
        )?;
        d.counter(
            "acquire",
            "mongodb_locks_acquire_count_total",
            "Total number of lock acquisitions",
            &[],
        )?;
        d.counter(
            "acquire_wait",
            "mongodb_locks_acquire_wait_count_total",
            "Total number of lock acquisitions that had to wait",
            &[],
        )?;
        Ok(Self { ctx, descs: d })
    }

    fn scrape(&self, sink: &SampleSink) -> Result<(), ClientError> {
        let status = self.ctx.server_status(self.ctx.timeouts().default)?;
        let Some(locks) = get_doc(&status, &["locks"]) else {
            return Ok(());
        };
        let labels = self.ctx.labels_for(&status);
        let d = &self.descs;

        let global = |field: &str| get_number(locks, &["Global", field, "r"]);
        d.emit_opt(sink, "acquire", global("acquireCount"), &labels, &[]);
        d.emit_opt(sink, "acquire_wait", global("acquireWaitCount"), &labels, &[]);
        d.emit_opt(sink, "time_global", global("timeAcquiringMicros"), &labels, &[]);
        d.emit_opt(sink, "deadlocks", global("deadlockCount"), &labels, &[]);

        d.emit_opt(sink, "time_database", read_write_micros(locks, "Database"), &labels, &[]);
        d.emit_opt(
            sink,
            "time_collection",
            read_write_micros(locks, "Collection"),
            &labels,
            &[],
        );
        Ok(())
    }
}

/// Sum of intent-shared and intent-exclusive acquisition time, or absent
/// when neither mode is reported.
fn read_write_micros(locks: &Document, lock_type: &str) -> Option<f64> {
    let times = get_doc(locks, &[lock_type, "timeAcquiringMicros"])?;
    match (get_number(times, &["r"]), get_number(times, &["w"])) {
        (None, None) => None,
        (r, w) => Some(r.unwrap_or(0.0) + w.unwrap_or(0.0)),
    }
}

impl MetricCollector for LockMetricsCollector {
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
            log_failure(NAME, "get server status for lock metrics", &e);
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
    fn test_lock_totals() {
        let (ctx, _) = context(MockClient::standalone());
        let samples = run(&LockMetricsCollector::new(ctx).unwrap());

        assert_eq!(value(&samples, "mongodb_locks_acquire_count_total", &[]), Some(1000.0));
        assert_eq!(value(&samples, "mongodb_locks_acquire_wait_count_total", &[]), Some(3.0));
        assert_eq!(
            value(&samples, "mongodb_locks_time_acquiring_global_microseconds_total", &[]),
            Some(450.0)
        );
        assert_eq!(value(&samples, "mongodb_locks_deadlock_count_total", &[]), Some(1.0));
        assert_eq!(
            value(&samples, "mongodb_locks_time_acquiring_database_microseconds_total", &[]),
            Some(100.0)
        );
        assert_eq!(
            value(&samples, "mongodb_locks_time_acquiring_collection_microseconds_total", &[]),
            Some(12.0)
        );
    }

    #[test]
    fn test_read_write_micros() {
        let locks = doc! {
            "Database": { "timeAcquiringMicros": { "w": 9_i64 } },
            "Collection": { "acquireCount": { "r": 1_i64 } },
        };
        assert_eq!(read_write_micros(&locks, "Database"), Some(9.0));
        assert_eq!(read_write_micros(&locks, "Collection"), None);
        assert_eq!(read_write_micros(&locks, "Global"), None);
    }

    #[test]
    fn test_gated_independently_from_locks() {
        let (ctx, _) = context_with(MockClient::standalone(), &disabled("locks"));
        assert!(!run(&LockMetricsCollector::new(ctx).unwrap()).is_empty());
    }
}
