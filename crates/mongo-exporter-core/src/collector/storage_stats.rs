//! Database and collection sizes from `dbStats` and `collStats`.

use mongodb::bson::{Document, doc};
use prometheus::core::Desc;

use super::{CollectorContext, MetricCollector, log_failure};
use crate::client::ClientError;
use crate::document::{get_bool, get_number};
use crate::labels::InstanceLabels;
use crate::metric::{DescSet, SampleSink};
use crate::value::flag;

const NAME: &str = "storage_stats";

/// `collStats` field and descriptor key.
const COLLECTION_FIELDS: [(&str, &str); 5] = [
    ("size", "collection_size_bytes"),
    ("storageSize", "collection_storage_size_bytes"),
    ("avgObjSize", "collection_avg_obj_size_bytes"),
    ("count", "collection_count"),
    ("totalIndexSize", "collection_index_size_bytes"),
];

pub struct StorageStatsCollector {
    ctx: CollectorContext,
    descs: DescSet,
}

impl StorageStatsCollector {
    pub fn new(ctx: CollectorContext) -> Result<Self, prometheus::Error> {
        let coll = ["database", "collection"];
        let mut d = DescSet::new(ctx.statics());
        d.gauge(
            "database_size_bytes",
            "mongodb_database_size_bytes",
            "Total size of the database in bytes",
            &["database"],
        )?;
        d.gauge(
            "collection_size_bytes",
            "mongodb_collection_size_bytes",
            "Total size of the collection in bytes",
            &coll,
        )?;
        d.gauge(
            "collection_storage_size_bytes",
            "mongodb_collection_storage_size_bytes",
            "Total storage size of the collection in bytes",
            &coll,
        )?;
        d.gauge(
            "collection_avg_obj_size_bytes",
            "mongodb_collection_avg_obj_size_bytes",
            "Average object size in the collection in bytes",
            &coll,
        )?;
        d.gauge(
            "collection_count",
            "mongodb_collection_count",
            "Number of documents in the collection",
            &coll,
        )?;
        d.gauge(
            "collection_index_size_bytes",
            "mongodb_collection_index_size_bytes",
            "Total size of all indexes in the collection",
            &coll,
        )?;
        d.gauge(
            "collection_capped",
            "mongodb_collection_capped",
            "Whether the collection is capped (1) or not (0)",
            &coll,
        )?;
        Ok(Self { ctx, descs: d })
    }

    fn scrape(&self, sink: &SampleSink) -> Result<(), ClientError> {
        let timeout = self.ctx.timeouts().default;
        let labels = self.ctx.unknown_labels();

        for db in self.ctx.user_databases(timeout)? {
            match self.ctx.run_command(&db, doc! { "dbStats": 1 }, timeout) {
                Ok(stats) => self.descs.emit_opt(
                    sink,
                    "database_size_bytes",
                    get_number(&stats, &["dataSize"]),
                    &labels,
                    &[db.as_str()],
                ),
                Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
                Err(e) => {
                    log_failure(NAME, &format!("get database stats for {}", db), &e);
                    continue;
                }
            }

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
                    Err(e) => log_failure(
                        NAME,
                        &format!("get collection stats for {}.{}", db, coll),
                        &e,
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
        for (field, key) in COLLECTION_FIELDS {
            self.descs
                .emit_opt(sink, key, get_number(stats, &[field]), labels, &[db, coll]);
        }
        self.descs.emit_opt(
            sink,
            "collection_capped",
            get_bool(stats, &["capped"]).map(flag),
            labels,
            &[db, coll],
        );
    }
}

impl MetricCollector for StorageStatsCollector {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::testing::*;
    use crate::mock::MockClient;

    #[test]
    fn test_database_and_collection_sizes() {
        let (ctx, _) = context(MockClient::standalone());
        let samples = run(&StorageStatsCollector::new(ctx).unwrap());

        assert_eq!(
            value(&samples, "mongodb_database_size_bytes", &[("database", "shop")]),
            Some(3_072_000.0)
        );
        assert_eq!(
            value(&samples, "mongodb_collection_count", &[("collection", "orders")]),
            Some(1_000.0)
        );
        assert_eq!(
            value(&samples, "mongodb_collection_size_bytes", &[("collection", "users")]),
            Some(51_200.0)
        );
        assert_eq!(
            value(&samples, "mongodb_collection_capped", &[("collection", "orders")]),
            Some(0.0)
        );
        assert_eq!(count(&samples, "mongodb_database_size_bytes"), 1);
        // system.profile and the system databases are skipped
        assert_eq!(count(&samples, "mongodb_collection_count"), 2);
        assert!(samples.iter().all(|s| s.label("instance") == Some("unknown")));
    }

    #[test]
    fn test_db_stats_failure_skips_database() {
        let mut mock = MockClient::standalone();
        mock.fail_command("shop", "dbStats", ClientError::command("unauthorized"));
        mock.add_collection("blog", "posts");
        mock.add_command("blog", "dbStats", doc! { "dataSize": 10_i32 });
        let (ctx, _) = context(mock);
        let samples = run(&StorageStatsCollector::new(ctx).unwrap());
        assert_eq!(count(&samples, "mongodb_database_size_bytes"), 1);
        assert_eq!(
            value(&samples, "mongodb_database_size_bytes", &[("database", "blog")]),
            Some(10.0)
        );
        assert!(samples.iter().all(|s| s.label("database") == Some("blog")));
    }

    #[test]
    fn test_listing_failure() {
        let mut mock = MockClient::standalone();
        mock.fail_listings(ClientError::Connection("connection refused".into()));
        let (ctx, _) = context(mock);
        assert!(run(&StorageStatsCollector::new(ctx).unwrap()).is_empty());
    }
}
