//! Pre-built mock deployments for testing.
//!
//! Replies are trimmed copies of what a 6.0/7.0 server returns; only the
//! fields collectors read are kept.

use mongodb::bson::{DateTime, Document, Timestamp, doc};

use super::MockClient;
use crate::client::{ClientError, NO_REPLICATION_ENABLED};

/// `serverStatus` reply shared by the scenarios.
pub fn server_status(host: &str, set_name: Option<&str>) -> Document {
    let mut status = doc! {
        "host": host,
        "version": "7.0.4",
        "process": "mongod",
        "uptime": 3600.0,
        "connections": {
            "current": 10_i32,
            "available": 838_850_i32,
            "totalCreated": 120_i32,
            "active": 3_i32,
        },
        "mem": {
            "bits": 64_i32,
            "resident": 104_857_600_i32,
            "virtual": 2_048_i32,
        },
        "extra_info": {
            "page_faults": 42_i64,
            "heap_usage_bytes": 5_000_000_i64,
        },
        "network": {
            "bytesIn": 1_000_000_i64,
            "bytesOut": 2_000_000_i64,
            "numRequests": 500_i64,
        },
        "opcounters": {
            "insert": 11_i64,
            "query": 22_i64,
            "update": 33_i64,
            "delete": 4_i64,
            "getmore": 5_i64,
            "command": 600_i64,
            "killcursors": 2_i64,
        },
        "opcountersRepl": {
            "insert": 1_i64,
            "query": 0_i64,
            "update": 2_i64,
            "delete": 0_i64,
            "getmore": 0_i64,
            "command": 3_i64,
        },
        "locks": {
            "Global": {
                "acquireCount": { "r": 1_000_i64, "w": 200_i64 },
                "acquireWaitCount": { "r": 3_i64 },
                "timeAcquiringMicros": { "r": 450_i64 },
                "deadlockCount": { "r": 1_i64 },
            },
            "Database": {
                "acquireCount": { "r": 300_i64, "w": 100_i64, "W": 2_i64 },
                "timeAcquiringMicros": { "r": 40_i64, "w": 60_i64 },
            },
            "Collection": {
                "acquireCount": { "r": 250_i64, "w": 90_i64 },
                "timeAcquiringMicros": { "r": 5_i64, "w": 7_i64 },
            },
        },
        "wiredTiger": {
            "cache": {
                "maximum bytes configured": 1_073_741_824_i64,
                "bytes currently in the cache": 52_428_800_i64,
                "tracked dirty bytes in the cache": 1_048_576_i64,
                "pages currently held in the cache": 900_i64,
                "tracked dirty pages in the cache": 12_i64,
                "pages read into cache": 1_500_i64,
                "pages written from cache": 700_i64,
                "unmodified pages evicted": 80_i64,
                "modified pages evicted": 20_i64,
            },
            "block-manager": {
                "blocks read": 1_200_i64,
                "blocks written": 800_i64,
                "bytes read": 4_915_200_i64,
                "bytes written": 3_276_800_i64,
            },
            "concurrentTransactions": {
                "read": { "out": 1_i32, "available": 127_i32, "totalTickets": 128_i32 },
                "write": { "out": 0_i32, "available": 128_i32, "totalTickets": 128_i32 },
            },
        },
        "metrics": {
            "document": {
                "deleted": 4_i64,
                "inserted": 11_i64,
                "returned": 220_i64,
                "updated": 33_i64,
            },
            "queryExecutor": {
                "scanned": 1_000_i64,
                "scannedObjects": 2_500_i64,
            },
            "operation": {
                "scanAndOrder": 7_i64,
                "writeConflicts": 2_i64,
            },
            "cursor": {
                "timedOut": 6_i64,
                "totalOpened": 40_i64,
                "open": { "noTimeout": 1_i64, "pinned": 2_i64, "total": 5_i64 },
            },
            "network": { "errors": 1_i64, "timeouts": 0_i64 },
        },
    };
    if let Some(name) = set_name {
        status.insert("repl", doc! { "setName": name, "ismaster": true });
    }
    status
}

fn collection_stats(ns: &str, count: i64) -> Document {
    doc! {
        "ns": ns,
        "size": count * 256,
        "count": count,
        "avgObjSize": 256_i32,
        "storageSize": count * 128,
        "nindexes": 2_i32,
        "totalIndexSize": 65_536_i64,
        "indexSizes": { "_id_": 32_768_i64, "status_1": 32_768_i64 },
        "capped": false,
        "indexAccesses": {
            "_id_": { "ops": 150_i64 },
            "status_1": { "ops": 0_i64 },
        },
        "wiredTiger": {
            "cache": { "bytes currently in the cache": 8_192_i64 },
            "block-manager": { "checkpoint size": 16_384_i64 },
        },
        "latencyStats": {
            "reads": { "latency": 1_500_i64, "ops": 30_i64 },
            "writes": { "latency": 900_i64, "ops": 9_i64 },
            "commands": { "latency": 0_i64, "ops": 0_i64 },
        },
    }
}

impl MockClient {
    /// A standalone `mongod` with one user database.
    ///
    /// `shop` holds `orders` and `users` plus `system.profile`; profiling
    /// is off and replication status fails with NoReplicationEnabled.
    pub fn standalone() -> Self {
        let mut mock = Self::new();
        mock.add_command("admin", "serverStatus", server_status("db1:27017", None));
        mock.fail_command(
            "admin",
            "replSetGetStatus",
            ClientError::Command {
                code: Some(NO_REPLICATION_ENABLED),
                message: "not running with --replSet".into(),
            },
        );
        mock.add_command(
            "admin",
            "isMaster",
            doc! { "ismaster": true, "maxWireVersion": 21_i32 },
        );
        mock.add_command(
            "admin",
            "getParameter",
            doc! { "cursorTimeoutMillis": 600_000_i64, "ok": 1.0 },
        );
        mock.add_command(
            "admin",
            "currentOp",
            doc! {
                "inprog": [
                    {
                        "client": "10.0.0.5:51234",
                        "cursor": { "memUsage": 2_048_i64, "batchSize": 100_i32 },
                    },
                    {
                        "client": "10.0.0.5:51240",
                        "cursor": { "memUsage": 1_024_i64, "batchSize": 50_i32 },
                    },
                    { "client": "10.0.0.9:40000" },
                ],
            },
        );

        mock.add_database("admin");
        mock.add_database("config");
        mock.add_database("local");
        mock.add_collection("shop", "orders");
        mock.add_collection("shop", "users");
        mock.add_collection("shop", "system.profile");

        mock.add_command(
            "shop",
            "dbStats",
            doc! { "db": "shop", "dataSize": 3_072_000_i64, "collections": 2_i32 },
        );
        mock.add_targeted_command("shop", "collStats", "orders", collection_stats("shop.orders", 1_000));
        mock.add_targeted_command("shop", "collStats", "users", collection_stats("shop.users", 200));
        mock.add_command("*", "profile", doc! { "was": 0_i32, "slowms": 100_i32 });
        mock
    }

    /// Primary of replica set `rs0` with three members and an oplog.
    pub fn replica_set_primary() -> Self {
        let mut mock = Self::standalone();
        mock.add_command(
            "admin",
            "serverStatus",
            server_status("db1:27017", Some("rs0")),
        );
        mock.add_command(
            "admin",
            "replSetGetStatus",
            doc! {
                "set": "rs0",
                "myState": 1_i32,
                "members": [
                    { "_id": 0_i32, "name": "db1:27017", "health": 1.0, "state": 1_i32, "stateStr": "PRIMARY" },
                    { "_id": 1_i32, "name": "db2:27017", "health": 1.0, "state": 2_i32, "stateStr": "SECONDARY" },
                    { "_id": 2_i32, "name": "db3:27017", "health": 0.0, "state": 8_i32, "stateStr": "(not reachable/healthy)" },
                ],
                "ok": 1.0,
            },
        );
        mock.add_targeted_command(
            "local",
            "collStats",
            "oplog.rs",
            doc! { "ns": "local.oplog.rs", "size": 10_485_760_i64, "capped": true, "maxSize": 1_073_741_824_i64 },
        );
        mock.add_find(
            "local",
            "oplog.rs",
            vec![doc! {
                "ts": Timestamp { time: 1_700_000_000, increment: 1 },
                "op": "n",
                "ns": "",
            }],
        );
        mock
    }

    /// A `mongos` router in front of two shards.
    pub fn mongos_router() -> Self {
        let mut mock = Self::new();
        let mut status = server_status("router1:27017", None);
        status.insert("process", "mongos");
        mock.add_command("admin", "serverStatus", status);
        mock.add_command(
            "admin",
            "isMaster",
            doc! { "ismaster": true, "msg": "isdbgrid", "maxWireVersion": 21_i32 },
        );
        mock.add_command(
            "admin",
            "balancerStatus",
            doc! { "mode": "full", "inBalancerRound": false, "ok": 1.0 },
        );
        mock.add_find(
            "config",
            "shards",
            vec![
                doc! { "_id": "shard0", "host": "shard0/db1:27018,db2:27018", "state": 1_i32 },
                doc! { "_id": "shard1", "host": "shard1/db3:27018,db4:27018", "state": 1_i32 },
            ],
        );
        mock.add_find(
            "config",
            "databases",
            vec![
                doc! { "_id": "shop", "primary": "shard0" },
                doc! { "_id": "blog", "primary": "shard1" },
                doc! { "_id": "crm", "primary": "shard0" },
            ],
        );
        mock.add_find(
            "config",
            "collections",
            vec![
                doc! { "_id": "shop.orders", "key": { "customer": 1_i32 } },
                doc! { "_id": "config.system.sessions", "key": { "_id": 1_i32 } },
            ],
        );
        mock.add_aggregate(
            "config",
            "chunks",
            vec![
                doc! { "_id": { "ns": "shop.orders", "shard": "shard0" }, "count": 12_i32 },
                doc! { "_id": { "ns": "shop.orders", "shard": "shard1" }, "count": 10_i32 },
            ],
        );
        mock.add_aggregate(
            "config",
            "changelog",
            vec![
                doc! { "_id": "moveChunk.commit", "count": 4_i32 },
                doc! { "_id": "moveChunk.from", "count": 5_i32 },
            ],
        );
        mock
    }

    /// Standalone with profiling at level 1 and two slow operations logged
    /// a minute ago.
    pub fn with_profiling() -> Self {
        let mut mock = Self::standalone();
        mock.add_command("*", "profile", doc! { "was": 1_i32, "slowms": 100_i32 });
        let ts = DateTime::from_millis(DateTime::now().timestamp_millis() - 60_000);
        mock.add_find(
            "shop",
            "system.profile",
            vec![
                doc! {
                    "op": "query",
                    "ns": "shop.orders",
                    "millis": 120_i32,
                    "ts": ts,
                    "docsExamined": 5_000_i64,
                    "keysExamined": 0_i64,
                    "nreturned": 10_i64,
                    "responseLength": 4_096_i64,
                    "planSummary": "COLLSCAN",
                    "cpuNanos": 2_000_000_i64,
                    "locks": {
                        "Global": { "acquireCount": { "r": 1_i64 } },
                    },
                },
                doc! {
                    "op": "query",
                    "ns": "shop.orders",
                    "millis": 80_i32,
                    "ts": ts,
                    "docsExamined": 3_000_i64,
                    "nreturned": 6_i64,
                    "responseLength": 1_024_i64,
                    "planSummary": "COLLSCAN",
                },
                doc! {
                    "op": "command",
                    "ns": "shop.$cmd",
                    "command": { "aggregate": "users", "pipeline": [] },
                    "millis": 300_i32,
                    "ts": ts,
                    "writeConflicts": 1_i64,
                },
            ],
        );
        mock
    }
}
