//! Replica set membership and oplog metrics from `replSetGetStatus`.
//!
//! On a standalone server the status command fails with
//! NoReplicationEnabled; that is expected and only logged at debug level.

use mongodb::bson::{Document, doc};
use prometheus::core::Desc;
use tracing::{debug, warn};

use super::{CollectorContext, MetricCollector, log_failure};
use crate::client::{ClientError, FindOptions};
use crate::document::{documents, get_array, get_bool, get_number, get_str, get_timestamp_secs};
use crate::labels::InstanceLabels;
use crate::metric::{DescSet, SampleSink};

const NAME: &str = "replica_set_status";

fn state_name(state: f64) -> &'static str {
    match state as i64 {
        1 => "PRIMARY",
        2 => "SECONDARY",
        7 => "ARBITER",
        _ => "UNKNOWN",
    }
}

pub struct ReplicaSetCollector {
    ctx: CollectorContext,
    descs: DescSet,
}

impl ReplicaSetCollector {
    pub fn new(ctx: CollectorContext) -> Result<Self, prometheus::Error> {
        let mut d = DescSet::new(ctx.statics());
        d.gauge(
            "member_state",
            "mongodb_replset_member_state",
            "State of the replica set member (1=Primary, 2=Secondary, 7=Arbiter)",
            &["name", "state"],
        )?;
        d.gauge(
            "member_health",
            "mongodb_replset_member_health",
            "Health status of the replica set member (0=unhealthy, 1=healthy)",
            &["name", "state"],
        )?;
        d.gauge(
            "number_of_members",
            "mongodb_replset_number_of_members",
            "Total number of members in the replica set",
            &[],
        )?;
        d.gauge(
            "oplog_size_bytes",
            "mongodb_replset_oplog_size_bytes",
            "Size of the oplog in bytes",
            &[],
        )?;
        d.gauge(
            "oplog_head_timestamp",
            "mongodb_replset_oplog_head_timestamp",
            "Timestamp of the newest oplog entry",
            &[],
        )?;
        Ok(Self { ctx, descs: d })
    }

    fn scrape(&self, sink: &SampleSink) -> Result<(), ClientError> {
        let timeout = self.ctx.timeouts().default;
        let status = match self
            .ctx
            .run_command("admin", doc! { "replSetGetStatus": 1 }, timeout)
        {
            Ok(status) => status,
            Err(e) if e.is_not_replica_set() => {
                debug!(collector = NAME, "not running as replica set");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let labels = self.ctx.labels_for(&topology_snapshot(&status));
        self.emit_members(&status, &labels, sink);
        self.collect_oplog(&labels, sink);
        Ok(())
    }

    fn emit_members(&self, status: &Document, labels: &InstanceLabels, sink: &SampleSink) {
        let Some(members) = get_array(status, &["members"]) else {
            return;
        };
        let d = &self.descs;
        d.emit(sink, "number_of_members", members.len() as f64, labels, &[]);

        for member in documents(members) {
            let name = get_str(member, &["name"]);
            let state = get_number(member, &["state"]);
            let health = get_number(member, &["health"]);
            let (Some(name), Some(state), Some(health)) = (name, state, health) else {
                warn!(
                    collector = NAME,
                    has_name = name.is_some(),
                    has_state = state.is_some(),
                    has_health = health.is_some(),
                    "invalid member data"
                );
                continue;
            };
            let state_label = state_name(state);
            d.emit(sink, "member_state", state, labels, &[name, state_label]);
            d.emit(sink, "member_health", health, labels, &[name, state_label]);
        }
    }

    /// Oplog failures are not worth an error: secondaries of some versions
    /// and restricted users cannot read `local`.
    fn collect_oplog(&self, labels: &InstanceLabels, sink: &SampleSink) {
        let timeout = self.ctx.timeouts().default;
        let stats = match self
            .ctx
            .run_command("local", doc! { "collStats": "oplog.rs" }, timeout)
        {
            Ok(stats) => stats,
            Err(e) => {
                debug!(collector = NAME, error = %e, "failed to get oplog stats");
                return;
            }
        };
        self.descs.emit_opt(
            sink,
            "oplog_size_bytes",
            get_number(&stats, &["size"]),
            labels,
            &[],
        );

        let options = FindOptions {
            sort: Some(doc! { "$natural": -1 }),
            limit: Some(1),
        };
        match self
            .ctx
            .find("local", "oplog.rs", Document::new(), options, timeout)
        {
            Ok(entries) => {
                let head = entries.first().and_then(|e| get_timestamp_secs(e, &["ts"]));
                self.descs
                    .emit_opt(sink, "oplog_head_timestamp", head, labels, &[]);
            }
            Err(e) => debug!(collector = NAME, error = %e, "failed to get latest oplog entry"),
        }
    }
}

/// Reshapes a replication status reply into the snapshot layout the labeler
/// reads: the set name becomes `repl.setName`, the member flagged `self`
/// becomes `host`.
fn topology_snapshot(status: &Document) -> Document {
    let mut snapshot = Document::new();
    let own = get_array(status, &["members"]).and_then(|members| {
        documents(members)
            .find(|m| get_bool(m, &["self"]) == Some(true))
            .and_then(|m| get_str(m, &["name"]))
    });
    if let Some(host) = own {
        snapshot.insert("host", host);
    }
    if let Some(set) = get_str(status, &["set"]) {
        snapshot.insert("repl", doc! { "setName": set });
    }
    snapshot
}

impl MetricCollector for ReplicaSetCollector {
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
            log_failure(NAME, "get replica set status", &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::testing::*;
    use crate::mock::{MockCall, MockClient};

    #[test]
    fn test_standalone_is_silent_noop() {
        let (ctx, mock) = context(MockClient::standalone());
        let samples = run(&ReplicaSetCollector::new(ctx).unwrap());
        assert!(samples.is_empty());
        assert_eq!(mock.command_names(), vec!["replSetGetStatus".to_string()]);
    }

    #[test]
    fn test_members_and_oplog() {
        let (ctx, _) = context(MockClient::replica_set_primary());
        let samples = run(&ReplicaSetCollector::new(ctx).unwrap());

        assert_eq!(value(&samples, "mongodb_replset_number_of_members", &[]), Some(3.0));
        assert_eq!(
            value(
                &samples,
                "mongodb_replset_member_state",
                &[("name", "db2:27017"), ("state", "SECONDARY")]
            ),
            Some(2.0)
        );
        assert_eq!(
            value(
                &samples,
                "mongodb_replset_member_health",
                &[("name", "db3:27017"), ("state", "UNKNOWN")]
            ),
            Some(0.0)
        );
        assert_eq!(
            value(&samples, "mongodb_replset_oplog_size_bytes", &[("replica_set", "rs0")]),
            Some(10_485_760.0)
        );
        assert_eq!(
            value(&samples, "mongodb_replset_oplog_head_timestamp", &[]),
            Some(1_700_000_000.0)
        );
    }

    #[test]
    fn test_oplog_query_sorted_natural_desc() {
        let (ctx, mock) = context(MockClient::replica_set_primary());
        run(&ReplicaSetCollector::new(ctx).unwrap());
        let find = mock.calls().into_iter().find_map(|c| match c {
            MockCall::Find {
                collection,
                options,
                ..
            } if collection == "oplog.rs" => Some(options),
            _ => None,
        });
        let options = find.unwrap();
        assert_eq!(options.sort, Some(doc! { "$natural": -1 }));
        assert_eq!(options.limit, Some(1));
    }

    #[test]
    fn test_member_missing_fields_is_skipped() {
        let mut mock = MockClient::new();
        mock.add_command(
            "admin",
            "replSetGetStatus",
            doc! {
                "set": "rs1",
                "members": [
                    { "name": "a:27017", "state": 1_i32 },
                    { "name": "b:27017", "state": 2_i32, "health": 1_i32, "self": true },
                ],
            },
        );
        let (ctx, _) = context(mock);
        let samples = run(&ReplicaSetCollector::new(ctx).unwrap());
        assert_eq!(count(&samples, "mongodb_replset_member_state"), 1);
        assert_eq!(
            value(
                &samples,
                "mongodb_replset_number_of_members",
                &[("replica_set", "rs1"), ("instance", "b:27017")]
            ),
            Some(2.0)
        );
        assert_eq!(count(&samples, "mongodb_replset_oplog_size_bytes"), 0);
    }

    #[test]
    fn test_real_error_returns_early() {
        let mut mock = MockClient::new();
        mock.fail_command(
            "admin",
            "replSetGetStatus",
            ClientError::command("unauthorized"),
        );
        let (ctx, mock_ref) = context(mock);
        assert!(run(&ReplicaSetCollector::new(ctx).unwrap()).is_empty());
        assert_eq!(mock_ref.calls().len(), 1);
    }
}
