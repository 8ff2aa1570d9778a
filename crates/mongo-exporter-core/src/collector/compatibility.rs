//! Replication op counters under the metric name older dashboards
//! (Grafana 2583) expect.

use prometheus::core::Desc;

use super::{CollectorContext, MetricCollector, log_failure};
use crate::client::ClientError;
use crate::document::get_doc;
use crate::metric::{DescSet, SampleSink};
use crate::value::numeric;

const NAME: &str = "compatibility";

pub struct CompatibilityCollector {
    ctx: CollectorContext,
    descs: DescSet,
}

impl CompatibilityCollector {
    pub fn new(ctx: CollectorContext) -> Result<Self, prometheus::Error> {
        let mut d = DescSet::new(ctx.statics());
        d.counter(
            "op_counters_repl",
            "mongodb_op_counters_repl_total",
            "Replication operation counters for dashboard 2583 compatibility",
            &["type"],
        )?;
        Ok(Self { ctx, descs: d })
    }

    fn scrape(&self, sink: &SampleSink) -> Result<(), ClientError> {
        let status = self.ctx.server_status(self.ctx.timeouts().default)?;
        let Some(counters) = get_doc(&status, &["opcountersRepl"]) else {
            return Ok(());
        };
        let labels = self.ctx.labels_for(&status);
        for (op, v) in counters {
            self.descs
                .emit_opt(sink, "op_counters_repl", numeric(v), &labels, &[op.as_str()]);
        }
        Ok(())
    }
}

impl MetricCollector for CompatibilityCollector {
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
            log_failure(NAME, "collect compatibility metrics", &e);
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
    fn test_repl_counters() {
        let (ctx, _) = context(MockClient::replica_set_primary());
        let samples = run(&CompatibilityCollector::new(ctx).unwrap());
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|s| s.label("replica_set") == Some("rs0")));
        assert!(samples.iter().all(|s| s.name() == "mongodb_op_counters_repl_total"));
    }

    #[test]
    fn test_every_key_is_exported() {
        let mut mock = MockClient::new();
        mock.add_command(
            "admin",
            "serverStatus",
            doc! { "opcountersRepl": { "insert": 7_i64, "update": 3_i32, "note": "x" } },
        );
        let (ctx, _) = context(mock);
        let samples = run(&CompatibilityCollector::new(ctx).unwrap());
        assert_eq!(samples.len(), 2);
        assert_eq!(
            value(&samples, "mongodb_op_counters_repl_total", &[("type", "insert")]),
            Some(7.0)
        );
    }

    #[test]
    fn test_disabled() {
        let (ctx, mock) = context_with(MockClient::standalone(), &disabled(NAME));
        assert!(run(&CompatibilityCollector::new(ctx).unwrap()).is_empty());
        assert!(mock.calls().is_empty());
    }
}
