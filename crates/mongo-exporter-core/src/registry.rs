//! Fan-out engine: runs every registered collector once per cycle.
//!
//! Each collector gets its own scoped thread. A collector that panics is
//! reported as a [`CollectorFault`]; its siblings still finish and their
//! samples still reach the sink.

use std::any::Any;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use tracing::{debug, error, warn};

use crate::collector::{MetricCollector, ShutdownSignal};
use crate::metric::{SampleSink, into_families};

pub const FAN_OUT_NAME: &str = "multi_collector";

/// A collector that panicked during a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorFault {
    pub collector: String,
    pub message: String,
}

/// Outcome of one cycle.
#[derive(Debug, Clone, Default)]
pub struct CollectReport {
    /// Collectors dispatched, faulted ones included.
    pub collectors: usize,
    pub faults: Vec<CollectorFault>,
    pub elapsed: Duration,
    /// The cycle was refused because shutdown had been triggered.
    pub cancelled: bool,
}

/// Mutable set of collectors driven as one.
pub struct FanOut {
    collectors: Mutex<Vec<Arc<dyn MetricCollector>>>,
    shutdown: ShutdownSignal,
}

impl FanOut {
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self {
            collectors: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    pub fn with_collectors(
        shutdown: ShutdownSignal,
        collectors: Vec<Arc<dyn MetricCollector>>,
    ) -> Self {
        let fan_out = Self::new(shutdown);
        for collector in collectors {
            fan_out.add(collector);
        }
        fan_out
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn MetricCollector>>> {
        self.collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `collector`, replacing any collector with the same name.
    pub fn add(&self, collector: Arc<dyn MetricCollector>) {
        let mut collectors = self.lock();
        if let Some(pos) = collectors.iter().position(|c| c.name() == collector.name()) {
            warn!(collector = collector.name(), "replacing registered collector");
            collectors[pos] = collector;
        } else {
            collectors.push(collector);
        }
    }

    /// Unregisters the collector called `name`. Unknown names are ignored.
    pub fn remove(&self, name: &str) -> bool {
        let mut collectors = self.lock();
        let before = collectors.len();
        collectors.retain(|c| c.name() != name);
        before != collectors.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().iter().map(|c| c.name().to_string()).collect()
    }

    pub fn name(&self) -> &str {
        FAN_OUT_NAME
    }

    /// Descriptors of every registered collector, in registration order.
    pub fn describe(&self) -> Vec<Desc> {
        let collectors = self.snapshot();
        collectors.iter().flat_map(|c| c.describe()).collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn MetricCollector>> {
        self.lock().clone()
    }

    /// Runs one cycle, returning once every collector has finished.
    ///
    /// The collector list is snapshotted first, so `add`/`remove` during a
    /// cycle take effect on the next one.
    pub fn collect(&self, sink: &SampleSink) -> CollectReport {
        if self.shutdown.is_triggered() {
            debug!("shutdown in progress, skipping collection cycle");
            return CollectReport {
                cancelled: true,
                ..CollectReport::default()
            };
        }

        let collectors = self.snapshot();
        let started = Instant::now();

        let faults: Vec<CollectorFault> = thread::scope(|s| {
            let handles: Vec<_> = collectors
                .iter()
                .map(|collector| {
                    let sink = sink.clone();
                    let handle = s.spawn(move || collector.collect(&sink));
                    (collector.name(), handle)
                })
                .collect();

            handles
                .into_iter()
                .filter_map(|(name, handle)| {
                    let payload = handle.join().err()?;
                    let fault = CollectorFault {
                        collector: name.to_string(),
                        message: panic_message(payload.as_ref()),
                    };
                    error!(
                        collector = %fault.collector,
                        panic = %fault.message,
                        "collector panicked"
                    );
                    Some(fault)
                })
                .collect()
        });

        let report = CollectReport {
            collectors: collectors.len(),
            faults,
            elapsed: started.elapsed(),
            cancelled: false,
        };
        if report.faults.is_empty() {
            debug!(
                collectors = report.collectors,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "collection cycle finished"
            );
        } else {
            let failed: Vec<&str> = report.faults.iter().map(|f| f.collector.as_str()).collect();
            warn!(
                collectors = report.collectors,
                faults = report.faults.len(),
                failed = ?failed,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "collection cycle finished with faults"
            );
        }
        report
    }

    /// Runs one cycle and groups the samples into exposition families.
    pub fn gather(&self) -> (Vec<MetricFamily>, CollectReport) {
        let (tx, rx) = mpsc::channel();
        let sink = SampleSink::new(tx);
        let report = self.collect(&sink);
        drop(sink);
        (into_families(rx), report)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Exposes a [`FanOut`] to a `prometheus::Registry`.
///
/// Descriptors are captured when the bridge is built; collectors added to the
/// fan-out afterwards are still collected but not described.
pub struct PrometheusBridge {
    fan_out: Arc<FanOut>,
    descs: Vec<Desc>,
}

impl PrometheusBridge {
    pub fn new(fan_out: Arc<FanOut>) -> Self {
        let descs = fan_out.describe();
        Self { fan_out, descs }
    }

    pub fn fan_out(&self) -> &Arc<FanOut> {
        &self.fan_out
    }
}

impl Collector for PrometheusBridge {
    fn desc(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.fan_out.gather().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{InstanceLabels, StaticLabels};
    use crate::metric::{DescSet, Sample};

    struct Fixed {
        name: &'static str,
        descs: DescSet,
        labels: InstanceLabels,
    }

    impl Fixed {
        fn new(name: &'static str, metric: &str) -> Self {
            let statics = StaticLabels::default();
            let mut descs = DescSet::new(&statics);
            descs.gauge("value", metric, "Test value", &["kind"]).unwrap();
            Self {
                name,
                descs,
                labels: InstanceLabels::unknown(&statics),
            }
        }
    }

    impl MetricCollector for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn describe(&self) -> Vec<Desc> {
            self.descs.descs()
        }

        fn collect(&self, sink: &SampleSink) {
            self.descs.emit(sink, "value", 1.0, &self.labels, &["a"]);
            self.descs.emit(sink, "value", 2.0, &self.labels, &["b"]);
        }
    }

    struct Faulty;

    impl MetricCollector for Faulty {
        fn name(&self) -> &str {
            "faulty"
        }

        fn describe(&self) -> Vec<Desc> {
            Vec::new()
        }

        fn collect(&self, _sink: &SampleSink) {
            panic!("unexpected document shape");
        }
    }

    fn drain(fan_out: &FanOut) -> (Vec<Sample>, CollectReport) {
        let (tx, rx) = mpsc::channel();
        let sink = SampleSink::new(tx);
        let report = fan_out.collect(&sink);
        drop(sink);
        (rx.into_iter().collect(), report)
    }

    #[test]
    fn test_fault_isolation() {
        let fan_out = FanOut::new(ShutdownSignal::new());
        fan_out.add(Arc::new(Faulty));
        fan_out.add(Arc::new(Fixed::new("fixed", "mongodb_test_value")));

        let (samples, report) = drain(&fan_out);
        assert_eq!(samples.len(), 2);
        assert_eq!(report.collectors, 2);
        assert_eq!(
            report.faults,
            vec![CollectorFault {
                collector: "faulty".into(),
                message: "unexpected document shape".into(),
            }]
        );
        assert!(!report.cancelled);
    }

    #[test]
    fn test_add_remove() {
        let fan_out = FanOut::new(ShutdownSignal::new());
        fan_out.add(Arc::new(Fixed::new("one", "mongodb_test_one")));
        fan_out.add(Arc::new(Fixed::new("two", "mongodb_test_two")));
        assert_eq!(fan_out.len(), 2);

        assert!(!fan_out.remove("missing"));
        assert_eq!(fan_out.len(), 2);

        assert!(fan_out.remove("one"));
        assert_eq!(fan_out.names(), vec!["two".to_string()]);
        assert_eq!(fan_out.name(), "multi_collector");
    }

    #[test]
    fn test_add_replaces_same_name() {
        let fan_out = FanOut::new(ShutdownSignal::new());
        fan_out.add(Arc::new(Fixed::new("one", "mongodb_test_old")));
        fan_out.add(Arc::new(Fixed::new("one", "mongodb_test_new")));
        assert_eq!(fan_out.len(), 1);
        let names: Vec<String> = fan_out.describe().into_iter().map(|d| d.fq_name).collect();
        assert_eq!(names, vec!["mongodb_test_new".to_string()]);
    }

    #[test]
    fn test_shutdown_refuses_cycle() {
        let shutdown = ShutdownSignal::new();
        let fan_out = FanOut::with_collectors(
            shutdown.clone(),
            vec![Arc::new(Fixed::new("fixed", "mongodb_test_value"))],
        );
        shutdown.trigger();
        let (samples, report) = drain(&fan_out);
        assert!(samples.is_empty());
        assert!(report.cancelled);
        assert_eq!(report.collectors, 0);
    }

    #[test]
    fn test_bridge_in_registry() {
        let fan_out = Arc::new(FanOut::with_collectors(
            ShutdownSignal::new(),
            vec![
                Arc::new(Fixed::new("fixed", "mongodb_test_value")),
                Arc::new(Faulty),
            ],
        ));
        let registry = prometheus::Registry::new();
        registry
            .register(Box::new(PrometheusBridge::new(fan_out)))
            .unwrap();

        let families = registry.gather();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_name(), "mongodb_test_value");
        assert_eq!(families[0].get_metric().len(), 2);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }
}
