//! Descriptors, samples and the sink collectors write into.
//!
//! A collector owns one [`DescSet`], built at construction time and never
//! mutated afterwards. During a cycle it resolves [`InstanceLabels`] and calls
//! [`DescSet::emit`] for every observation; the resulting [`Sample`]s travel
//! through a shared [`SampleSink`] to whoever drives the cycle, which turns
//! them into exposition families with [`into_families`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::mpsc::Sender;

use prometheus::core::Desc;
use prometheus::proto::{Counter, Gauge, LabelPair, Metric, MetricFamily, MetricType};
use tracing::warn;

use crate::labels::{InstanceLabels, StaticLabels, TOPOLOGY_LABELS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

/// Immutable metadata for one metric family.
#[derive(Debug, Clone)]
pub struct MetricDesc {
    pub desc: Desc,
    pub kind: MetricKind,
    const_labels: Vec<(String, String)>,
}

impl MetricDesc {
    pub fn name(&self) -> &str {
        &self.desc.fq_name
    }

    pub fn help(&self) -> &str {
        &self.desc.help
    }

    /// Variable label names: topology labels first, then collector labels.
    pub fn label_names(&self) -> &[String] {
        &self.desc.variable_labels
    }
}

/// Per-collector descriptor table keyed by a short, collector-local key.
///
/// Iteration order is the key order, so `describe` is stable across calls.
#[derive(Debug, Clone)]
pub struct DescSet {
    descs: BTreeMap<&'static str, Arc<MetricDesc>>,
    const_labels: HashMap<String, String>,
}

impl DescSet {
    pub fn new(statics: &StaticLabels) -> Self {
        Self {
            descs: BTreeMap::new(),
            const_labels: statics.const_labels(),
        }
    }

    pub fn gauge(
        &mut self,
        key: &'static str,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> Result<(), prometheus::Error> {
        self.add(key, name, help, labels, MetricKind::Gauge)
    }

    pub fn counter(
        &mut self,
        key: &'static str,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> Result<(), prometheus::Error> {
        self.add(key, name, help, labels, MetricKind::Counter)
    }

    fn add(
        &mut self,
        key: &'static str,
        name: &str,
        help: &str,
        labels: &[&str],
        kind: MetricKind,
    ) -> Result<(), prometheus::Error> {
        let variable: Vec<String> = TOPOLOGY_LABELS
            .iter()
            .chain(labels.iter())
            .map(|s| s.to_string())
            .collect();
        let desc = Desc::new(
            name.to_string(),
            help.to_string(),
            variable,
            self.const_labels.clone(),
        )?;
        let mut const_labels: Vec<(String, String)> = self
            .const_labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        const_labels.sort();
        self.descs.insert(
            key,
            Arc::new(MetricDesc {
                desc,
                kind,
                const_labels,
            }),
        );
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Arc<MetricDesc>> {
        self.descs.get(key)
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    /// Every descriptor in key order.
    pub fn descs(&self) -> Vec<Desc> {
        self.descs.values().map(|d| d.desc.clone()).collect()
    }

    /// Sends one observation for descriptor `key`.
    ///
    /// `extra` holds the values of the collector-specific labels in
    /// declaration order. An unknown key is dropped with a warning.
    pub fn emit(
        &self,
        sink: &SampleSink,
        key: &str,
        value: f64,
        labels: &InstanceLabels,
        extra: &[&str],
    ) {
        let Some(desc) = self.descs.get(key) else {
            warn!(metric = key, "emit for undeclared metric");
            return;
        };
        sink.send(Sample {
            desc: Arc::clone(desc),
            value,
            label_values: labels.values(extra),
        });
    }

    /// [`emit`](Self::emit) when `value` is present, nothing otherwise.
    pub fn emit_opt(
        &self,
        sink: &SampleSink,
        key: &str,
        value: Option<f64>,
        labels: &InstanceLabels,
        extra: &[&str],
    ) {
        if let Some(value) = value {
            self.emit(sink, key, value, labels, extra);
        }
    }
}

/// One labeled observation.
#[derive(Debug, Clone)]
pub struct Sample {
    pub desc: Arc<MetricDesc>,
    pub value: f64,
    pub label_values: Vec<String>,
}

impl Sample {
    pub fn name(&self) -> &str {
        self.desc.name()
    }

    /// Value of label `name`, static labels included.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.desc
            .label_names()
            .iter()
            .position(|l| l == name)
            .and_then(|i| self.label_values.get(i))
            .map(String::as_str)
            .or_else(|| {
                self.desc
                    .const_labels
                    .iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.as_str())
            })
    }
}

/// Output channel shared by every collector running in a cycle.
///
/// Sending never blocks and never fails from the collector's point of view:
/// a disconnected receiver simply discards the sample.
#[derive(Debug, Clone)]
pub struct SampleSink {
    tx: Sender<Sample>,
}

impl SampleSink {
    pub fn new(tx: Sender<Sample>) -> Self {
        Self { tx }
    }

    pub fn send(&self, sample: Sample) {
        let expected = sample.desc.label_names().len();
        if sample.label_values.len() != expected {
            warn!(
                metric = sample.name(),
                expected,
                got = sample.label_values.len(),
                "dropping sample with wrong label cardinality"
            );
            return;
        }
        let _ = self.tx.send(sample);
    }
}

/// Groups samples into exposition families.
///
/// Families come out sorted by name, metrics sorted by label values. When two
/// samples share a name and label values, the later one wins.
pub fn into_families<I>(samples: I) -> Vec<MetricFamily>
where
    I: IntoIterator<Item = Sample>,
{
    type Series = BTreeMap<Vec<String>, f64>;
    let mut grouped: BTreeMap<String, (Arc<MetricDesc>, Series)> = BTreeMap::new();
    for sample in samples {
        let entry = grouped
            .entry(sample.desc.name().to_string())
            .or_insert_with(|| (Arc::clone(&sample.desc), BTreeMap::new()));
        entry.1.insert(sample.label_values, sample.value);
    }

    grouped
        .into_values()
        .map(|(desc, series)| {
            let metrics = series
                .into_iter()
                .map(|(values, value)| build_metric(&desc, values, value))
                .collect();
            let mut family = MetricFamily::default();
            family.set_name(desc.name().to_string());
            family.set_help(desc.help().to_string());
            family.set_field_type(match desc.kind {
                MetricKind::Counter => MetricType::COUNTER,
                MetricKind::Gauge => MetricType::GAUGE,
            });
            family.set_metric(metrics);
            family
        })
        .collect()
}

fn build_metric(desc: &MetricDesc, values: Vec<String>, value: f64) -> Metric {
    let mut pairs: Vec<(String, String)> = desc
        .label_names()
        .iter()
        .cloned()
        .zip(values)
        .chain(desc.const_labels.iter().cloned())
        .collect();
    pairs.sort();

    let labels = pairs
        .into_iter()
        .map(|(name, value)| {
            let mut lp = LabelPair::default();
            lp.set_name(name);
            lp.set_value(value);
            lp
        })
        .collect();

    let mut m = Metric::default();
    m.set_label(labels);
    match desc.kind {
        MetricKind::Counter => {
            let mut c = Counter::default();
            c.set_value(value);
            m.set_counter(c);
        }
        MetricKind::Gauge => {
            let mut g = Gauge::default();
            g.set_value(value);
            m.set_gauge(g);
        }
    }
    m
}
