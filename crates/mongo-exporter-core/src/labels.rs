//! Topology labels attached to every sample.
//!
//! Every descriptor starts with the same three variable labels
//! (`instance`, `replica_set`, `shard`) derived from a diagnostic snapshot.
//! Operator-supplied static labels are merged last: a static label named like
//! one of the three reserved labels replaces the derived value, all other
//! static labels become constant labels on the descriptors.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use mongodb::bson::Document;

use crate::document::{get_doc, get_str};

/// Variable labels shared by every descriptor, in this order.
pub const TOPOLOGY_LABELS: [&str; 3] = ["instance", "replica_set", "shard"];

/// Placeholder for topology fields the snapshot does not carry.
pub const UNKNOWN: &str = "unknown";

/// Returned when a configured static label name is not a valid metric label.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidLabelName(pub String);

impl fmt::Display for InvalidLabelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid label name '{}'", self.0)
    }
}

impl std::error::Error for InvalidLabelName {}

/// Checks the exposition-format label name grammar `[a-zA-Z_][a-zA-Z0-9_]*`,
/// excluding the reserved `__` prefix.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    if name.starts_with("__") {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validated operator-supplied labels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticLabels {
    labels: BTreeMap<String, String>,
}

impl StaticLabels {
    pub fn new(labels: &HashMap<String, String>) -> Result<Self, InvalidLabelName> {
        let mut validated = BTreeMap::new();
        for (name, value) in labels {
            if !is_valid_label_name(name) {
                return Err(InvalidLabelName(name.clone()));
            }
            validated.insert(name.clone(), value.clone());
        }
        Ok(Self { labels: validated })
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Static labels that do not shadow a topology label.
    pub fn const_labels(&self) -> HashMap<String, String> {
        self.labels
            .iter()
            .filter(|(k, _)| !TOPOLOGY_LABELS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn topology_override(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}

/// Resolved topology labels for one collection cycle of one collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLabels {
    pub instance: String,
    pub replica_set: String,
    pub shard: String,
    extra: BTreeMap<String, String>,
}

impl InstanceLabels {
    /// Derives labels from a snapshot: `host`, `repl.setName` and `shard`.
    ///
    /// Missing or wrong-typed fields degrade to [`UNKNOWN`]; static labels win.
    pub fn from_snapshot(snapshot: &Document, statics: &StaticLabels) -> Self {
        let pick = |name: &str, derived: Option<&str>| -> String {
            statics
                .topology_override(name)
                .or(derived)
                .unwrap_or(UNKNOWN)
                .to_string()
        };

        Self {
            instance: pick("instance", get_str(snapshot, &["host"])),
            replica_set: pick(
                "replica_set",
                get_doc(snapshot, &["repl"]).and_then(|r| get_str(r, &["setName"])),
            ),
            shard: pick("shard", get_str(snapshot, &["shard"])),
            extra: statics.const_labels().into_iter().collect(),
        }
    }

    /// Labels for collectors that have no natural snapshot to derive from.
    pub fn unknown(statics: &StaticLabels) -> Self {
        Self::from_snapshot(&Document::new(), statics)
    }

    /// Topology values followed by `extra`, matching descriptor label order.
    pub fn values(&self, extra: &[&str]) -> Vec<String> {
        let mut values = Vec::with_capacity(3 + extra.len());
        values.push(self.instance.clone());
        values.push(self.replica_set.clone());
        values.push(self.shard.clone());
        values.extend(extra.iter().map(|s| s.to_string()));
        values
    }

    /// Every label this instance contributes, static labels included.
    pub fn as_map(&self) -> BTreeMap<String, String> {
        let mut map = self.extra.clone();
        map.insert("instance".into(), self.instance.clone());
        map.insert("replica_set".into(), self.replica_set.clone());
        map.insert("shard".into(), self.shard.clone());
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    fn statics(pairs: &[(&str, &str)]) -> StaticLabels {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        StaticLabels::new(&map).unwrap()
    }

    #[test]
    fn test_labels_from_full_snapshot() {
        let snapshot = doc! {
            "host": "test-host",
            "repl": { "setName": "test-replica" },
            "shard": "test-shard",
        };
        let labels = InstanceLabels::from_snapshot(&snapshot, &StaticLabels::default());
        assert_eq!(labels.instance, "test-host");
        assert_eq!(labels.replica_set, "test-replica");
        assert_eq!(labels.shard, "test-shard");
        assert_eq!(labels.as_map().len(), 3);
    }

    #[test]
    fn test_labels_from_empty_snapshot() {
        let labels = InstanceLabels::unknown(&StaticLabels::default());
        assert_eq!(
            labels.values(&[]),
            vec!["unknown".to_string(), "unknown".into(), "unknown".into()]
        );
    }

    #[test]
    fn test_labels_wrong_types_degrade() {
        let snapshot = doc! { "host": 5, "repl": "rs0", "shard": true };
        let labels = InstanceLabels::from_snapshot(&snapshot, &StaticLabels::default());
        assert_eq!(labels.instance, UNKNOWN);
        assert_eq!(labels.replica_set, UNKNOWN);
        assert_eq!(labels.shard, UNKNOWN);
    }

    #[test]
    fn test_static_labels_merged_and_win() {
        let snapshot = doc! { "host": "db1" };
        let s = statics(&[("env", "prod"), ("instance", "override")]);
        let labels = InstanceLabels::from_snapshot(&snapshot, &s);
        assert_eq!(labels.instance, "override");

        let map = labels.as_map();
        assert_eq!(map.get("env").map(String::as_str), Some("prod"));
        assert_eq!(map.len(), 4);

        let consts = s.const_labels();
        assert_eq!(consts.len(), 1);
        assert!(consts.contains_key("env"));
    }

    #[test]
    fn test_values_appends_extra() {
        let labels = InstanceLabels::unknown(&StaticLabels::default());
        let values = labels.values(&["db", "coll"]);
        assert_eq!(values.len(), 5);
        assert_eq!(values[3], "db");
        assert_eq!(values[4], "coll");
    }

    #[test]
    fn test_label_name_validation() {
        assert!(is_valid_label_name("env"));
        assert!(is_valid_label_name("_private"));
        assert!(is_valid_label_name("dc2"));
        assert!(!is_valid_label_name(""));
        assert!(!is_valid_label_name("2dc"));
        assert!(!is_valid_label_name("my-label"));
        assert!(!is_valid_label_name("__name__"));

        let mut bad = HashMap::new();
        bad.insert("my-label".to_string(), "x".to_string());
        assert_eq!(
            StaticLabels::new(&bad),
            Err(InvalidLabelName("my-label".into()))
        );
    }
}
