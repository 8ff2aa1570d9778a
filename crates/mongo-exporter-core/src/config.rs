//! Resolved collector configuration.
//!
//! Built once before any collector and shared read-only afterwards. The
//! `collectors` section is free-form so new per-collector settings do not need
//! a schema change; the typed views below decode the settings collectors
//! actually read.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::labels::{InvalidLabelName, StaticLabels};
use crate::policy::EnablementPolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Static labels added to every sample.
    pub custom_labels: HashMap<String, String>,
    /// Allow-list of collector names; empty means all.
    pub enabled_metrics: Vec<String>,
    /// Deny-list of collector names; always wins.
    pub disabled_metrics: Vec<String>,
    /// Per-collector settings keyed by collector name.
    pub collectors: HashMap<String, Value>,
}

impl CollectorConfig {
    pub fn policy(&self) -> EnablementPolicy {
        EnablementPolicy::new(&self.enabled_metrics, &self.disabled_metrics)
    }

    pub fn static_labels(&self) -> Result<StaticLabels, InvalidLabelName> {
        StaticLabels::new(&self.custom_labels)
    }

    /// Raw setting `key` of collector `collector`.
    pub fn setting(&self, collector: &str, key: &str) -> Option<&Value> {
        self.collectors.get(collector)?.get(key)
    }

    /// String list setting. Accepts a list of strings (non-string entries are
    /// skipped) or a single comma-separated string.
    pub fn string_list(&self, collector: &str, key: &str) -> Vec<String> {
        match self.setting(collector, key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn bool_setting(&self, collector: &str, key: &str, default: bool) -> bool {
        self.setting(collector, key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    /// Positive integer setting; zero or negative values read as unset.
    pub fn limit_setting(&self, collector: &str, key: &str) -> Option<usize> {
        self.setting(collector, key)
            .and_then(Value::as_u64)
            .filter(|v| *v > 0)
            .map(|v| v as usize)
    }

    /// Collection allow-list for the collection-stats collector, read from
    /// either of its names.
    pub fn monitored_collections(&self) -> MonitoredCollections {
        let mut entries = self.string_list("collstats", "monitored_collections");
        entries.extend(self.string_list("collection_stats", "monitored_collections"));
        MonitoredCollections::from_entries(entries)
    }
}

/// Which `database.collection` namespaces the collection-stats collector reads.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitoredCollections {
    All,
    Only(HashSet<String>),
}

impl MonitoredCollections {
    /// An empty list, or one containing `*`, means every collection.
    pub fn from_entries<I: IntoIterator<Item = String>>(entries: I) -> Self {
        let set: HashSet<String> = entries.into_iter().collect();
        if set.is_empty() || set.contains("*") {
            MonitoredCollections::All
        } else {
            MonitoredCollections::Only(set)
        }
    }

    pub fn matches(&self, database: &str, collection: &str) -> bool {
        match self {
            MonitoredCollections::All => true,
            MonitoredCollections::Only(set) => set.contains(&format!("{database}.{collection}")),
        }
    }
}
