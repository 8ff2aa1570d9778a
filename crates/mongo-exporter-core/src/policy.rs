//! Enable/disable decision for collectors.

use std::collections::HashSet;

/// Allow-list / deny-list pair.
///
/// The decision is recomputed on every call; collectors ask at the top of each
/// `collect`, so nothing here is cached.
#[derive(Debug, Clone, Default)]
pub struct EnablementPolicy {
    enabled: HashSet<String>,
    disabled: HashSet<String>,
}

impl EnablementPolicy {
    pub fn new<I, J, S, T>(enabled: I, disabled: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        let clean = |s: &str| s.trim().to_string();
        Self {
            enabled: enabled
                .into_iter()
                .map(|s| clean(s.as_ref()))
                .filter(|s| !s.is_empty())
                .collect(),
            disabled: disabled
                .into_iter()
                .map(|s| clean(s.as_ref()))
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Deny-list wins; an empty allow-list enables everything else;
    /// otherwise the name must be allow-listed.
    pub fn is_enabled(&self, name: &str) -> bool {
        if self.disabled.contains(name) {
            return false;
        }
        self.enabled.is_empty() || self.enabled.contains(name)
    }

    /// Same decision for a collector known under several names: denying any
    /// alias disables it, allowing any alias enables it.
    pub fn any_enabled(&self, names: &[&str]) -> bool {
        if names.iter().any(|n| self.disabled.contains(*n)) {
            return false;
        }
        self.enabled.is_empty() || names.iter().any(|n| self.enabled.contains(*n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: [&str; 0] = [];

    #[test]
    fn test_empty_lists_enable_everything() {
        let policy = EnablementPolicy::new(NONE, NONE);
        assert!(policy.is_enabled("server_status"));
        assert!(policy.is_enabled("anything_else"));
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let policy = EnablementPolicy::new(["locks", "profile"], ["locks"]);
        assert!(!policy.is_enabled("locks"));
        assert!(policy.is_enabled("profile"));

        let deny_only = EnablementPolicy::new(NONE, ["profile"]);
        assert!(!deny_only.is_enabled("profile"));
        assert!(deny_only.is_enabled("locks"));
    }

    #[test]
    fn test_allow_list_requires_membership() {
        let policy = EnablementPolicy::new(["server_status"], NONE);
        assert!(policy.is_enabled("server_status"));
        assert!(!policy.is_enabled("wiredtiger"));
    }

    #[test]
    fn test_entries_are_trimmed() {
        let policy = EnablementPolicy::new([" cursors ", ""], NONE);
        assert!(policy.is_enabled("cursors"));
        assert!(!policy.is_enabled("locks"));
    }

    #[test]
    fn test_any_enabled_alias() {
        let policy = EnablementPolicy::new(["collection_stats"], NONE);
        assert!(policy.any_enabled(&["collstats", "collection_stats"]));
        assert!(!policy.any_enabled(&["collstats"]));

        let denied_alias = EnablementPolicy::new(NONE, ["collstats"]);
        assert!(!denied_alias.any_enabled(&["collstats", "collection_stats"]));
    }
}
