//! Router Layer
//!
//! Responsibilities:
//! - Action selection based on the destination string
//! - NO IO operations
//! - NO async operations
//!
//! The rule engine is a pure function over an immutable rule snapshot:
//! destination -> RuleAction. Mutation swaps in a fresh snapshot, so a
//! match in progress never observes a partially updated list.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Action applied to a classified flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Forward through the upstream proxy
    Proxy,
    /// Write back to the tunnel unchanged
    Direct,
    /// Drop silently
    Reject,
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleAction::Proxy => write!(f, "proxy"),
            RuleAction::Direct => write!(f, "direct"),
            RuleAction::Reject => write!(f, "reject"),
        }
    }
}

/// A single classification rule
///
/// The pattern is matched as a case-sensitive substring of the
/// destination string (`http://<addr>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Substring to look for in the destination
    pub pattern: String,
    /// Action when the pattern matches
    pub action: RuleAction,
}

impl Rule {
    pub fn new(pattern: impl Into<String>, action: RuleAction) -> Self {
        Self {
            pattern: pattern.into(),
            action,
        }
    }
}

/// Ordered first-match-wins rule engine
///
/// Readers clone the current `Arc` snapshot and iterate without holding
/// the lock; writers build a new list and swap it in atomically.
pub struct RuleEngine {
    rules: RwLock<Arc<Vec<Rule>>>,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    /// Select the action for a destination string
    ///
    /// Rules are evaluated in order; the first matching pattern wins.
    /// No match, or no destination to match against, selects Direct.
    pub fn select(&self, destination: Option<&str>) -> RuleAction {
        let destination = match destination {
            Some(d) => d,
            None => return RuleAction::Direct,
        };

        let snapshot = self.rules.read().clone();
        for rule in snapshot.iter() {
            if destination.contains(&rule.pattern) {
                return rule.action;
            }
        }

        RuleAction::Direct
    }

    /// Append a rule to the end of the list
    pub fn add_rule(&self, rule: Rule) {
        let mut guard = self.rules.write();
        let mut rules = guard.as_ref().clone();
        rules.push(rule);
        *guard = Arc::new(rules);
    }

    /// Remove the rule at `index`; out-of-range is a no-op
    pub fn remove_rule(&self, index: usize) -> bool {
        let mut guard = self.rules.write();
        if index >= guard.len() {
            return false;
        }
        let mut rules = guard.as_ref().clone();
        rules.remove(index);
        *guard = Arc::new(rules);
        true
    }

    /// Replace the whole rule list
    pub fn replace_rules(&self, rules: Vec<Rule>) {
        *self.rules.write() = Arc::new(rules);
    }

    /// Current rule snapshot
    pub fn rules(&self) -> Arc<Vec<Rule>> {
        self.rules.read().clone()
    }

    /// Number of rules in the current snapshot
    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
