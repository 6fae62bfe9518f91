use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_epoch::Atomic;

use crate::types::flow::hash_words;
use crate::types::Match;

//------------ Rule ----------------------------------------------------------

/// A classifier rule: a match and a priority.
///
/// Rules are owned by the caller and handed to a classifier as
/// `Arc<Rule>`. While a rule is installed the classifier holds its own
/// reference; removing it hands that reference back. The installed flag
/// tracks which state the rule is in, so that inserting an installed
/// rule or removing an uninstalled one is caught as a contract
/// violation rather than silently corrupting the rule set.
#[derive(Debug)]
pub struct Rule {
    match_spec: Match,
    priority: u32,
    installed: AtomicBool,
}

impl Rule {
    pub fn new(match_spec: Match, priority: u32) -> Rule {
        Rule {
            match_spec,
            priority,
            installed: AtomicBool::new(false),
        }
    }

    pub fn match_spec(&self) -> &Match {
        &self.match_spec
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Whether this rule is currently installed in a classifier.
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    pub(crate) fn set_installed(&self, installed: bool) {
        self.installed.store(installed, Ordering::Release);
    }

    pub fn is_catchall(&self) -> bool {
        self.match_spec.is_catchall()
    }

    /// Whether this rule pins everything `criteria` pins, identically.
    pub fn is_loose_match(&self, criteria: &Match) -> bool {
        self.match_spec.is_loose_match(criteria)
    }

    /// Basis-seeded hash over match and priority.
    pub fn hash(&self, basis: u64) -> u64 {
        hash_words(&[u64::from(self.priority)], self.match_spec.hash(basis))
    }
}

// Equality is over match and priority; whether the rule happens to be
// installed somewhere does not change its identity.
impl PartialEq for Rule {
    fn eq(&self, other: &Rule) -> bool {
        self.priority == other.priority
            && self.match_spec == other.match_spec
    }
}

impl Eq for Rule {}

// A cloned rule starts out uninstalled regardless of the source.
impl Clone for Rule {
    fn clone(&self) -> Rule {
        Rule::new(self.match_spec, self.priority)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} priority={}", self.match_spec, self.priority)
    }
}

//------------ ClsMatch ------------------------------------------------------

/// The classifier-internal face of an installed rule.
///
/// Rules of one subtable that share their whole match differ only in
/// priority; they hang off a single hash-map entry as a chain of these
/// nodes in descending priority order. Only the chain head is visible to
/// the supplementary indices and the priority vector.
pub(crate) struct ClsMatch {
    priority: u32,
    rule: Arc<Rule>,
    /// Next lower-priority rule with the identical match, or null.
    pub(crate) next: Atomic<ClsMatch>,
}

impl ClsMatch {
    pub(crate) fn new(rule: Arc<Rule>) -> ClsMatch {
        ClsMatch {
            priority: rule.priority(),
            rule,
            next: Atomic::null(),
        }
    }

    pub(crate) fn priority(&self) -> u32 {
        self.priority
    }

    pub(crate) fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::field::FieldId;
    use crate::types::flow::{Flow, FlowMask};

    #[test]
    fn equality_ignores_installed_state() {
        let mut mask = FlowMask::new();
        mask.open_field(FieldId::TpDst);
        let mut flow = Flow::new();
        flow.set_tp_dst(53);
        let m = Match::new(flow, mask).unwrap();

        let a = Rule::new(m, 7);
        let b = Rule::new(m, 7);
        a.set_installed(true);
        assert_eq!(a, b);
        assert_eq!(a.hash(99), b.hash(99));

        let c = a.clone();
        assert!(!c.is_installed());
        assert_eq!(a, c);
    }
}
