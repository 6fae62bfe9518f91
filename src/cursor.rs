//------------ Cursor --------------------------------------------------------
//
// Iteration over every installed rule, optionally restricted to rules
// that loose-match a target. Order is subtables in descending
// max-priority order, then hash-map order within a subtable, then down
// each priority chain. Iteration is a writer-role operation; it comes
// in two flavors mirroring the two ways to hold that role:
//
//  * the plain cursor takes the writer lock for its whole lifetime, so
//    the rule set cannot change under it (and the thread holding it
//    must not call a mutating classifier method);
//  * the safe cursor takes no lock. The caller is the writer and may
//    remove the rule the cursor just yielded. The cursor stays ahead
//    of such removals by prefetching its successor before yielding,
//    and it keeps an epoch guard pinned for its whole lifetime, so
//    positions it already holds stay readable even once unlinked.

use std::sync::{Arc, MutexGuard};
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Guard};

use crate::classifier::{Classifier, WriterState};
use crate::cmap::CmapCursor;
use crate::pvector::Entry;
use crate::rule::{ClsMatch, Rule};
use crate::subtable::{RuleChain, Subtable};
use crate::types::Match;

pub struct Cursor<'a> {
    _lock: Option<MutexGuard<'a, WriterState>>,
    guard: Guard,
    target: Option<Match>,
    safe: bool,
    entries: *const Entry<Arc<Subtable>>,
    n_entries: usize,
    idx: usize,
    chains: Option<CmapCursor<RuleChain>>,
    node: *const ClsMatch,
    pending: Option<Arc<Rule>>,
    started: bool,
}

impl Classifier {
    /// Start iterating the installed rules whose match loose-matches
    /// `target` (all rules if `target` is `None`). With `safe` the
    /// caller may remove the most recently yielded rule while
    /// iterating; without it the cursor holds the writer lock until it
    /// is dropped.
    pub fn cursor(
        &self,
        target: Option<&Match>,
        safe: bool,
    ) -> Cursor<'_> {
        let lock = if safe {
            None
        } else {
            Some(self.writer.lock().unwrap())
        };
        let guard = epoch::pin();
        let (entries, n_entries) =
            unsafe { self.subtables.snapshot_raw(&guard) };
        Cursor {
            _lock: lock,
            guard,
            target: target.copied(),
            safe,
            entries,
            n_entries,
            idx: 0,
            chains: None,
            node: std::ptr::null(),
            pending: None,
            started: false,
        }
    }
}

impl Cursor<'_> {
    fn advance_raw(&mut self) -> Option<Arc<Rule>> {
        loop {
            // Walk down the current priority chain.
            while !self.node.is_null() {
                let node = unsafe { &*self.node };
                self.node = unsafe {
                    node.next
                        .load(Ordering::Acquire, epoch::unprotected())
                        .as_raw()
                };
                let rule = node.rule();
                match &self.target {
                    Some(t) if !rule.is_loose_match(t) => {}
                    _ => return Some(rule.clone()),
                }
            }

            // Next chain of the current subtable.
            if let Some(chains) = self.chains.as_mut() {
                match unsafe { chains.next() } {
                    Some(chain) => {
                        let chain: &RuleChain = chain;
                        self.node = unsafe {
                            chain
                                .head
                                .load(
                                    Ordering::Acquire,
                                    epoch::unprotected(),
                                )
                                .as_raw()
                        };
                        continue;
                    }
                    None => self.chains = None,
                }
            }

            // Next subtable.
            if self.idx >= self.n_entries {
                return None;
            }
            let entry = unsafe { &*self.entries.add(self.idx) };
            self.idx += 1;
            let subtable = &entry.value;
            if let Some(t) = &self.target {
                // A loose match needs the rule mask to cover the
                // target mask, and all rules here share the subtable
                // mask.
                if !t.mask().is_subset_of(subtable.mask()) {
                    continue;
                }
            }
            self.chains = Some(unsafe {
                CmapCursor::start(subtable.rules_map(), &self.guard)
            });
        }
    }
}

impl Iterator for Cursor<'_> {
    type Item = Arc<Rule>;

    fn next(&mut self) -> Option<Arc<Rule>> {
        if !self.safe {
            return self.advance_raw();
        }
        if !self.started {
            self.pending = self.advance_raw();
            self.started = true;
        }
        let current = self.pending.take()?;
        self.pending = self.advance_raw();
        Some(current)
    }
}
