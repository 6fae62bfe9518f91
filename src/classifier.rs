//------------ Classifier ----------------------------------------------------
//
// The top-level rule database. One subtable per distinct mask shape does
// the hashed matching; this module decides which subtables a lookup
// visits and in what order, and maintains every auxiliary structure that
// cuts that visit list down: the priority vector (subtables in
// descending max-priority order, so a lookup stops as soon as nothing
// later can win), the metadata partitions, and the prefix tries.
//
// Concurrency follows the single-writer / many-reader discipline: all
// mutation serializes on the writer mutex, while lookups run lock-free
// against epoch-published state. Bookkeeping only the writer ever needs
// (the shape-to-subtable map, per-partition rule counts) lives inside
// the mutex; everything a reader touches is published with release
// stores and reclaimed through the epoch collector.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use crossbeam_utils::CachePadded;
use log::{debug, trace};

use crate::partition::{
    tag_create_deterministic, PartitionMap, TAG_ARBITRARY,
};
use crate::pvector::PVector;
use crate::rule::{ClsMatch, Rule};
use crate::subtable::{chain_iter, Subtable, SubtableInsert};
use crate::trie::{Trie, TrieCtx};
use crate::types::errors::ClassifierError;
use crate::types::field::FieldId;
use crate::types::flow::{
    hash_words, Flow, FlowMask, FlowWildcards, FLOW_U64S,
};
use crate::types::match_spec::Match;
use crate::{CLASSIFIER_MAX_BATCH, CLS_MAX_INDICES, CLS_MAX_TRIES};

//------------ Writer-only state ---------------------------------------------

struct PartitionRef {
    tag: u64,
    n_rules: usize,
}

pub(crate) struct WriterState {
    /// Mask shape to subtable. Only the writer resolves shapes; readers
    /// go through the priority vector.
    subtables_map: HashMap<FlowMask, Arc<Subtable>>,
    /// For each fully-pinned metadata value, how many rules each
    /// subtable contributes, keyed by subtable identity. Drives the
    /// published partition aggregates.
    partition_counts: HashMap<u64, HashMap<usize, PartitionRef>>,
}

//------------ Classifier ----------------------------------------------------

pub struct Classifier {
    segments: [u8; CLS_MAX_INDICES],
    n_rules: CachePadded<AtomicUsize>,
    pub(crate) subtables: PVector<Arc<Subtable>>,
    partitions: PartitionMap,
    tries: Atomic<Vec<Trie>>,
    pub(crate) writer: Mutex<WriterState>,
}

impl Default for Classifier {
    fn default() -> Self {
        Classifier::new(crate::types::flow::FLOW_SEGMENTS)
    }
}

impl Classifier {
    /// A classifier cutting its staged lookups at the given flow-word
    /// boundaries. The boundaries must be strictly ascending and inside
    /// the flow.
    pub fn new(segments: [u8; CLS_MAX_INDICES]) -> Classifier {
        let mut prev = 0u8;
        for &b in &segments {
            assert!(
                b > prev && (b as usize) < FLOW_U64S,
                "segment boundaries must be ascending flow word indices"
            );
            prev = b;
        }
        Classifier {
            segments,
            n_rules: CachePadded::new(AtomicUsize::new(0)),
            subtables: PVector::new(),
            partitions: PartitionMap::new(),
            tries: Atomic::new(Vec::new()),
            writer: Mutex::new(WriterState {
                subtables_map: HashMap::new(),
                partition_counts: HashMap::new(),
            }),
        }
    }

    pub fn count(&self) -> usize {
        self.n_rules.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Number of distinct mask shapes currently installed.
    pub fn subtable_count(&self) -> usize {
        self.writer.lock().unwrap().subtables_map.len()
    }

    fn tries_snapshot<'g>(&self, guard: &'g Guard) -> &'g [Trie] {
        unsafe { self.tries.load(Ordering::Acquire, guard).deref() }
    }

    /// Bind the prefix tries to `fields`. Only valid while the
    /// classifier is empty; returns whether the configuration changed.
    pub fn set_prefix_fields(
        &self,
        fields: &[FieldId],
    ) -> Result<bool, ClassifierError> {
        let _w = self.writer.lock().unwrap();
        if !self.is_empty() || fields.len() > CLS_MAX_TRIES {
            return Err(ClassifierError::ConfigInvalid);
        }
        if fields.iter().any(|f| !f.def().prefix_capable()) {
            return Err(ClassifierError::ConfigInvalid);
        }

        let guard = &epoch::pin();
        let current = self.tries_snapshot(guard);
        if current.len() == fields.len()
            && current
                .iter()
                .zip(fields.iter())
                .all(|(t, f)| t.field() == *f)
        {
            return Ok(false);
        }

        debug!("prefix fields reconfigured: {:?}", fields);
        let new: Vec<Trie> =
            fields.iter().map(|f| Trie::new(*f)).collect();
        let old = self.tries.load(Ordering::Acquire, guard);
        self.tries.store(Owned::new(new), Ordering::Release);
        unsafe {
            guard.defer_destroy(old);
        }
        Ok(true)
    }

    /// Install a rule that is certain not to displace another. Use
    /// [`Classifier::replace`] when an identical (match, priority) rule
    /// may already be installed.
    pub fn insert(
        &self,
        rule: &Arc<Rule>,
    ) -> Result<(), ClassifierError> {
        if rule.is_installed() {
            return Err(ClassifierError::AlreadyInstalled);
        }
        let displaced = self.replace(rule)?;
        assert!(
            displaced.is_none(),
            "insert displaced an identical rule; use replace"
        );
        Ok(())
    }

    /// Install a rule. If a rule with equal match and priority is
    /// already installed, it is evicted, marked uninstalled and
    /// returned. Replacing a rule with itself is allowed and returns
    /// the rule, still installed.
    pub fn replace(
        &self,
        rule: &Arc<Rule>,
    ) -> Result<Option<Arc<Rule>>, ClassifierError> {
        let mut w = self.writer.lock().unwrap();
        let guard = &epoch::pin();

        let mask = *rule.match_spec().mask();
        if rule.is_installed() {
            // Only a self-replacement within this classifier is legal
            // for an installed rule.
            let here = w
                .subtables_map
                .get(&mask)
                .map_or(false, |st| st.contains(rule, guard));
            if !here {
                return Err(ClassifierError::AlreadyInstalled);
            }
        }
        let subtable = match w.subtables_map.get(&mask) {
            Some(st) => st.clone(),
            None => self.create_subtable(&mut w, mask, guard),
        };

        trace!("insert {}", rule);
        let old_max = subtable.max_priority();
        let outcome = subtable.insert(rule.clone(), guard);
        rule.set_installed(true);

        if let SubtableInsert::Replaced(evicted) = outcome {
            // Same match, same priority: every auxiliary structure is
            // keyed by things the two rules share, so nothing else
            // moves.
            return Ok(Some(evicted));
        }

        self.n_rules.fetch_add(1, Ordering::Relaxed);
        if subtable.max_priority() != old_max {
            self.subtables.reprioritize(
                subtable.max_priority(),
                guard,
                |st| Arc::ptr_eq(st, &subtable),
            );
        }

        for (i, trie) in self.tries_snapshot(guard).iter().enumerate() {
            let plen = subtable.trie_plen(i);
            if plen > 0 {
                let value = rule
                    .match_spec()
                    .value()
                    .extract_be64(trie.field().def());
                trie.insert(value, plen, guard);
            }
        }

        if mask.metadata_mask() == !0u64 {
            let metadata = rule.match_spec().value().metadata();
            self.partition_add(&mut w, metadata, &subtable, guard);
        }

        Ok(None)
    }

    /// Uninstall a rule, by identity, and hand back the classifier's
    /// reference to it.
    pub fn remove(
        &self,
        rule: &Rule,
    ) -> Result<Arc<Rule>, ClassifierError> {
        if !rule.is_installed() {
            return Err(ClassifierError::NotInstalled);
        }
        let mut w = self.writer.lock().unwrap();
        let guard = &epoch::pin();

        let mask = rule.match_spec().mask();
        let subtable = w
            .subtables_map
            .get(mask)
            .ok_or(ClassifierError::NotInstalled)?
            .clone();

        let old_max = subtable.max_priority();
        let removed = subtable
            .remove(rule, guard)
            .ok_or(ClassifierError::NotInstalled)?;
        rule.set_installed(false);
        trace!("remove {}", rule);
        self.n_rules.fetch_sub(1, Ordering::Relaxed);

        for (i, trie) in self.tries_snapshot(guard).iter().enumerate() {
            let plen = subtable.trie_plen(i);
            if plen > 0 {
                let value =
                    rule.match_spec().value().extract_be64(trie.field().def());
                trie.remove(value, plen, guard);
            }
        }

        if mask.metadata_mask() == !0u64 {
            let metadata = rule.match_spec().value().metadata();
            self.partition_del(&mut w, metadata, &subtable, guard);
        }

        if subtable.is_empty() {
            debug!("subtable destroyed ({})", subtable.mask());
            w.subtables_map.remove(mask);
            self.subtables
                .remove(guard, |st| Arc::ptr_eq(st, &subtable));
        } else if subtable.max_priority() != old_max {
            self.subtables.reprioritize(
                subtable.max_priority(),
                guard,
                |st| Arc::ptr_eq(st, &subtable),
            );
        }

        Ok(removed)
    }

    fn create_subtable(
        &self,
        w: &mut WriterState,
        mask: FlowMask,
        guard: &Guard,
    ) -> Arc<Subtable> {
        let mut trie_plen = [0u8; CLS_MAX_TRIES];
        for (i, trie) in self.tries_snapshot(guard).iter().enumerate() {
            trie_plen[i] =
                mask.prefix_len(trie.field().def()).unwrap_or(0);
        }

        let mut subtable = Subtable::new(mask, &self.segments, trie_plen);
        if mask.metadata_mask() == !0u64 {
            subtable.set_tag(tag_create_deterministic(hash_words(
                mask.words(),
                0,
            )));
        }
        debug!("subtable created ({})", subtable.mask());

        let subtable = Arc::new(subtable);
        w.subtables_map.insert(mask, subtable.clone());
        // An empty subtable sorts last; the first insert repositions it.
        self.subtables.insert(-1, subtable.clone(), guard);
        subtable
    }

    fn partition_add(
        &self,
        w: &mut WriterState,
        metadata: u64,
        subtable: &Arc<Subtable>,
        guard: &Guard,
    ) {
        let per = w.partition_counts.entry(metadata).or_default();
        let entry = per
            .entry(Arc::as_ptr(subtable) as usize)
            .or_insert(PartitionRef {
                tag: subtable.tag(),
                n_rules: 0,
            });
        entry.n_rules += 1;
        let tags =
            per.values().fold(0u64, |acc, r| acc | r.tag);
        self.partitions.set_tags(metadata, tags, guard);
    }

    fn partition_del(
        &self,
        w: &mut WriterState,
        metadata: u64,
        subtable: &Arc<Subtable>,
        guard: &Guard,
    ) {
        let Some(per) = w.partition_counts.get_mut(&metadata) else {
            return;
        };
        let key = Arc::as_ptr(subtable) as usize;
        if let Some(entry) = per.get_mut(&key) {
            entry.n_rules -= 1;
            if entry.n_rules == 0 {
                per.remove(&key);
            }
        }
        let tags = per.values().fold(0u64, |acc, r| acc | r.tag);
        let now_empty = per.is_empty();
        self.partitions.set_tags(metadata, tags, guard);
        if now_empty {
            w.partition_counts.remove(&metadata);
        }
    }

    /// Find the highest-priority rule matching `flow`, recording every
    /// header bit the search examined in `wc`.
    pub fn lookup<'g>(
        &'g self,
        flow: &Flow,
        wc: &mut FlowWildcards,
        guard: &'g Guard,
    ) -> Option<&'g Rule> {
        self.lookup_inner(flow, Some(wc), guard)
            .map(|m| m.rule().as_ref())
    }

    fn lookup_inner<'g>(
        &'g self,
        flow: &Flow,
        mut wc: Option<&mut FlowWildcards>,
        guard: &'g Guard,
    ) -> Option<&'g ClsMatch> {
        let tags = if self.partitions.is_empty() {
            TAG_ARBITRARY
        } else {
            // The partition consult examined the metadata field, and a
            // skipped subtable pins all of it, so the result is only
            // reproducible for flows with this exact metadata.
            if let Some(wc) = wc.as_deref_mut() {
                wc.mask.open_field(FieldId::Metadata);
            }
            self.partitions
                .lookup_tags(flow.metadata(), guard)
                .unwrap_or(TAG_ARBITRARY)
        };

        let tries = self.tries_snapshot(guard);
        let mut trie_ctx: [TrieCtx<'_>; CLS_MAX_TRIES] =
            std::array::from_fn(|_| TrieCtx::unused());
        for (i, trie) in tries.iter().enumerate() {
            trie_ctx[i] = TrieCtx::new(trie);
        }

        let mut best: Option<&'g ClsMatch> = None;
        for entry in self.subtables.snapshot(guard) {
            if let Some(b) = best {
                if entry.priority <= i64::from(b.priority()) {
                    // Nothing further can beat the current best.
                    break;
                }
            }
            let subtable = &entry.value;
            if subtable.tag() & tags == 0 {
                continue;
            }
            let Some(found) = subtable.lookup(
                flow,
                wc.as_deref_mut(),
                &mut trie_ctx,
                guard,
            ) else {
                continue;
            };
            match best {
                Some(b) => {
                    debug_assert!(
                        found.priority() != b.priority(),
                        "equal-priority rules matched via two shapes"
                    );
                    if found.priority() > b.priority() {
                        best = Some(found);
                    }
                }
                None => best = Some(found),
            }
        }
        best
    }

    /// Look up `flows.len()` flows (at most `CLASSIFIER_MAX_BATCH`),
    /// storing the results in `results`. No wildcard tracking: each
    /// subtable is probed with its full key. Returns whether anything
    /// matched.
    pub fn lookup_batch(
        &self,
        flows: &[Flow],
        results: &mut [Option<Arc<Rule>>],
        guard: &Guard,
    ) -> bool {
        assert!(flows.len() <= CLASSIFIER_MAX_BATCH);
        assert!(results.len() >= flows.len());
        let mut any = false;
        for (flow, slot) in flows.iter().zip(results.iter_mut()) {
            *slot = self
                .lookup_inner(flow, None, guard)
                .map(|m| m.rule().clone());
            any |= slot.is_some();
        }
        any
    }

    /// The installed rule with a match and priority both equal to
    /// `rule`'s, if any.
    pub fn find_rule_exactly(&self, rule: &Rule) -> Option<Arc<Rule>> {
        self.find_match_exactly(rule.match_spec(), rule.priority())
    }

    /// The installed rule with this exact match and priority, if any.
    pub fn find_match_exactly(
        &self,
        target: &Match,
        priority: u32,
    ) -> Option<Arc<Rule>> {
        let w = self.writer.lock().unwrap();
        let guard = &epoch::pin();
        let subtable = w.subtables_map.get(target.mask())?;
        subtable.find_exact(target.value(), priority, guard)
    }

    /// Whether an installed rule of equal priority admits a flow that
    /// `rule` also admits: the masks' shared bits agree on both values.
    pub fn rule_overlaps(&self, rule: &Rule) -> bool {
        let w = self.writer.lock().unwrap();
        let guard = &epoch::pin();
        for subtable in w.subtables_map.values() {
            for chain in subtable.rule_chains(guard) {
                for m in chain_iter(chain, guard) {
                    if m.priority() < rule.priority() {
                        // Chains descend; nothing below can tie.
                        break;
                    }
                    if m.priority() > rule.priority()
                        || std::ptr::eq(m.rule().as_ref(), rule)
                    {
                        continue;
                    }
                    if rule.match_spec().overlaps(m.rule().match_spec())
                    {
                        return true;
                    }
                }
            }
        }
        false
    }
}

impl Drop for Classifier {
    fn drop(&mut self) {
        let guard = unsafe { epoch::unprotected() };
        let tries = self.tries.load(Ordering::Acquire, guard);
        if !tries.is_null() {
            drop(unsafe { tries.into_owned() });
        }
    }
}
