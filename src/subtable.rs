//------------ Subtable ------------------------------------------------------
//
// All rules whose masks are bitwise equal live in one subtable, where a
// masked-value hash probe replaces a linear scan. The probe is staged:
// the mask is cut at the classifier's segment boundaries and each
// prefix of the cut gets its own supplementary hash index. A lookup
// hashes the flow stage by stage, and the first stage whose partial
// hash is absent from its index proves no rule here can match, without
// the later stages' bits ever being examined. Prefix-trie checks are
// interleaved at the stage where the trie's field becomes relevant.
//
// Rules that share their entire match (so: same subtable, same masked
// value) differ only in priority and hang off one hash entry as a
// descending-priority chain; only the chain head takes part in the
// indices and in the subtable's maximum priority.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{Atomic, Guard, Owned};
use log::trace;

use crate::cmap::Cmap;
use crate::partition::TAG_ALL;
use crate::rule::{ClsMatch, Rule};
use crate::trie::TrieCtx;
use crate::types::flow::{
    Flow, FlowMask, FlowWildcards, StagedHasher, FLOW_U64S,
};
use crate::{CLS_MAX_INDICES, CLS_MAX_TRIES};

//------------ RuleChain -----------------------------------------------------

/// One hash-map entry: the descending-priority chain of rules with an
/// identical match. The clone made when the map grows is shallow; chain
/// nodes are owned by the subtable's insert/remove logic.
#[derive(Clone)]
pub(crate) struct RuleChain {
    pub(crate) head: Atomic<ClsMatch>,
}

pub(crate) struct ChainIter<'g> {
    cur: Option<&'g ClsMatch>,
    guard: &'g Guard,
}

impl<'g> Iterator for ChainIter<'g> {
    type Item = &'g ClsMatch;

    fn next(&mut self) -> Option<&'g ClsMatch> {
        let node = self.cur?;
        self.cur = unsafe {
            node.next.load(Ordering::Acquire, self.guard).as_ref()
        };
        Some(node)
    }
}

pub(crate) fn chain_iter<'g>(
    chain: &'g RuleChain,
    guard: &'g Guard,
) -> ChainIter<'g> {
    ChainIter {
        cur: unsafe {
            chain.head.load(Ordering::Acquire, guard).as_ref()
        },
        guard,
    }
}

//------------ Index entries -------------------------------------------------

/// Occupancy counter for one partial-key hash value. Membership is by
/// hash alone: a false positive merely fails to cut a lookup short.
struct IndexEntry {
    count: AtomicUsize,
}

impl Clone for IndexEntry {
    fn clone(&self) -> Self {
        IndexEntry {
            count: AtomicUsize::new(self.count.load(Ordering::Relaxed)),
        }
    }
}

//------------ Subtable ------------------------------------------------------

pub(crate) struct Subtable {
    mask: FlowMask,
    /// Metadata-partition tag; `TAG_ALL` unless the mask pins the whole
    /// metadata field.
    tag: u64,
    /// Word boundaries of the staged indices, ascending. Only the first
    /// `n_indices` are in use; an index exists only for a segment that
    /// actually adds mask bits.
    index_ends: [u8; CLS_MAX_INDICES],
    n_indices: usize,
    indices: [Cmap<IndexEntry>; CLS_MAX_INDICES],
    /// Prefix length the mask pins for each configured trie's field;
    /// zero when the trie does not apply to this shape.
    trie_plen: [u8; CLS_MAX_TRIES],
    rules: Cmap<RuleChain>,
    /// All rules, chain tails included.
    n_rules: AtomicUsize,
    /// Priority of the highest-priority chain head, and how many heads
    /// share it. Writer-maintained; readers use the priority vector.
    max_priority: AtomicI64,
    max_count: AtomicUsize,
}

pub(crate) enum SubtableInsert {
    /// The rule went in; the subtable's max priority may have changed.
    Inserted,
    /// An identical (match, priority) rule was evicted and returned.
    Replaced(Arc<Rule>),
}

impl Subtable {
    pub(crate) fn new(
        mask: FlowMask,
        segments: &[u8; CLS_MAX_INDICES],
        trie_plen: [u8; CLS_MAX_TRIES],
    ) -> Subtable {
        // Plan the staged indices: one per segment boundary that adds
        // mask bits, and no trailing index that already covers the
        // whole mask (the full-key map serves that stage).
        let mut index_ends = [0u8; CLS_MAX_INDICES];
        let mut n_indices = 0;
        let mut covered = 0usize;
        for &boundary in segments {
            let end = boundary as usize;
            if mask.any_in_range(covered..end) {
                index_ends[n_indices] = boundary;
                n_indices += 1;
                covered = end;
            }
        }
        if n_indices > 0 && !mask.any_in_range(covered..FLOW_U64S) {
            n_indices -= 1;
        }

        Subtable {
            mask,
            // The classifier assigns the real tag right after
            // construction; until then the subtable is unconditionally
            // visited.
            tag: TAG_ALL,
            index_ends,
            n_indices,
            indices: [Cmap::new(), Cmap::new(), Cmap::new()],
            trie_plen,
            rules: Cmap::new(),
            n_rules: AtomicUsize::new(0),
            max_priority: AtomicI64::new(-1),
            max_count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_tag(&mut self, tag: u64) {
        self.tag = tag;
    }

    pub(crate) fn mask(&self) -> &FlowMask {
        &self.mask
    }

    pub(crate) fn tag(&self) -> u64 {
        self.tag
    }

    pub(crate) fn trie_plen(&self, i: usize) -> u8 {
        self.trie_plen[i]
    }

    pub(crate) fn n_rules(&self) -> usize {
        self.n_rules.load(Ordering::Relaxed)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.n_rules() == 0
    }

    pub(crate) fn max_priority(&self) -> i64 {
        self.max_priority.load(Ordering::Relaxed)
    }

    pub(crate) fn rule_chains<'g>(
        &self,
        guard: &'g Guard,
    ) -> impl Iterator<Item = &'g RuleChain> {
        self.rules.iter(guard)
    }

    pub(crate) fn rules_map(&self) -> &Cmap<RuleChain> {
        &self.rules
    }

    /// The per-index digests and the full-key digest for a value that
    /// is already canonical under this subtable's mask.
    fn stage_hashes(&self, value: &Flow) -> ([u64; CLS_MAX_INDICES], u64) {
        let mut hashes = [0u64; CLS_MAX_INDICES];
        let mut hasher = StagedHasher::new(0);
        let mut start = 0usize;
        for i in 0..self.n_indices {
            let end = self.index_ends[i] as usize;
            hasher.fold_range(value, &self.mask, start..end);
            hashes[i] = hasher.digest();
            start = end;
        }
        hasher.fold_range(value, &self.mask, start..FLOW_U64S);
        (hashes, hasher.digest())
    }

    fn index_add(&self, i: usize, hash: u64, guard: &Guard) {
        match self.indices[i].find(hash, guard, |_| true) {
            Some(e) => {
                e.count.fetch_add(1, Ordering::Relaxed);
            }
            None => self.indices[i].insert(
                hash,
                IndexEntry {
                    count: AtomicUsize::new(1),
                },
                guard,
            ),
        }
    }

    fn index_del(&self, i: usize, hash: u64, guard: &Guard) {
        if let Some(e) = self.indices[i].find(hash, guard, |_| true) {
            if e.count.fetch_sub(1, Ordering::Relaxed) == 1 {
                self.indices[i].remove(hash, guard, |_| true);
            }
        }
    }

    fn max_add(&self, priority: u32) {
        let p = i64::from(priority);
        let max = self.max_priority.load(Ordering::Relaxed);
        if p > max {
            self.max_priority.store(p, Ordering::Relaxed);
            self.max_count.store(1, Ordering::Relaxed);
        } else if p == max {
            self.max_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn max_del(&self, priority: u32, guard: &Guard) {
        let p = i64::from(priority);
        if p != self.max_priority.load(Ordering::Relaxed) {
            return;
        }
        if self.max_count.fetch_sub(1, Ordering::Relaxed) > 1 {
            return;
        }
        // Last head at the old maximum is gone; rescan the heads.
        let mut max = -1i64;
        let mut count = 0usize;
        for chain in self.rules.iter(guard) {
            if let Some(head) = unsafe {
                chain.head.load(Ordering::Acquire, guard).as_ref()
            } {
                let hp = i64::from(head.priority());
                if hp > max {
                    max = hp;
                    count = 1;
                } else if hp == max {
                    count += 1;
                }
            }
        }
        self.max_priority.store(max, Ordering::Relaxed);
        self.max_count.store(count, Ordering::Relaxed);
    }

    /// Writer only. Install `rule`, splicing it into the chain of any
    /// rules with an identical match. An installed rule with equal
    /// match and priority is evicted and handed back.
    pub(crate) fn insert(
        &self,
        rule: Arc<Rule>,
        guard: &Guard,
    ) -> SubtableInsert {
        let value = *rule.match_spec().value();
        let (hashes, hash) = self.stage_hashes(&value);

        let chain = self.rules.find(hash, guard, |chain| {
            chain_head_value_eq(chain, &value, guard)
        });

        let Some(chain) = chain else {
            // First rule of this match: new chain, new index entries.
            let head = Owned::new(ClsMatch::new(rule.clone()));
            self.rules.insert(
                hash,
                RuleChain {
                    head: Atomic::from(head),
                },
                guard,
            );
            for i in 0..self.n_indices {
                self.index_add(i, hashes[i], guard);
            }
            self.n_rules.fetch_add(1, Ordering::Relaxed);
            self.max_add(rule.priority());
            return SubtableInsert::Inserted;
        };

        // Walk the chain to the splice point.
        let mut link = &chain.head;
        let mut at_head = true;
        loop {
            let cur = link.load(Ordering::Acquire, guard);
            let node = unsafe { cur.as_ref() };
            match node {
                Some(node) if rule.priority() == node.priority() => {
                    // Same match, same priority: replace in place.
                    let evicted = node.rule().clone();
                    let new = Owned::new(ClsMatch::new(rule));
                    new.next.store(
                        node.next.load(Ordering::Acquire, guard),
                        Ordering::Relaxed,
                    );
                    link.store(new, Ordering::Release);
                    unsafe {
                        guard.defer_destroy(cur);
                    }
                    evicted.set_installed(false);
                    return SubtableInsert::Replaced(evicted);
                }
                Some(node) if rule.priority() < node.priority() => {
                    link = &node.next;
                    at_head = false;
                }
                _ => {
                    // Splice before `node` (or append on None). At the
                    // head this rotates the old head into the chain.
                    let new = Owned::new(ClsMatch::new(rule.clone()));
                    new.next.store(cur, Ordering::Relaxed);
                    link.store(new, Ordering::Release);
                    if at_head {
                        self.max_add(rule.priority());
                        if let Some(old_head) = node {
                            self.max_del(old_head.priority(), guard);
                        }
                    }
                    self.n_rules.fetch_add(1, Ordering::Relaxed);
                    return SubtableInsert::Inserted;
                }
            }
        }
    }

    /// Writer only. Uninstall the exact rule object, by identity.
    /// Returns the classifier's reference, or `None` if the rule is not
    /// in this subtable.
    pub(crate) fn remove(
        &self,
        rule: &Rule,
        guard: &Guard,
    ) -> Option<Arc<Rule>> {
        let value = *rule.match_spec().value();
        let (hashes, hash) = self.stage_hashes(&value);

        let chain = self.rules.find(hash, guard, |chain| {
            chain_head_value_eq(chain, &value, guard)
        })?;

        let mut link = &chain.head;
        let mut at_head = true;
        loop {
            let cur = link.load(Ordering::Acquire, guard);
            let node = unsafe { cur.as_ref() }?;
            if !std::ptr::eq(node.rule().as_ref(), rule) {
                link = &node.next;
                at_head = false;
                continue;
            }

            let removed = node.rule().clone();
            let next = node.next.load(Ordering::Acquire, guard);
            if at_head && next.is_null() {
                // Chain is emptying: drop the hash entry and the index
                // entries along with it.
                self.rules.remove(hash, guard, |c| {
                    std::ptr::eq(c as *const RuleChain, chain)
                });
                for i in 0..self.n_indices {
                    self.index_del(i, hashes[i], guard);
                }
            } else {
                link.store(next, Ordering::Release);
            }
            unsafe {
                guard.defer_destroy(cur);
            }
            if at_head {
                // Promote first: the old head's priority is strictly
                // higher, so max_add is a no-op unless a rescan in
                // max_del needs the promoted head to be visible.
                if let Some(promoted) = unsafe { next.as_ref() } {
                    self.max_add(promoted.priority());
                }
                self.max_del(node.priority(), guard);
            }
            self.n_rules.fetch_sub(1, Ordering::Relaxed);
            return Some(removed);
        }
    }

    /// Reader path. Staged probe with trie interleaving; every word of
    /// the mask the probe examined is folded into `wc`.
    pub(crate) fn lookup<'g>(
        &self,
        flow: &Flow,
        mut wc: Option<&mut FlowWildcards>,
        trie_ctx: &mut [TrieCtx<'_>],
        guard: &'g Guard,
    ) -> Option<&'g ClsMatch> {
        let Some(wc) = wc.as_deref_mut() else {
            // No wildcard tracking wanted: a single full-key probe is
            // both correct and cheapest.
            let mut hasher = StagedHasher::new(0);
            hasher.fold_range(flow, &self.mask, 0..FLOW_U64S);
            return self.find_match(flow, hasher.digest(), guard);
        };

        let mut hasher = StagedHasher::new(0);
        let mut start = 0usize;
        for i in 0..self.n_indices {
            let end = self.index_ends[i] as usize;
            if self.check_tries(flow, trie_ctx, start..end, wc, guard) {
                // A trie ruled this subtable out; only the stages
                // already hashed and the trie's own bits were examined.
                wc.fold_mask_range(&self.mask, start);
                return None;
            }
            hasher.fold_range(flow, &self.mask, start..end);
            start = end;
            if self.indices[i]
                .find(hasher.digest(), guard, |_| true)
                .is_none()
            {
                // No rule here continues past this stage.
                wc.fold_mask_range(&self.mask, start);
                return None;
            }
        }
        if self.check_tries(
            flow,
            trie_ctx,
            start..FLOW_U64S,
            wc,
            guard,
        ) {
            wc.fold_mask_range(&self.mask, start);
            return None;
        }

        hasher.fold_range(flow, &self.mask, start..FLOW_U64S);
        let found = self.find_match(flow, hasher.digest(), guard);
        // The full-key probe examined the entire mask either way.
        wc.fold_mask_range(&self.mask, FLOW_U64S);
        found
    }

    /// Whether this exact rule object is installed here.
    pub(crate) fn contains(&self, rule: &Rule, guard: &Guard) -> bool {
        let value = rule.match_spec().value();
        let (_, hash) = self.stage_hashes(value);
        self.rules
            .find(hash, guard, |chain| {
                chain_head_value_eq(chain, value, guard)
            })
            .map_or(false, |chain| {
                chain_iter(chain, guard)
                    .any(|m| std::ptr::eq(m.rule().as_ref(), rule))
            })
    }

    /// The installed rule with this exact canonical value and priority,
    /// if any. Writer role: used by the exact-find queries.
    pub(crate) fn find_exact(
        &self,
        value: &Flow,
        priority: u32,
        guard: &Guard,
    ) -> Option<Arc<Rule>> {
        let (_, hash) = self.stage_hashes(value);
        let chain = self.rules.find(hash, guard, |chain| {
            chain_head_value_eq(chain, value, guard)
        })?;
        chain_iter(chain, guard)
            .find(|m| m.priority() == priority)
            .map(|m| m.rule().clone())
    }

    fn find_match<'g>(
        &self,
        flow: &Flow,
        hash: u64,
        guard: &'g Guard,
    ) -> Option<&'g ClsMatch> {
        let chain = self.rules.find(hash, guard, |chain| {
            match unsafe {
                chain.head.load(Ordering::Acquire, guard).as_ref()
            } {
                Some(head) => flow.equal_in_mask(
                    head.rule().match_spec().value(),
                    &self.mask,
                ),
                None => false,
            }
        })?;
        unsafe { chain.head.load(Ordering::Acquire, guard).as_ref() }
    }

    /// Whether one of the tries relevant for the word range proves this
    /// subtable cannot match `flow`. The trie walk's examined bits go
    /// into `wc` the first time each trie is consulted.
    fn check_tries(
        &self,
        flow: &Flow,
        trie_ctx: &mut [TrieCtx<'_>],
        range: std::ops::Range<usize>,
        wc: &mut FlowWildcards,
        guard: &Guard,
    ) -> bool {
        for (i, ctx) in trie_ctx.iter_mut().enumerate() {
            let plen = self.trie_plen[i];
            if plen == 0 {
                continue;
            }
            let Some(trie) = ctx.trie() else { continue };
            let word = trie.field_word();
            if word < range.start || word >= range.end {
                continue;
            }
            let res = ctx.lookup(flow, wc, guard);
            if plen > res.match_plen {
                trace!(
                    "subtable skipped: trie {} match /{} < required /{}",
                    trie.field(),
                    res.match_plen,
                    plen
                );
                return true;
            }
        }
        false
    }
}

impl Drop for Subtable {
    fn drop(&mut self) {
        // Chain nodes are owned here; the cmap only frees its own
        // entries. Normally the classifier empties a subtable before
        // dropping it, but a classifier dropped wholesale still has
        // full chains.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        for chain in self.rules.iter(guard) {
            let mut cur = chain.head.load(Ordering::Acquire, guard);
            while let Some(node) = unsafe { cur.as_ref() } {
                let next = node.next.load(Ordering::Acquire, guard);
                node.rule().set_installed(false);
                drop(unsafe { cur.into_owned() });
                cur = next;
            }
        }
    }
}

fn chain_head_value_eq(
    chain: &RuleChain,
    value: &Flow,
    guard: &Guard,
) -> bool {
    match unsafe { chain.head.load(Ordering::Acquire, guard).as_ref() } {
        Some(head) => head.rule().match_spec().value() == value,
        None => false,
    }
}
