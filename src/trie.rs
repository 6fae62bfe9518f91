//------------ Prefix trie ---------------------------------------------------
//
// A binary radix tree over the big-endian bit string of one flow field,
// tracking how many installed rules pin each distinct prefix of that
// field. A lookup walks the flow's field value through the tree and
// reports the longest prefix length at which rules exist, together with
// how many bits it had to examine to establish that. The classifier uses
// the first number to skip subtables demanding longer prefixes than the
// flow can satisfy, and the second to un-wildcard no more of the field
// than the walk actually read.
//
// Edges are path-compressed: a node carries up to 64 bits of shared
// prefix, left-aligned in a u64, and two child slots indexed by the bit
// following that prefix (the child's own prefix repeats that bit as its
// first bit). Readers hold no lock, so every mutation clones the
// root-to-target path, publishes the new root with a release store and
// retires the displaced nodes through the epoch collector. Counts live
// in the nodes, which is why count changes path-copy too: a published
// node is never written again.

use std::sync::atomic::Ordering;

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use log::trace;

use crate::types::field::FieldId;
use crate::types::flow::{Flow, FlowWildcards};

/// `len` top bits set.
fn top_mask(len: u8) -> u64 {
    if len == 0 {
        0
    } else {
        !0u64 << (64 - len)
    }
}

/// Bit `ofs` (0 = MSB) of a left-aligned bit string.
fn bit_at(value: u64, ofs: u8) -> usize {
    debug_assert!(ofs < 64);
    ((value >> (63 - ofs)) & 1) as usize
}

/// The bits `[ofs, ofs + len)` of `value`, left-aligned.
fn bits_from(value: u64, ofs: u8, len: u8) -> u64 {
    debug_assert!(ofs < 64);
    (value << ofs) & top_mask(len)
}

/// Number of leading bits (up to `n_bits`) on which the node prefix and
/// `value` at offset `ofs` agree.
fn prefix_equal_bits(prefix: u64, n_bits: u8, value: u64, ofs: u8) -> u8 {
    let diff = prefix ^ bits_from(value, ofs, 64);
    (diff.leading_zeros() as u8).min(n_bits)
}

struct TrieNode {
    /// Shared prefix bits of this edge, left-aligned.
    prefix: u64,
    /// Number of valid bits in `prefix`. Zero only at the root.
    n_bits: u8,
    /// Installed rules pinning exactly the prefix that ends here.
    n_rules: u32,
    edges: [Atomic<TrieNode>; 2],
}

impl TrieNode {
    fn is_leaf(&self, guard: &Guard) -> bool {
        self.edges[0].load(Ordering::Acquire, guard).is_null()
            && self.edges[1].load(Ordering::Acquire, guard).is_null()
    }
}

fn edge_from<'g>(child: Shared<'g, TrieNode>) -> Atomic<TrieNode> {
    let a = Atomic::null();
    a.store(child, Ordering::Relaxed);
    a
}

fn clone_edges<'g>(
    node: &TrieNode,
    guard: &'g Guard,
) -> [Atomic<TrieNode>; 2] {
    [
        edge_from(node.edges[0].load(Ordering::Acquire, guard)),
        edge_from(node.edges[1].load(Ordering::Acquire, guard)),
    ]
}

/// What a trie walk learned about a flow's field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TrieLookup {
    /// Longest prefix length at which rules exist for this value.
    pub(crate) match_plen: u8,
    /// Number of leading bits of the field the walk examined.
    pub(crate) wc_plen: u8,
}

pub(crate) struct Trie {
    field: FieldId,
    width: u8,
    root: Atomic<TrieNode>,
}

impl Trie {
    pub(crate) fn new(field: FieldId) -> Trie {
        Trie {
            field,
            width: field.def().n_bits,
            root: Atomic::null(),
        }
    }

    pub(crate) fn field(&self) -> FieldId {
        self.field
    }

    /// The flow word the trie's field lives in, for interleaving the
    /// trie check with the right lookup stage.
    pub(crate) fn field_word(&self) -> usize {
        self.field.def().word()
    }

    pub(crate) fn lookup(&self, value: u64, guard: &Guard) -> TrieLookup {
        let mut ofs: u8 = 0;
        let mut match_plen: u8 = 0;
        let mut last: Option<&TrieNode> = None;
        let mut cur = self.root.load(Ordering::Acquire, guard);

        while let Some(node) = unsafe { cur.as_ref() } {
            let eq = prefix_equal_bits(node.prefix, node.n_bits, value, ofs);
            ofs += eq;
            if eq < node.n_bits {
                // Diverged inside the edge; the first mismatching bit
                // was examined too.
                return TrieLookup {
                    match_plen,
                    wc_plen: ofs + 1,
                };
            }
            if node.n_rules > 0 {
                match_plen = ofs;
            }
            last = Some(node);
            if ofs >= self.width {
                // Address exhausted.
                return TrieLookup {
                    match_plen,
                    wc_plen: ofs,
                };
            }
            cur = node.edges[bit_at(value, ofs)]
                .load(Ordering::Acquire, guard);
        }

        // Dead end. If the last node was an interior node we examined
        // its branch bit to conclude there is nothing further.
        match last {
            Some(node) if !node.is_leaf(guard) => TrieLookup {
                match_plen,
                wc_plen: ofs + 1,
            },
            _ => TrieLookup {
                match_plen,
                wc_plen: ofs,
            },
        }
    }

    /// Writer only. Count one more rule pinning the first `plen` bits of
    /// `value`.
    pub(crate) fn insert(&self, value: u64, plen: u8, guard: &Guard) {
        debug_assert!(plen > 0 && plen <= self.width);
        trace!("trie {} insert /{}", self.field, plen);
        let old = self.root.load(Ordering::Acquire, guard);
        let new = insert_rec(old, value, plen, 0, guard);
        self.root.store(new, Ordering::Release);
    }

    /// Writer only. Forget one rule previously inserted with the same
    /// `(value, plen)`.
    pub(crate) fn remove(&self, value: u64, plen: u8, guard: &Guard) {
        debug_assert!(plen > 0 && plen <= self.width);
        trace!("trie {} remove /{}", self.field, plen);
        let old = self.root.load(Ordering::Acquire, guard);
        let new = remove_rec(old, value, plen, 0, guard);
        self.root.store(new, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self, guard: &Guard) -> bool {
        self.root.load(Ordering::Acquire, guard).is_null()
    }
}

impl Drop for Trie {
    fn drop(&mut self) {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        fn free(slot: &Atomic<TrieNode>, guard: &Guard) {
            let cur = slot.load(Ordering::Acquire, guard);
            if let Some(node) = unsafe { cur.as_ref() } {
                free(&node.edges[0], guard);
                free(&node.edges[1], guard);
                drop(unsafe { cur.into_owned() });
            }
        }
        free(&self.root, guard);
    }
}

fn insert_rec<'g>(
    slot: Shared<'g, TrieNode>,
    value: u64,
    plen: u8,
    ofs: u8,
    guard: &'g Guard,
) -> Shared<'g, TrieNode> {
    let Some(node) = (unsafe { slot.as_ref() }) else {
        // Fresh branch carrying the rest of the prefix.
        return Owned::new(TrieNode {
            prefix: bits_from(value, ofs, plen - ofs),
            n_bits: plen - ofs,
            n_rules: 1,
            edges: [Atomic::null(), Atomic::null()],
        })
        .into_shared(guard);
    };

    // Cap the comparison at the insertion length: an insert may also
    // terminate inside this edge.
    let eq = prefix_equal_bits(node.prefix, node.n_bits, value, ofs)
        .min(plen - ofs);
    let end = ofs + eq;

    let new = if eq == node.n_bits {
        if end == plen {
            // The prefix ends exactly at this node.
            TrieNode {
                prefix: node.prefix,
                n_bits: node.n_bits,
                n_rules: node.n_rules + 1,
                edges: clone_edges(node, guard),
            }
        } else {
            // Follow the branch bit down.
            let bit = bit_at(value, end);
            let child =
                node.edges[bit].load(Ordering::Acquire, guard);
            let new_child = insert_rec(child, value, plen, end, guard);
            let mut edges = clone_edges(node, guard);
            edges[bit] = edge_from(new_child);
            TrieNode {
                prefix: node.prefix,
                n_bits: node.n_bits,
                n_rules: node.n_rules,
                edges,
            }
        }
    } else {
        // Split the edge at the divergence point. The lower part keeps
        // the node's rules and children.
        let rest = Owned::new(TrieNode {
            prefix: node.prefix << eq,
            n_bits: node.n_bits - eq,
            n_rules: node.n_rules,
            edges: clone_edges(node, guard),
        })
        .into_shared(guard);
        let rest_bit = bit_at(node.prefix, eq);

        let mut edges = [Atomic::null(), Atomic::null()];
        edges[rest_bit] = edge_from(rest);
        let n_rules = if end == plen {
            // The inserted prefix ends at the split point.
            1
        } else {
            let branch_bit = bit_at(value, end);
            debug_assert_ne!(branch_bit, rest_bit);
            edges[branch_bit] =
                edge_from(insert_rec(Shared::null(), value, plen, end, guard));
            0
        };
        TrieNode {
            prefix: node.prefix & top_mask(eq),
            n_bits: eq,
            n_rules,
            edges,
        }
    };

    unsafe {
        guard.defer_destroy(slot);
    }
    Owned::new(new).into_shared(guard)
}

fn remove_rec<'g>(
    slot: Shared<'g, TrieNode>,
    value: u64,
    plen: u8,
    ofs: u8,
    guard: &'g Guard,
) -> Shared<'g, TrieNode> {
    let Some(node) = (unsafe { slot.as_ref() }) else {
        debug_assert!(false, "removing a prefix that was never inserted");
        return slot;
    };

    let eq = prefix_equal_bits(node.prefix, node.n_bits, value, ofs)
        .min(plen - ofs);
    let end = ofs + eq;
    debug_assert_eq!(eq, node.n_bits.min(plen - ofs));

    let new = if eq == node.n_bits && end == plen {
        debug_assert!(node.n_rules > 0);
        let n_rules = node.n_rules - 1;
        if n_rules == 0 {
            let e0 = node.edges[0].load(Ordering::Acquire, guard);
            let e1 = node.edges[1].load(Ordering::Acquire, guard);
            match (unsafe { e0.as_ref() }, unsafe { e1.as_ref() }) {
                (None, None) => {
                    unsafe {
                        guard.defer_destroy(slot);
                    }
                    return Shared::null();
                }
                (Some(child), None) => {
                    let merged = merge_into(node, child, guard);
                    unsafe {
                        guard.defer_destroy(e0);
                        guard.defer_destroy(slot);
                    }
                    return merged;
                }
                (None, Some(child)) => {
                    let merged = merge_into(node, child, guard);
                    unsafe {
                        guard.defer_destroy(e1);
                        guard.defer_destroy(slot);
                    }
                    return merged;
                }
                (Some(_), Some(_)) => TrieNode {
                    prefix: node.prefix,
                    n_bits: node.n_bits,
                    n_rules: 0,
                    edges: clone_edges(node, guard),
                },
            }
        } else {
            TrieNode {
                prefix: node.prefix,
                n_bits: node.n_bits,
                n_rules,
                edges: clone_edges(node, guard),
            }
        }
    } else {
        let bit = bit_at(value, end);
        let child = node.edges[bit].load(Ordering::Acquire, guard);
        let new_child = remove_rec(child, value, plen, end, guard);
        let other = node.edges[1 - bit].load(Ordering::Acquire, guard);

        if new_child.is_null() && node.n_rules == 0 {
            // This node only existed to fork; fold it into the
            // remaining branch.
            let remaining = unsafe { other.as_ref() }
                .expect("interior trie node with a single dead branch");
            let merged = merge_into(node, remaining, guard);
            unsafe {
                guard.defer_destroy(other);
                guard.defer_destroy(slot);
            }
            return merged;
        }

        let mut edges = clone_edges(node, guard);
        edges[bit] = edge_from(new_child);
        TrieNode {
            prefix: node.prefix,
            n_bits: node.n_bits,
            n_rules: node.n_rules,
            edges,
        }
    };

    unsafe {
        guard.defer_destroy(slot);
    }
    Owned::new(new).into_shared(guard)
}

/// A node whose single child absorbs it: concatenate the edges.
fn merge_into<'g>(
    node: &TrieNode,
    child: &TrieNode,
    guard: &'g Guard,
) -> Shared<'g, TrieNode> {
    debug_assert!(node.n_bits + child.n_bits <= 64);
    Owned::new(TrieNode {
        prefix: node.prefix | (child.prefix >> node.n_bits),
        n_bits: node.n_bits + child.n_bits,
        n_rules: child.n_rules,
        edges: clone_edges(child, guard),
    })
    .into_shared(guard)
}

//------------ TrieCtx -------------------------------------------------------

/// Per-lookup cache of one trie's answer, so each trie is walked at most
/// once per classifier lookup no matter how many subtables consult it.
/// The unused slots of the fixed-size context array carry no trie.
pub(crate) struct TrieCtx<'a> {
    trie: Option<&'a Trie>,
    looked_up: bool,
    result: TrieLookup,
}

impl<'a> TrieCtx<'a> {
    pub(crate) fn new(trie: &'a Trie) -> Self {
        TrieCtx {
            trie: Some(trie),
            ..TrieCtx::unused()
        }
    }

    pub(crate) fn unused() -> Self {
        TrieCtx {
            trie: None,
            looked_up: false,
            result: TrieLookup {
                match_plen: 0,
                wc_plen: 0,
            },
        }
    }

    pub(crate) fn trie(&self) -> Option<&'a Trie> {
        self.trie
    }

    /// The cached walk result, performing the walk on first use. The
    /// examined bits are recorded in `wc` at that point.
    pub(crate) fn lookup(
        &mut self,
        flow: &Flow,
        wc: &mut FlowWildcards,
        guard: &Guard,
    ) -> TrieLookup {
        if !self.looked_up {
            if let Some(trie) = self.trie {
                let value = flow.extract_be64(trie.field().def());
                self.result = trie.lookup(value, guard);
                wc.unwildcard_prefix(trie.field(), self.result.wc_plen);
            }
            self.looked_up = true;
        }
        self.result
    }
}
