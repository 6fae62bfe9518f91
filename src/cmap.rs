//------------ Cmap ----------------------------------------------------------
//
// A chained hash map for one writer and any number of lock-free readers.
// The bucket array and every node are published through epoch-protected
// atomic pointers: readers pin an epoch guard, load the array, and walk
// bucket chains without taking a lock. The single writer (serialized
// externally) inserts by pushing a node at the head of its chain,
// removes by unlinking, and grows the table by rebuilding every node
// into a fresh array and republishing it. Displaced nodes and arrays are
// handed to the epoch collector, so a reader that loaded them before the
// republish can finish its walk on the old version.
//
// Values may carry interior-atomic state (chain heads, occupancy
// counters); the map itself never moves a value once its node is
// published, except during a grow, which clones values into new nodes.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

pub(crate) struct Node<T> {
    hash: u64,
    value: T,
    next: Atomic<Node<T>>,
}

struct Buckets<T> {
    mask: usize,
    slots: Box<[Atomic<Node<T>>]>,
}

impl<T> Buckets<T> {
    fn with_capacity(n_slots: usize) -> Self {
        debug_assert!(n_slots.is_power_of_two());
        let slots = (0..n_slots)
            .map(|_| Atomic::null())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Buckets {
            mask: n_slots - 1,
            slots,
        }
    }

    fn slot(&self, hash: u64) -> &Atomic<Node<T>> {
        &self.slots[hash as usize & self.mask]
    }
}

pub(crate) struct Cmap<T> {
    buckets: Atomic<Buckets<T>>,
    len: AtomicUsize,
}

impl<T> Cmap<T> {
    pub(crate) fn new() -> Self {
        Cmap {
            buckets: Atomic::new(Buckets::with_capacity(8)),
            len: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the first node with `hash` whose value satisfies `pred`.
    pub(crate) fn find<'g>(
        &self,
        hash: u64,
        guard: &'g Guard,
        mut pred: impl FnMut(&T) -> bool,
    ) -> Option<&'g T> {
        let buckets = unsafe {
            self.buckets.load(Ordering::Acquire, guard).deref()
        };
        let mut cur = buckets.slot(hash).load(Ordering::Acquire, guard);
        while let Some(node) = unsafe { cur.as_ref() } {
            if node.hash == hash && pred(&node.value) {
                return Some(&node.value);
            }
            cur = node.next.load(Ordering::Acquire, guard);
        }
        None
    }

    /// Writer only. Publishes a new node at the head of its chain and
    /// grows the table when chains get long on average.
    pub(crate) fn insert(&self, hash: u64, value: T, guard: &Guard)
    where
        T: Clone,
    {
        let len = self.len.load(Ordering::Relaxed) + 1;
        let buckets = unsafe {
            self.buckets.load(Ordering::Acquire, guard).deref()
        };
        if len > (buckets.mask + 1) * 2 {
            self.grow(guard);
        }
        let buckets = unsafe {
            self.buckets.load(Ordering::Acquire, guard).deref()
        };

        let slot = buckets.slot(hash);
        let node = Owned::new(Node {
            hash,
            value,
            next: Atomic::null(),
        });
        node.next
            .store(slot.load(Ordering::Relaxed, guard), Ordering::Relaxed);
        slot.store(node, Ordering::Release);
        self.len.store(len, Ordering::Relaxed);
    }

    /// Writer only. Unlink the first node with `hash` satisfying `pred`
    /// and retire it. Returns whether a node was removed.
    pub(crate) fn remove(
        &self,
        hash: u64,
        guard: &Guard,
        mut pred: impl FnMut(&T) -> bool,
    ) -> bool {
        let buckets = unsafe {
            self.buckets.load(Ordering::Acquire, guard).deref()
        };
        let slot = buckets.slot(hash);
        let mut prev: Option<&Atomic<Node<T>>> = None;
        let mut cur = slot.load(Ordering::Acquire, guard);
        while let Some(node) = unsafe { cur.as_ref() } {
            let next = node.next.load(Ordering::Acquire, guard);
            if node.hash == hash && pred(&node.value) {
                match prev {
                    Some(link) => link.store(next, Ordering::Release),
                    None => slot.store(next, Ordering::Release),
                }
                unsafe {
                    guard.defer_destroy(cur);
                }
                self.len.fetch_sub(1, Ordering::Relaxed);
                return true;
            }
            prev = Some(&node.next);
            cur = next;
        }
        false
    }

    /// Writer only. Rebuild every node into a table of twice the size
    /// and republish; readers on the old table keep walking retired
    /// chains.
    fn grow(&self, guard: &Guard)
    where
        T: Clone,
    {
        let old_shared = self.buckets.load(Ordering::Acquire, guard);
        let old = unsafe { old_shared.deref() };
        let new = Buckets::with_capacity((old.mask + 1) * 2);

        for slot in old.slots.iter() {
            let mut cur = slot.load(Ordering::Acquire, guard);
            while let Some(node) = unsafe { cur.as_ref() } {
                let new_slot = new.slot(node.hash);
                let copy = Owned::new(Node {
                    hash: node.hash,
                    value: node.value.clone(),
                    next: Atomic::null(),
                });
                copy.next.store(
                    new_slot.load(Ordering::Relaxed, guard),
                    Ordering::Relaxed,
                );
                new_slot.store(copy, Ordering::Relaxed);

                let next = node.next.load(Ordering::Acquire, guard);
                unsafe {
                    guard.defer_destroy(cur);
                }
                cur = next;
            }
        }

        self.buckets.store(Owned::new(new), Ordering::Release);
        unsafe {
            guard.defer_destroy(old_shared);
        }
    }

    pub(crate) fn iter<'g>(&self, guard: &'g Guard) -> Iter<'g, T> {
        let buckets = unsafe {
            self.buckets.load(Ordering::Acquire, guard).deref()
        };
        Iter {
            slots: &buckets.slots,
            bucket: 0,
            cur: Shared::null(),
            guard,
        }
    }
}

impl<T> Drop for Cmap<T> {
    fn drop(&mut self) {
        // Exclusive access: free all nodes and the bucket array in
        // place. Nodes already handed to the collector are not ours.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let buckets = self.buckets.load(Ordering::Acquire, guard);
        if let Some(b) = unsafe { buckets.as_ref() } {
            for slot in b.slots.iter() {
                let mut cur = slot.load(Ordering::Acquire, guard);
                while !cur.is_null() {
                    let next = unsafe {
                        cur.deref().next.load(Ordering::Acquire, guard)
                    };
                    drop(unsafe { cur.into_owned() });
                    cur = next;
                }
            }
            drop(unsafe { buckets.into_owned() });
        }
    }
}

//------------ Iter ----------------------------------------------------------

pub(crate) struct Iter<'g, T> {
    slots: &'g [Atomic<Node<T>>],
    bucket: usize,
    cur: Shared<'g, Node<T>>,
    guard: &'g Guard,
}

impl<'g, T> Iterator for Iter<'g, T> {
    type Item = &'g T;

    fn next(&mut self) -> Option<&'g T> {
        loop {
            if let Some(node) = unsafe { self.cur.as_ref() } {
                self.cur = node.next.load(Ordering::Acquire, self.guard);
                return Some(&node.value);
            }
            if self.bucket >= self.slots.len() {
                return None;
            }
            self.cur =
                self.slots[self.bucket].load(Ordering::Acquire, self.guard);
            self.bucket += 1;
        }
    }
}

//------------ CmapCursor ----------------------------------------------------
//
// A resumable position for the classifier cursor. Unlike `Iter` it is not
// tied to a guard lifetime: the caller owns a pinned guard for as long as
// the cursor lives and promises that the map is not grown meanwhile
// (rule removal only unlinks nodes, and an unlinked node keeps its next
// pointer, so a walk passing through it still terminates).

pub(crate) struct CmapCursor<T> {
    slots: *const Atomic<Node<T>>,
    n_slots: usize,
    bucket: usize,
    cur: *const Node<T>,
}

impl<T> CmapCursor<T> {
    /// Safety: `guard` must stay pinned for the cursor's whole lifetime.
    pub(crate) unsafe fn start(map: &Cmap<T>, guard: &Guard) -> Self {
        let buckets = map.buckets.load(Ordering::Acquire, guard).deref();
        CmapCursor {
            slots: buckets.slots.as_ptr(),
            n_slots: buckets.slots.len(),
            bucket: 0,
            cur: std::ptr::null(),
        }
    }

    /// Safety: the guard passed to `start` must still be pinned; no
    /// grow may have happened since.
    pub(crate) unsafe fn next<'a>(&mut self) -> Option<&'a T> {
        loop {
            if !self.cur.is_null() {
                let node = &*self.cur;
                let next = node
                    .next
                    .load(Ordering::Acquire, crossbeam_epoch::unprotected());
                self.cur = next.as_raw();
                return Some(&node.value);
            }
            if self.bucket >= self.n_slots {
                return None;
            }
            let slot = &*self.slots.add(self.bucket);
            self.bucket += 1;
            self.cur = slot
                .load(Ordering::Acquire, crossbeam_epoch::unprotected())
                .as_raw();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_find_remove() {
        let map: Cmap<u64> = Cmap::new();
        let guard = crossbeam_epoch::pin();
        for i in 0..100u64 {
            map.insert(i % 7, i, &guard);
        }
        assert_eq!(map.len(), 100);
        assert!(map.find(3, &guard, |v| *v == 45).is_some());
        assert!(map.find(4, &guard, |v| *v == 45).is_none());

        assert!(map.remove(3, &guard, |v| *v == 45));
        assert!(!map.remove(3, &guard, |v| *v == 45));
        assert_eq!(map.len(), 99);
    }

    #[test]
    fn grow_preserves_entries() {
        let map: Cmap<u64> = Cmap::new();
        let guard = crossbeam_epoch::pin();
        for i in 0..1000u64 {
            map.insert(i.wrapping_mul(0x9e37_79b9), i, &guard);
        }
        for i in 0..1000u64 {
            assert!(map
                .find(i.wrapping_mul(0x9e37_79b9), &guard, |v| *v == i)
                .is_some());
        }
        assert_eq!(map.iter(&guard).count(), 1000);
    }

    #[test]
    fn duplicate_hashes_coexist() {
        let map: Cmap<&str> = Cmap::new();
        let guard = crossbeam_epoch::pin();
        map.insert(1, "a", &guard);
        map.insert(1, "b", &guard);
        assert!(map.find(1, &guard, |v| *v == "a").is_some());
        assert!(map.find(1, &guard, |v| *v == "b").is_some());
        assert!(map.remove(1, &guard, |v| *v == "b"));
        assert!(map.find(1, &guard, |v| *v == "a").is_some());
    }
}
