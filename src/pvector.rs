//------------ PVector -------------------------------------------------------
//
// A priority-ordered vector with copy-on-write publication. The writer
// rebuilds the backing vector for every mutation, sorts it descending by
// priority (stable, so equal priorities keep their insertion order) and
// publishes it with a release store; the displaced vector is retired
// through the epoch collector. Readers load a snapshot once per lookup
// and iterate it without any synchronization beyond the pinned guard.
//
// The classifier keys this by each subtable's maximum rule priority,
// which is what lets a lookup stop as soon as no remaining subtable can
// beat the best match so far.

use std::sync::atomic::Ordering;

use crossbeam_epoch::{Atomic, Guard, Owned};

#[derive(Clone)]
pub(crate) struct Entry<T> {
    pub(crate) priority: i64,
    pub(crate) value: T,
}

pub(crate) struct PVector<T> {
    vec: Atomic<Vec<Entry<T>>>,
}

impl<T: Clone> PVector<T> {
    pub(crate) fn new() -> Self {
        PVector {
            vec: Atomic::new(Vec::new()),
        }
    }

    pub(crate) fn snapshot<'g>(&self, guard: &'g Guard) -> &'g [Entry<T>] {
        unsafe { self.vec.load(Ordering::Acquire, guard).deref() }
    }

    /// Safety: `guard` must stay pinned for as long as the returned
    /// slice is referenced.
    pub(crate) unsafe fn snapshot_raw(
        &self,
        guard: &Guard,
    ) -> (*const Entry<T>, usize) {
        let v = self.vec.load(Ordering::Acquire, guard).deref();
        (v.as_ptr(), v.len())
    }

    fn publish(&self, mut vec: Vec<Entry<T>>, guard: &Guard) {
        vec.sort_by(|a, b| b.priority.cmp(&a.priority));
        let old = self.vec.load(Ordering::Acquire, guard);
        self.vec.store(Owned::new(vec), Ordering::Release);
        unsafe {
            guard.defer_destroy(old);
        }
    }

    /// Writer only.
    pub(crate) fn insert(&self, priority: i64, value: T, guard: &Guard) {
        let mut vec = self.snapshot(guard).to_vec();
        vec.push(Entry { priority, value });
        self.publish(vec, guard);
    }

    /// Writer only. Removes the first entry satisfying `pred`.
    pub(crate) fn remove(
        &self,
        guard: &Guard,
        mut pred: impl FnMut(&T) -> bool,
    ) {
        let mut vec = self.snapshot(guard).to_vec();
        if let Some(pos) = vec.iter().position(|e| pred(&e.value)) {
            vec.remove(pos);
            self.publish(vec, guard);
        }
    }

    /// Writer only. Re-keys the first entry satisfying `pred`.
    pub(crate) fn reprioritize(
        &self,
        priority: i64,
        guard: &Guard,
        mut pred: impl FnMut(&T) -> bool,
    ) {
        let mut vec = self.snapshot(guard).to_vec();
        if let Some(e) = vec.iter_mut().find(|e| pred(&e.value)) {
            e.priority = priority;
            self.publish(vec, guard);
        }
    }
}

impl<T> Drop for PVector<T> {
    fn drop(&mut self) {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let vec = self.vec.load(Ordering::Acquire, guard);
        if !vec.is_null() {
            drop(unsafe { vec.into_owned() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_descending_order_with_stable_ties() {
        let pv: PVector<&str> = PVector::new();
        let guard = crossbeam_epoch::pin();
        pv.insert(5, "a", &guard);
        pv.insert(9, "b", &guard);
        pv.insert(5, "c", &guard);
        pv.insert(7, "d", &guard);

        let order: Vec<_> =
            pv.snapshot(&guard).iter().map(|e| e.value).collect();
        assert_eq!(order, ["b", "d", "a", "c"]);

        pv.reprioritize(10, &guard, |v| *v == "a");
        let order: Vec<_> =
            pv.snapshot(&guard).iter().map(|e| e.value).collect();
        assert_eq!(order, ["a", "b", "d", "c"]);

        pv.remove(&guard, |v| *v == "d");
        let order: Vec<_> =
            pv.snapshot(&guard).iter().map(|e| e.value).collect();
        assert_eq!(order, ["a", "b", "c"]);
    }
}
