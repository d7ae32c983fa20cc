//! Insertion-ordered set with batch eviction.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// A set that remembers at most `capacity` ids.
///
/// Inserting a new id into a full set first drops the `evict_count` oldest
/// entries, so one overflow leaves `capacity - evict_count + 1` entries.
#[derive(Debug, Clone)]
pub struct BoundedIdSet<T> {
    order: VecDeque<T>,
    members: HashSet<T>,
    capacity: usize,
    evict_count: usize,
}

impl<T: Clone + Eq + Hash> BoundedIdSet<T> {
    /// Create a set. `capacity` is at least 1 and `evict_count` is clamped to
    /// `1..=capacity`.
    #[must_use]
    pub fn new(capacity: usize, evict_count: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
            evict_count: evict_count.clamp(1, capacity),
        }
    }

    /// Insert `id`. Returns false if it was already present.
    pub fn insert(&mut self, id: T) -> bool {
        if self.members.contains(&id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            for _ in 0..self.evict_count {
                match self.order.pop_front() {
                    Some(old) => {
                        self.members.remove(&old);
                    }
                    None => break,
                }
            }
        }
        self.members.insert(id.clone());
        self.order.push_back(id);
        true
    }

    /// Returns true if `id` is present.
    #[must_use]
    pub fn contains(&self, id: &T) -> bool {
        self.members.contains(id)
    }

    /// Remove `id`. Returns true if it was present.
    pub fn remove(&mut self, id: &T) -> bool {
        if !self.members.remove(id) {
            return false;
        }
        self.order.retain(|x| x != id);
        true
    }

    /// Number of ids held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if no ids are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}
