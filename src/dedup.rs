//! Membership set of already-processed event ids.

use std::collections::{HashSet, VecDeque};

/// Remembers processed event ids.
///
/// Without a capacity the set grows for the lifetime of the process. With a
/// capacity it keeps only the most recently recorded ids, evicting the
/// oldest first.
#[derive(Debug, Default)]
pub struct ProcessedIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: Option<usize>,
}

impl ProcessedIds {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: Some(capacity.max(1)),
        }
    }

    pub fn new(capacity: Option<usize>) -> Self {
        capacity.map_or_else(Self::unbounded, Self::with_capacity)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Records `id`. Returns false if it was already present.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.ids.contains(&id) {
            return false;
        }

        if let Some(capacity) = self.capacity {
            while self.order.len() >= capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.ids.remove(&oldest);
                }
            }
            self.order.push_back(id.clone());
        }
        self.ids.insert(id);
        true
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_keeps_everything() {
        let mut ids = ProcessedIds::unbounded();
        for i in 0..1000 {
            assert!(ids.insert(format!("evt-{}", i)));
        }
        assert_eq!(ids.len(), 1000);
        assert_eq!(ids.capacity(), None);
        assert!(ids.contains("evt-0"));
        assert!(!ids.insert("evt-0"));
    }

    #[test]
    fn test_bounded_evicts_oldest() {
        let mut ids = ProcessedIds::new(Some(2));
        assert!(ids.is_empty());
        assert_eq!(ids.capacity(), Some(2));
        ids.insert("a");
        ids.insert("b");
        ids.insert("c");

        assert_eq!(ids.len(), 2);
        assert!(!ids.contains("a"));
        assert!(ids.contains("b"));
        assert!(ids.contains("c"));
    }
}
