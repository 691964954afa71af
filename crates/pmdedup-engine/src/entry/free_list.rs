//! Free-list allocator for entry ids

use parking_lot::Mutex;
use pmdedup_common::EntryId;
use std::collections::VecDeque;

/// Queue of unused entry ids behind a single lock
///
/// The lock is held only across one push or pop.
#[derive(Debug, Default)]
pub struct FreeList {
    ids: Mutex<VecDeque<EntryId>>,
}

impl FreeList {
    /// Free list holding every id in `0..capacity`
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn with_all(capacity: u64) -> Self {
        Self::from_ids((0..capacity).map(EntryId::new))
    }

    /// Free list holding the given ids, in order
    pub fn from_ids(ids: impl IntoIterator<Item = EntryId>) -> Self {
        Self {
            ids: Mutex::new(ids.into_iter().collect()),
        }
    }

    /// Take the oldest free id
    pub fn pop(&self) -> Option<EntryId> {
        self.ids.lock().pop_front()
    }

    /// Return an id to the list
    pub fn push(&self, id: EntryId) {
        self.ids.lock().push_back(id);
    }

    /// Number of free ids
    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    /// Check if no id is free
    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_free_list_fifo() {
        let list = FreeList::with_all(3);
        assert_eq!(list.len(), 3);

        assert_eq!(list.pop(), Some(EntryId::new(0)));
        assert_eq!(list.pop(), Some(EntryId::new(1)));
        list.push(EntryId::new(0));
        assert_eq!(list.pop(), Some(EntryId::new(2)));
        assert_eq!(list.pop(), Some(EntryId::new(0)));
        assert_eq!(list.pop(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_free_list_concurrent_pop_is_unique() {
        let list = Arc::new(FreeList::with_all(1000));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let list = Arc::clone(&list);
                std::thread::spawn(move || {
                    let mut taken = Vec::new();
                    while let Some(id) = list.pop() {
                        taken.push(id);
                    }
                    taken
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "id {id} handed out twice");
            }
        }
        assert_eq!(seen.len(), 1000);
    }
}
