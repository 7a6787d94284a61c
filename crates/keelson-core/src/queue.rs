//! Keyed binary min-heap with head-changed notifications.
//!
//! `KeyedPriorityQueue<K, V, P>` orders values by priority (smallest first)
//! and additionally lets callers remove an entry by key. Equal priorities are
//! not ordered by insertion; the heap shape decides.
//!
//! Listeners registered with [`KeyedPriorityQueue::on_head_changed`] run
//! synchronously inside the mutating call, so whatever lock guards the queue
//! is held while they run.
//!
//! Complexity: `enqueue`/`dequeue` O(log n), `remove` O(n), `peek` O(1).

use std::fmt;

/// Previous and current head around a mutation that changed the head.
#[derive(Debug)]
pub struct HeadChanged<'a, V> {
    /// Head before the mutation (`None` if the queue was empty).
    pub previous: Option<&'a V>,
    /// Head after the mutation (`None` if the queue is now empty).
    pub current: Option<&'a V>,
}

type Listener<V> = Box<dyn FnMut(&HeadChanged<'_, V>) + Send>;

struct Entry<K, V, P> {
    key: K,
    value: V,
    priority: P,
}

/// Array-backed binary min-heap addressable by key.
pub struct KeyedPriorityQueue<K, V, P> {
    heap: Vec<Entry<K, V, P>>,
    listeners: Vec<Listener<V>>,
}

impl<K: PartialEq, V, P: Ord> KeyedPriorityQueue<K, V, P> {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Register a listener invoked whenever the head entry changes.
    pub fn on_head_changed(&mut self, listener: impl FnMut(&HeadChanged<'_, V>) + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// The value with the smallest priority.
    pub fn peek(&self) -> Option<&V> {
        self.heap.first().map(|entry| &entry.value)
    }

    /// Priority of the head entry.
    pub fn peek_priority(&self) -> Option<&P> {
        self.heap.first().map(|entry| &entry.priority)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.position(key).is_some()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.position(key).map(|index| &self.heap[index].value)
    }

    /// Values in heap order (not sorted).
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.heap.iter().map(|entry| &entry.value)
    }

    /// Insert a value. Notifies listeners if it became the new head.
    pub fn enqueue(&mut self, key: K, value: V, priority: P) {
        self.heap.push(Entry {
            key,
            value,
            priority,
        });
        let inserted = self.heap.len() - 1;
        let landed = self.sift_up(inserted);

        if landed == 0 {
            // The old head (if any) was pushed down onto the inserted entry's
            // path and now sits in the depth-1 slot of that path.
            let previous = (inserted > 0).then(|| &self.heap[root_child_on_path(inserted)].value);
            let change = HeadChanged {
                previous,
                current: Some(&self.heap[0].value),
            };
            notify(&mut self.listeners, &change);
        }
    }

    /// Remove and return the head. Listeners are notified after every removal.
    pub fn dequeue(&mut self) -> Option<V> {
        if self.heap.is_empty() {
            return None;
        }
        Some(self.remove_at(0))
    }

    /// Remove the entry for `key`, if present. Listeners are notified only
    /// when the removed entry was the head.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let index = self.position(key)?;
        Some(self.remove_at(index))
    }

    /// Remove every entry. Notifies listeners if the queue was non-empty.
    pub fn clear(&mut self) {
        if self.heap.is_empty() {
            return;
        }
        let old = std::mem::take(&mut self.heap);
        let change = HeadChanged {
            previous: old.first().map(|entry| &entry.value),
            current: None,
        };
        notify(&mut self.listeners, &change);
    }

    /// Find the first value matching `predicate` among entries whose priority
    /// is strictly earlier than `priority`.
    ///
    /// Subtrees whose root is not earlier than `priority` are skipped, since
    /// nothing below them can be earlier either.
    pub fn find_by_priority(&self, priority: &P, predicate: impl Fn(&V) -> bool) -> Option<&V> {
        if self.heap.is_empty() {
            return None;
        }
        self.search(priority, 0, &predicate)
    }

    fn search<'a>(&'a self, priority: &P, index: usize, predicate: &impl Fn(&V) -> bool) -> Option<&'a V> {
        let entry = &self.heap[index];
        if entry.priority >= *priority {
            return None;
        }
        if predicate(&entry.value) {
            return Some(&entry.value);
        }
        let left = 2 * index + 1;
        let right = left + 1;
        let found = if left < self.heap.len() {
            self.search(priority, left, predicate)
        } else {
            None
        };
        match found {
            Some(value) => Some(value),
            None if right < self.heap.len() => self.search(priority, right, predicate),
            None => None,
        }
    }

    fn position(&self, key: &K) -> Option<usize> {
        self.heap.iter().position(|entry| entry.key == *key)
    }

    fn remove_at(&mut self, index: usize) -> V {
        let removed = self.heap.swap_remove(index).value;

        if index < self.heap.len() {
            let landed = self.sift_up(index);
            if landed == index {
                self.sift_down(index);
            }
        }

        if index == 0 {
            let change = HeadChanged {
                previous: Some(&removed),
                current: self.heap.first().map(|entry| &entry.value),
            };
            notify(&mut self.listeners, &change);
        }
        removed
    }

    fn sift_up(&mut self, mut index: usize) -> usize {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.heap[index].priority < self.heap[parent].priority {
                self.heap.swap(index, parent);
                index = parent;
            } else {
                break;
            }
        }
        index
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;
            if left < len && self.heap[left].priority < self.heap[smallest].priority {
                smallest = left;
            }
            if right < len && self.heap[right].priority < self.heap[smallest].priority {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.heap.swap(index, smallest);
            index = smallest;
        }
    }
}

/// Depth-1 ancestor (index 1 or 2) of a non-root heap index.
fn root_child_on_path(mut index: usize) -> usize {
    while index > 2 {
        index = (index - 1) / 2;
    }
    index
}

fn notify<V>(listeners: &mut [Listener<V>], change: &HeadChanged<'_, V>) {
    for listener in listeners.iter_mut() {
        listener(change);
    }
}

impl<K: PartialEq, V, P: Ord> Default for KeyedPriorityQueue<K, V, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, P> fmt::Debug for KeyedPriorityQueue<K, V, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedPriorityQueue")
            .field("len", &self.heap.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
