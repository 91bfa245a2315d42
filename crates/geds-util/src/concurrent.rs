//! Concurrent container wrappers with an explicit read-write discipline.
//!
//! Readers take the shared lock, writers the exclusive lock; value mutation
//! happens outside the container lock through whatever interior locking the
//! value itself carries.

use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

pub struct ConcurrentMap<K, V> {
    map: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for ConcurrentMap<K, V> {
    fn default() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.read().get(key).cloned()
    }

    pub fn insert_or_replace(&self, key: K, value: V) {
        self.map.write().insert(key, value);
    }

    /// Insert `value` if `key` is vacant, returning whichever value ends up
    /// stored. Lets callers detect a lost insertion race by comparing the
    /// returned value with the one they supplied.
    pub fn insert_or_exists(&self, key: K, value: V) -> V {
        self.map.write().entry(key).or_insert(value).clone()
    }

    pub fn get_and_remove(&self, key: &K) -> Option<V> {
        self.map.write().remove(key)
    }

    pub fn remove(&self, key: &K) -> bool {
        self.map.write().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }

    pub fn forall(&self, mut action: impl FnMut(&K, &V)) {
        for (k, v) in self.map.read().iter() {
            action(k, v);
        }
    }

    pub fn retain(&self, predicate: impl FnMut(&K, &mut V) -> bool) {
        self.map.write().retain(predicate);
    }
}

pub struct ConcurrentSet<T> {
    set: RwLock<HashSet<T>>,
}

impl<T> Default for ConcurrentSet<T> {
    fn default() -> Self {
        Self {
            set: RwLock::new(HashSet::new()),
        }
    }
}

impl<T> ConcurrentSet<T>
where
    T: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, value: T) -> bool {
        self.set.write().insert(value)
    }

    pub fn contains(&self, value: &T) -> bool {
        self.set.read().contains(value)
    }

    pub fn remove(&self, value: &T) -> bool {
        self.set.write().remove(value)
    }

    pub fn len(&self) -> usize {
        self.set.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.read().is_empty()
    }
}

pub struct ConcurrentQueue<T> {
    queue: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> Default for ConcurrentQueue<T> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }
}

impl<T> ConcurrentQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, value: T) {
        self.queue.lock().push_back(value);
        self.available.notify_one();
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    /// Block the calling thread until an element is available. Must not be
    /// called from async context; async callers gate on a semaphore and use
    /// `pop` instead.
    pub fn pop_wait(&self) -> T {
        let mut queue = self.queue.lock();
        loop {
            if let Some(value) = queue.pop_front() {
                return value;
            }
            self.available.wait(&mut queue);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn insert_or_exists_keeps_first_value() {
        let map = ConcurrentMap::new();
        assert_eq!(map.insert_or_exists("k".to_string(), 1), 1);
        assert_eq!(map.insert_or_exists("k".to_string(), 2), 1);
        map.insert_or_replace("k".to_string(), 3);
        assert_eq!(map.get(&"k".to_string()), Some(3));
    }

    #[test]
    fn get_and_remove_is_exclusive() {
        let map = ConcurrentMap::new();
        map.insert_or_replace(1u32, "a");
        assert_eq!(map.get_and_remove(&1), Some("a"));
        assert_eq!(map.get_and_remove(&1), None);
    }

    #[test]
    fn queue_is_fifo_across_threads() {
        let queue = Arc::new(ConcurrentQueue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for i in 0..64 {
                    queue.push(i);
                }
            })
        };
        let mut seen = Vec::new();
        for _ in 0..64 {
            seen.push(queue.pop_wait());
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..64).collect::<Vec<_>>());
    }
}
