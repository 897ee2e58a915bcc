//! Fixed-capacity slot pools backing the task scheduler.
//!
//! Every task record and every per-task stack block lives in a [`Pool`]. Slots
//! are addressed by typed [`slotmap`] keys, so a stale key can never alias a
//! slot that was freed and handed out again.

mod stack;

use slotmap::{Key, SlotMap};

pub use slotmap::new_key_type;
pub use stack::{StackBlock, StackKey, StackPool, STACK_ALIGN};

/// A slot pool with a hard capacity.
///
/// Running out of slots is a programming error (the pools are sized so that
/// normal play never exhausts them), so [`Pool::alloc`] panics instead of
/// returning an error.
pub struct Pool<K: Key, V> {
    name: &'static str,
    capacity: usize,
    slots: SlotMap<K, V>,
}

impl<K: Key, V> Pool<K, V> {
    pub fn with_capacity(name: &'static str, capacity: usize) -> Self {
        assert!(capacity > 0, "pool `{}` must have at least one slot", name);
        Pool {
            name,
            capacity,
            slots: SlotMap::with_capacity_and_key(capacity),
        }
    }

    /// Move `value` into a free slot and return its key.
    ///
    /// # Panics
    ///
    /// Panics when every slot is taken.
    pub fn alloc(&mut self, value: V) -> K {
        assert!(
            self.slots.len() < self.capacity,
            "pool `{}` exhausted ({} slots)",
            self.name,
            self.capacity
        );
        let key = self.slots.insert(value);
        tracing::trace!(pool = self.name, ?key, live = self.slots.len(), "alloc");
        key
    }

    /// Release the slot of `key`, returning its value. Freeing a key twice
    /// returns `None` the second time.
    pub fn free(&mut self, key: K) -> Option<V> {
        let value = self.slots.remove(key);
        if value.is_some() {
            tracing::trace!(pool = self.name, ?key, live = self.slots.len(), "free");
        }
        value
    }

    /// Drop every value in the pool at once.
    pub fn clear(&mut self) {
        tracing::debug!(pool = self.name, dropped = self.slots.len(), "clear");
        self.slots.clear();
    }

    pub fn get(&self, key: K) -> Option<&V> {
        self.slots.get(key)
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        self.slots.get_mut(key)
    }

    pub fn contains(&self, key: K) -> bool {
        self.slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> + '_ {
        self.slots.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.slots.keys()
    }
}

impl<K: Key, V> std::ops::Index<K> for Pool<K, V> {
    type Output = V;

    fn index(&self, key: K) -> &V {
        match self.slots.get(key) {
            Some(v) => v,
            None => panic!("pool `{}`: stale key {:?}", self.name, key),
        }
    }
}

impl<K: Key, V> std::ops::IndexMut<K> for Pool<K, V> {
    fn index_mut(&mut self, key: K) -> &mut V {
        let name = self.name;
        match self.slots.get_mut(key) {
            Some(v) => v,
            None => panic!("pool `{}`: stale key {:?}", name, key),
        }
    }
}

impl<K: Key, V> std::fmt::Debug for Pool<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("len", &self.slots.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
