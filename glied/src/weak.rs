//! Weak collections.
//!
//! Liveness comes from `Arc` reference counts. A dead entry still pins its
//! `ArcInner` allocation (the weak count keeps it), so addresses of dead keys
//! are never reused while their slot exists and identity keys stay sound.
//! Sweeping dead slots therefore matters for memory, not for correctness.
use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

static COLLECTION_EPOCH: AtomicUsize = AtomicUsize::new(0);

/// Called by whoever releases large amounts of objects (the host allocator's
/// collection hook, a runtime `collect`). Weak tables only consider a sweep
/// after the epoch moved.
pub fn notify_collection() {
    COLLECTION_EPOCH.fetch_add(1, Ordering::Release);
}

pub fn collection_epoch() -> usize {
    COLLECTION_EPOCH.load(Ordering::Acquire)
}

fn address<K: ?Sized>(key: &Arc<K>) -> usize {
    Arc::as_ptr(key) as *const () as usize
}

#[derive(Debug, Clone, Copy)]
pub struct WeakTableSettings {
    /// Inserts between two sweep checks.
    pub cooldown: usize,
    /// Sweep once `dead * dead_ratio >= live`.
    pub dead_ratio: usize,
}

impl Default for WeakTableSettings {
    fn default() -> Self {
        Self {
            cooldown: 64,
            dead_ratio: 4,
        }
    }
}

/// Map keyed by object identity that does not keep its keys alive.
///
/// Single writer: callers serialise mutation (the state store wraps it in a
/// mutex).
pub struct WeakKeyedTable<K: ?Sized, V> {
    slots: HashMap<usize, (Weak<K>, V), ahash::RandomState>,
    settings: WeakTableSettings,
    seen_epoch: usize,
    inserts_since_check: usize,
    sweeps: usize,
}

impl<K: ?Sized, V> WeakKeyedTable<K, V> {
    pub fn new() -> Self {
        Self::with_settings(WeakTableSettings::default())
    }

    pub fn with_settings(settings: WeakTableSettings) -> Self {
        Self {
            slots: HashMap::default(),
            settings,
            seen_epoch: collection_epoch(),
            inserts_since_check: 0,
            sweeps: 0,
        }
    }

    pub fn try_get_value(&self, key: &Arc<K>) -> Option<&V> {
        let (weak, value) = self.slots.get(&address(key))?;
        // A live key pins its address, so a slot under it is either ours or
        // (impossible while the weak exists) someone else's.
        debug_assert!(weak.strong_count() > 0);
        Some(value)
    }

    /// Inserts or replaces the value for `key`.
    pub fn add(&mut self, key: &Arc<K>, value: V) {
        self.maybe_sweep();
        self.slots.insert(address(key), (Arc::downgrade(key), value));
        self.inserts_since_check += 1;
    }

    pub fn get_or_insert_with(&mut self, key: &Arc<K>, f: impl FnOnce() -> V) -> &mut V {
        let addr = address(key);
        if !self.slots.contains_key(&addr) {
            self.add(key, f());
        }
        match self.slots.get_mut(&addr) {
            Some((_, value)) => value,
            None => unreachable!("slot was inserted above"),
        }
    }

    pub fn remove(&mut self, key: &Arc<K>) -> Option<V> {
        self.slots.remove(&address(key)).map(|(_, v)| v)
    }

    /// Slot count including dead keys that were not swept yet.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.slots
            .values()
            .filter(|(weak, _)| weak.strong_count() > 0)
            .count()
    }

    pub fn sweeps(&self) -> usize {
        self.sweeps
    }

    /// Drops every dead slot and rehashes into a right-sized map.
    pub fn sweep(&mut self) -> usize {
        let before = self.slots.len();
        let live: HashMap<_, _, ahash::RandomState> = self
            .slots
            .drain()
            .filter(|(_, (weak, _))| weak.strong_count() > 0)
            .collect();
        self.slots = live;
        self.sweeps += 1;
        self.inserts_since_check = 0;
        let removed = before - self.slots.len();
        log::debug!(
            "weak table sweep removed {} dead slots, {} live",
            removed,
            self.slots.len()
        );
        removed
    }

    fn maybe_sweep(&mut self) {
        if self.inserts_since_check < self.settings.cooldown {
            return;
        }
        let epoch = collection_epoch();
        if epoch == self.seen_epoch {
            return;
        }
        self.seen_epoch = epoch;
        self.inserts_since_check = 0;

        let live = self.live_count();
        let dead = self.slots.len() - live;
        if dead > 0 && dead * self.settings.dead_ratio >= live {
            self.sweep();
        }
    }
}

impl<K: ?Sized, V> Default for WeakKeyedTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ?Sized, V> std::fmt::Debug for WeakKeyedTable<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakKeyedTable")
            .field("slots", &self.slots.len())
            .field("sweeps", &self.sweeps)
            .finish()
    }
}

const WEAK_LIST_MIN_DEAD: usize = 16;

/// Append-only list of weak references for subscriber-style registries.
pub struct WeakList<T: ?Sized> {
    items: Vec<Weak<T>>,
    dead_seen: AtomicUsize,
}

impl<T: ?Sized> WeakList<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            dead_seen: AtomicUsize::new(0),
        }
    }

    pub fn add(&mut self, item: &Arc<T>) {
        self.maybe_compact();
        self.items.push(Arc::downgrade(item));
    }

    /// Lazily upgrades entries, skipping dead ones. Iteration can be
    /// restarted at any time by calling `iter` again.
    pub fn iter(&self) -> WeakListIter<'_, T> {
        WeakListIter {
            list: self,
            index: 0,
            dead: 0,
        }
    }

    /// Slots including dead ones.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn compact(&mut self) {
        self.items.retain(|w| w.strong_count() > 0);
        self.dead_seen.store(0, Ordering::Relaxed);
    }

    fn maybe_compact(&mut self) {
        let dead = self.dead_seen.load(Ordering::Relaxed);
        if dead >= WEAK_LIST_MIN_DEAD && dead * 2 >= self.items.len() {
            self.compact();
        }
    }
}

impl<T: ?Sized> Default for WeakList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> std::fmt::Debug for WeakList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakList")
            .field("len", &self.items.len())
            .finish()
    }
}

pub struct WeakListIter<'a, T: ?Sized> {
    list: &'a WeakList<T>,
    index: usize,
    dead: usize,
}

impl<T: ?Sized> Iterator for WeakListIter<'_, T> {
    type Item = Arc<T>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(weak) = self.list.items.get(self.index) {
            self.index += 1;
            match weak.upgrade() {
                Some(item) => return Some(item),
                None => self.dead += 1,
            }
        }
        None
    }
}

impl<T: ?Sized> Drop for WeakListIter<'_, T> {
    fn drop(&mut self) {
        // A full pass reports the dead count it saw; partial passes only
        // raise the hint.
        if self.index >= self.list.items.len() {
            self.list.dead_seen.store(self.dead, Ordering::Relaxed);
        } else {
            self.list.dead_seen.fetch_max(self.dead, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_found_by_identity_not_by_equality() {
        let mut table = WeakKeyedTable::<String, u32>::new();
        let a = Arc::new(String::from("same"));
        let b = Arc::new(String::from("same"));
        table.add(&a, 1);
        assert_eq!(table.try_get_value(&a), Some(&1));
        assert_eq!(table.try_get_value(&b), None);
    }

    #[test]
    fn get_or_insert_with_creates_once() {
        let mut table = WeakKeyedTable::<u64, Vec<u8>>::new();
        let key = Arc::new(7);
        table.get_or_insert_with(&key, Vec::new).push(1);
        table.get_or_insert_with(&key, || vec![9, 9]).push(2);
        assert_eq!(table.try_get_value(&key), Some(&vec![1, 2]));
    }

    #[test]
    fn dropped_keys_decay_after_a_collection_and_cooldown() {
        let settings = WeakTableSettings {
            cooldown: 8,
            dead_ratio: 1,
        };
        let mut table = WeakKeyedTable::<u64, u64>::with_settings(settings);

        let doomed: Vec<Arc<u64>> = (0..32).map(Arc::new).collect();
        for key in &doomed {
            table.add(key, *key.as_ref());
        }
        drop(doomed);
        assert_eq!(table.live_count(), 0);
        assert_eq!(table.len(), 32);

        notify_collection();

        let survivors: Vec<Arc<u64>> = (100..110).map(Arc::new).collect();
        for key in &survivors {
            table.add(key, *key.as_ref());
        }

        assert!(table.sweeps() >= 1, "a sweep should have run");
        assert_eq!(table.len(), table.live_count());
        for key in &survivors {
            assert_eq!(table.try_get_value(key), Some(key.as_ref()));
        }
    }

    #[test]
    fn no_sweep_without_a_collection_tick() {
        let settings = WeakTableSettings {
            cooldown: 1,
            dead_ratio: 1,
        };
        let mut table = WeakKeyedTable::<u64, ()>::with_settings(settings);
        // Freeze the table's view of the epoch by syncing it right now.
        table.seen_epoch = collection_epoch();

        let dead = Arc::new(1);
        table.add(&dead, ());
        drop(dead);

        let live = Arc::new(2);
        table.add(&live, ());
        // Another test may tick the epoch concurrently; only assert when the
        // epoch is unchanged.
        if collection_epoch() == table.seen_epoch {
            assert_eq!(table.sweeps(), 0);
            assert_eq!(table.len(), 2);
        }
        table.sweep();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn weak_list_skips_dead_entries_and_compacts() {
        let mut list = WeakList::<u32>::new();
        let keep: Vec<Arc<u32>> = (0..4).map(Arc::new).collect();
        {
            let temp: Vec<Arc<u32>> = (0..40).map(Arc::new).collect();
            for item in &temp {
                list.add(item);
            }
        }
        for item in &keep {
            list.add(item);
        }

        let seen: Vec<u32> = list.iter().map(|a| *a).collect();
        assert_eq!(seen, vec![0, 1, 2, 3]);

        // The full pass above recorded 40 dead entries; the next add compacts.
        let extra = Arc::new(99);
        list.add(&extra);
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn weak_list_iteration_is_restartable() {
        let mut list = WeakList::<str>::new();
        let a: Arc<str> = Arc::from("a");
        let b: Arc<str> = Arc::from("b");
        list.add(&a);
        list.add(&b);

        let mut first = list.iter();
        assert_eq!(first.next().as_deref(), Some("a"));
        drop(first);

        let all: Vec<_> = list.iter().map(|s| s.to_string()).collect();
        assert_eq!(all, ["a", "b"]);
    }
}
