use std::sync::Arc;

use arc_swap::{ArcSwapOption, Guard};

/// Lock-free readable slot holding an immutable, versioned cache entry.
///
/// Writers build a complete entry (value and version together) and swap it
/// in whole, so a reader never sees a version paired with a value written
/// after it. A superseded entry is freed once its last reader lets go.
pub struct VersionedCell<T> {
    slot: ArcSwapOption<T>,
}

impl<T> VersionedCell<T> {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
        }
    }

    /// Hot-path read. Keep the guard short-lived.
    pub fn load(&self) -> Guard<Option<Arc<T>>> {
        self.slot.load()
    }

    pub fn current(&self) -> Option<Arc<T>> {
        self.slot.load_full()
    }

    /// Offers `f` the current entry and publishes its result, if any. `f`
    /// runs again when another writer got in first. Returns whether a new
    /// entry was published.
    pub fn update(&self, mut f: impl FnMut(Option<&T>) -> Option<T>) -> bool {
        let mut current = self.slot.load();
        loop {
            let Some(next) = f(current.as_deref()) else {
                return false;
            };
            let previous = self.slot.compare_and_swap(&current, Some(Arc::new(next)));
            if same_entry(&previous, &current) {
                return true;
            }
            current = previous;
        }
    }
}

fn same_entry<T>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

impl<T> Default for VersionedCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for VersionedCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedCell")
            .field("current", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unbound() {
        let cell = VersionedCell::<u32>::new();
        assert!(cell.load().is_none());
        assert!(!cell.update(|_| None));
        assert!(cell.current().is_none());
    }

    #[test]
    fn held_entries_survive_updates() {
        let cell = VersionedCell::new();
        cell.update(|_| Some((1u64, String::from("one"))));
        let first = cell.current().unwrap();
        cell.update(|prev| {
            assert_eq!(prev.map(|p| p.0), Some(1));
            Some((2, String::from("two")))
        });
        assert_eq!(first.1, "one");
        assert_eq!(cell.load().as_ref().map(|e| e.0), Some(2));
    }

    #[test]
    fn superseded_entries_are_released() {
        let cell = VersionedCell::new();
        cell.update(|_| Some(1u64));
        let first = cell.current().unwrap();
        assert_eq!(Arc::strong_count(&first), 2);

        for v in 2..100 {
            cell.update(|_| Some(v));
        }
        assert_eq!(Arc::strong_count(&first), 1);
        let last = cell.current().unwrap();
        assert_eq!(*last, 99);
        assert_eq!(Arc::strong_count(&last), 2);
    }

    #[test]
    fn readers_never_see_torn_entries() {
        // Each entry stores its version twice; a torn read would disagree.
        let cell = Arc::new(VersionedCell::<(u64, u64)>::new());
        cell.update(|_| Some((0, 0)));

        let writer = {
            let cell = cell.clone();
            std::thread::spawn(move || {
                for v in 1..=2_000u64 {
                    cell.update(|_| Some((v, v)));
                }
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let cell = cell.clone();
                std::thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..10_000 {
                        let (a, b) = **cell.load().as_ref().unwrap();
                        assert_eq!(a, b);
                        assert!(a >= last, "versions never go backwards");
                        last = a;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(cell.current().as_deref(), Some(&(2_000, 2_000)));
    }

    #[test]
    fn racing_writers_retry_against_the_latest_entry() {
        let cell = Arc::new(VersionedCell::<u64>::new());
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let cell = cell.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        cell.update(|prev| Some(prev.copied().unwrap_or(0) + 1));
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(cell.current().as_deref(), Some(&4_000));
    }
}
