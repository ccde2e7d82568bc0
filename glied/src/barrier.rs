use parking_lot::{Condvar, Mutex};

/// A reusable synchronization barrier that puts threads to sleep. Used to
/// start racing threads together.
#[derive(Debug, Default)]
pub struct SenseBarrier {
    /// Protected state: (current_count, current_sense)
    state: Mutex<(usize, bool)>,
    cvar: Condvar,
}

impl SenseBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new((0, false)),
            cvar: Condvar::new(),
        }
    }

    /// Blocks the current thread until `until` threads have called this
    /// function. Returns true on exactly one thread per round.
    pub fn wait(&self, until: usize) -> bool {
        let mut state = self.state.lock();
        let my_sense = state.1;
        state.0 += 1;

        if state.0 == until {
            state.0 = 0;
            state.1 = !my_sense;
            self.cvar.notify_all();
            true
        } else {
            while state.1 == my_sense {
                self.cvar.wait(&mut state);
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[test]
    fn releases_all_threads_each_round() {
        const THREADS: usize = 4;
        let barrier = Arc::new(SenseBarrier::new());
        let arrived = Arc::new(AtomicUsize::new(0));
        let leaders = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let (barrier, arrived, leaders) =
                    (barrier.clone(), arrived.clone(), leaders.clone());
                std::thread::spawn(move || {
                    for round in 1..=3 {
                        arrived.fetch_add(1, Ordering::SeqCst);
                        if barrier.wait(THREADS) {
                            leaders.fetch_add(1, Ordering::SeqCst);
                        }
                        assert!(arrived.load(Ordering::SeqCst) >= round * THREADS);
                        barrier.wait(THREADS);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(leaders.load(Ordering::SeqCst), 3);
    }
}
