use crossbeam_epoch::Guard;

/// The operations the surrounding benchmark drivers consume. Keys are plain
/// `u64` values below `u64::MAX`.
pub trait ConcurrentSet {
    fn new() -> Self;
    fn get(&self, key: u64, guard: &Guard) -> bool;
    fn insert(&self, key: u64, guard: &Guard) -> bool;
    fn remove(&self, key: u64, guard: &Guard) -> bool;
}

#[cfg(test)]
pub mod tests {
    use super::ConcurrentSet;
    use crossbeam_epoch::pin;
    use crossbeam_utils::thread;
    use rand::prelude::*;

    const THREADS: u64 = 16;
    const ELEMENTS_PER_THREAD: u64 = 500;

    pub fn smoke<S: ConcurrentSet + Send + Sync>() {
        let set = &S::new();

        thread::scope(|s| {
            for t in 0..THREADS {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<u64> = (0..ELEMENTS_PER_THREAD)
                        .map(|k| k * THREADS + t)
                        .collect();
                    keys.shuffle(&mut rng);
                    for k in keys {
                        assert!(set.insert(k, &pin()));
                    }
                });
            }
        })
        .unwrap();

        thread::scope(|s| {
            for t in 0..(THREADS / 2) {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<u64> = (0..ELEMENTS_PER_THREAD)
                        .map(|k| k * THREADS + t)
                        .collect();
                    keys.shuffle(&mut rng);
                    for k in keys {
                        assert!(set.remove(k, &pin()));
                    }
                });
            }
        })
        .unwrap();

        thread::scope(|s| {
            for t in (THREADS / 2)..THREADS {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<u64> = (0..ELEMENTS_PER_THREAD)
                        .map(|k| k * THREADS + t)
                        .collect();
                    keys.shuffle(&mut rng);
                    for k in keys {
                        assert!(set.get(k, &pin()));
                    }
                });
            }
        })
        .unwrap();
    }
}
