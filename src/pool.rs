//! Free-list object pool with an explicit reset contract.
//!
//! Every value handed back through [`Pool::release`] is reset before it is
//! stored, so anything pulled out of the pool is indistinguishable from a
//! freshly built value.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Clears all per-use state of a pooled value.
pub trait Reset {
    fn reset(&mut self);
}

impl<T: Reset + ?Sized> Reset for Box<T> {
    fn reset(&mut self) {
        (**self).reset();
    }
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Concurrency-safe free list of reusable values of one type.
pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
    factory: Factory<T>,
    created: AtomicU64,
}

impl<T: Reset> Pool<T> {
    pub fn new(max_idle: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
            factory: Box::new(factory),
            created: AtomicU64::new(0),
        }
    }

    /// Pops an idle value or builds a new one.
    pub fn acquire(&self) -> T {
        self.try_acquire().unwrap_or_else(|| self.create())
    }

    /// Builds a new value, bypassing the idle list.
    pub fn create(&self) -> T {
        self.created.fetch_add(1, Ordering::Relaxed);
        (self.factory)()
    }

    /// Pops an idle value without ever allocating.
    pub fn try_acquire(&self) -> Option<T> {
        self.idle.lock().pop()
    }

    /// Resets `value` and keeps it for reuse. Returns `false` when the pool is
    /// full and the value was dropped instead.
    pub fn release(&self, mut value: T) -> bool {
        value.reset();
        let mut idle = self.idle.lock();
        if idle.len() >= self.max_idle {
            return false;
        }
        idle.push(value);
        true
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Number of values the factory has built so far.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }
}

/// Reset through a shared reference, for values that live behind an `Arc`
/// and use interior mutability.
pub trait SharedReset {
    fn reset_shared(&self);
}

impl<T: SharedReset + ?Sized> Reset for Arc<T> {
    fn reset(&mut self) {
        self.reset_shared();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Scratch {
        buf: Vec<u8>,
        resets: usize,
    }

    impl Reset for Scratch {
        fn reset(&mut self) {
            self.buf.clear();
            self.resets += 1;
        }
    }

    #[test]
    fn acquire_builds_when_empty() {
        let pool: Pool<Scratch> = Pool::new(4, Scratch::default);
        assert!(pool.try_acquire().is_none());

        let scratch = pool.acquire();
        assert!(scratch.buf.is_empty());
        assert_eq!(pool.created(), 1);
    }

    #[test]
    fn release_resets_before_reuse() {
        let pool: Pool<Scratch> = Pool::new(4, Scratch::default);
        let mut scratch = pool.acquire();
        scratch.buf.extend_from_slice(b"leftover");

        assert!(pool.release(scratch));
        assert_eq!(pool.idle(), 1);

        let reused = pool.acquire();
        assert!(reused.buf.is_empty());
        assert_eq!(reused.resets, 1);
        assert_eq!(pool.created(), 1);
    }

    #[test]
    fn release_drops_past_capacity() {
        let pool: Pool<Scratch> = Pool::new(1, Scratch::default);
        let a = pool.acquire();
        let b = pool.acquire();

        assert!(pool.release(a));
        assert!(!pool.release(b));
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn boxed_values_keep_identity() {
        let pool: Pool<Box<Scratch>> = Pool::new(2, || Box::new(Scratch::default()));
        let boxed = pool.acquire();
        let addr = &*boxed as *const Scratch;

        pool.release(boxed);
        let again = pool.acquire();
        assert_eq!(&*again as *const Scratch, addr);
    }

    #[test]
    fn concurrent_acquire_release() {
        let pool = Arc::new(Pool::new(64, Scratch::default));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut scratch = pool.acquire();
                        scratch.buf.push(1);
                        pool.release(scratch);
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert!(pool.idle() <= 64);
        assert!(pool.created() <= 8);
    }
}
