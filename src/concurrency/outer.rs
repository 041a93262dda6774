//! Outer-mutex bookkeeping.
//!
//! The outer mutex belongs to the collaborators around the registry, not to
//! the registry itself. The registry only needs to know whether the calling
//! thread holds it, so that a callback running under a record's
//! do-not-disturb bit can re-enter the registry on that same record.
//! Callers announce ownership with [`hold`]; classes flagged
//! `NEEDS_OUTER_MUTEX` make the registry take a configured [`OuterMutex`]
//! around their callbacks.

use core::cell::Cell;
use core::marker::PhantomData;

thread_local! {
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// A recursive mutex supplied by the embedding library.
pub trait OuterMutex: Send + Sync {
    /// Blocks until the calling thread owns the mutex.
    fn lock(&self);
    /// Releases one level of ownership.
    fn unlock(&self);
}

/// Returns `true` if the calling thread has announced outer-mutex ownership.
#[inline]
pub fn held() -> bool {
    DEPTH.with(|d| d.get() > 0)
}

/// Announces that the calling thread holds the outer mutex until the
/// returned value is dropped.
///
/// The registry does not lock anything here; it trusts the announcement.
pub fn hold() -> OuterHeld {
    DEPTH.with(|d| d.set(d.get() + 1));
    OuterHeld { _not_send: PhantomData }
}

/// Ownership announcement returned by [`hold`]. Not `Send`.
#[must_use = "the announcement ends when this value is dropped"]
pub struct OuterHeld {
    _not_send: PhantomData<*const ()>,
}

impl Drop for OuterHeld {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get() - 1));
    }
}

/// An outer mutex actually locked by the registry.
pub(crate) struct OuterLock<'a> {
    mutex: &'a dyn OuterMutex,
    _held: OuterHeld,
}

impl<'a> OuterLock<'a> {
    pub(crate) fn acquire(mutex: &'a dyn OuterMutex) -> Self {
        mutex.lock();
        Self { mutex, _held: hold() }
    }
}

impl Drop for OuterLock<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn announcements_nest() {
        assert!(!held());
        let a = hold();
        let b = hold();
        assert!(held());
        drop(b);
        assert!(held());
        drop(a);
        assert!(!held());
    }

    #[test]
    fn not_visible_on_other_threads() {
        let _h = hold();
        std::thread::spawn(|| assert!(!held())).join().unwrap();
    }

    struct Counting(AtomicU32);

    impl OuterMutex for Counting {
        fn lock(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn unlock(&self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn outer_lock_pairs_calls() {
        let m = Counting(AtomicU32::new(0));
        {
            let _l = OuterLock::acquire(&m);
            assert_eq!(m.0.load(Ordering::SeqCst), 1);
            assert!(held());
        }
        assert_eq!(m.0.load(Ordering::SeqCst), 0);
        assert!(!held());
    }
}
