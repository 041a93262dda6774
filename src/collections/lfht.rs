//! `Lfht`: a lock-free, intrusive hash table keyed by `u64`.
//!
//! Each bucket is a singly linked list threaded through the entries' own
//! link words. The low bit of an entry's link is its *removed* mark.
//!
//! - Insert pushes at the bucket head with one CAS.
//! - Lookup and iteration never write; they skip marked entries.
//! - Removal is two-phase: [`Lfht::mark`] sets the entry's mark bit (one
//!   winner), then the winner calls [`Lfht::unlink_if_marked`] to splice it
//!   out of its predecessor. Only the marker unlinks, so each entry is
//!   unlinked exactly once and the caller knows when it may be retired.
//!
//! The table never frees entries. Callers guarantee that an unlinked entry
//! stays readable until every thread that could have reached it is gone.
//! Entries always point at older entries, so a traversal that wanders onto
//! an unlinked entry still terminates.

use core::marker::PhantomData;
use core::ops::ControlFlow;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::Backoff;

const MARK: usize = 1;

/// Entries stored in an [`Lfht`].
///
/// # Safety
/// `lfht_link` must always return the same word, used by no one but the
/// table, and entries must be at least 2-byte aligned.
pub unsafe trait LfhtEntry {
    /// The entry's key; must not change while the entry is in a table.
    fn lfht_key(&self) -> u64;
    /// Successor address, with the low bit as the deletion mark.
    fn lfht_link(&self) -> &AtomicUsize;
}

/// Reasons an insert is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// [`Lfht::clear`] has been called.
    Cleared,
    /// An unmarked entry with the same key is present.
    Duplicate,
}

/// A lock-free hash table of `E` entries.
pub struct Lfht<E> {
    buckets: Box<[AtomicUsize]>,
    mask: u64,
    cleared: AtomicBool,
    inserters: AtomicUsize,
    _marker: PhantomData<*const E>,
}

// SAFETY: the table only stores addresses and touches entries through their
// atomic link words.
unsafe impl<E: LfhtEntry + Sync> Send for Lfht<E> {}
unsafe impl<E: LfhtEntry + Sync> Sync for Lfht<E> {}

#[inline(always)]
fn addr<E>(entry: &E) -> usize {
    entry as *const E as usize
}

#[inline(always)]
unsafe fn node<'a, E>(word: usize) -> &'a E {
    &*((word & !MARK) as *const E)
}

impl<E: LfhtEntry> Lfht<E> {
    /// Creates a table with `buckets` buckets (rounded up to a power of two).
    pub fn new(buckets: usize) -> Self {
        let n = buckets.max(1).next_power_of_two();
        Self {
            buckets: (0..n).map(|_| AtomicUsize::new(0)).collect(),
            mask: (n - 1) as u64,
            cleared: AtomicBool::new(false),
            inserters: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn bucket(&self, key: u64) -> &AtomicUsize {
        let mut h = key ^ (key >> 31);
        h = h.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        h ^= h >> 29;
        &self.buckets[(h & self.mask) as usize]
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Publishes `entry` under its key.
    ///
    /// The entry must not currently be linked into any table.
    pub fn insert(&self, entry: &E) -> Result<(), InsertError> {
        self.inserters.fetch_add(1, Ordering::SeqCst);
        let result = self.insert_inner(entry);
        self.inserters.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn insert_inner(&self, entry: &E) -> Result<(), InsertError> {
        if self.cleared.load(Ordering::SeqCst) {
            return Err(InsertError::Cleared);
        }
        let key = entry.lfht_key();
        let slot = self.bucket(key);
        loop {
            let head = slot.load(Ordering::Acquire);
            if self.find_from(head, key).is_some() {
                return Err(InsertError::Duplicate);
            }
            entry.lfht_link().store(head, Ordering::Relaxed);
            if slot
                .compare_exchange(head, addr(entry), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    fn find_from(&self, mut cur: usize, key: u64) -> Option<NonNull<E>> {
        while cur != 0 {
            // SAFETY: reachable entries stay readable (type-level contract).
            let e = unsafe { node::<E>(cur) };
            let next = e.lfht_link().load(Ordering::Acquire);
            if next & MARK == 0 && e.lfht_key() == key {
                return Some(NonNull::from(e));
            }
            cur = next & !MARK;
        }
        None
    }

    /// Finds the unmarked entry stored under `key`.
    pub fn lookup(&self, key: u64) -> Option<NonNull<E>> {
        self.find_from(self.bucket(key).load(Ordering::Acquire), key)
    }

    /// Sets the removed mark on `entry`. Returns `true` for the one caller
    /// that made the transition.
    pub fn mark(&self, entry: &E) -> bool {
        entry.lfht_link().fetch_or(MARK, Ordering::AcqRel) & MARK == 0
    }

    /// Physically removes a marked `entry`.
    ///
    /// Returns `false` if the entry is not marked or cannot be found.
    pub fn unlink_if_marked(&self, entry: &E) -> bool {
        if entry.lfht_link().load(Ordering::Acquire) & MARK == 0 {
            return false;
        }
        let target = addr(entry);
        let slot = self.bucket(entry.lfht_key());
        let backoff = Backoff::new();

        'search: loop {
            let mut prev: &AtomicUsize = slot;
            let mut cur = prev.load(Ordering::Acquire);
            while cur & !MARK != 0 {
                if cur & !MARK == target {
                    if cur & MARK != 0 {
                        // Our predecessor is itself being removed; wait for
                        // its remover to splice it out, then look again.
                        backoff.snooze();
                        continue 'search;
                    }
                    let succ = entry.lfht_link().load(Ordering::Acquire) & !MARK;
                    if prev
                        .compare_exchange(target, succ, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                    continue 'search;
                }
                // SAFETY: reachable entries stay readable.
                let e = unsafe { node::<E>(cur) };
                prev = e.lfht_link();
                cur = prev.load(Ordering::Acquire);
            }
            return false;
        }
    }

    /// Visits every unmarked entry.
    ///
    /// Not a snapshot: entries inserted during the walk may or may not be
    /// seen, and an entry is skipped once its mark is set.
    pub fn for_each<B>(&self, mut f: impl FnMut(NonNull<E>) -> ControlFlow<B>) -> ControlFlow<B> {
        for slot in self.buckets.iter() {
            let mut cur = slot.load(Ordering::Acquire);
            while cur & !MARK != 0 {
                // SAFETY: reachable entries stay readable.
                let e = unsafe { node::<E>(cur) };
                let next = e.lfht_link().load(Ordering::Acquire);
                if next & MARK == 0 {
                    f(NonNull::from(e))?;
                }
                // Re-read: `f` may have removed `e`.
                cur = e.lfht_link().load(Ordering::Acquire) & !MARK;
            }
        }
        ControlFlow::Continue(())
    }

    /// Blocks all further inserts and waits out inserts already in flight.
    pub fn clear(&self) {
        self.cleared.store(true, Ordering::SeqCst);
        let backoff = Backoff::new();
        while self.inserters.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }
    }

    /// Returns `true` once [`clear`](Self::clear) has been called.
    pub fn is_cleared(&self) -> bool {
        self.cleared.load(Ordering::Acquire)
    }

    /// Returns `true` if no entry, marked or not, is linked.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.load(Ordering::Acquire) == 0)
    }

    /// Returns the table to its freshly built state.
    ///
    /// Only for a table no other thread can reach.
    pub fn reset(&self) {
        for b in self.buckets.iter() {
            b.store(0, Ordering::Relaxed);
        }
        self.inserters.store(0, Ordering::Relaxed);
        self.cleared.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct Item {
        key: u64,
        link: AtomicUsize,
    }

    unsafe impl LfhtEntry for Item {
        fn lfht_key(&self) -> u64 {
            self.key
        }
        fn lfht_link(&self) -> &AtomicUsize {
            &self.link
        }
    }

    fn items(n: u64) -> Vec<Item> {
        (0..n).map(|key| Item { key, link: AtomicUsize::new(0) }).collect()
    }

    fn count(t: &Lfht<Item>) -> usize {
        let mut n = 0;
        let _ = t.for_each::<()>(|_| {
            n += 1;
            ControlFlow::Continue(())
        });
        n
    }

    #[test]
    fn insert_lookup_remove() {
        let table = Lfht::new(4);
        let items = items(32);
        for it in &items {
            table.insert(it).unwrap();
        }
        assert_eq!(table.insert(&Item { key: 3, link: AtomicUsize::new(0) }), Err(InsertError::Duplicate));
        assert_eq!(count(&table), 32);

        for it in items.iter().filter(|it| it.key % 2 == 0) {
            assert!(table.mark(it));
            assert!(!table.mark(it));
            assert!(table.lookup(it.key).is_none());
            assert!(table.unlink_if_marked(it));
            assert!(!table.unlink_if_marked(it));
        }
        assert_eq!(count(&table), 16);
        assert_eq!(table.lookup(5).map(|p| unsafe { p.as_ref() }.key), Some(5));
    }

    #[test]
    fn clear_blocks_inserts() {
        let table = Lfht::new(8);
        let items = items(2);
        table.insert(&items[0]).unwrap();
        table.clear();
        assert!(table.is_cleared());
        assert_eq!(table.insert(&items[1]), Err(InsertError::Cleared));
        assert!(table.lookup(0).is_some());
    }

    #[test]
    fn marked_entries_skipped_during_walk() {
        let table = Lfht::new(1);
        let items = items(8);
        for it in &items {
            table.insert(it).unwrap();
        }
        let mut seen = Vec::new();
        let _ = table.for_each::<()>(|p| {
            let it = unsafe { p.as_ref() };
            seen.push(it.key);
            // Remove the next-older entry before the walk reaches it.
            if it.key > 0 {
                let older = &items[(it.key - 1) as usize];
                if table.mark(older) {
                    table.unlink_if_marked(older);
                }
            }
            ControlFlow::Continue(())
        });
        // Head-insertion puts 7 first; every other entry is removed ahead of the walk.
        assert_eq!(seen, vec![7, 5, 3, 1]);
    }

    #[test]
    fn concurrent_insert_and_remove() {
        let table = Lfht::new(16);
        let items = items(4000);
        thread::scope(|s| {
            for chunk in items.chunks(1000) {
                let table = &table;
                s.spawn(move || {
                    for it in chunk {
                        table.insert(it).unwrap();
                    }
                    for it in chunk.iter().filter(|it| it.key % 3 == 0) {
                        assert!(table.mark(it));
                        assert!(table.unlink_if_marked(it));
                    }
                });
            }
        });
        let expected = items.iter().filter(|it| it.key % 3 != 0).count();
        assert_eq!(count(&table), expected);
    }
}
