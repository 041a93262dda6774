//! ABA-safe free list with a sentinel.
//!
//! A Michael–Scott queue threaded through the entries themselves: `head`
//! always points at a sentinel, and the list is logically empty when `head`
//! and `tail` name the same entry. Appends go to the tail, pops come from
//! the head. Popping hands out the *old* sentinel and promotes its successor,
//! which works because every entry has the same type.
//!
//! Both ends and every `next` link are [`AtomicTagged`] slots, so a CAS built
//! from a stale snapshot fails even when an entry has been popped and
//! re-appended at the same address.
//!
//! Entries are never returned to the heap while another thread may still be
//! reading them; the registry only frees popped entries while it is alone in
//! the [`ThreadGate`].

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use super::gate::ThreadGate;
use super::tagged::{AtomicTagged, TaggedPtr};

/// Stamp for an entry that was never handed out; always reallocable.
const FRESH: u64 = u64::MAX;

/// Intrusive free-list fields embedded in every entry.
pub struct FreeLink<T> {
    next: AtomicTagged<T>,
    on_freelist: AtomicBool,
    retire_epoch: AtomicU64,
}

impl<T> FreeLink<T> {
    /// Links for an entry that has never been on a list.
    pub fn new() -> Self {
        Self {
            next: AtomicTagged::new(TaggedPtr::NULL),
            on_freelist: AtomicBool::new(false),
            retire_epoch: AtomicU64::new(FRESH),
        }
    }

    /// Returns `true` while the entry sits on a free list.
    #[inline]
    pub fn on_freelist(&self) -> bool {
        self.on_freelist.load(Ordering::Acquire)
    }
}

impl<T> Default for FreeLink<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Types that can sit on a [`FreeList`].
pub trait FreeListEntry: Sized {
    /// The entry's embedded links.
    fn free_link(&self) -> &FreeLink<Self>;
}

/// A lock-free pool of retired entries.
pub struct FreeList<T: FreeListEntry> {
    head: CachePadded<AtomicTagged<T>>,
    tail: CachePadded<AtomicTagged<T>>,
    len: AtomicUsize,
    max_desired_len: usize,
}

// SAFETY: entries are only reached through atomics; ownership of a popped
// entry passes to exactly one thread.
unsafe impl<T: FreeListEntry + Send> Send for FreeList<T> {}
unsafe impl<T: FreeListEntry + Send> Sync for FreeList<T> {}

impl<T: FreeListEntry> FreeList<T> {
    /// Creates a logically empty list around `sentinel`.
    pub fn new(sentinel: Box<T>, max_desired_len: usize) -> Self {
        let sentinel = Box::into_raw(sentinel);
        // SAFETY: freshly boxed, exclusively ours.
        unsafe { (*sentinel).free_link().on_freelist.store(true, Ordering::Relaxed) };
        Self {
            head: CachePadded::new(AtomicTagged::new(TaggedPtr::new(sentinel, 0))),
            tail: CachePadded::new(AtomicTagged::new(TaggedPtr::new(sentinel, 0))),
            len: AtomicUsize::new(0),
            max_desired_len,
        }
    }

    /// Number of entries, excluding the sentinel.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        let head = self.head.load();
        head.ptr() == self.tail.load().ptr() && self.link(head.ptr()).next.load().is_null()
    }

    /// Soft cap on [`len`](Self::len).
    #[inline]
    pub fn max_desired_len(&self) -> usize {
        self.max_desired_len
    }

    #[inline]
    fn link(&self, entry: *mut T) -> &FreeLink<T> {
        // SAFETY: every pointer reachable from `head`/`tail` is an entry this
        // list owns or recently owned; entries leave the heap only while the
        // gate holds no other thread.
        unsafe { (*entry).free_link() }
    }

    /// Appends `entry`, stamped with the epoch at which it became
    /// unreachable. Returns the new length.
    ///
    /// # Safety
    /// `entry` must be a heap entry produced by `Box::into_raw` that the
    /// caller owns exclusively and that is not on any list.
    pub unsafe fn append(&self, entry: NonNull<T>, retire_epoch: u32) -> usize {
        let entry = entry.as_ptr();
        let link = self.link(entry);
        debug_assert!(!link.on_freelist(), "entry appended twice");

        link.retire_epoch.store(u64::from(retire_epoch), Ordering::Relaxed);
        let old = link.next.load();
        link.next.store(old.advance(ptr::null_mut()));
        link.on_freelist.store(true, Ordering::Release);

        loop {
            let tail = self.tail.load();
            let next = self.link(tail.ptr()).next.load();
            if tail != self.tail.load() {
                continue;
            }
            if next.is_null() {
                if self.link(tail.ptr()).next.compare_exchange(next, next.advance(entry)).is_ok() {
                    let _ = self.tail.compare_exchange(tail, tail.advance(entry));
                    break;
                }
            } else {
                // Tail is lagging; help it along.
                let _ = self.tail.compare_exchange(tail, tail.advance(next.ptr()));
            }
        }

        self.len.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Pops the oldest entry if it is reallocable.
    ///
    /// Returns `None` when the list is empty or when its oldest entry was
    /// retired in the current epoch; the caller falls back to the heap.
    pub fn pop(&self, gate: &ThreadGate) -> Option<NonNull<T>> {
        loop {
            let head = self.head.load();
            let tail = self.tail.load();
            let next = self.link(head.ptr()).next.load();
            if head != self.head.load() {
                continue;
            }
            if head.ptr() == tail.ptr() {
                if next.is_null() {
                    return None;
                }
                let _ = self.tail.compare_exchange(tail, tail.advance(next.ptr()));
                continue;
            }
            if next.is_null() {
                continue;
            }

            let stamp = self.link(head.ptr()).retire_epoch.load(Ordering::Acquire);
            if stamp != FRESH && !gate.is_quiescent_since(stamp as u32) {
                return None;
            }

            if self.head.compare_exchange(head, head.advance(next.ptr())).is_ok() {
                self.link(head.ptr()).on_freelist.store(false, Ordering::Release);
                self.len.fetch_sub(1, Ordering::Relaxed);
                // SAFETY: non-null, owned by the list until the CAS above.
                return Some(unsafe { NonNull::new_unchecked(head.ptr()) });
            }
        }
    }
}

impl<T: FreeListEntry> Drop for FreeList<T> {
    fn drop(&mut self) {
        let mut cur = self.head.load().ptr();
        while !cur.is_null() {
            // SAFETY: `&mut self`; every entry from head onward is ours.
            let next = unsafe { (*cur).free_link().next.load().ptr() };
            drop(unsafe { Box::from_raw(cur) });
            cur = next;
        }
    }
}
