//! ABA-safe `(pointer, serial)` pairs.
//!
//! Every successful update bumps the serial, so a compare-and-swap against a
//! stale snapshot fails even if the pointer has come back to the same
//! address. The pair is 128 bits wide, wider than any atomic `AtomicCell`
//! maps natively, so it goes through crossbeam's striped sequence locks.

use core::fmt;
use core::ptr;

use crossbeam_utils::atomic::AtomicCell;

/// A pointer paired with a monotonically increasing serial.
pub struct TaggedPtr<T> {
    ptr: *mut T,
    serial: u64,
}

impl<T> TaggedPtr<T> {
    /// Null pointer, serial zero.
    pub const NULL: Self = Self { ptr: ptr::null_mut(), serial: 0 };

    /// Pairs `ptr` with `serial`.
    #[inline(always)]
    pub fn new(ptr: *mut T, serial: u64) -> Self {
        Self { ptr, serial }
    }

    /// The pointer half.
    #[inline(always)]
    pub fn ptr(self) -> *mut T {
        self.ptr
    }

    /// The serial half.
    #[inline(always)]
    pub fn serial(self) -> u64 {
        self.serial
    }

    /// `true` if the pointer half is null.
    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.ptr.is_null()
    }

    /// The value that replaces `self` when the slot is pointed at `ptr`.
    #[inline(always)]
    pub fn advance(self, ptr: *mut T) -> Self {
        Self { ptr, serial: self.serial.wrapping_add(1) }
    }
}

impl<T> Clone for TaggedPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TaggedPtr<T> {}

impl<T> PartialEq for TaggedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.ptr, other.ptr) && self.serial == other.serial
    }
}

impl<T> Eq for TaggedPtr<T> {}

impl<T> fmt::Debug for TaggedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaggedPtr({:p}, serial={})", self.ptr, self.serial)
    }
}

// SAFETY: a tagged pointer is plain data; whoever dereferences it is
// responsible for the pointee's lifetime.
unsafe impl<T> Send for TaggedPtr<T> {}

/// An atomic slot holding a [`TaggedPtr`].
pub struct AtomicTagged<T> {
    cell: AtomicCell<TaggedPtr<T>>,
}

impl<T> AtomicTagged<T> {
    pub fn new(value: TaggedPtr<T>) -> Self {
        Self { cell: AtomicCell::new(value) }
    }

    #[inline]
    pub fn load(&self) -> TaggedPtr<T> {
        self.cell.load()
    }

    /// Unconditional store. Only for slots no other thread can CAS.
    #[inline]
    pub fn store(&self, value: TaggedPtr<T>) {
        self.cell.store(value);
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: TaggedPtr<T>,
        new: TaggedPtr<T>,
    ) -> Result<TaggedPtr<T>, TaggedPtr<T>> {
        self.cell.compare_exchange(current, new)
    }
}
