//! The record kernel and its two mutation disciplines.
//!
//! Everything about a record that must change together lives in one
//! [`Kernel`] value replaced by compare-and-swap on an [`AtomicKernel`].
//!
//! *Rollback-able* changes ([`AtomicKernel::mutate`]) compute a new kernel
//! locally and CAS it in, retrying immediately on a lost race.
//!
//! *Non-rollback-able* changes run a user callback, which cannot be retried
//! blindly. They first take the kernel's `DO_NOT_DISTURB` bit
//! ([`AtomicKernel::acquire_dnd`]), run the callback, and publish the result
//! through the returned [`DndGuard`]. Other threads that find the bit set
//! yield until it clears. The thread holding the bit may re-enter when it
//! also holds the outer mutex, which the `OWNER_HAS_OUTER_MUTEX` bit records.

use crossbeam_utils::atomic::AtomicCell;
use crossbeam_utils::Backoff;

use crate::concurrency::outer;
use crate::error::{IdError, Result};
use crate::handle::{Hid, ObjectPtr};
use crate::stats::RegistryStats;

bitflags::bitflags! {
    /// State bits of a [`Kernel`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KernelFlags: u32 {
        /// Logically deleted. Never cleared.
        const MARKED = 1 << 0;
        /// Created by `register_future`.
        const IS_FUTURE = 1 << 1;
        /// A real handle has been linked to this future.
        const REAL_DEFINED = 1 << 2;
        /// A `link_real` is writing the real handle.
        const REAL_LINK_IN_PROGRESS = 1 << 3;
        /// The future now holds the real object.
        const FUTURE_REALIZED = 1 << 4;
        /// The placeholder object was discarded successfully.
        const FUTURE_DISCARDED = 1 << 5;
        /// A non-rollback-able callback is running on this record.
        const DO_NOT_DISTURB = 1 << 6;
        /// The `DO_NOT_DISTURB` holder also holds the outer mutex.
        const OWNER_HAS_OUTER_MUTEX = 1 << 7;
        /// The last reference was dropped from inside the holder's own
        /// callback; the holder deletes the record when it lets go.
        const RELEASE_PENDING = 1 << 8;
    }
}

/// Mutable heart of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Kernel {
    pub object: ObjectPtr,
    pub ref_count: u32,
    pub app_ref: u32,
    pub flags: KernelFlags,
}

impl Kernel {
    /// The kernel a fresh record starts with.
    pub fn initial(object: ObjectPtr, app: bool, future: bool) -> Self {
        let mut flags = KernelFlags::empty();
        flags.set(KernelFlags::IS_FUTURE, future);
        Self { object, ref_count: 1, app_ref: u32::from(app), flags }
    }

    /// Logically deleted.
    #[inline(always)]
    pub fn is_marked(&self) -> bool {
        self.flags.contains(KernelFlags::MARKED)
    }

    /// Deleted, or about to be by the do-not-disturb holder.
    #[inline]
    pub fn is_gone(&self) -> bool {
        self.flags.intersects(KernelFlags::MARKED | KernelFlags::RELEASE_PENDING)
    }

    /// A future that still holds its placeholder.
    #[inline]
    pub fn is_unrealized_future(&self) -> bool {
        self.flags.contains(KernelFlags::IS_FUTURE)
            && !self.flags.contains(KernelFlags::FUTURE_REALIZED)
    }

    /// `true` if another thread holds `DO_NOT_DISTURB`.
    #[inline]
    fn disturbed_by_other(&self) -> bool {
        self.flags.contains(KernelFlags::DO_NOT_DISTURB) && !self.held_by_current()
    }

    /// `true` if the calling thread holds `DO_NOT_DISTURB`.
    ///
    /// Only outer-mutex owners can be recognised; the outer mutex is
    /// exclusive, so an owner that also holds the bit is this thread.
    #[inline]
    fn held_by_current(&self) -> bool {
        self.flags
            .contains(KernelFlags::DO_NOT_DISTURB | KernelFlags::OWNER_HAS_OUTER_MUTEX)
            && outer::held()
    }
}

/// A [`Kernel`] replaced as a whole by compare-and-swap.
pub struct AtomicKernel {
    cell: AtomicCell<Kernel>,
}

/// Outcome of [`AtomicKernel::acquire_dnd`].
pub enum Acquire<'k> {
    /// The bit is ours; the kernel is as it was just before we took it.
    Held(DndGuard<'k>, Kernel),
    /// This thread already holds the bit further up the stack.
    Recursive(Kernel),
    /// The predicate no longer holds; nothing was changed.
    Declined(Kernel),
}

impl AtomicKernel {
    /// Wraps `kernel`.
    pub fn new(kernel: Kernel) -> Self {
        Self { cell: AtomicCell::new(kernel) }
    }

    /// A plain snapshot; may observe a disturbed kernel.
    #[inline]
    pub fn load(&self) -> Kernel {
        self.cell.load()
    }

    /// Overwrites the kernel. Only for records no other thread can reach.
    pub fn store(&self, kernel: Kernel) {
        self.cell.store(kernel);
    }

    /// Rollback-able mutation.
    ///
    /// `f` sees the current kernel and returns the replacement together
    /// with the operation's result. Returning the kernel unchanged skips the
    /// CAS, so `f` doubles as a consistent read. Fails with `NoSuchId` once
    /// the record is marked or its release is pending.
    pub fn mutate<T>(
        &self,
        id: Hid,
        stats: &RegistryStats,
        mut f: impl FnMut(Kernel) -> Result<(Kernel, T)>,
    ) -> Result<T> {
        let backoff = Backoff::new();
        loop {
            let current = self.cell.load();
            if current.is_gone() {
                return Err(IdError::NoSuchId(id));
            }
            if current.disturbed_by_other() {
                RegistryStats::bump(&stats.dnd_yields);
                backoff.snooze();
                continue;
            }
            let (next, out) = f(current)?;
            if next == current {
                return Ok(out);
            }
            debug_assert!(next.app_ref <= next.ref_count, "app_ref exceeds ref");
            if self.cell.compare_exchange(current, next).is_ok() {
                return Ok(out);
            }
            RegistryStats::bump(&stats.kernel_cas_retries);
        }
    }

    /// A consistent read that waits out other threads' callbacks.
    pub fn read(&self, id: Hid, stats: &RegistryStats) -> Result<Kernel> {
        self.mutate(id, stats, |k| Ok((k, k)))
    }

    /// Takes `DO_NOT_DISTURB` if `pending` holds for the current kernel.
    ///
    /// Callers that need the outer mutex must take it before calling, so
    /// the owner bit is recorded correctly.
    pub fn acquire_dnd(
        &self,
        id: Hid,
        stats: &RegistryStats,
        pending: impl Fn(&Kernel) -> bool,
    ) -> Result<Acquire<'_>> {
        let backoff = Backoff::new();
        loop {
            let current = self.cell.load();
            if current.is_gone() {
                return Err(IdError::NoSuchId(id));
            }
            if current.flags.contains(KernelFlags::DO_NOT_DISTURB) {
                if current.held_by_current() {
                    RegistryStats::bump(&stats.dnd_recursions);
                    return Ok(Acquire::Recursive(current));
                }
                RegistryStats::bump(&stats.dnd_yields);
                backoff.snooze();
                continue;
            }
            if !pending(&current) {
                return Ok(Acquire::Declined(current));
            }

            let mut next = current;
            next.flags.insert(KernelFlags::DO_NOT_DISTURB);
            next.flags.set(KernelFlags::OWNER_HAS_OUTER_MUTEX, outer::held());
            if self.cell.compare_exchange(current, next).is_ok() {
                return Ok(Acquire::Held(DndGuard { kernel: self, armed: true }, current));
            }
            RegistryStats::bump(&stats.kernel_cas_retries);
            backoff.snooze();
        }
    }

    #[inline]
    fn compare_exchange(&self, current: Kernel, new: Kernel) -> bool {
        self.cell.compare_exchange(current, new).is_ok()
    }
}

/// Ownership of a kernel's `DO_NOT_DISTURB` bit.
///
/// Dropping the guard without calling [`release_with`](Self::release_with)
/// clears the bit and leaves every other field as the holder last set it,
/// which is how a failed callback rolls back.
#[must_use = "dropping the guard releases the bit immediately"]
pub struct DndGuard<'k> {
    kernel: &'k AtomicKernel,
    armed: bool,
}

impl DndGuard<'_> {
    /// The kernel as it stands, bit included.
    pub fn peek(&self) -> Kernel {
        self.kernel.load()
    }

    /// Applies `f` while keeping the bit. Returns the kernel before `f`.
    pub fn update(&self, f: impl FnOnce(&mut Kernel)) -> Kernel {
        self.swap(f, false)
    }

    /// Applies `f` and clears the bit. Returns the kernel before `f`.
    pub fn release_with(mut self, f: impl FnOnce(&mut Kernel)) -> Kernel {
        self.armed = false;
        self.swap(f, true)
    }

    fn swap(&self, f: impl FnOnce(&mut Kernel), release: bool) -> Kernel {
        // Other threads only ever read a disturbed kernel; re-entry from this
        // thread has already finished by the time we get here.
        let current = self.kernel.load();
        assert!(
            current.flags.contains(KernelFlags::DO_NOT_DISTURB),
            "do-not-disturb bit lost while held"
        );
        let mut next = current;
        f(&mut next);
        if release {
            next.flags
                .remove(KernelFlags::DO_NOT_DISTURB | KernelFlags::OWNER_HAS_OUTER_MUTEX);
        } else {
            next.flags.insert(KernelFlags::DO_NOT_DISTURB);
        }
        assert!(
            self.kernel.compare_exchange(current, next),
            "kernel changed under do-not-disturb"
        );
        current
    }
}

impl Drop for DndGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.swap(|_| {}, true);
        }
    }
}
