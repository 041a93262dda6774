//! Per-handle records.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::collections::lfht::LfhtEntry;
use crate::concurrency::freelist::{FreeLink, FreeListEntry};
use crate::handle::Hid;

use super::class::{DiscardFn, RealizeFn};
use super::kernel::{AtomicKernel, Kernel};

/// Callbacks a future record carries until it is realized or disposed.
#[derive(Clone)]
pub(crate) struct FutureHooks {
    pub realize: RealizeFn,
    pub discard: DiscardFn,
}

/// Registry bookkeeping for one handle.
///
/// A record moves through `live → marked → on free list → reused`. Its
/// memory is only returned to the heap by the maintenance pass, once no
/// thread can still hold a reference obtained while it was live.
pub(crate) struct Rec {
    id: AtomicU64,
    pub kernel: AtomicKernel,
    hooks: UnsafeCell<Option<FutureHooks>>,
    real_id: AtomicU64,
    pinned_real: AtomicBool,
    lfht_link: AtomicUsize,
    free_link: FreeLink<Rec>,
}

// SAFETY: `hooks` is written only in `init`, while the record is unreachable
// by other threads, and read-only afterwards. Everything else is atomic.
unsafe impl Send for Rec {}
unsafe impl Sync for Rec {}

impl Rec {
    pub fn blank() -> Self {
        Self {
            id: AtomicU64::new(Hid::INVALID.0),
            kernel: AtomicKernel::new(Kernel::default()),
            hooks: UnsafeCell::new(None),
            real_id: AtomicU64::new(Hid::INVALID.0),
            pinned_real: AtomicBool::new(false),
            lfht_link: AtomicUsize::new(0),
            free_link: FreeLink::new(),
        }
    }

    /// Prepares the record to be published under `id`.
    ///
    /// # Safety
    /// The caller must own the record exclusively: freshly allocated, or
    /// popped from the free list as reallocable.
    pub unsafe fn init(&self, id: Hid, kernel: Kernel, hooks: Option<FutureHooks>) {
        debug_assert!(!self.free_link.on_freelist());
        self.id.store(id.0, Ordering::Relaxed);
        self.kernel.store(kernel);
        *self.hooks.get() = hooks;
        self.real_id.store(Hid::INVALID.0, Ordering::Relaxed);
        self.pinned_real.store(false, Ordering::Relaxed);
        self.lfht_link.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn id(&self) -> Hid {
        Hid(self.id.load(Ordering::Acquire))
    }

    /// The future callbacks, if this record was registered as a future.
    pub fn hooks(&self) -> Option<FutureHooks> {
        // SAFETY: see the `Sync` impl.
        unsafe { (*self.hooks.get()).clone() }
    }

    pub fn real_id(&self) -> Hid {
        Hid(self.real_id.load(Ordering::Acquire))
    }

    pub fn set_real_id(&self, real: Hid) {
        self.real_id.store(real.0, Ordering::Release);
    }

    pub fn set_pinned(&self, pinned: bool) {
        self.pinned_real.store(pinned, Ordering::Release);
    }

    /// Clears the pin flag, returning the pinned real handle if there was one.
    pub fn take_pin(&self) -> Option<Hid> {
        self.pinned_real.swap(false, Ordering::AcqRel).then(|| self.real_id())
    }
}

const _: () = assert!(core::mem::align_of::<Rec>() >= 2);

// SAFETY: `lfht_link` is used only by the class table; alignment is checked above.
unsafe impl LfhtEntry for Rec {
    #[inline]
    fn lfht_key(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    #[inline]
    fn lfht_link(&self) -> &AtomicUsize {
        &self.lfht_link
    }
}

impl FreeListEntry for Rec {
    #[inline]
    fn free_link(&self) -> &FreeLink<Self> {
        &self.free_link
    }
}
