//! Type classes: the user-facing description and the shared descriptor.

use core::cell::UnsafeCell;
use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::collections::lfht::Lfht;
use crate::concurrency::freelist::{FreeLink, FreeListEntry};
use crate::handle::{ClassId, Hid, ObjectPtr};

use super::record::Rec;

/// Releases an object when its handle dies.
pub type FreeFn = Arc<dyn Fn(ObjectPtr) -> anyhow::Result<()> + Send + Sync>;

/// Produces the real handle a future adopts.
///
/// Called with the placeholder object and the handle linked by `link_real`;
/// returns the handle whose object the future takes over. Must tolerate
/// being called again after it has failed.
pub type RealizeFn = Arc<dyn Fn(ObjectPtr, Hid) -> anyhow::Result<Hid> + Send + Sync>;

/// Disposes of a future's placeholder object.
pub type DiscardFn = Arc<dyn Fn(ObjectPtr) -> anyhow::Result<()> + Send + Sync>;

bitflags::bitflags! {
    /// Per-class options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ClassFlags: u32 {
        /// The free callback is thread-safe and never needs the outer mutex.
        const THREAD_SAFE_FREE = 1 << 0;
        /// Callbacks of this class run with the outer mutex held.
        const NEEDS_OUTER_MUTEX = 1 << 1;
    }
}

/// Everything `register_class` needs to know about a new class.
///
/// ```rust
/// use std::sync::Arc;
/// use idreg::{ClassFlags, ClassSpec};
///
/// let spec = ClassSpec::new()
///     .free_fn(Arc::new(|_obj| Ok(())))
///     .reserved(8)
///     .flags(ClassFlags::THREAD_SAFE_FREE);
/// assert_eq!(spec.reserved, 8);
/// ```
#[derive(Clone, Default)]
pub struct ClassSpec {
    /// Called on each object whose handle is freed. `None` frees nothing.
    pub free_fn: Option<FreeFn>,
    /// Leading serials skipped; the first handle gets serial `reserved`.
    pub reserved: u64,
    /// Callback locking behaviour.
    pub flags: ClassFlags,
}

impl ClassSpec {
    /// A class with no free callback, no reserved serials and no flags.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the free callback.
    pub fn free_fn(mut self, f: FreeFn) -> Self {
        self.free_fn = Some(f);
        self
    }

    /// Sets the number of leading serials to skip.
    pub fn reserved(mut self, reserved: u64) -> Self {
        self.reserved = reserved;
        self
    }

    /// Sets the class flags.
    pub fn flags(mut self, flags: ClassFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl fmt::Debug for ClassSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassSpec")
            .field("free_fn", &self.free_fn.as_ref().map(|_| "<fn>"))
            .field("reserved", &self.reserved)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Shared state of one live class.
pub(crate) struct ClassDesc {
    id: AtomicU32,
    spec: UnsafeCell<ClassSpec>,
    pub init_count: AtomicU32,
    pub live_count: AtomicU64,
    pub next_serial: AtomicU64,
    pub mru: AtomicPtr<Rec>,
    pub torn_down: AtomicBool,
    pub table: Lfht<Rec>,
    free_link: FreeLink<ClassDesc>,
}

// SAFETY: `spec` is written only in `init`, while the descriptor is
// unreachable by other threads. Everything else is atomic.
unsafe impl Send for ClassDesc {}
unsafe impl Sync for ClassDesc {}

impl ClassDesc {
    pub fn blank(buckets: usize) -> Self {
        Self {
            id: AtomicU32::new(0),
            spec: UnsafeCell::new(ClassSpec::default()),
            init_count: AtomicU32::new(0),
            live_count: AtomicU64::new(0),
            next_serial: AtomicU64::new(0),
            mru: AtomicPtr::new(ptr::null_mut()),
            torn_down: AtomicBool::new(false),
            table: Lfht::new(buckets),
            free_link: FreeLink::new(),
        }
    }

    /// Prepares the descriptor for a new incarnation of class `id`.
    ///
    /// # Safety
    /// The caller must own the descriptor exclusively.
    pub unsafe fn init(&self, id: ClassId, spec: ClassSpec, first_serial: u64) {
        self.id.store(u32::from(id.0), Ordering::Relaxed);
        *self.spec.get() = spec;
        self.init_count.store(1, Ordering::Relaxed);
        self.live_count.store(0, Ordering::Relaxed);
        self.next_serial.store(first_serial, Ordering::Relaxed);
        self.mru.store(ptr::null_mut(), Ordering::Relaxed);
        self.torn_down.store(false, Ordering::Relaxed);
        self.table.reset();
    }

    #[inline]
    pub fn id(&self) -> ClassId {
        ClassId(self.id.load(Ordering::Relaxed) as u8)
    }

    #[inline]
    pub fn spec(&self) -> &ClassSpec {
        // SAFETY: see the `Sync` impl.
        unsafe { &*self.spec.get() }
    }

    #[inline]
    pub fn flags(&self) -> ClassFlags {
        self.spec().flags
    }
}

impl FreeListEntry for ClassDesc {
    #[inline]
    fn free_link(&self) -> &FreeLink<Self> {
        &self.free_link
    }
}
