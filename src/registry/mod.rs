//! The identifier registry.
//!
//! A [`Registry`] owns a fixed array of class slots, one lock-free table per
//! live class, and two free lists (records and class descriptors). Every
//! public operation runs inside the registry's [`ThreadGate`]; memory that
//! an operation unlinks is parked on a free list and only reused or freed
//! after the gate has been empty at least once.
//!
//! The operations themselves live in submodules:
//!
//! - [`ops`]: record operations (`register`, `lookup`, reference counts …)
//! - [`future`]: future handles and their realization
//! - [`class_ops`]: class lifecycle, clears and statistics

pub mod class;
pub(crate) mod kernel;

mod class_ops;
mod future;
mod ops;
mod record;

use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_utils::CachePadded;

use crate::concurrency::freelist::{FreeList, FreeListEntry};
use crate::concurrency::gate::{GateGuard, ThreadGate};
use crate::concurrency::outer::{self, OuterLock, OuterMutex};
use crate::config::{ConfigError, RegistryConfig};
use crate::error::{IdError, Result};
use crate::handle::{ClassId, Hid, MAX_CLASSES};
use crate::stats::RegistryStats;

use class::{ClassDesc, ClassFlags, ClassSpec};
use kernel::{DndGuard, Kernel};
use record::{FutureHooks, Rec};

pub use kernel::KernelFlags;

/// A multi-thread identifier registry.
///
/// Most programs use the process-wide instance from [`Registry::global`];
/// separate instances are independent and mainly useful in tests.
///
/// ```rust
/// use idreg::{ClassSpec, ObjectPtr, Registry, RegistryConfig};
///
/// let reg = Registry::new(RegistryConfig::default()).unwrap();
/// let class = reg.register_class(ClassSpec::new()).unwrap();
/// let obj = ObjectPtr::from_addr(0x1000);
/// let h = reg.register(class, obj, true).unwrap();
/// assert_eq!(reg.lookup(h, class).unwrap(), obj);
/// assert_eq!(reg.dec_ref(h, false).unwrap(), 0);
/// assert!(reg.lookup(h, class).is_err());
/// ```
pub struct Registry {
    config: RegistryConfig,
    gate: ThreadGate,
    class_slot: [AtomicPtr<ClassDesc>; MAX_CLASSES],
    class_allocated: [AtomicBool; MAX_CLASSES],
    marking: [AtomicU32; MAX_CLASSES],
    /// First serial a new incarnation of each index may hand out.
    serial_floor: [AtomicU64; MAX_CLASSES],
    next_class: CachePadded<AtomicUsize>,
    rec_fl: FreeList<Rec>,
    class_fl: FreeList<ClassDesc>,
    outer_mutex: Option<Arc<dyn OuterMutex>>,
    stats: RegistryStats,
}

impl Registry {
    /// Builds a registry.
    pub fn new(config: RegistryConfig) -> core::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    /// Builds a registry that takes `mutex` around callbacks of classes
    /// flagged [`ClassFlags::NEEDS_OUTER_MUTEX`].
    pub fn with_outer_mutex(
        config: RegistryConfig,
        mutex: Arc<dyn OuterMutex>,
    ) -> core::result::Result<Self, ConfigError> {
        let mut reg = Self::new(config)?;
        reg.outer_mutex = Some(mutex);
        Ok(reg)
    }

    /// The process-wide registry, configured from `IDREG_*` variables on
    /// first use.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            Registry::new(RegistryConfig::from_env()).unwrap_or_else(|err| {
                tracing::warn!(error = %err, "falling back to default registry configuration");
                Registry::default()
            })
        })
    }

    /// The options this registry was built with.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn build(config: RegistryConfig) -> Self {
        Self {
            gate: ThreadGate::new(),
            class_slot: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            class_allocated: core::array::from_fn(|_| AtomicBool::new(false)),
            marking: core::array::from_fn(|_| AtomicU32::new(0)),
            serial_floor: core::array::from_fn(|_| AtomicU64::new(0)),
            next_class: CachePadded::new(AtomicUsize::new(1)),
            rec_fl: FreeList::new(Box::new(Rec::blank()), config.max_desired_rec_fl_len),
            class_fl: FreeList::new(
                Box::new(ClassDesc::blank(config.lfht_buckets)),
                config.max_desired_class_fl_len,
            ),
            outer_mutex: None,
            stats: RegistryStats::default(),
            config,
        }
    }

    fn enter(&self) -> Entered<'_> {
        Entered { reg: self, guard: Some(self.gate.enter()) }
    }

    // ---------------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------------

    fn alloc_rec(&self, id: Hid, kernel: Kernel, hooks: Option<FutureHooks>) -> &Rec {
        let rec = match self.rec_fl.pop(&self.gate) {
            Some(rec) => {
                RegistryStats::bump(&self.stats.rec_reuses);
                rec
            }
            None => {
                RegistryStats::bump(&self.stats.rec_heap_allocs);
                NonNull::from(Box::leak(Box::new(Rec::blank())))
            }
        };
        // SAFETY: popped as reallocable or freshly allocated; only we see it.
        let rec = unsafe { &*rec.as_ptr() };
        unsafe { rec.init(id, kernel, hooks) };
        rec
    }

    fn retire_rec(&self, rec: &Rec) {
        // SAFETY: unreachable from every table and hint; owned by no list.
        let len = unsafe { self.rec_fl.append(NonNull::from(rec), self.gate.retire_epoch()) };
        RegistryStats::high_water(&self.stats.rec_fl_high_water, len);
    }

    fn alloc_class(&self, id: ClassId, spec: ClassSpec, first_serial: u64) -> &ClassDesc {
        let desc = match self.class_fl.pop(&self.gate) {
            Some(desc) => {
                RegistryStats::bump(&self.stats.class_reuses);
                desc
            }
            None => {
                RegistryStats::bump(&self.stats.class_heap_allocs);
                NonNull::from(Box::leak(Box::new(ClassDesc::blank(self.config.lfht_buckets))))
            }
        };
        // SAFETY: as in `alloc_rec`.
        let desc = unsafe { &*desc.as_ptr() };
        unsafe { desc.init(id, spec, first_serial) };
        desc
    }

    fn retire_class(&self, desc: &ClassDesc) {
        // SAFETY: the slot no longer publishes `desc`.
        let len = unsafe { self.class_fl.append(NonNull::from(desc), self.gate.retire_epoch()) };
        RegistryStats::high_water(&self.stats.class_fl_high_water, len);
    }

    /// Returns surplus free-list entries to the heap.
    ///
    /// Runs on the way out of the gate when this thread is alone in it, and
    /// gives up as soon as another thread comes in.
    fn maintain(&self) {
        if !self.trim(&self.rec_fl, &self.stats.rec_heap_frees) {
            return;
        }
        self.trim(&self.class_fl, &self.stats.class_heap_frees);
    }

    fn trim<T: FreeListEntry>(&self, list: &FreeList<T>, freed: &AtomicU64) -> bool {
        let mut released = 0usize;
        while list.len() > list.max_desired_len() {
            let Some(entry) = list.pop(&self.gate) else { break };
            if self.gate.active() != 1 {
                // SAFETY: popped above, so exclusively ours again.
                unsafe { list.append(entry, self.gate.retire_epoch()) };
                RegistryStats::bump(&self.stats.maintenance_cancels);
                tracing::trace!(released, "free-list maintenance cancelled");
                return false;
            }
            // SAFETY: reallocable and popped while no other thread is inside.
            drop(unsafe { Box::from_raw(entry.as_ptr()) });
            RegistryStats::bump(freed);
            released += 1;
        }
        if released > 0 {
            tracing::trace!(released, remaining = list.len(), "free-list trimmed");
        }
        true
    }

    // ---------------------------------------------------------------------
    // Resolution
    // ---------------------------------------------------------------------

    /// The published descriptor for `id`.
    fn class(&self, id: ClassId) -> Result<&ClassDesc> {
        if !id.in_range() {
            return Err(IdError::BadRange(u32::from(id.0)));
        }
        let desc = self.class_slot[id.index()].load(Ordering::Acquire);
        if desc.is_null() {
            return Err(IdError::NoSuchClass(id));
        }
        // SAFETY: published descriptors stay readable while we are gated.
        Ok(unsafe { &*desc })
    }

    /// Finds the record behind `id`, in whatever state it is.
    fn resolve(&self, id: Hid) -> Result<(&ClassDesc, &Rec)> {
        let class_id = id.decode_class().ok_or(IdError::BadId(id))?;
        let class = self.class(class_id).map_err(|_| IdError::NoSuchId(id))?;
        let rec = self.find_rec(class, id).ok_or(IdError::NoSuchId(id))?;
        Ok((class, rec))
    }

    /// As [`resolve`](Self::resolve), checking the handle's class first.
    fn resolve_in(&self, id: Hid, expected: ClassId) -> Result<(&ClassDesc, &Rec)> {
        if !expected.in_range() {
            return Err(IdError::BadRange(u32::from(expected.0)));
        }
        let actual = id.decode_class().ok_or(IdError::BadId(id))?;
        if actual != expected {
            return Err(IdError::BadClass { id, expected, actual });
        }
        self.resolve(id)
    }

    fn find_rec<'a>(&'a self, class: &'a ClassDesc, id: Hid) -> Option<&'a Rec> {
        let hint = class.mru.load(Ordering::Acquire);
        if !hint.is_null() {
            // SAFETY: a hinted record is not retired before the hint is
            // withdrawn, and we are gated.
            let rec = unsafe { &*hint };
            if rec.id() == id {
                return Some(rec);
            }
        }
        // SAFETY: table entries stay readable while we are gated.
        class.table.lookup(id.0).map(|rec| unsafe { &*rec.as_ptr() })
    }

    /// Records `rec` as the class's most recently used record.
    fn hint(&self, class: &ClassDesc, rec: &Rec) {
        let ptr = rec as *const Rec as *mut Rec;
        if class.mru.load(Ordering::Relaxed) == ptr {
            return;
        }
        class.mru.store(ptr, Ordering::Release);
        // Pairs with the fence in `unpublish`: either the deleter sees our
        // hint, or we see its mark.
        fence(Ordering::SeqCst);
        if rec.kernel.load().is_marked() {
            let _ = class.mru.compare_exchange(ptr, ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed);
        }
    }

    // ---------------------------------------------------------------------
    // Deletion
    // ---------------------------------------------------------------------

    /// Takes a freshly marked record out of its class and parks it.
    ///
    /// Must be called exactly once, by the thread that set `MARKED`.
    fn unpublish(&self, class: &ClassDesc, rec: &Rec) {
        fence(Ordering::SeqCst);
        let ptr = rec as *const Rec as *mut Rec;
        let _ = class.mru.compare_exchange(ptr, ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed);

        let won = class.table.mark(rec);
        assert!(won, "record {} unlinked twice", rec.id());
        class.table.unlink_if_marked(rec);
        class.live_count.fetch_sub(1, Ordering::AcqRel);
        self.retire_rec(rec);
    }

    /// Gives up `guard` and finishes whatever re-entry on this thread
    /// started while the bit was held.
    ///
    /// A `remove` from inside a callback is completed by unpublishing. A
    /// last `dec_ref` from inside a callback is completed by releasing the
    /// object and deleting the record; `disposed` says the holder already
    /// ran the release callback and it failed, so the object is leaked
    /// rather than released twice. Returns `true` if that release happened.
    fn settle(&self, class: &ClassDesc, rec: &Rec, guard: DndGuard<'_>, disposed: bool) -> bool {
        let current = guard.peek();
        if current.flags.contains(KernelFlags::RELEASE_PENDING) {
            let outcome = if disposed { Ok(()) } else { self.dispose(class, rec, &current) };
            if disposed || outcome.is_err() {
                RegistryStats::bump(&self.stats.forced_leaks);
                tracing::warn!(id = %rec.id(), object = current.object.addr(), "deferred release leaked an object");
            }
            guard.release_with(|k| {
                k.flags.remove(KernelFlags::RELEASE_PENDING);
                k.flags.insert(KernelFlags::MARKED);
            });
            self.unpublish(class, rec);
            self.release_pin(rec);
            return true;
        }
        let before = guard.release_with(|_| {});
        if before.is_marked() {
            self.unpublish(class, rec);
            self.release_pin(rec);
        }
        false
    }

    /// Drops the reference a pinned future held on its real handle.
    fn release_pin(&self, rec: &Rec) {
        if let Some(real) = rec.take_pin() {
            if let Err(err) = self.dec_ref_entered(real, false) {
                tracing::debug!(%real, error = %err, "pinned real handle already gone");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Callbacks
    // ---------------------------------------------------------------------

    /// `true` if a callback of `class` must run under the outer mutex and
    /// this thread does not hold it yet. Only the class free callback is
    /// exempted by `THREAD_SAFE_FREE`.
    fn wants_outer(&self, class: &ClassDesc, free_callback: bool) -> bool {
        let flags = class.flags();
        self.outer_mutex.is_some()
            && flags.contains(ClassFlags::NEEDS_OUTER_MUTEX)
            && !(free_callback && flags.contains(ClassFlags::THREAD_SAFE_FREE))
            && !outer::held()
    }

    /// Takes the configured outer mutex for a callback of `class` if
    /// [`wants_outer`](Self::wants_outer) says so.
    fn outer_for(&self, class: &ClassDesc, free_callback: bool) -> Option<OuterLock<'_>> {
        if !self.wants_outer(class, free_callback) {
            return None;
        }
        self.outer_mutex.as_deref().map(OuterLock::acquire)
    }

    /// As [`outer_for`](Self::outer_for), for the callback [`dispose`]
    /// would run on `kernel`.
    ///
    /// [`dispose`]: Self::dispose
    fn outer_for_release(&self, class: &ClassDesc, kernel: &Kernel) -> Option<OuterLock<'_>> {
        self.outer_for(class, !kernel.is_unrealized_future())
    }

    fn note_callback(&self) {
        if outer::held() {
            RegistryStats::bump(&self.stats.callbacks_with_outer_mutex);
        } else {
            RegistryStats::bump(&self.stats.callbacks_without_outer_mutex);
        }
    }

    /// Runs the callback that releases `kernel.object`: the class free
    /// callback, or `discard` for a future that never got its real object.
    ///
    /// The caller holds the record's do-not-disturb bit.
    fn dispose(&self, class: &ClassDesc, rec: &Rec, kernel: &Kernel) -> Result<()> {
        if kernel.is_unrealized_future() {
            let Some(hooks) = rec.hooks() else {
                return Ok(());
            };
            self.note_callback();
            (hooks.discard)(kernel.object).map_err(IdError::callback)?;
            RegistryStats::bump(&self.stats.discards);
            return Ok(());
        }
        match class.spec().free_fn.as_ref() {
            Some(free) => {
                self.note_callback();
                free(kernel.object).map_err(IdError::callback)
            }
            None => Ok(()),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::build(RegistryConfig::default())
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for idx in 1..MAX_CLASSES {
            if !self.class_slot[idx].load(Ordering::Acquire).is_null() {
                let _ = self.destroy_class(ClassId(idx as u8));
            }
        }
        if self.config.dump_stats_on_shutdown {
            match serde_json::to_string(&self.stats.snapshot()) {
                Ok(json) => tracing::info!(stats = %json, "identifier registry shutting down"),
                Err(err) => tracing::warn!(error = %err, "could not serialize registry stats"),
            }
        }
    }
}

/// Presence inside the registry's gate.
///
/// The last thread out runs free-list maintenance before leaving.
struct Entered<'r> {
    reg: &'r Registry,
    guard: Option<GateGuard<'r>>,
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        if self.reg.gate.active() == 1 {
            self.reg.maintain();
        }
        if let Some(guard) = self.guard.take() {
            if guard.leave() {
                RegistryStats::bump(&self.reg.stats.quiescent_epochs);
            }
        }
    }
}
