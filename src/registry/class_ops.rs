//! Class lifecycle: claim, publish, clear, teardown; plus diagnostics.

use core::ops::ControlFlow;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};
use std::io;

use crossbeam_utils::Backoff;

use crate::error::{IdError, Result};
use crate::handle::{ClassId, MAX_CLASSES};
use crate::stats::{RegistryStats, StatsSnapshot};

use super::class::{ClassDesc, ClassSpec};
use super::kernel::{Acquire, KernelFlags};
use super::record::Rec;
use super::Registry;

/// Keeps `marking[idx]` raised for the length of a clear pass.
struct MarkingPass<'r> {
    counter: &'r AtomicU32,
}

impl<'r> MarkingPass<'r> {
    fn begin(counter: &'r AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for MarkingPass<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Registry {
    /// Creates a class and returns its index.
    ///
    /// The class starts with one reference (see
    /// [`dec_class_ref`](Self::dec_class_ref)). Fails with `NoSpace` once
    /// every index in `1..MAX_CLASSES` is live.
    pub fn register_class(&self, spec: ClassSpec) -> Result<ClassId> {
        let _e = self.enter();
        RegistryStats::bump(&self.stats.register_class);
        loop {
            let idx = self.claim_index()?;
            let id = ClassId(idx as u8);
            let first_serial = spec.reserved.max(self.serial_floor[idx].load(Ordering::Acquire));
            let desc = self.alloc_class(id, spec.clone(), first_serial);
            let ptr = desc as *const ClassDesc as *mut ClassDesc;

            match self.class_slot[idx].compare_exchange(
                ptr::null_mut(),
                ptr,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::debug!(class = %id, first_serial, "class registered");
                    return Ok(id);
                }
                Err(_) => {
                    RegistryStats::bump(&self.stats.class_collisions);
                    tracing::debug!(class = %id, "class slot already published; claiming another");
                    self.retire_class(desc);
                    self.class_allocated[idx].store(false, Ordering::Release);
                }
            }
        }
    }

    /// Claims a free class index.
    fn claim_index(&self) -> Result<usize> {
        let idx = self.next_class.fetch_add(1, Ordering::Relaxed);
        if idx < MAX_CLASSES
            && self.class_allocated[idx]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            return Ok(idx);
        }
        if self.config.recycle_class_ids {
            for idx in 1..MAX_CLASSES {
                if self.class_allocated[idx]
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    tracing::debug!(idx, "recycled class index");
                    return Ok(idx);
                }
            }
        }
        tracing::debug!("class indices exhausted");
        Err(IdError::NoSpace)
    }

    /// `true` if a live class is published at `id`.
    pub fn has_class(&self, id: ClassId) -> Result<bool> {
        if !id.in_range() {
            return Err(IdError::BadRange(u32::from(id.0)));
        }
        let _e = self.enter();
        Ok(self.class(id).is_ok_and(|class| !class.torn_down.load(Ordering::Acquire)))
    }

    /// Number of live handles in `id`.
    ///
    /// Waits briefly for clear passes in progress. Fails with `CantCount` if
    /// the class is torn down while counting.
    pub fn class_members(&self, id: ClassId) -> Result<u64> {
        let _e = self.enter();
        let class = self.class(id)?;
        let marking = &self.marking[id.index()];
        let backoff = Backoff::new();
        while marking.load(Ordering::Acquire) > 0 && !backoff.is_completed() {
            backoff.snooze();
        }

        let count = class.live_count.load(Ordering::Acquire);
        let published = self.class_slot[id.index()].load(Ordering::Acquire);
        if !ptr::eq(published, class) || class.torn_down.load(Ordering::Acquire) {
            return Err(IdError::CantCount(id));
        }
        Ok(count)
    }

    /// Frees the handles of `id`.
    ///
    /// A soft clear (`force == false`) skips handles holding more than one
    /// internal reference, keeps a handle whose free callback fails, and
    /// reports the first such failure after finishing the pass. A forced
    /// clear deletes every handle, leaking the objects whose callbacks fail.
    pub fn clear_class(&self, id: ClassId, force: bool) -> Result<()> {
        let _e = self.enter();
        RegistryStats::bump(&self.stats.clear_class);
        let class = self.class(id)?;
        if class.torn_down.load(Ordering::Acquire) {
            return Err(IdError::NoSuchClass(id));
        }
        self.clear_records(class, force)
    }

    /// Force-clears `id` and releases its index.
    pub fn destroy_class(&self, id: ClassId) -> Result<()> {
        let _e = self.enter();
        let class = self.class(id)?;
        self.teardown(class);
        Ok(())
    }

    /// Takes another reference on `id`; returns the new count.
    pub fn inc_class_ref(&self, id: ClassId) -> Result<u32> {
        let _e = self.enter();
        let class = self.class(id)?;
        if class.torn_down.load(Ordering::Acquire) {
            return Err(IdError::NoSuchClass(id));
        }
        Ok(class.init_count.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Drops a reference on `id`; the last one tears the class down.
    pub fn dec_class_ref(&self, id: ClassId) -> Result<u32> {
        let _e = self.enter();
        let class = self.class(id)?;
        let previous = class
            .init_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| IdError::NoSuchClass(id))?;
        if previous == 1 {
            self.teardown(class);
        }
        Ok(previous - 1)
    }

    /// Current reference count of `id`.
    pub fn class_ref(&self, id: ClassId) -> Result<u32> {
        let _e = self.enter();
        Ok(self.class(id)?.init_count.load(Ordering::Acquire))
    }

    fn clear_records(&self, class: &ClassDesc, force: bool) -> Result<()> {
        let _pass = MarkingPass::begin(&self.marking[class.id().index()]);
        let mut first_err = None;
        let _ = class.table.for_each::<()>(|rec| {
            // SAFETY: table entries stay readable while we are gated.
            let rec = unsafe { rec.as_ref() };
            if let Err(err) = self.clear_rec(class, rec, force) {
                first_err.get_or_insert(err);
            }
            ControlFlow::Continue(())
        });
        first_err.map_or(Ok(()), Err)
    }

    fn clear_rec(&self, class: &ClassDesc, rec: &Rec, force: bool) -> Result<()> {
        let id = rec.id();
        let (outer, guard, kernel) = loop {
            let seen = rec.kernel.load();
            if seen.is_gone() || !(force || seen.ref_count <= 1) {
                return Ok(());
            }
            let outer = self.outer_for_release(class, &seen);
            match rec.kernel.acquire_dnd(id, &self.stats, |k| force || k.ref_count <= 1) {
                Ok(Acquire::Held(guard, k)) => {
                    if outer.is_none() && self.wants_outer(class, !k.is_unrealized_future()) {
                        drop(guard);
                        continue;
                    }
                    break (outer, guard, k);
                }
                // Deleted meanwhile, or still referenced elsewhere.
                Err(_) | Ok(Acquire::Declined(_)) => return Ok(()),
                Ok(Acquire::Recursive(_)) => {
                    tracing::warn!(%id, "handle busy in a callback on this thread; clear skipped it");
                    return Ok(());
                }
            }
        };

        if let Err(err) = self.dispose(class, rec, &kernel) {
            if !force {
                self.settle(class, rec, guard, true);
                return Err(err);
            }
            RegistryStats::bump(&self.stats.forced_leaks);
            tracing::warn!(%id, object = kernel.object.addr(), "forced clear leaked an object");
        }
        guard.release_with(|k| {
            k.ref_count = 0;
            k.app_ref = 0;
            k.flags.insert(KernelFlags::MARKED);
        });
        drop(outer);
        self.unpublish(class, rec);
        self.release_pin(rec);
        Ok(())
    }

    /// Force-clears `class`, unpublishes it and parks its descriptor.
    fn teardown(&self, class: &ClassDesc) {
        if class.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let id = class.id();
        let idx = id.index();
        RegistryStats::bump(&self.stats.destroy_class);
        RegistryStats::bump(&self.stats.clear_class);

        class.table.clear();
        let _ = self.clear_records(class, true);
        let leftover = class.live_count.load(Ordering::Acquire);
        if leftover > 0 {
            tracing::warn!(class = %id, leftover, "class torn down with handles still busy");
        }

        self.serial_floor[idx].fetch_max(class.next_serial.load(Ordering::Acquire), Ordering::AcqRel);
        let ptr = class as *const ClassDesc as *mut ClassDesc;
        let _ = self.class_slot[idx].compare_exchange(
            ptr,
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.class_allocated[idx].store(false, Ordering::Release);
        self.retire_class(class);
        tracing::debug!(class = %id, "class torn down");
    }

    /// A copy of the registry's counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Writes the counters to `sink` as pretty-printed JSON.
    pub fn dump_stats(&self, sink: &mut dyn io::Write) -> io::Result<()> {
        self.stats.dump(sink)
    }

    /// Zeros the counters.
    pub fn clear_stats(&self) {
        self.stats.clear();
    }
}
