//! Record operations.

use core::ops::ControlFlow;
use core::sync::atomic::Ordering;

use crate::collections::lfht::InsertError;
use crate::error::{IdError, Result};
use crate::handle::{ClassId, Hid, ObjectPtr};
use crate::stats::RegistryStats;

use super::class::ClassDesc;
use super::kernel::{Acquire, Kernel, KernelFlags};
use super::record::{FutureHooks, Rec};
use super::Registry;

enum Dec {
    Done(u32),
    Release(Kernel),
}

/// `true` if dropping one reference of the given kind ends the handle.
fn releases(k: &Kernel, app: bool) -> bool {
    k.ref_count <= 1 || (app && k.app_ref <= 1)
}

impl Registry {
    /// Registers `object` in `class` and returns its new handle.
    ///
    /// The handle starts with one internal reference, plus one application
    /// reference when `app` is set.
    pub fn register(&self, class: ClassId, object: ObjectPtr, app: bool) -> Result<Hid> {
        let _e = self.enter();
        RegistryStats::bump(&self.stats.register);
        self.register_entered(class, Kernel::initial(object, app, false), None)
    }

    pub(super) fn register_entered(
        &self,
        class_id: ClassId,
        kernel: Kernel,
        hooks: Option<FutureHooks>,
    ) -> Result<Hid> {
        let class = self.class(class_id)?;
        let serial = class.next_serial.fetch_add(1, Ordering::Relaxed);
        let id = Hid::encode(class_id, serial);
        let rec = self.alloc_rec(id, kernel, hooks);

        class.live_count.fetch_add(1, Ordering::AcqRel);
        match class.table.insert(rec) {
            Ok(()) => Ok(id),
            Err(InsertError::Cleared) => {
                class.live_count.fetch_sub(1, Ordering::AcqRel);
                self.retire_rec(rec);
                tracing::debug!(class = %class_id, "registration raced class teardown");
                Err(IdError::NoSuchClass(class_id))
            }
            Err(InsertError::Duplicate) => panic!("serial {serial} of {class_id} handed out twice"),
        }
    }

    /// Returns the object behind `id`.
    ///
    /// A future whose real handle has been linked is realized here, once;
    /// concurrent lookups wait for the realization and see its result. A
    /// future with nothing linked yet yields its placeholder.
    pub fn lookup(&self, id: Hid, class: ClassId) -> Result<ObjectPtr> {
        let _e = self.enter();
        RegistryStats::bump(&self.stats.lookup);
        let (desc, rec) = self.resolve_in(id, class)?;

        let kernel = rec.kernel.read(id, &self.stats)?;
        let object = if kernel.is_unrealized_future()
            && kernel.flags.contains(KernelFlags::REAL_DEFINED)
        {
            self.realize(desc, rec, id)?
        } else {
            kernel.object
        };
        self.hint(desc, rec);
        Ok(object)
    }

    /// Recovers the class encoded in `id`. Says nothing about liveness.
    pub fn class_of(&self, id: Hid) -> Result<ClassId> {
        id.decode_class().ok_or_else(|| {
            tracing::debug!(id = id.0, "class_of on a malformed handle");
            IdError::BadId(id)
        })
    }

    /// Deletes `id` without calling any free callback and returns the
    /// object it held.
    pub fn remove(&self, id: Hid, class: ClassId) -> Result<ObjectPtr> {
        let _e = self.enter();
        RegistryStats::bump(&self.stats.remove);
        let (desc, rec) = self.resolve_in(id, class)?;
        self.remove_rec(id, desc, rec)
    }

    pub(super) fn remove_rec(&self, id: Hid, desc: &ClassDesc, rec: &Rec) -> Result<ObjectPtr> {
        let before = rec.kernel.mutate(id, &self.stats, |k| {
            let mut next = k;
            next.flags.insert(KernelFlags::MARKED);
            Ok((next, k))
        })?;
        // A do-not-disturb holder further up this thread's stack finishes
        // the deletion when it releases the bit.
        if !before.flags.contains(KernelFlags::DO_NOT_DISTURB) {
            self.unpublish(desc, rec);
            self.release_pin(rec);
        }
        Ok(before.object)
    }

    /// Replaces the object behind `id`, returning the previous one.
    pub fn substitute(&self, id: Hid, class: ClassId, object: ObjectPtr) -> Result<ObjectPtr> {
        let _e = self.enter();
        let (_, rec) = self.resolve_in(id, class)?;
        rec.kernel.mutate(id, &self.stats, |k| {
            let mut next = k;
            next.object = object;
            Ok((next, k.object))
        })
    }

    /// `true` if `id` is live and referenced by the application.
    pub fn is_valid(&self, id: Hid) -> bool {
        let _e = self.enter();
        match self.resolve(id) {
            Ok((_, rec)) => {
                let k = rec.kernel.load();
                !k.is_gone() && k.app_ref > 0
            }
            Err(_) => false,
        }
    }

    /// Adds a reference; returns the new application count when `app` is
    /// set, the new internal count otherwise.
    pub fn inc_ref(&self, id: Hid, app: bool) -> Result<u32> {
        let _e = self.enter();
        RegistryStats::bump(&self.stats.inc_ref);
        self.inc_ref_entered(id, app)
    }

    pub(super) fn inc_ref_entered(&self, id: Hid, app: bool) -> Result<u32> {
        let (_, rec) = self.resolve(id)?;
        rec.kernel.mutate(id, &self.stats, |k| {
            let mut next = k;
            next.ref_count = k
                .ref_count
                .checked_add(1)
                .ok_or(IdError::BadArg("reference count overflow"))?;
            if app {
                next.app_ref += 1;
                Ok((next, next.app_ref))
            } else {
                Ok((next, next.ref_count))
            }
        })
    }

    /// Drops a reference.
    ///
    /// When the internal count, or with `app` set the application count,
    /// would reach zero, the object is released (free callback, or `discard`
    /// for an unrealized future) and the handle dies; the call then returns
    /// 0, and 0 is never returned for a handle that lives on. If the
    /// callback fails the handle stays as it was and the error is returned.
    /// Otherwise returns the new count as for [`inc_ref`](Self::inc_ref).
    /// The application count never exceeds the internal count, so dropping
    /// internal references can lower it too. Dropping an application
    /// reference the handle does not have is a `BadArg`.
    ///
    /// A last reference dropped from inside one of the handle's own
    /// callbacks returns 0 at once; the release itself happens when the
    /// outer operation finishes.
    pub fn dec_ref(&self, id: Hid, app: bool) -> Result<u32> {
        let _e = self.enter();
        RegistryStats::bump(&self.stats.dec_ref);
        self.dec_ref_entered(id, app)
    }

    pub(super) fn dec_ref_entered(&self, id: Hid, app: bool) -> Result<u32> {
        let (desc, rec) = self.resolve(id)?;
        loop {
            let step = rec.kernel.mutate(id, &self.stats, |k| {
                if app && k.app_ref == 0 {
                    return Err(IdError::BadArg("handle holds no application reference"));
                }
                if releases(&k, app) {
                    return Ok((k, Dec::Release(k)));
                }
                let mut next = k;
                next.ref_count -= 1;
                if app {
                    next.app_ref -= 1;
                }
                next.app_ref = next.app_ref.min(next.ref_count);
                let count = if app { next.app_ref } else { next.ref_count };
                Ok((next, Dec::Done(count)))
            })?;
            let seen = match step {
                Dec::Done(count) => return Ok(count),
                Dec::Release(k) => k,
            };

            let outer = self.outer_for_release(desc, &seen);
            match rec.kernel.acquire_dnd(id, &self.stats, |k| releases(k, app))? {
                // Someone took a reference meanwhile; decrement normally.
                Acquire::Declined(_) => continue,
                Acquire::Recursive(_) => {
                    rec.kernel.mutate(id, &self.stats, |k| {
                        let mut next = k;
                        next.ref_count = 0;
                        next.app_ref = 0;
                        next.flags.insert(KernelFlags::RELEASE_PENDING);
                        Ok((next, ()))
                    })?;
                    tracing::debug!(%id, "last reference dropped inside its own callback; release deferred");
                    return Ok(0);
                }
                Acquire::Held(guard, k) => {
                    if outer.is_none() && self.wants_outer(desc, !k.is_unrealized_future()) {
                        drop(guard);
                        continue;
                    }
                    if let Err(err) = self.dispose(desc, rec, &k) {
                        self.settle(desc, rec, guard, true);
                        return Err(err);
                    }
                    guard.release_with(|k| {
                        k.ref_count = 0;
                        k.app_ref = 0;
                        k.flags.insert(KernelFlags::MARKED);
                    });
                    self.unpublish(desc, rec);
                    drop(outer);
                    self.release_pin(rec);
                    return Ok(0);
                }
            }
        }
    }

    /// Reads the application count when `app` is set, the internal count
    /// otherwise.
    pub fn get_ref(&self, id: Hid, app: bool) -> Result<u32> {
        let _e = self.enter();
        RegistryStats::bump(&self.stats.get_ref);
        let (_, rec) = self.resolve(id)?;
        let k = rec.kernel.read(id, &self.stats)?;
        Ok(if app { k.app_ref } else { k.ref_count })
    }

    /// Calls `f` on every live handle of `class`, optionally only those
    /// with application references.
    ///
    /// `f` returns 0 to continue. A positive value stops the walk and is
    /// returned; a negative one stops it with `CallbackFailed`. Handles
    /// deleted during the walk are not visited afterwards; handles created
    /// during it may or may not be. `f` may call back into the registry.
    pub fn iterate<F>(&self, class: ClassId, mut f: F, app_only: bool) -> Result<i32>
    where
        F: FnMut(Hid, ObjectPtr) -> i32,
    {
        let _e = self.enter();
        RegistryStats::bump(&self.stats.iterate);
        let desc = self.class(class)?;

        let flow = desc.table.for_each(|rec| {
            // SAFETY: table entries stay readable while we are gated.
            let rec: &Rec = unsafe { rec.as_ref() };
            let k = rec.kernel.load();
            if k.is_gone() || (app_only && k.app_ref == 0) {
                return ControlFlow::Continue(());
            }
            match f(rec.id(), k.object) {
                0 => ControlFlow::Continue(()),
                stop => ControlFlow::Break(stop),
            }
        });
        match flow {
            ControlFlow::Break(stop) if stop < 0 => {
                Err(IdError::callback(anyhow::anyhow!("iteration over {class} stopped with {stop}")))
            }
            ControlFlow::Break(stop) => Ok(stop),
            ControlFlow::Continue(()) => Ok(0),
        }
    }
}
