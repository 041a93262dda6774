//! Future handles.
//!
//! A future is registered with a placeholder object and two callbacks. Once
//! the producer has the real handle it calls [`Registry::link_real`]; the
//! next lookup of the future runs `realize` under the record's
//! do-not-disturb bit, adopts the real object, removes the real handle, and
//! hands the placeholder to `discard`.
//!
//! Nothing stops the real handle from dying between `link_real` and that
//! lookup, in which case realization fails and the future stays as it was.
//! [`Registry::link_real_pinned`] closes the gap by holding a reference on
//! the real handle until the future consumes or drops it.

use crate::error::{IdError, Result};
use crate::handle::{ClassId, Hid, ObjectPtr};
use crate::stats::RegistryStats;

use super::class::{ClassDesc, DiscardFn, RealizeFn};
use super::kernel::{Acquire, Kernel, KernelFlags};
use super::record::{FutureHooks, Rec};
use super::Registry;

impl Registry {
    /// Registers a future handle holding `placeholder`.
    ///
    /// Both callbacks are required. The handle starts with one internal and
    /// one application reference.
    pub fn register_future(
        &self,
        class: ClassId,
        placeholder: ObjectPtr,
        realize: Option<RealizeFn>,
        discard: Option<DiscardFn>,
    ) -> Result<Hid> {
        let (Some(realize), Some(discard)) = (realize, discard) else {
            tracing::debug!(%class, "register_future without both callbacks");
            return Err(IdError::BadArg("future handles need realize and discard callbacks"));
        };
        let _e = self.enter();
        RegistryStats::bump(&self.stats.register);
        RegistryStats::bump(&self.stats.register_future);
        self.register_entered(
            class,
            Kernel::initial(placeholder, true, true),
            Some(FutureHooks { realize, discard }),
        )
    }

    /// Links the real handle `real` to `future`, arming realization.
    ///
    /// May be called once per future.
    pub fn link_real(&self, future: Hid, real: Hid) -> Result<()> {
        self.link(future, real, false)
    }

    /// As [`link_real`](Self::link_real), additionally taking an internal
    /// reference on `real` so dropping the producer's internal references
    /// cannot kill it before the future is realized. Dropping its last
    /// application reference, `remove` and class teardown still do.
    /// Realization consumes the reference; deleting the future unrealized
    /// drops it.
    pub fn link_real_pinned(&self, future: Hid, real: Hid) -> Result<()> {
        self.link(future, real, true)
    }

    fn link(&self, future: Hid, real: Hid, pin: bool) -> Result<()> {
        let _e = self.enter();
        RegistryStats::bump(&self.stats.link_real);
        if !real.is_well_formed() {
            return Err(IdError::BadId(real));
        }
        if real == future {
            return Err(IdError::BadArg("a future cannot be linked to itself"));
        }
        let (_, rec) = self.resolve(future)?;

        rec.kernel.mutate(future, &self.stats, |k| {
            if !k.flags.contains(KernelFlags::IS_FUTURE) {
                return Err(IdError::BadArg("not a future handle"));
            }
            if k.flags
                .intersects(KernelFlags::REAL_DEFINED | KernelFlags::REAL_LINK_IN_PROGRESS)
            {
                return Err(IdError::BadArg("future already has a real handle"));
            }
            let mut next = k;
            next.flags.insert(KernelFlags::REAL_LINK_IN_PROGRESS);
            Ok((next, ()))
        })?;

        rec.set_real_id(real);
        if pin {
            if let Err(err) = self.inc_ref_entered(real, false) {
                // The future may have died meanwhile; nothing left to undo then.
                let _ = rec.kernel.mutate(future, &self.stats, |k| {
                    let mut next = k;
                    next.flags.remove(KernelFlags::REAL_LINK_IN_PROGRESS);
                    Ok((next, ()))
                });
                return Err(err);
            }
            rec.set_pinned(true);
        }

        let linked = rec.kernel.mutate(future, &self.stats, |k| {
            let mut next = k;
            next.flags.remove(KernelFlags::REAL_LINK_IN_PROGRESS);
            next.flags.insert(KernelFlags::REAL_DEFINED);
            Ok((next, ()))
        });
        if linked.is_err() {
            self.release_pin(rec);
        }
        linked
    }

    /// Promotes the future `id` to its real object and returns that object.
    ///
    /// Returns the current object without doing anything if another thread
    /// realized the future first, or if this thread is already inside one
    /// of the future's callbacks. Fails with `NoSuchId` if a callback
    /// dropped the future's last reference, once the future has been
    /// released.
    pub(super) fn realize(&self, class: &ClassDesc, rec: &Rec, id: Hid) -> Result<ObjectPtr> {
        let outer = self.outer_for(class, false);
        let pending = |k: &Kernel| {
            k.is_unrealized_future() && k.flags.contains(KernelFlags::REAL_DEFINED)
        };
        let (guard, before) = match rec.kernel.acquire_dnd(id, &self.stats, pending)? {
            Acquire::Held(guard, k) => (guard, k),
            Acquire::Recursive(k) | Acquire::Declined(k) => return Ok(k.object),
        };
        let Some(hooks) = rec.hooks() else {
            drop(guard);
            return Ok(before.object);
        };
        let real = rec.real_id();

        self.note_callback();
        let target = match (hooks.realize)(before.object, real) {
            Ok(target) => target,
            Err(err) => {
                let released = self.settle(class, rec, guard, false);
                return Err(if released { IdError::NoSuchId(id) } else { IdError::callback(err) });
            }
        };
        let adopted = match self.adopt(id, target) {
            Ok(object) => object,
            Err(err) => {
                tracing::debug!(%id, %target, error = %err, "future could not adopt its real handle");
                let released = self.settle(class, rec, guard, false);
                return Err(if released { IdError::NoSuchId(id) } else { err });
            }
        };
        guard.update(|k| {
            k.object = adopted;
            k.flags.insert(KernelFlags::FUTURE_REALIZED);
        });
        RegistryStats::bump(&self.stats.realizations);
        if target == real {
            // The pinned reference died with the real handle.
            rec.set_pinned(false);
        }

        self.note_callback();
        let discarded = (hooks.discard)(before.object);
        if discarded.is_ok() {
            guard.update(|k| k.flags.insert(KernelFlags::FUTURE_DISCARDED));
        }
        let released = self.settle(class, rec, guard, false);
        drop(outer);
        self.release_pin(rec);
        if released {
            return Err(IdError::NoSuchId(id));
        }

        match discarded {
            Ok(()) => {
                RegistryStats::bump(&self.stats.discards);
                Ok(adopted)
            }
            Err(err) => Err(IdError::callback(err)),
        }
    }

    /// Removes `target` and returns its object for a future to adopt.
    fn adopt(&self, future: Hid, target: Hid) -> Result<ObjectPtr> {
        if target == future {
            return Err(IdError::BadArg("realize returned the future itself"));
        }
        let (class, rec) = self.resolve(target)?;
        self.remove_rec(target, class, rec)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::registry::class::{ClassSpec, DiscardFn, RealizeFn};
    use crate::{ErrorKind, Hid, ObjectPtr, Registry};

    fn hooks(discards: &Arc<AtomicUsize>) -> (Option<RealizeFn>, Option<DiscardFn>) {
        let seen = Arc::clone(discards);
        let realize: RealizeFn = Arc::new(|_, real| Ok(real));
        let discard: DiscardFn = Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (Some(realize), Some(discard))
    }

    #[test]
    fn missing_callbacks_are_rejected() {
        let reg = Registry::default();
        let class = reg.register_class(ClassSpec::new()).unwrap();
        let err = reg.register_future(class, ObjectPtr::null(), None, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadArg);
    }

    #[test]
    fn unlinked_future_yields_placeholder() {
        let reg = Registry::default();
        let class = reg.register_class(ClassSpec::new()).unwrap();
        let discards = Arc::new(AtomicUsize::new(0));
        let (r, d) = hooks(&discards);
        let place = ObjectPtr::from_addr(0xf00);
        let fut = reg.register_future(class, place, r, d).unwrap();
        assert_eq!(reg.lookup(fut, class).unwrap(), place);
        // Dropping it unrealized disposes of the placeholder through discard.
        assert_eq!(reg.dec_ref(fut, true).unwrap(), 0);
        assert_eq!(discards.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn link_twice_is_an_error() {
        let reg = Registry::default();
        let class = reg.register_class(ClassSpec::new()).unwrap();
        let discards = Arc::new(AtomicUsize::new(0));
        let (r, d) = hooks(&discards);
        let fut = reg.register_future(class, ObjectPtr::null(), r, d).unwrap();
        let real = reg.register(class, ObjectPtr::from_addr(1), true).unwrap();
        reg.link_real(fut, real).unwrap();
        assert_eq!(reg.link_real(fut, real).unwrap_err().kind(), ErrorKind::BadArg);
        assert_eq!(reg.link_real(real, fut).unwrap_err().kind(), ErrorKind::BadArg);
        assert_eq!(reg.link_real(fut, Hid::INVALID).unwrap_err().kind(), ErrorKind::BadId);
    }

    #[test]
    fn realization_failure_leaves_future_intact() {
        let reg = Registry::default();
        let class = reg.register_class(ClassSpec::new()).unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        let realize: RealizeFn = Arc::new(move |_, real| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("not ready");
            }
            Ok(real)
        });
        let discard: DiscardFn = Arc::new(|_| Ok(()));
        let place = ObjectPtr::from_addr(0xa);
        let fut = reg.register_future(class, place, Some(realize), Some(discard)).unwrap();
        let real = reg.register(class, ObjectPtr::from_addr(0xb), true).unwrap();
        reg.link_real(fut, real).unwrap();

        assert_eq!(reg.lookup(fut, class).unwrap_err().kind(), ErrorKind::CallbackFail);
        assert_eq!(reg.lookup(fut, class).unwrap(), ObjectPtr::from_addr(0xb));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        // The real handle was consumed by the future.
        assert_eq!(reg.lookup(real, class).unwrap_err().kind(), ErrorKind::NoSuchId);
    }

    #[test]
    fn dead_real_handle_fails_realization() {
        let reg = Registry::default();
        let class = reg.register_class(ClassSpec::new()).unwrap();
        let discards = Arc::new(AtomicUsize::new(0));
        let (r, d) = hooks(&discards);
        let fut = reg.register_future(class, ObjectPtr::from_addr(1), r, d).unwrap();
        let real = reg.register(class, ObjectPtr::from_addr(2), true).unwrap();
        reg.link_real(fut, real).unwrap();
        reg.dec_ref(real, true).unwrap();
        assert_eq!(reg.lookup(fut, class).unwrap_err().kind(), ErrorKind::NoSuchId);
        assert_eq!(discards.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pinned_real_survives_until_realized() {
        let reg = Registry::default();
        let class = reg.register_class(ClassSpec::new()).unwrap();
        let discards = Arc::new(AtomicUsize::new(0));
        let (r, d) = hooks(&discards);
        let fut = reg.register_future(class, ObjectPtr::from_addr(1), r, d).unwrap();
        let real = reg.register(class, ObjectPtr::from_addr(2), false).unwrap();
        reg.link_real_pinned(fut, real).unwrap();
        assert_eq!(reg.get_ref(real, false).unwrap(), 2);
        // The producer lets go; the pin keeps the real handle alive.
        assert_eq!(reg.dec_ref(real, false).unwrap(), 1);
        assert_eq!(reg.lookup(fut, class).unwrap(), ObjectPtr::from_addr(2));
        assert_eq!(discards.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pin_is_dropped_with_unrealized_future() {
        let reg = Registry::default();
        let class = reg.register_class(ClassSpec::new()).unwrap();
        let discards = Arc::new(AtomicUsize::new(0));
        let (r, d) = hooks(&discards);
        let fut = reg.register_future(class, ObjectPtr::from_addr(1), r, d).unwrap();
        let real = reg.register(class, ObjectPtr::from_addr(2), false).unwrap();
        reg.link_real_pinned(fut, real).unwrap();
        reg.dec_ref(fut, false).unwrap();
        assert_eq!(discards.load(Ordering::SeqCst), 1);
        assert_eq!(reg.get_ref(real, false).unwrap(), 1);
    }
}
