//! Registry counters.
//!
//! Every counter is a relaxed `AtomicU64`; they are diagnostics, not
//! synchronization, and a snapshot taken under load is only approximately
//! consistent across fields.

use core::sync::atomic::{AtomicU64, Ordering};
use std::io;

use serde::Serialize;

macro_rules! registry_counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Live counters owned by a [`crate::Registry`].
        #[derive(Default)]
        pub struct RegistryStats {
            $($(#[$doc])* pub(crate) $name: AtomicU64,)*
        }

        /// A plain copy of [`RegistryStats`] at one point in time.
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        pub struct StatsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl RegistryStats {
            /// Copies every counter.
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }

            /// Zeros every counter.
            pub fn clear(&self) {
                $(self.$name.store(0, Ordering::Relaxed);)*
            }
        }
    };
}

registry_counters! {
    /// `register_class` calls.
    register_class,
    /// Classes torn down.
    destroy_class,
    /// `clear_class` calls, including the clear inside teardown.
    clear_class,
    /// Lost `class_slot` publication races.
    class_collisions,
    /// `register` and `register_future` calls.
    register,
    /// Futures registered.
    register_future,
    /// `link_real` calls.
    link_real,
    /// `lookup` calls.
    lookup,
    /// `remove` calls.
    remove,
    /// `inc_ref` calls.
    inc_ref,
    /// `dec_ref` calls.
    dec_ref,
    /// `get_ref` calls.
    get_ref,
    /// `iterate` calls.
    iterate,
    /// Lost kernel compare-and-swaps, retried without yielding.
    kernel_cas_retries,
    /// Yields while another thread held a record's do-not-disturb bit.
    dnd_yields,
    /// Recursive entries allowed through an outer-mutex-owned do-not-disturb bit.
    dnd_recursions,
    /// Callbacks invoked while the outer mutex was held.
    callbacks_with_outer_mutex,
    /// Callbacks invoked without the outer mutex.
    callbacks_without_outer_mutex,
    /// Successful future realizations.
    realizations,
    /// Successful discard callbacks.
    discards,
    /// Free callbacks that failed during a forced clear (object leaked).
    forced_leaks,
    /// Records allocated from the heap.
    rec_heap_allocs,
    /// Records reused from the free list.
    rec_reuses,
    /// Records returned to the heap by the maintenance pass.
    rec_heap_frees,
    /// Highest observed record free-list length.
    rec_fl_high_water,
    /// Class descriptors allocated from the heap.
    class_heap_allocs,
    /// Class descriptors reused from the free list.
    class_reuses,
    /// Class descriptors returned to the heap by the maintenance pass.
    class_heap_frees,
    /// Highest observed class free-list length.
    class_fl_high_water,
    /// Times the gate emptied and the quiescent epoch advanced.
    quiescent_epochs,
    /// Maintenance passes abandoned because a thread entered mid-pass.
    maintenance_cancels,
}

impl RegistryStats {
    #[inline(always)]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn high_water(counter: &AtomicU64, value: usize) {
        counter.fetch_max(value as u64, Ordering::Relaxed);
    }

    /// Writes a pretty-printed JSON snapshot to `sink`.
    pub fn dump(&self, sink: &mut dyn io::Write) -> io::Result<()> {
        serde_json::to_writer_pretty(&mut *sink, &self.snapshot())?;
        writeln!(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_and_clear() {
        let stats = RegistryStats::default();
        RegistryStats::bump(&stats.lookup);
        RegistryStats::bump(&stats.lookup);
        RegistryStats::high_water(&stats.rec_fl_high_water, 7);
        RegistryStats::high_water(&stats.rec_fl_high_water, 3);

        let snap = stats.snapshot();
        assert_eq!(snap.lookup, 2);
        assert_eq!(snap.rec_fl_high_water, 7);

        stats.clear();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn dump_is_json() {
        let stats = RegistryStats::default();
        RegistryStats::bump(&stats.register);
        let mut out = Vec::new();
        stats.dump(&mut out).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["register"], 1);
    }
}
