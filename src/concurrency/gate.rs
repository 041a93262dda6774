//! Thread gate and quiescent epochs.
//!
//! Every registry operation runs between [`ThreadGate::enter`] and the drop
//! of the returned guard. The gate packs two counters into one word:
//!
//! ```text
//! ┌──────────────────────────┬──────────────────────────┐
//! │      epoch (32 bits)     │  active threads (32 bits)│
//! └──────────────────────────┴──────────────────────────┘
//! ```
//!
//! The thread that brings `active` from one to zero advances `epoch` in the
//! same atomic step. An entry retired while the epoch read `E` can be reused
//! once the epoch reads anything other than `E`: the gate has been empty at
//! least once since, so nobody still holds a pointer obtained before the
//! retirement.

use core::sync::atomic::{fence, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

const ACTIVE_MASK: u64 = u32::MAX as u64;
const EPOCH_SHIFT: u32 = 32;
const EPOCH_ONE: u64 = 1 << EPOCH_SHIFT;

/// Counts threads inside the registry and the quiescent points between them.
pub struct ThreadGate {
    word: CachePadded<AtomicU64>,
}

impl ThreadGate {
    /// Creates an empty gate at epoch zero.
    pub const fn new() -> Self {
        Self {
            word: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Enters the gate.
    ///
    /// Nested entry from the same thread is allowed and simply counts twice.
    #[inline]
    pub fn enter(&self) -> GateGuard<'_> {
        let prev = self.word.fetch_add(1, Ordering::SeqCst);
        debug_assert!(prev & ACTIVE_MASK < ACTIVE_MASK, "thread gate overflow");
        // Pairs with the fence in `retire_epoch`: either the retiring thread
        // counts us, or we observe its unlink.
        fence(Ordering::SeqCst);
        GateGuard { gate: self }
    }

    /// Number of threads currently inside.
    #[inline]
    pub fn active(&self) -> u32 {
        (self.word.load(Ordering::SeqCst) & ACTIVE_MASK) as u32
    }

    /// Current quiescent epoch.
    #[inline]
    pub fn epoch(&self) -> u32 {
        (self.word.load(Ordering::SeqCst) >> EPOCH_SHIFT) as u32
    }

    /// Epoch to stamp on an entry that is being retired right now.
    ///
    /// The caller must already have made the entry unreachable.
    #[inline]
    pub fn retire_epoch(&self) -> u32 {
        fence(Ordering::SeqCst);
        self.epoch()
    }

    /// Returns `true` if an entry stamped with `retired` may be reused.
    #[inline]
    pub fn is_quiescent_since(&self, retired: u32) -> bool {
        self.epoch() != retired
    }

    /// Leaves the gate; returns `true` if this exit advanced the epoch.
    fn exit(&self) -> bool {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            debug_assert!(current & ACTIVE_MASK > 0, "thread gate underflow");
            let next = if current & ACTIVE_MASK == 1 {
                (current & !ACTIVE_MASK).wrapping_add(EPOCH_ONE)
            } else {
                current - 1
            };
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current & ACTIVE_MASK == 1,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for ThreadGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof of presence inside a [`ThreadGate`].
#[must_use = "leaving the gate immediately makes the entry pointless"]
pub struct GateGuard<'g> {
    gate: &'g ThreadGate,
}

impl GateGuard<'_> {
    /// The gate this guard belongs to.
    #[inline]
    pub fn gate(&self) -> &ThreadGate {
        self.gate
    }

    /// Leaves the gate now; returns `true` if this exit advanced the epoch.
    pub fn leave(self) -> bool {
        let gate = self.gate;
        core::mem::forget(self);
        gate.exit()
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        if self.gate.exit() {
            tracing::trace!(epoch = self.gate.epoch(), "thread gate quiescent");
        }
    }
}
