//! Lock-free building blocks.
//!
//! - `gate`: active-thread count and quiescent epochs
//! - `tagged`: `(pointer, serial)` pairs for ABA-safe CAS
//! - `freelist`: sentinel free list built on tagged pointers
//! - `outer`: bookkeeping for the collaborators' outer mutex

pub mod freelist;
pub mod gate;
pub mod outer;
pub mod tagged;

pub use freelist::{FreeLink, FreeList, FreeListEntry};
pub use gate::{GateGuard, ThreadGate};
pub use tagged::{AtomicTagged, TaggedPtr};
