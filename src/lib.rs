//! # `idreg` - Multi-thread Identifier Registry
//!
//! Hands out opaque integer handles for caller-owned objects and answers,
//! from any number of threads and without a global lock:
//!
//! - does this handle name a live object, and which one?
//! - how many references does it hold, and when does it die?
//! - which handles belong to a class, and how is the class torn down?
//! - how does a *future* handle become real on first use?
//!
//! ## Architecture
//!
//! ```text
//! Registry ─┬─ class_slot[1..128] ──► ClassDesc ──► Lfht<Rec> ──► Rec { AtomicKernel }
//!           ├─ ThreadGate (active threads + quiescent epoch)
//!           ├─ FreeList<Rec>        (ABA-safe, tagged pointers)
//!           └─ FreeList<ClassDesc>
//! ```
//!
//! 1. **Handles** ([`Hid`]) pack a class index and a per-class serial.
//! 2. **Records** keep everything that must change together in one kernel
//!    value replaced by compare-and-swap. Callbacks that cannot be rolled
//!    back run under the kernel's do-not-disturb bit.
//! 3. **Classes** own a lock-free hash table of their records.
//! 4. **Reclamation** is quiescent-state based: retired memory is reused
//!    only after the registry's gate has been empty once.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use idreg::{ClassSpec, ObjectPtr, Registry, RegistryConfig};
//!
//! let reg = Registry::new(RegistryConfig::default()).unwrap();
//! let class = reg
//!     .register_class(ClassSpec::new().free_fn(Arc::new(|obj| {
//!         println!("freeing {:#x}", obj.addr());
//!         Ok(())
//!     })))
//!     .unwrap();
//!
//! let h = reg.register(class, ObjectPtr::from_addr(0xbeef), true).unwrap();
//! assert_eq!(reg.class_of(h).unwrap(), class);
//! assert_eq!(reg.inc_ref(h, false).unwrap(), 2);
//! assert_eq!(reg.class_members(class).unwrap(), 1);
//!
//! reg.destroy_class(class).unwrap();
//! assert!(reg.lookup(h, class).is_err());
//! ```

#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod collections;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod handle;
pub mod registry;
pub mod stats;

pub use concurrency::outer::{hold as hold_outer_mutex, OuterHeld, OuterMutex};
pub use config::{ConfigError, RegistryConfig};
pub use error::{ErrorKind, IdError, Result};
pub use handle::{ClassId, Hid, ObjectPtr, CLASS_BITS, HANDLE_BITS, MAX_CLASSES};
pub use registry::class::{ClassFlags, ClassSpec, DiscardFn, FreeFn, RealizeFn};
pub use registry::{KernelFlags, Registry};
pub use stats::StatsSnapshot;

// Layout assumptions the handle encoding relies on.
const _: () = {
    use core::mem;

    assert!(mem::size_of::<Hid>() * 8 == HANDLE_BITS as usize);
    assert!(MAX_CLASSES <= u8::MAX as usize + 1);
    assert!(mem::size_of::<ObjectPtr>() == mem::size_of::<usize>());
};
