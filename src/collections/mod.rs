//! Concurrent collections used by the registry.
//!
//! - `lfht`: intrusive lock-free hash table, one per class

pub mod lfht;

pub use lfht::{InsertError, Lfht, LfhtEntry};
