//! Handle encoding.
//!
//! A handle is a 64-bit word laid out as:
//!
//! ```text
//! ┌──────┬────────────────┬──────────────────────────────────────┐
//! │ sign │  class index   │              serial                  │
//! │  63  │    62 .. 56    │              55 .. 0                 │
//! └──────┴────────────────┴──────────────────────────────────────┘
//! ```
//!
//! The sign bit is reserved, which keeps every valid handle positive when
//! reinterpreted as `i64` and leaves `u64::MAX` free to serve as `INVALID`.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Total width of a handle.
pub const HANDLE_BITS: u32 = 64;

/// Width of the class-index field.
pub const CLASS_BITS: u32 = 7;

/// Size of the class-slot arrays. Valid class indices are `1..MAX_CLASSES`.
pub const MAX_CLASSES: usize = 1 << CLASS_BITS;

const SERIAL_BITS: u32 = HANDLE_BITS - 1 - CLASS_BITS;
const SERIAL_MASK: u64 = (1 << SERIAL_BITS) - 1;
const CLASS_MASK: u64 = (1 << CLASS_BITS) - 1;
const SIGN_BIT: u64 = 1 << (HANDLE_BITS - 1);

/// Index of a type class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ClassId(pub u8);

impl ClassId {
    /// Returns the index as a `usize`, suitable for indexing the slot arrays.
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns `true` if the index lies in `1..MAX_CLASSES`.
    #[inline]
    pub const fn in_range(self) -> bool {
        self.0 != 0 && (self.0 as usize) < MAX_CLASSES
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class#{}", self.0)
    }
}

/// An opaque identifier naming a registered object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Hid(pub u64);

impl Hid {
    /// The reserved "no handle" value.
    pub const INVALID: Hid = Hid(u64::MAX);

    /// Packs a class index and a per-class serial into a handle.
    ///
    /// Serial bits above the serial field are discarded.
    #[inline]
    pub const fn encode(class: ClassId, serial: u64) -> Hid {
        Hid(((class.0 as u64 & CLASS_MASK) << SERIAL_BITS) | (serial & SERIAL_MASK))
    }

    /// Recovers the class index, or `None` for a malformed handle.
    ///
    /// A well-formed handle does not imply a live one.
    #[inline]
    pub const fn decode_class(self) -> Option<ClassId> {
        if self.0 & SIGN_BIT != 0 {
            return None;
        }
        let class = ((self.0 >> SERIAL_BITS) & CLASS_MASK) as u8;
        if class == 0 {
            None
        } else {
            Some(ClassId(class))
        }
    }

    /// The per-class serial number.
    #[inline(always)]
    pub const fn serial(self) -> u64 {
        self.0 & SERIAL_MASK
    }

    /// Returns `true` unless this is `INVALID` or otherwise malformed.
    #[inline]
    pub const fn is_well_formed(self) -> bool {
        self.decode_class().is_some()
    }
}

impl fmt::Display for Hid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode_class() {
            Some(class) => write!(f, "{}:{}", class.0, self.serial()),
            None => f.write_str("<invalid>"),
        }
    }
}

/// An opaque object word.
///
/// The registry stores and hands back this value but never dereferences it;
/// ownership of whatever it points at stays with the caller and the class's
/// free callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ObjectPtr(usize);

impl ObjectPtr {
    /// The null object.
    #[inline(always)]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Wraps a raw pointer.
    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Wraps a plain address or token.
    #[inline(always)]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the stored value as a raw pointer.
    #[inline(always)]
    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the stored value as an address.
    #[inline(always)]
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Returns `true` for the null object.
    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}
