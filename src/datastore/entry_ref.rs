//! Compact handles into data store buffers

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque 32-bit handle to an entry in a data store
///
/// The raw value packs `(buffer_id, offset)` according to the owning store's
/// [`RefLayout`]. Zero is never handed out by an allocator and acts as the
/// null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EntryRef(u32);

impl EntryRef {
    /// The null handle
    pub const INVALID: EntryRef = EntryRef(0);

    /// Wrap a raw handle value
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw handle value
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether this handle may refer to an entry
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryRef({:#010x})", self.0)
    }
}

/// Split of an [`EntryRef`] between buffer id bits and offset bits
///
/// Fixed for the lifetime of a store. Offsets count arrays, so a layout with
/// `offset_bits = 22` addresses up to 4M arrays in each of 1024 buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefLayout {
    offset_bits: u32,
    offset_mask: u32,
}

impl RefLayout {
    pub const MIN_OFFSET_BITS: u32 = 1;
    pub const MAX_OFFSET_BITS: u32 = 31;
    pub const DEFAULT_OFFSET_BITS: u32 = 22;

    /// Create a layout using `offset_bits` for the offset and the rest for the buffer id
    pub fn new(offset_bits: u32) -> Result<Self> {
        if !(Self::MIN_OFFSET_BITS..=Self::MAX_OFFSET_BITS).contains(&offset_bits) {
            return Err(Error::InvalidArgument(format!(
                "offset bits must be in {}..={}, got {}",
                Self::MIN_OFFSET_BITS,
                Self::MAX_OFFSET_BITS,
                offset_bits
            )));
        }
        Ok(Self {
            offset_bits,
            offset_mask: (1u32 << offset_bits) - 1,
        })
    }

    pub fn offset_bits(&self) -> u32 {
        self.offset_bits
    }

    pub fn buffer_bits(&self) -> u32 {
        32 - self.offset_bits
    }

    /// Number of buffers addressable by this layout
    pub fn num_buffers(&self) -> u32 {
        1u32 << self.buffer_bits()
    }

    /// Number of arrays addressable within one buffer
    pub fn offset_size(&self) -> usize {
        1usize << self.offset_bits
    }

    #[inline]
    pub fn make(&self, buffer_id: u32, offset: usize) -> EntryRef {
        debug_assert!(buffer_id < self.num_buffers());
        debug_assert!(offset < self.offset_size());
        EntryRef((buffer_id << self.offset_bits) | offset as u32)
    }

    #[inline]
    pub fn buffer_id(&self, entry_ref: EntryRef) -> u32 {
        entry_ref.0 >> self.offset_bits
    }

    #[inline]
    pub fn offset(&self, entry_ref: EntryRef) -> usize {
        (entry_ref.0 & self.offset_mask) as usize
    }
}

impl Default for RefLayout {
    fn default() -> Self {
        Self {
            offset_bits: Self::DEFAULT_OFFSET_BITS,
            offset_mask: (1u32 << Self::DEFAULT_OFFSET_BITS) - 1,
        }
    }
}
