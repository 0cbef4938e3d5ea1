//! Generation tracking for safe memory reclamation
//!
//! The writer bumps a generation counter after retiring memory and tags the
//! retired items with the new value. Readers pin the generation they start in
//! through a guard. An item tagged `g` may be released once the oldest pinned
//! generation is at least `g`.

pub mod handler;
pub mod hold_list;

pub use handler::{GenerationGuard, GenerationHandler};
pub use hold_list::{GenerationHoldList, HeldBytes};

/// Monotonic generation counter value
pub type Generation = u64;
