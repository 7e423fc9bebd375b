//! Index layout: which physical index each item type lives in.
//!
//! Three placement strategies coexist. Most types get a dedicated index.
//! Low-volume platform types share one `systemitems` index and are
//! discriminated by an `itemType` field plus a document-id suffix. High-volume
//! time-series types roll over through a write alias onto numbered physical
//! indices managed by a lifecycle policy.

pub mod codec;
pub mod rollover;
pub mod router;

pub use router::{IndexRouter, Placement, TypeRegistry};
