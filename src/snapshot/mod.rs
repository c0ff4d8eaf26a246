//! Read-only filesystem snapshots.
//!
//! A [`Snapshot`] records the on-disk state of a path at one instant. The
//! reconciliation engine consumes single-level captures as its live view of
//! a directory; deep captures serve tests, tooling, and recursive deletion.

mod snapshot;

pub use snapshot::{Snapshot, SnapshotError};
pub(crate) use snapshot::modified_or_now;
