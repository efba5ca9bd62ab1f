pub mod checkpoint;
pub mod snapshot;

pub use checkpoint::{GroupState, GroupStore};
pub use snapshot::SnapshotFile;
