pub mod merge;
pub mod plan_cache;
pub mod range;
pub mod reduce;
pub mod request;
pub mod selector;

pub use merge::{ViewMerger, ViewRow, ViewStream};
pub use range::KeyRange;
pub use reduce::Reducer;
pub use request::{Grouping, MergeRequest, PartitionFilter, Stale, UnavailablePolicy};
pub use selector::{select_partitions, Selection};
