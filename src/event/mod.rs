pub mod coordinator;
pub mod feed;

pub use coordinator::{BurstOutcome, BurstReport, PendingUpdate, UpdateCoordinator};
pub use feed::{ChangeFeed, DocumentSource, MemoryDocs, MemoryFeed};
