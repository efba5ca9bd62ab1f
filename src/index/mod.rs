pub mod builder;
pub mod compactor;
pub mod fragment;
pub mod set_view;
pub mod slot;

pub use builder::IndexBuilder;
pub use compactor::{
    CompactionHandle, CompactionPhase, CompactionReport, CompactionTarget, Compactor,
};
pub use fragment::{FragmentStats, IndexFragment};
pub use set_view::{Collaborators, SetView};
pub use slot::{FragmentSlot, Fragments};
