pub mod adaptive;
pub mod change;
pub mod error;
pub mod key;
pub mod partition;
pub mod registry;

pub use adaptive::*;
pub use change::*;
pub use error::*;
pub use key::*;
pub use partition::*;
pub use registry::*;
