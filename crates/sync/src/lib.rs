pub mod engine;
pub mod error;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use engine::{Command, SyncEngine, SyncSnapshot};
pub use error::SyncError;
