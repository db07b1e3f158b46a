//! Deciding when to persist training progress, and doing so consistently across processes.

mod error;
mod record;
mod scheduler;
mod store;

pub use error::CheckpointError;
pub use record::{MANIFEST_VERSION, Manifest, Restored, Snapshot};
pub use scheduler::{CheckpointScheduler, IntervalType, SaveReport, should_save};
pub use store::CheckpointStore;
