//! Applying an approved recipe to a whole catalog.

pub mod engine;
pub mod progress;
pub mod store;

pub use engine::{BatchControl, BatchEngine, BatchError, BatchRun, RerunScope};
pub use progress::ProgressHub;
pub use store::ResultStore;
