//! Turning raw seller uploads into a structured catalog.

pub mod data_model;
pub mod fingerprint;
pub mod paste;
pub mod source;
pub mod store;
pub mod synthesis;
pub mod vision;

pub use data_model::DataModel;
pub use source::{SourceError, build_source, format_for_filename, sniff_format};
pub use store::ScriptStore;
pub use synthesis::{ExtractionError, ScriptSynthesizer};
