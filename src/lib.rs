//! ea-convert - Wearable EDF recordings to seizure-forecasting chunks
//!
//! ea-convert turns per-channel-group wearable recordings into a labeled,
//! time-indexed chunk dataset through a deterministic pipeline:
//! channel-group loading → session alignment → chunking → train/test/val
//! split → forecast labeling.
//!
//! ## Modules
//!
//! - **Conversion**: [`readers`], [`aligner`] and [`chunker`] turn raw sessions
//!   into gap-padded, bucketed chunk files
//! - **Dataset**: [`split`] and [`labeler`] assign sessions to splits and
//!   label chunks against seizure onsets
//! - **Audit**: [`audit`] reports civil times that fall in ambiguous
//!   daylight-saving hours

pub mod aligner;
pub mod audit;
pub mod chunker;
pub mod config;
pub mod error;
pub mod grid;
pub mod labeler;
pub mod pipeline;
pub mod readers;
pub mod seizures;
pub mod split;
pub mod store;
pub mod timezone;
pub mod types;

#[cfg(test)]
mod testutil;

pub use config::{AmbiguityPolicy, Config, Granularity, JoinPolicy};
pub use error::{AlignError, ChunkError, ConfigError, LoadError, PipelineError, StoreError};
pub use pipeline::{convert_patient, ConvertReport, Pipeline, SessionOutcome};

// Component exports
pub use readers::{ChannelGroupReader, EdfReader, RawRecording};
pub use store::{ColumnarStore, SafetensorsStore};

// Data model exports
pub use labeler::{SplitLabels, WindowParams};
pub use types::{LabelRecord, Modality, SeizureEvent, SessionTable, SplitAssignment, COLUMNS};

/// Crate version, recorded in CLI output
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
