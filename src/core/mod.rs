//! Core types shared by every pipeline component: configuration, the
//! immutable page context, and the error taxonomy.

pub mod config;
pub mod context;
pub mod errors;

pub use config::{ExtractionConfig, ParallelPolicy};
pub use context::PageContext;
pub use errors::{ExtractError, ExtractResult, ProcessingStage};
