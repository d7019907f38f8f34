//! Header recovery and document splitting for scanned picklist PDFs.
//!
//! A multi-document scan batch carries a structured identifier ("header",
//! e.g. `B-HK-WFE-S17975643`) in a fixed region of every page. This crate
//! recovers those headers — direct text extraction first, a multi-method
//! OCR voting pipeline otherwise — scores their plausibility, resolves
//! visually ambiguous glyphs in the customer-code segment, and uses the
//! recovered headers to split the batch into per-document files.
//!
//! Component map:
//! - [`validator`] — header normalization, scoring, and matching
//! - [`ambiguity`] — glyph ambiguity detection and harmonization planning
//! - [`ocr`] — the engine abstraction, preprocessing method bank, and
//!   adaptive orchestrator
//! - [`splitter`] — document boundary detection over per-page headers
//! - [`extract`] — the orchestrating extractor and collaborator traits
//! - [`pdf`] — PDFium-backed page source and assembler
//! - [`telemetry`] — fire-and-forget per-page extraction records

pub mod ambiguity;
pub mod core;
pub mod extract;
pub mod ocr;
pub mod pdf;
pub mod splitter;
pub mod telemetry;
pub mod validator;

pub use crate::core::{ExtractError, ExtractResult, ExtractionConfig, PageContext, ParallelPolicy};
pub use extract::{DocumentAssembler, Extractor, JobSummary, PageSource, RegionSpec, SplitOutput};
pub use ocr::{OcrEngine, OcrPipeline, PageExtraction, PageStatus, TesseractEngine};
pub use splitter::{DocumentGroup, DocumentSplitter};
pub use validator::HeaderValidator;
