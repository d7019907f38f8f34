//! Immutable per-call context for OCR operations.
//!
//! Earlier designs threaded the current filename and page number through
//! shared mutable attributes on the extractor, which made the method bank
//! unsafe to fan out. Every method-bank call now receives this value
//! object instead, so workers share nothing.

use std::sync::Arc;

/// Context for one page's OCR work: which file, which page, at what scale.
#[derive(Debug, Clone, PartialEq)]
pub struct PageContext {
    /// Source document filename, shared across all of a job's contexts.
    pub filename: Arc<str>,
    /// 1-based page number.
    pub page_num: usize,
    /// Current render scale multiplier.
    pub render_scale: f32,
    /// Job identifier for telemetry correlation.
    pub job_id: Arc<str>,
}

impl PageContext {
    /// Creates a context for a page at the given scale.
    pub fn new(filename: impl Into<Arc<str>>, page_num: usize, job_id: impl Into<Arc<str>>) -> Self {
        Self {
            filename: filename.into(),
            page_num,
            render_scale: 1.0,
            job_id: job_id.into(),
        }
    }

    /// Returns a copy of this context at a different render scale.
    pub fn with_scale(&self, render_scale: f32) -> Self {
        Self {
            render_scale,
            ..self.clone()
        }
    }
}
