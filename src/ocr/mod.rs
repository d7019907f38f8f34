//! OCR: the engine abstraction, the preprocessing method bank, and the
//! orchestrating pipeline that votes over their combined output.

pub mod engine;
pub mod methods;
pub mod pipeline;

pub use engine::{CharBox, OcrEngine, OcrOptions, Recognition, TesseractEngine};
pub use methods::PreprocessMethod;
pub use pipeline::{MethodOutcome, OcrPipeline, PageExtraction, PageStatus, ScaleCandidate};
