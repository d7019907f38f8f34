//! The orchestrating extractor: per-page header recovery, document-level
//! correction passes, and splitting.
//!
//! The extractor ties the components together per document: try direct
//! text extraction, fall back to the OCR pipeline, run the document-wide
//! harmonization and anchor-rescue passes once every page has been read,
//! then hand the page groups to the splitter and write the outputs.
//!
//! Failure containment: a page that cannot be read yields an empty-header
//! record and the job continues; a document that cannot be split at all
//! is copied through unsplit; only a document that cannot be opened
//! surfaces as a job-level error.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use image::GrayImage;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ambiguity::{self, plan_harmonization};
use crate::core::config::ExtractionConfig;
use crate::core::context::PageContext;
use crate::core::errors::ExtractResult;
use crate::ocr::pipeline::{OcrPipeline, PageStatus};
use crate::splitter::{DocumentGroup, DocumentSplitter};
use crate::telemetry::{ExtractionRecord, MethodRecord, TelemetrySink};
use crate::validator::HeaderValidator;

/// A rectangular page region. Values at or below 100 are percentages of
/// the page dimension; larger values are absolute page units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionSpec {
    pub top: f32,
    pub left: f32,
    pub width: f32,
    pub height: f32,
}

impl Default for RegionSpec {
    fn default() -> Self {
        Self {
            top: 0.0,
            left: 0.0,
            width: 100.0,
            height: 15.0,
        }
    }
}

impl RegionSpec {
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            top: config.header_area_top,
            left: config.header_area_left,
            width: config.header_area_width,
            height: config.header_area_height,
        }
    }

    /// Resolves this spec against a page size, returning `(x, y, w, h)` in
    /// page units.
    pub fn resolve(&self, page_width: f32, page_height: f32) -> (f32, f32, f32, f32) {
        let axis = |value: f32, extent: f32| {
            if value <= 100.0 {
                value / 100.0 * extent
            } else {
                value
            }
        };
        let x = axis(self.left, page_width);
        let y = axis(self.top, page_height);
        let w = axis(self.width, page_width).min(page_width - x);
        let h = axis(self.height, page_height).min(page_height - y);
        (x, y, w, h)
    }
}

/// A source of pages: direct text extraction and rasterization for a
/// clipped region. Implemented by the PDF collaborator.
///
/// Deliberately not `Send`/`Sync`: the underlying PDF library is
/// single-threaded, and the method-bank fan-out parallelizes over
/// already-rendered buffers, never over the source itself.
pub trait PageSource {
    /// Number of pages in the document.
    fn page_count(&self) -> usize;

    /// Plain text for the clipped region, empty when the page carries no
    /// extractable text layer.
    fn direct_text(&self, page_index: usize, region: &RegionSpec) -> ExtractResult<String>;

    /// Rasterizes the clipped region at the given scale multiplier.
    fn render_region(
        &self,
        page_index: usize,
        region: &RegionSpec,
        scale: f32,
    ) -> ExtractResult<GrayImage>;
}

/// Produces a new document containing a contiguous page range of the
/// source. Must be robust to destination-path contention.
pub trait DocumentAssembler {
    /// Writes pages `start..=end` (0-based) to `target`, returning the
    /// path actually written (which may differ when the target was
    /// locked).
    fn write_page_range(&self, start: usize, end: usize, target: &Path) -> ExtractResult<PathBuf>;
}

/// Per-page extraction outcome retained for splitting and reporting.
#[derive(Debug, Clone)]
pub struct PageHeaderRecord {
    /// 0-based page index.
    pub page_index: usize,
    pub header: String,
    pub status: PageStatus,
    pub quality_flags: String,
}

/// One written split output.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SplitOutput {
    pub path: PathBuf,
    pub header: String,
    pub start_page: usize,
    pub end_page: usize,
}

/// Job-level result summary.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub source: String,
    pub total_pages: usize,
    pub headers_extracted: usize,
    pub page_errors: usize,
    pub groups: usize,
    pub outputs: Vec<SplitOutput>,
    pub elapsed_ms: u64,
}

/// The orchestrating extractor.
pub struct Extractor {
    config: Arc<ExtractionConfig>,
    validator: HeaderValidator,
    pipeline: OcrPipeline,
    splitter: DocumentSplitter,
    sink: Arc<dyn TelemetrySink>,
}

impl Extractor {
    pub fn new(
        config: Arc<ExtractionConfig>,
        validator: HeaderValidator,
        pipeline: OcrPipeline,
        splitter: DocumentSplitter,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            config,
            validator,
            pipeline,
            splitter,
            sink,
        }
    }

    /// Processes one document end to end: header per page, correction
    /// passes, boundary detection, output writes.
    pub fn process_document(
        &self,
        source: &dyn PageSource,
        assembler: &dyn DocumentAssembler,
        filename: &str,
        output_dir: &Path,
    ) -> ExtractResult<JobSummary> {
        let started = Instant::now();
        let job_id = job_id_for(filename);
        let total_pages = source.page_count();
        let region = RegionSpec::from_config(&self.config);
        info!(job = %job_id, %filename, total_pages, "processing document");

        let pages: Vec<usize> = if self.config.pages_to_read.is_empty() {
            (0..total_pages).collect()
        } else {
            self.config
                .pages_to_read
                .iter()
                .filter_map(|p| {
                    let index = p.checked_sub(1)?;
                    (index < total_pages).then_some(index)
                })
                .collect()
        };

        let mut records: Vec<PageHeaderRecord> = Vec::with_capacity(pages.len());
        for page_index in pages {
            let record = self.extract_header_from_page(source, page_index, &region, filename, &job_id);
            if !record.header.is_empty() {
                info!(
                    job = %job_id,
                    page = page_index + 1,
                    header = %record.header,
                    "page header"
                );
            }
            records.push(record);
        }

        // Document-scoped second passes need every page read first.
        let mut page_headers: Vec<(usize, String)> = records
            .iter()
            .filter(|r| !r.header.is_empty())
            .map(|r| (r.page_index, r.header.clone()))
            .collect();
        let mut flags: BTreeMap<usize, String> = records
            .iter()
            .map(|r| (r.page_index, r.quality_flags.clone()))
            .collect();

        if self.config.enable_anchor_harmonize {
            self.harmonize_pass(&mut page_headers, &mut flags);
        }
        if self.config.enable_anchor_rescue {
            self.anchor_rescue_pass(source, &region, filename, &job_id, &mut page_headers, &mut flags);
        }

        let outputs = if self.config.enable_splitting {
            self.split_document(assembler, filename, output_dir, total_pages, &page_headers)?
        } else {
            Vec::new()
        };

        self.sink.flush();
        let headers_extracted = page_headers.len();
        let page_errors = records
            .iter()
            .filter(|r| r.status == PageStatus::Error)
            .count();
        let groups = outputs.len();
        info!(
            job = %job_id,
            headers_extracted,
            outputs = groups,
            "processing complete"
        );
        Ok(JobSummary {
            job_id,
            source: filename.to_string(),
            total_pages,
            headers_extracted,
            page_errors,
            groups,
            outputs,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Extracts one page's header: direct text first, OCR otherwise.
    fn extract_header_from_page(
        &self,
        source: &dyn PageSource,
        page_index: usize,
        region: &RegionSpec,
        filename: &str,
        job_id: &str,
    ) -> PageHeaderRecord {
        let ctx = PageContext::new(filename, page_index + 1, job_id);
        let mut record = ExtractionRecord::now(job_id, filename, page_index + 1);

        let direct = source
            .direct_text(page_index, region)
            .unwrap_or_else(|e| {
                debug!(page = page_index + 1, error = %e, "direct text extraction failed");
                String::new()
            });
        record.direct_text = direct.clone();

        if !direct.trim().is_empty() {
            let (score, corrected) = self.validator.validate_and_score(&direct);
            if score > 0 && !corrected.is_empty() {
                debug!(page = page_index + 1, header = %corrected, score, "direct text hit");
                record.final_answer = corrected.clone();
                self.emit(record);
                return PageHeaderRecord {
                    page_index,
                    header: corrected,
                    status: PageStatus::Success,
                    quality_flags: String::new(),
                };
            }
        }

        let extraction = self.pipeline.extract_adaptive(source, page_index, region, &ctx);
        for outcome in &extraction.method_outcomes {
            record.method_results.insert(
                outcome.method.id().to_string(),
                MethodRecord {
                    text: outcome.text.clone(),
                    score: outcome.score,
                    confidence: outcome.confidence,
                },
            );
        }
        record.final_answer = extraction.text.clone();
        record.status = extraction.status.as_str().to_string();
        record.quality_flags = extraction.quality_flags.clone();
        self.emit(record);

        PageHeaderRecord {
            page_index,
            header: extraction.text,
            status: extraction.status,
            quality_flags: extraction.quality_flags,
        }
    }

    /// Unifies inconsistent code spellings across pages sharing an anchor,
    /// driven by per-page glyph evidence.
    fn harmonize_pass(
        &self,
        page_headers: &mut Vec<(usize, String)>,
        flags: &mut BTreeMap<usize, String>,
    ) {
        let pairs = ambiguity::parse_pair_map(&self.config.code_ambiguity_pairs);
        let updates = plan_harmonization(
            page_headers,
            flags,
            self.config.expected_separator,
            &pairs,
            self.config.harmonize_min_evidence,
        );
        if updates.is_empty() {
            return;
        }
        info!(pages = updates.len(), "harmonized code spellings across anchor");
        for (page, header) in page_headers.iter_mut() {
            if let Some(updated) = updates.get(page) {
                *header = updated.clone();
                append_flag(flags, *page, ambiguity::FLAG_HARMONIZED);
            }
        }
    }

    /// One extra high-scale re-OCR for anchors whose every ambiguous page
    /// lacked character boxes, propagating the rescued spelling to the
    /// whole anchor.
    fn anchor_rescue_pass(
        &self,
        source: &dyn PageSource,
        region: &RegionSpec,
        filename: &str,
        job_id: &str,
        page_headers: &mut Vec<(usize, String)>,
        flags: &mut BTreeMap<usize, String>,
    ) {
        let pairs = ambiguity::parse_pair_map(&self.config.code_ambiguity_pairs);
        let mut anchors: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let by_page: BTreeMap<usize, String> = page_headers.iter().cloned().collect();
        for (page, header) in page_headers.iter() {
            anchors
                .entry(ambiguity::anchor_key(header, self.config.expected_separator, &pairs))
                .or_default()
                .push(*page);
        }

        let mut updates: BTreeMap<usize, String> = BTreeMap::new();
        for pages in anchors.values() {
            let eligible = pages.iter().all(|page| {
                flags
                    .get(page)
                    .is_some_and(|f| ambiguity::skipped_for_missing_boxes(f))
            });
            if !eligible || pages.is_empty() {
                continue;
            }

            let first = pages[0];
            let base = by_page[&first].clone();
            let ctx = PageContext::new(filename, first + 1, job_id);
            match self
                .pipeline
                .rescue_ambiguous_header(source, first, region, &ctx, &base)
            {
                Ok((rescued, reason)) => {
                    if rescued != base {
                        info!(anchor_pages = pages.len(), %rescued, %reason, "anchor rescued");
                        for page in pages {
                            updates.insert(*page, rescued.clone());
                            append_flag(
                                flags,
                                *page,
                                &format!("{}:{reason}", ambiguity::FLAG_ANCHOR_RESCUED),
                            );
                        }
                    } else {
                        debug!(%reason, "anchor rescue made no change");
                    }
                }
                Err(e) => warn!(error = %e, "anchor rescue failed"),
            }
        }

        for (page, header) in page_headers.iter_mut() {
            if let Some(updated) = updates.get(page) {
                *header = updated.clone();
            }
        }
    }

    /// Plans groups and writes one output per group. A document with one
    /// group (or none) is copied through whole rather than dropped.
    fn split_document(
        &self,
        assembler: &dyn DocumentAssembler,
        filename: &str,
        output_dir: &Path,
        total_pages: usize,
        page_headers: &[(usize, String)],
    ) -> ExtractResult<Vec<SplitOutput>> {
        if total_pages == 0 {
            return Ok(Vec::new());
        }
        let original_stem = Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unnamed");

        let groups = if page_headers.is_empty() {
            Vec::new()
        } else {
            self.splitter.plan(page_headers)
        };

        if groups.len() <= 1 {
            let header = groups
                .first()
                .map(|g| g.header.clone())
                .unwrap_or_else(|| original_stem.to_string());
            info!(%header, "single header group, copying document through");
            let name = self.output_name(&header, 1, total_pages, original_stem, 1);
            let target = output_dir.join(name);
            let written = assembler.write_page_range(0, total_pages - 1, &target)?;
            return Ok(vec![SplitOutput {
                path: written,
                header,
                start_page: 0,
                end_page: total_pages - 1,
            }]);
        }

        let mut outputs = Vec::with_capacity(groups.len());
        let mut name_counts: BTreeMap<String, usize> = BTreeMap::new();
        for (index, group) in groups.iter().enumerate() {
            let safe = self.sanitize_filename(&group.header, original_stem);
            let mut name = self.output_name(
                &group.header,
                group.start_page + 1,
                group.end_page + 1,
                original_stem,
                index + 1,
            );
            let count = name_counts.entry(safe).or_insert(0);
            *count += 1;
            if *count > 1 {
                let suffixed = name.trim_end_matches(".pdf").to_string();
                name = format!("{suffixed}_{:02}.pdf", *count);
                warn!(%name, header = %group.header, "duplicate output name, suffixed");
            }

            let target = output_dir.join(&name);
            match assembler.write_page_range(group.start_page, group.end_page, &target) {
                Ok(written) => {
                    info!(
                        path = %written.display(),
                        pages = format_args!("{}-{}", group.start_page + 1, group.end_page + 1),
                        header = %group.header,
                        "wrote split document"
                    );
                    outputs.push(SplitOutput {
                        path: written,
                        header: group.header.clone(),
                        start_page: group.start_page,
                        end_page: group.end_page,
                    });
                }
                Err(e) => {
                    warn!(error = %e, header = %group.header, "failed to write split document");
                }
            }
        }
        Ok(outputs)
    }

    /// Renders the configured naming pattern for one output.
    fn output_name(
        &self,
        header: &str,
        start: usize,
        end: usize,
        original: &str,
        index: usize,
    ) -> String {
        let safe = self.sanitize_filename(header, original);
        let mut name = self
            .config
            .split_naming_pattern
            .replace("{header}", &safe)
            .replace("{start}", &start.to_string())
            .replace("{end}", &end.to_string())
            .replace("{original}", original)
            .replace("{index}", &index.to_string());
        if !name.to_ascii_lowercase().ends_with(".pdf") {
            name.push_str(".pdf");
        }
        name
    }

    /// Converts header text into a safe filename: word characters only,
    /// spaces replaced, separator runs collapsed, capped length.
    fn sanitize_filename(&self, text: &str, fallback: &str) -> String {
        let replaced: String = text
            .chars()
            .map(|c| {
                if c == ' ' {
                    self.config.replace_spaces_with
                } else if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        let mut collapsed = String::with_capacity(replaced.len());
        for c in replaced.chars() {
            if (c == '_' || c == '-') && matches!(collapsed.chars().last(), Some('_') | Some('-')) {
                continue;
            }
            collapsed.push(c);
        }
        let trimmed: String = collapsed
            .trim_matches(|c| c == '_' || c == '-')
            .chars()
            .take(self.config.max_filename_length)
            .collect();
        if trimmed.is_empty() {
            let fallback = fallback.trim();
            if fallback.is_empty() {
                "unnamed".to_string()
            } else {
                fallback.to_string()
            }
        } else {
            trimmed
        }
    }

    fn emit(&self, record: ExtractionRecord) {
        if self.config.enable_telemetry {
            self.sink.record(record);
        }
    }
}

fn append_flag(flags: &mut BTreeMap<usize, String>, page: usize, flag: &str) {
    let entry = flags.entry(page).or_default();
    if !entry.is_empty() {
        entry.push(';');
    }
    entry.push_str(flag);
}

fn job_id_for(filename: &str) -> String {
    let mut hasher = DefaultHasher::new();
    filename.hash(&mut hasher);
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0)
        .hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

/// Test doubles shared by the pipeline and extractor unit tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use image::Luma;
    use std::sync::Mutex;

    /// Page source backed by static text and a blank raster.
    pub struct StaticPageSource {
        texts: Vec<String>,
    }

    impl StaticPageSource {
        /// `count` pages with no text layer.
        pub fn blank(count: usize) -> Self {
            Self {
                texts: vec![String::new(); count],
            }
        }

        /// One page per entry, each with the given direct text.
        pub fn with_texts(texts: &[&str]) -> Self {
            Self {
                texts: texts.iter().map(|t| t.to_string()).collect(),
            }
        }
    }

    impl PageSource for StaticPageSource {
        fn page_count(&self) -> usize {
            self.texts.len()
        }

        fn direct_text(&self, page_index: usize, _region: &RegionSpec) -> ExtractResult<String> {
            Ok(self.texts.get(page_index).cloned().unwrap_or_default())
        }

        fn render_region(
            &self,
            _page_index: usize,
            _region: &RegionSpec,
            _scale: f32,
        ) -> ExtractResult<GrayImage> {
            Ok(GrayImage::from_pixel(140, 24, Luma([255])))
        }
    }

    /// Assembler that records ranges instead of writing PDFs.
    #[derive(Default)]
    pub struct RecordingAssembler {
        pub written: Mutex<Vec<(usize, usize, PathBuf)>>,
    }

    impl DocumentAssembler for RecordingAssembler {
        fn write_page_range(
            &self,
            start: usize,
            end: usize,
            target: &Path,
        ) -> ExtractResult<PathBuf> {
            self.written
                .lock()
                .unwrap()
                .push((start, end, target.to_path_buf()));
            Ok(target.to_path_buf())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{RecordingAssembler, StaticPageSource};
    use super::*;
    use crate::ocr::engine::{OcrEngine, OcrOptions, Recognition};
    use crate::telemetry::NullSink;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct ScriptedEngine {
        responses: Mutex<VecDeque<Recognition>>,
        available: bool,
    }

    impl ScriptedEngine {
        fn new(texts: &[&str]) -> Self {
            Self {
                responses: Mutex::new(
                    texts
                        .iter()
                        .map(|t| Recognition {
                            text: t.to_string(),
                            mean_confidence: 88.0,
                            char_boxes: Vec::new(),
                        })
                        .collect(),
                ),
                available: true,
            }
        }

        fn unavailable() -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                available: false,
            }
        }
    }

    impl OcrEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        fn is_available(&self) -> bool {
            self.available
        }

        fn recognize(
            &self,
            _image: &GrayImage,
            _options: &OcrOptions,
        ) -> ExtractResult<Recognition> {
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default())
        }
    }

    fn extractor_with(engine: ScriptedEngine, config: ExtractionConfig) -> Extractor {
        let config = Arc::new(config);
        let validator = HeaderValidator::new(config.clone()).unwrap();
        let pipeline = OcrPipeline::new(
            config.clone(),
            validator.clone(),
            Arc::new(engine),
            None,
        );
        let splitter = DocumentSplitter::new(config.clone(), validator.clone());
        Extractor::new(config, validator, pipeline, splitter, Arc::new(NullSink))
    }

    #[test]
    fn region_resolves_percentages_and_absolute_units() {
        let region = RegionSpec {
            top: 10.0,
            left: 0.0,
            width: 100.0,
            height: 15.0,
        };
        let (x, y, w, h) = region.resolve(600.0, 800.0);
        assert_eq!((x, y), (0.0, 80.0));
        assert_eq!((w, h), (600.0, 120.0));

        let absolute = RegionSpec {
            top: 150.0,
            left: 120.0,
            width: 300.0,
            height: 200.0,
        };
        let (x, y, w, h) = absolute.resolve(600.0, 800.0);
        assert_eq!((x, y, w, h), (120.0, 150.0, 300.0, 200.0));
    }

    #[test]
    fn process_document_splits_on_direct_text_headers() {
        let extractor = extractor_with(ScriptedEngine::unavailable(), ExtractionConfig::default());
        let source = StaticPageSource::with_texts(&[
            "B-HK-WFE-S17975643",
            "B-HK-WFE-S17975643",
            "B-TW-UEI-S18010794",
            "B-TW-UEI-S18010794",
        ]);
        let assembler = RecordingAssembler::default();
        let summary = extractor
            .process_document(&source, &assembler, "scan.pdf", Path::new("out"))
            .unwrap();

        assert_eq!(summary.total_pages, 4);
        assert_eq!(summary.headers_extracted, 4);
        assert_eq!(summary.page_errors, 0);
        assert_eq!(summary.outputs.len(), 2);
        assert_eq!(
            (summary.outputs[0].start_page, summary.outputs[0].end_page),
            (0, 1)
        );
        assert_eq!(
            (summary.outputs[1].start_page, summary.outputs[1].end_page),
            (2, 3)
        );
        let written = assembler.written.lock().unwrap();
        assert_eq!(written.len(), 2);
        let name = written[0].2.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.contains("B-HK-WFE-S17975643"));
        assert!(name.ends_with(".pdf"));
    }

    #[test]
    fn unreadable_document_is_copied_through() {
        let extractor = extractor_with(ScriptedEngine::unavailable(), ExtractionConfig::default());
        let source = StaticPageSource::blank(3);
        let assembler = RecordingAssembler::default();
        let summary = extractor
            .process_document(&source, &assembler, "mystery.pdf", Path::new("out"))
            .unwrap();

        assert_eq!(summary.headers_extracted, 0);
        assert_eq!(summary.page_errors, 3);
        // Still written through whole, never silently dropped.
        assert_eq!(summary.outputs.len(), 1);
        assert_eq!(
            (summary.outputs[0].start_page, summary.outputs[0].end_page),
            (0, 2)
        );
        let written = assembler.written.lock().unwrap();
        let name = written[0].2.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.contains("mystery"));
    }

    #[test]
    fn anchor_rescue_updates_all_pages_in_anchor() {
        // Rescue re-OCR yields two votes for the O spelling against the
        // base spelling.
        let engine = ScriptedEngine::new(&[
            "B-FD-02OH-S18020267",
            "B-FD-02OH-S18020267",
            "B-FD-020H-S18020267",
        ]);
        let extractor = extractor_with(engine, ExtractionConfig::default());
        let source = StaticPageSource::blank(2);
        let region = RegionSpec::default();

        let mut page_headers = vec![
            (0, "B-FD-020H-S18020267".to_string()),
            (1, "B-FD-020H-S18020267".to_string()),
        ];
        let mut flags: BTreeMap<usize, String> = [
            (
                0,
                "glyph_disambiguation_skipped:no_char_boxes;code_ambiguity:020H->02OH".to_string(),
            ),
            (
                1,
                "glyph_disambiguation_skipped:no_char_boxes;code_ambiguity:020H->02OH".to_string(),
            ),
        ]
        .into_iter()
        .collect();

        extractor.anchor_rescue_pass(
            &source,
            &region,
            "xtest.pdf",
            "job1",
            &mut page_headers,
            &mut flags,
        );

        for (_page, header) in &page_headers {
            assert_eq!(header, "B-FD-02OH-S18020267");
        }
        assert!(flags[&0].contains(ambiguity::FLAG_ANCHOR_RESCUED));
        assert!(flags[&1].contains(ambiguity::FLAG_ANCHOR_RESCUED));
    }

    #[test]
    fn anchor_rescue_skips_when_boxes_were_available() {
        let engine = ScriptedEngine::new(&["B-FD-02OH-S18020267"]);
        let extractor = extractor_with(engine, ExtractionConfig::default());
        let source = StaticPageSource::blank(2);
        let region = RegionSpec::default();

        let original = vec![
            (0, "B-FD-020H-S18020267".to_string()),
            (1, "B-FD-020H-S18020267".to_string()),
        ];
        let mut page_headers = original.clone();
        let mut flags: BTreeMap<usize, String> = [
            (0, "code_ambiguity:020H->02OH".to_string()),
            (1, "code_ambiguity:020H->02OH".to_string()),
        ]
        .into_iter()
        .collect();

        extractor.anchor_rescue_pass(
            &source,
            &region,
            "xtest.pdf",
            "job1",
            &mut page_headers,
            &mut flags,
        );

        assert_eq!(page_headers, original);
    }

    #[test]
    fn harmonize_pass_rewrites_headers_and_flags() {
        let extractor = extractor_with(ScriptedEngine::unavailable(), ExtractionConfig::default());
        let mut page_headers = vec![
            (0, "B-FD-02OH-S18018435".to_string()),
            (1, "B-FD-020H-S18018435".to_string()),
        ];
        let mut flags: BTreeMap<usize, String> = [
            (0, "glyph_disambiguated:width_ratio>=1.12".to_string()),
            (1, "code_ambiguity:020H->02OH".to_string()),
        ]
        .into_iter()
        .collect();

        extractor.harmonize_pass(&mut page_headers, &mut flags);
        assert_eq!(page_headers[1].1, "B-FD-02OH-S18018435");
        assert!(flags[&1].contains(ambiguity::FLAG_HARMONIZED));
    }

    #[test]
    fn duplicate_output_names_get_suffixes() {
        let extractor = extractor_with(ScriptedEngine::unavailable(), ExtractionConfig::default());
        let source = StaticPageSource::with_texts(&[
            "B-HK-WFE-S17975643",
            "B-TW-UEI-S18010794",
            "B-HK-WFE-S17975643",
        ]);
        let assembler = RecordingAssembler::default();
        let summary = extractor
            .process_document(&source, &assembler, "scan.pdf", Path::new("out"))
            .unwrap();

        assert_eq!(summary.outputs.len(), 3);
        let names: Vec<String> = assembler
            .written
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, p)| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.iter().filter(|n| n.contains("WFE")).count(), 2);
        assert!(names.iter().any(|n| n.ends_with("_02.pdf")), "names: {names:?}");
    }

    #[test]
    fn sanitize_filename_cleans_and_falls_back() {
        let extractor = extractor_with(ScriptedEngine::unavailable(), ExtractionConfig::default());
        assert_eq!(
            extractor.sanitize_filename("B-HK-WFE-S17975643", "orig"),
            "B-HK-WFE-S17975643"
        );
        assert_eq!(
            extractor.sanitize_filename("A  B//C", "orig"),
            "A_B_C"
        );
        assert_eq!(extractor.sanitize_filename("///", "orig"), "orig");
        assert_eq!(extractor.sanitize_filename("", ""), "unnamed");
    }
}
