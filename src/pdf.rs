//! PDFium-backed page source and document assembler.
//!
//! Implements the two collaborator traits the extractor needs: direct
//! text extraction and region rasterization ([`PdfiumPageSource`]), and
//! page-range assembly with contention-tolerant output writes
//! ([`PdfiumAssembler`]). Output files are written to a temp file in the
//! destination directory and moved into place with a bounded rename
//! retry; a locked target falls back to an alternate filename instead of
//! failing the job.

use std::path::{Path, PathBuf};
use std::time::Duration;

use image::GrayImage;
use pdfium_render::prelude::*;
use tracing::{debug, warn};

use crate::core::errors::{ExtractError, ExtractResult};
use crate::extract::{DocumentAssembler, PageSource, RegionSpec};

/// Binds to the PDFium library, preferring a local copy and falling back
/// to common system locations.
pub fn bind_pdfium() -> ExtractResult<Pdfium> {
    let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("/usr/lib"))
        })
        .or_else(|_| {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("/usr/local/lib"))
        })
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|e| ExtractError::pdf(format!("could not find PDFium library: {e}")))?;
    Ok(Pdfium::new(bindings))
}

/// Page source over one loaded PDF document.
pub struct PdfiumPageSource<'a> {
    document: PdfDocument<'a>,
}

impl<'a> PdfiumPageSource<'a> {
    /// Loads a document from disk.
    pub fn open(pdfium: &'a Pdfium, path: &Path) -> ExtractResult<Self> {
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| ExtractError::pdf(format!("failed to open '{}': {e}", path.display())))?;
        Ok(Self { document })
    }

    fn page(&self, page_index: usize) -> ExtractResult<PdfPage<'_>> {
        self.document
            .pages()
            .get(page_index as u16)
            .map_err(|e| ExtractError::pdf(format!("page {} unavailable: {e}", page_index + 1)))
    }

    /// The clipped region in PDF coordinates (origin bottom-left).
    fn clip_rect(page: &PdfPage<'_>, region: &RegionSpec) -> PdfRect {
        let page_width = page.width().value;
        let page_height = page.height().value;
        let (x, y, w, h) = region.resolve(page_width, page_height);
        PdfRect::new(
            PdfPoints::new(page_height - (y + h)),
            PdfPoints::new(x),
            PdfPoints::new(page_height - y),
            PdfPoints::new(x + w),
        )
    }
}

impl PageSource for PdfiumPageSource<'_> {
    fn page_count(&self) -> usize {
        self.document.pages().len() as usize
    }

    fn direct_text(&self, page_index: usize, region: &RegionSpec) -> ExtractResult<String> {
        let page = self.page(page_index)?;
        let rect = Self::clip_rect(&page, region);
        let text = page
            .text()
            .map_err(|e| ExtractError::pdf(format!("text extraction failed: {e}")))?;
        Ok(text.inside_rect(rect).trim().to_string())
    }

    fn render_region(
        &self,
        page_index: usize,
        region: &RegionSpec,
        scale: f32,
    ) -> ExtractResult<GrayImage> {
        let page = self.page(page_index)?;
        let page_width = page.width().value;
        let page_height = page.height().value;
        let (x, y, w, h) = region.resolve(page_width, page_height);

        let render_config = PdfRenderConfig::new()
            .set_target_width((page_width * scale).round() as i32)
            .set_target_height((page_height * scale).round() as i32)
            .render_form_data(true)
            .render_annotations(true);
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| ExtractError::pdf(format!("render failed: {e}")))?;
        let full = bitmap.as_image().to_luma8();

        let crop_x = ((x * scale).floor() as u32).min(full.width().saturating_sub(1));
        let crop_y = ((y * scale).floor() as u32).min(full.height().saturating_sub(1));
        let crop_w = ((w * scale).ceil() as u32).clamp(1, full.width() - crop_x);
        let crop_h = ((h * scale).ceil() as u32).clamp(1, full.height() - crop_y);
        debug!(
            page = page_index + 1,
            scale, crop_x, crop_y, crop_w, crop_h, "rendered header region"
        );
        Ok(image::imageops::crop_imm(&full, crop_x, crop_y, crop_w, crop_h).to_image())
    }
}

/// Assembles page-range subsets of one source document.
pub struct PdfiumAssembler<'a> {
    pdfium: &'a Pdfium,
    source_path: PathBuf,
}

impl<'a> PdfiumAssembler<'a> {
    pub fn new(pdfium: &'a Pdfium, source_path: impl Into<PathBuf>) -> Self {
        Self {
            pdfium,
            source_path: source_path.into(),
        }
    }
}

impl DocumentAssembler for PdfiumAssembler<'_> {
    fn write_page_range(&self, start: usize, end: usize, target: &Path) -> ExtractResult<PathBuf> {
        let source = self
            .pdfium
            .load_pdf_from_file(&self.source_path, None)
            .map_err(|e| {
                ExtractError::pdf(format!(
                    "failed to reopen '{}': {e}",
                    self.source_path.display()
                ))
            })?;
        let mut subset = self
            .pdfium
            .create_new_pdf()
            .map_err(|e| ExtractError::pdf(format!("failed to create document: {e}")))?;
        subset
            .pages_mut()
            .copy_page_range_from_document(&source, start as u16..=end as u16, 0)
            .map_err(|e| {
                ExtractError::pdf(format!("failed to copy pages {}-{}: {e}", start + 1, end + 1))
            })?;

        let parent = target.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        // Write to a temp file beside the target, then move it into place.
        let temp = tempfile::Builder::new()
            .prefix(".picksplit-")
            .suffix(".tmp.pdf")
            .tempfile_in(parent)?;
        let temp_path = temp.into_temp_path();
        subset
            .save_to_file(&temp_path)
            .map_err(|e| ExtractError::pdf(format!("failed to save subset: {e}")))?;
        let temp_path = temp_path
            .keep()
            .map_err(|e| ExtractError::pdf(format!("failed to retain temp file: {e}")))?;

        place_output(&temp_path, target)
    }
}

/// Moves a finished temp file to its target with a bounded retry, falling
/// back to an alternate filename when the target stays locked.
fn place_output(temp_path: &Path, target: &Path) -> ExtractResult<PathBuf> {
    const RETRY_DELAYS_MS: [u64; 3] = [0, 200, 600];

    for delay in RETRY_DELAYS_MS {
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        match std::fs::rename(temp_path, target) {
            Ok(()) => return Ok(target.to_path_buf()),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                debug!(target = %target.display(), "target locked, retrying rename");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // The temp file vanished underneath us (external cleanup).
                let _ = std::fs::remove_file(temp_path);
                return Err(ExtractError::pdf(format!(
                    "temp file disappeared before rename to '{}': {e}",
                    target.display()
                )));
            }
            Err(e) => {
                let _ = std::fs::remove_file(temp_path);
                return Err(ExtractError::Io(e));
            }
        }
    }

    let fallback = locked_fallback_path(target);
    match std::fs::rename(temp_path, &fallback) {
        Ok(()) => {
            warn!(
                target = %target.display(),
                fallback = %fallback.display(),
                "target stayed locked, wrote to fallback path"
            );
            Ok(fallback)
        }
        Err(e) => {
            let _ = std::fs::remove_file(temp_path);
            Err(ExtractError::Io(e))
        }
    }
}

/// A `<stem>_locked[_NN].pdf` sibling path that does not yet exist.
fn locked_fallback_path(target: &Path) -> PathBuf {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let stem = target
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    let extension = target
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("pdf");

    let first = parent.join(format!("{stem}_locked.{extension}"));
    if !first.exists() {
        return first;
    }
    for n in 2..100 {
        let candidate = parent.join(format!("{stem}_locked_{n:02}.{extension}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    parent.join(format!("{stem}_locked_final.{extension}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn place_output_moves_temp_to_target() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("scratch.tmp.pdf");
        std::fs::write(&temp, b"%PDF-1.4").unwrap();
        let target = dir.path().join("out.pdf");

        let written = place_output(&temp, &target).unwrap();
        assert_eq!(written, target);
        assert!(target.exists());
        assert!(!temp.exists());
    }

    #[test]
    fn place_output_overwrites_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("scratch.tmp.pdf");
        std::fs::write(&temp, b"%PDF-1.4 new").unwrap();
        let target = dir.path().join("out.pdf");
        std::fs::write(&target, b"old").unwrap();

        let written = place_output(&temp, &target).unwrap();
        assert_eq!(written, target);
        assert_eq!(std::fs::read(&target).unwrap(), b"%PDF-1.4 new");
    }

    #[test]
    fn fallback_path_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("doc.pdf");
        let first = locked_fallback_path(&target);
        assert_eq!(first.file_name().unwrap(), "doc_locked.pdf");

        std::fs::write(&first, b"x").unwrap();
        let second = locked_fallback_path(&target);
        assert_eq!(second.file_name().unwrap(), "doc_locked_02.pdf");
    }
}
