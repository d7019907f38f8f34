//! The preprocessing method bank.
//!
//! A fixed catalog of image transforms, each an independent, side-effect
//! free function over a shared grayscale buffer. The orchestrator pairs
//! each transform with an OCR call and votes over the results; degraded
//! scans (faint print, pen marks, skew, variable contrast) tend to be
//! readable under at least one of these.

use image::{GrayImage, Luma};
use imageproc::contrast::{adaptive_threshold, equalize_histogram, otsu_level, threshold, ThresholdType};
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::filter::{bilateral_filter, gaussian_blur_f32, median_filter, sharpen3x3};
use imageproc::hough::{detect_lines, draw_polar_lines, LineDetectionOptions};
use imageproc::map::map_colors;
use imageproc::morphology::{close, dilate, open};

/// Typed enumeration of the preprocessing variants.
///
/// The orchestrator iterates this enumeration in priority order instead
/// of dispatching through name-keyed tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreprocessMethod {
    /// Plain high threshold; the fast path for bold, clean print.
    HighThreshold,
    /// Adaptive local threshold for uneven illumination.
    Adaptive,
    /// Light denoise followed by OTSU global threshold.
    OtsuDenoise,
    /// Edge-preserving bilateral filter followed by OTSU.
    BilateralOtsu,
    /// Histogram equalization plus sharpening, then OTSU.
    ContrastSharpen,
    /// Morphological opening and dilation to knock out speckle.
    Opening,
    /// Median blur with a morphological close to reconnect strokes.
    MedianClose,
    /// Horizontal-run line removal for underlines and light scribbles.
    LineRemoval,
    /// Hough-transform line removal for heavy scribbles. Slowest.
    HoughLineRemoval,
}

impl PreprocessMethod {
    /// Every method, in the voting priority order the orchestrator uses:
    /// the cheap, frequently-agreeing transforms first, the aggressive
    /// line-removal transforms last.
    pub fn priority_order() -> &'static [PreprocessMethod] {
        use PreprocessMethod::*;
        &[
            HighThreshold,
            Adaptive,
            OtsuDenoise,
            BilateralOtsu,
            ContrastSharpen,
            Opening,
            MedianClose,
            LineRemoval,
            HoughLineRemoval,
        ]
    }

    /// Stable identifier for telemetry records.
    pub fn id(&self) -> &'static str {
        match self {
            PreprocessMethod::HighThreshold => "high_threshold",
            PreprocessMethod::Adaptive => "adaptive",
            PreprocessMethod::OtsuDenoise => "otsu_denoise",
            PreprocessMethod::BilateralOtsu => "bilateral_otsu",
            PreprocessMethod::ContrastSharpen => "contrast_sharpen",
            PreprocessMethod::Opening => "opening",
            PreprocessMethod::MedianClose => "median_close",
            PreprocessMethod::LineRemoval => "line_removal",
            PreprocessMethod::HoughLineRemoval => "hough_line_removal",
        }
    }

    /// Applies this transform to a shared grayscale input, returning a new
    /// buffer ready for the OCR engine.
    pub fn apply(&self, gray: &GrayImage) -> GrayImage {
        match self {
            PreprocessMethod::HighThreshold => threshold(gray, 200, ThresholdType::Binary),
            PreprocessMethod::Adaptive => adaptive_threshold(gray, 5),
            PreprocessMethod::OtsuDenoise => {
                let denoised = median_filter(gray, 1, 1);
                otsu_binarize(&denoised)
            }
            PreprocessMethod::BilateralOtsu => {
                let filtered = bilateral_filter(gray, 9, 75.0, 75.0);
                otsu_binarize(&filtered)
            }
            PreprocessMethod::ContrastSharpen => {
                let equalized = equalize_histogram(gray);
                let sharpened = sharpen3x3(&equalized);
                otsu_binarize(&sharpened)
            }
            PreprocessMethod::Opening => {
                let blurred = gaussian_blur_f32(gray, 1.0);
                let binary = otsu_binarize(&blurred);
                // Operate with text as foreground, then restore polarity.
                let inked = invert(&binary);
                let opened = open(&inked, Norm::LInf, 1);
                let grown = dilate(&opened, Norm::LInf, 1);
                invert(&grown)
            }
            PreprocessMethod::MedianClose => {
                let median = median_filter(gray, 1, 1);
                let binary = otsu_binarize(&median);
                let inked = invert(&binary);
                let closed = close(&inked, Norm::LInf, 1);
                invert(&closed)
            }
            PreprocessMethod::LineRemoval => remove_horizontal_lines(gray),
            PreprocessMethod::HoughLineRemoval => remove_hough_lines(gray),
        }
    }
}

/// Zeroes every pixel at or below the darkness threshold, leaving lighter
/// content untouched. Dark print becomes solid black while colored stamps
/// and watermarks stay light enough for the thresholding methods to drop.
pub fn filter_black_text(gray: &GrayImage, threshold: u8) -> GrayImage {
    map_colors(gray, |p| {
        if p[0] <= threshold {
            Luma([0])
        } else {
            Luma([p[0]])
        }
    })
}

fn otsu_binarize(gray: &GrayImage) -> GrayImage {
    let level = otsu_level(gray);
    threshold(gray, level, ThresholdType::Binary)
}

fn invert(gray: &GrayImage) -> GrayImage {
    map_colors(gray, |p| Luma([255 - p[0]]))
}

/// Suppresses long horizontal ink runs (underlines, strike-throughs).
///
/// The line mask is a horizontal morphological opening of the inked
/// image: only runs longer than the structuring window survive, and those
/// are subtracted from the text before a small opening cleans up stubs.
fn remove_horizontal_lines(gray: &GrayImage) -> GrayImage {
    let binary = otsu_binarize(gray);
    let inked = invert(&binary);

    let half_len = (gray.width() / 16).clamp(8, 40) as usize;
    let eroded = row_erode(&inked, half_len);
    let line_mask = row_dilate(&eroded, half_len + 2);

    let mut cleaned = inked.clone();
    for (mask_px, out_px) in line_mask.pixels().zip(cleaned.pixels_mut()) {
        if mask_px[0] > 0 {
            out_px[0] = 0;
        }
    }
    let opened = open(&cleaned, Norm::LInf, 1);
    invert(&opened)
}

/// Hough-transform line removal for heavy scribbles.
fn remove_hough_lines(gray: &GrayImage) -> GrayImage {
    let binary = otsu_binarize(gray);
    let inked = invert(&binary);

    let edges = canny(gray, 50.0, 150.0);
    let options = LineDetectionOptions {
        vote_threshold: 30,
        suppression_radius: 8,
    };
    let lines = detect_lines(&edges, options);

    let mut mask = GrayImage::new(gray.width(), gray.height());
    if !lines.is_empty() {
        mask = draw_polar_lines(&mask, &lines, Luma([255u8]));
        mask = dilate(&mask, Norm::LInf, 1);
    }

    let mut cleaned = inked;
    for (mask_px, out_px) in mask.pixels().zip(cleaned.pixels_mut()) {
        if mask_px[0] > 0 {
            out_px[0] = 0;
        }
    }
    let closed = close(&cleaned, Norm::LInf, 1);
    invert(&closed)
}

/// Horizontal erosion: a pixel survives only if the whole row window
/// around it is foreground.
fn row_erode(img: &GrayImage, half_len: usize) -> GrayImage {
    row_morph(img, half_len, true)
}

/// Horizontal dilation: a pixel lights up if anything in its row window
/// is foreground.
fn row_dilate(img: &GrayImage, half_len: usize) -> GrayImage {
    row_morph(img, half_len, false)
}

fn row_morph(img: &GrayImage, half_len: usize, erode: bool) -> GrayImage {
    let (width, height) = img.dimensions();
    let mut out = GrayImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let lo = x.saturating_sub(half_len as u32);
            let hi = (x + half_len as u32).min(width - 1);
            let mut value = if erode { 255u8 } else { 0u8 };
            for wx in lo..=hi {
                let p = img.get_pixel(wx, y)[0];
                value = if erode { value.min(p) } else { value.max(p) };
            }
            out.put_pixel(x, y, Luma([value]));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_image() -> GrayImage {
        // White background with a dark block in the middle.
        let mut img = GrayImage::from_pixel(64, 32, Luma([255]));
        for y in 10..20 {
            for x in 20..44 {
                img.put_pixel(x, y, Luma([30]));
            }
        }
        img
    }

    #[test]
    fn every_method_preserves_dimensions() {
        let img = test_image();
        for method in PreprocessMethod::priority_order() {
            let out = method.apply(&img);
            assert_eq!(out.dimensions(), img.dimensions(), "{}", method.id());
        }
    }

    #[test]
    fn priority_order_lists_all_methods_once() {
        let order = PreprocessMethod::priority_order();
        assert_eq!(order.len(), 9);
        let ids: std::collections::HashSet<_> = order.iter().map(|m| m.id()).collect();
        assert_eq!(ids.len(), 9);
    }

    #[test]
    fn high_threshold_binarizes() {
        let out = PreprocessMethod::HighThreshold.apply(&test_image());
        assert!(out.pixels().all(|p| p[0] == 0 || p[0] == 255));
        assert_eq!(out.get_pixel(30, 15)[0], 0);
        assert_eq!(out.get_pixel(0, 0)[0], 255);
    }

    #[test]
    fn filter_black_text_zeroes_dark_pixels_only() {
        let img = test_image();
        let filtered = filter_black_text(&img, 100);
        assert_eq!(filtered.get_pixel(30, 15)[0], 0);
        assert_eq!(filtered.get_pixel(0, 0)[0], 255);
    }

    #[test]
    fn line_removal_erases_long_run_keeps_blob() {
        let mut img = GrayImage::from_pixel(128, 32, Luma([255]));
        // A full-width underline.
        for x in 0..128 {
            img.put_pixel(x, 28, Luma([0]));
        }
        // A compact character-sized blob.
        for y in 8..16 {
            for x in 60..66 {
                img.put_pixel(x, y, Luma([0]));
            }
        }
        let out = PreprocessMethod::LineRemoval.apply(&img);
        assert_eq!(out.get_pixel(64, 28)[0], 255, "underline should be erased");
        assert_eq!(out.get_pixel(62, 12)[0], 0, "blob should survive");
    }

    #[test]
    fn row_morphology_round_trips_solid_rows() {
        let mut img = GrayImage::new(32, 4);
        for x in 0..32 {
            img.put_pixel(x, 1, Luma([255]));
        }
        let opened = row_dilate(&row_erode(&img, 4), 4);
        assert_eq!(opened.get_pixel(16, 1)[0], 255);
        assert_eq!(opened.get_pixel(16, 0)[0], 0);
    }
}
