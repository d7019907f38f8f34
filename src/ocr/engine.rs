//! OCR engine abstraction.
//!
//! The engine is an external collaborator: given an image and a
//! whitelist/segmentation configuration it returns text, a mean
//! confidence, and (optionally) per-character boxes. Unavailability is a
//! distinguishable failure mode, never an empty result.
//!
//! `TesseractEngine` drives the system `tesseract` binary over temp PNG
//! files: one `tsv` invocation for text plus word confidences, and a
//! `makebox` invocation when character boxes are requested.

use std::fmt;
use std::process::Command;
use std::sync::OnceLock;

use image::GrayImage;
use tracing::{debug, warn};

use crate::core::errors::{ExtractError, ExtractResult};

/// Per-call recognition options.
#[derive(Debug, Clone)]
pub struct OcrOptions {
    /// Page segmentation mode (7 = single text line, 10 = single char).
    pub psm: u8,
    /// Restrict recognition to these characters, when set.
    pub whitelist: Option<String>,
    /// Also collect per-character bounding boxes.
    pub collect_boxes: bool,
}

impl OcrOptions {
    /// Single-line recognition with a character whitelist.
    pub fn single_line(whitelist: impl Into<String>) -> Self {
        Self {
            psm: 7,
            whitelist: Some(whitelist.into()),
            collect_boxes: false,
        }
    }

    /// Single-character recognition constrained to an ambiguous pair.
    pub fn single_char_pair(pair: (char, char)) -> Self {
        Self {
            psm: 10,
            whitelist: Some(format!("{}{}", pair.0, pair.1)),
            collect_boxes: false,
        }
    }

    /// Returns a copy with a different segmentation mode.
    pub fn with_psm(&self, psm: u8) -> Self {
        Self {
            psm,
            ..self.clone()
        }
    }

    /// Returns a copy that also collects character boxes.
    pub fn with_boxes(&self) -> Self {
        Self {
            collect_boxes: true,
            ..self.clone()
        }
    }
}

/// One recognized character with its image-space box (top-left origin).
#[derive(Debug, Clone, PartialEq)]
pub struct CharBox {
    pub ch: char,
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// The result of one engine invocation.
#[derive(Debug, Clone, Default)]
pub struct Recognition {
    /// Recognized text, whitespace-trimmed.
    pub text: String,
    /// Mean word confidence in `0..=100`, 0.0 when nothing was recognized.
    pub mean_confidence: f32,
    /// Per-character boxes, populated only when requested and supported.
    pub char_boxes: Vec<CharBox>,
}

/// An OCR engine. Implementations must be callable from worker threads.
pub trait OcrEngine: Send + Sync + fmt::Debug {
    /// Short engine identifier for logs and telemetry.
    fn name(&self) -> &str;

    /// Whether the engine can be invoked at all. A `false` here must make
    /// `recognize` fail with `ExtractError::EngineUnavailable`.
    fn is_available(&self) -> bool;

    /// Recognizes text in a grayscale image.
    fn recognize(&self, image: &GrayImage, options: &OcrOptions) -> ExtractResult<Recognition>;
}

/// System-binary Tesseract engine.
#[derive(Debug)]
pub struct TesseractEngine {
    binary: String,
    language: String,
    /// OCR engine mode: 3 = default LSTM+legacy, 0 = legacy only.
    oem: u8,
    name: String,
    available: OnceLock<bool>,
}

impl TesseractEngine {
    /// The default engine configuration.
    pub fn new() -> Self {
        Self {
            binary: "tesseract".to_string(),
            language: "eng".to_string(),
            oem: 3,
            name: "tesseract".to_string(),
            available: OnceLock::new(),
        }
    }

    /// A legacy-mode instance, usable as the secondary fallback engine:
    /// the legacy recognizer disagrees with the LSTM one often enough to
    /// act as an independent vote.
    pub fn legacy() -> Self {
        Self {
            binary: "tesseract".to_string(),
            language: "eng".to_string(),
            oem: 0,
            name: "tesseract-legacy".to_string(),
            available: OnceLock::new(),
        }
    }

    fn probe(&self) -> bool {
        match Command::new(&self.binary).arg("--version").output() {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    fn unavailable(&self, reason: impl Into<String>) -> ExtractError {
        ExtractError::EngineUnavailable {
            engine: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn run(&self, image_path: &std::path::Path, options: &OcrOptions, output_config: &str) -> ExtractResult<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(image_path)
            .arg("stdout")
            .args(["-l", &self.language])
            .args(["--psm", &options.psm.to_string()])
            .args(["--oem", &self.oem.to_string()]);
        if let Some(whitelist) = &options.whitelist {
            cmd.args(["-c", &format!("tessedit_char_whitelist={whitelist}")]);
        }
        if !output_config.is_empty() {
            cmd.arg(output_config);
        }

        match cmd.output() {
            Ok(output) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(ExtractError::Recognition {
                    engine: self.name.clone(),
                    context: stderr.trim().to_string(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(self.unavailable("binary not found (install tesseract-ocr)"))
            }
            Err(e) => Err(ExtractError::Io(e)),
        }
    }
}

impl Default for TesseractEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl OcrEngine for TesseractEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        *self.available.get_or_init(|| {
            let ok = self.probe();
            if !ok {
                warn!(engine = %self.name, "OCR engine binary not runnable");
            }
            ok
        })
    }

    fn recognize(&self, image: &GrayImage, options: &OcrOptions) -> ExtractResult<Recognition> {
        if !self.is_available() {
            return Err(self.unavailable("binary not found (install tesseract-ocr)"));
        }

        let file = tempfile::Builder::new()
            .prefix("picksplit-ocr-")
            .suffix(".png")
            .tempfile()?;
        image.save_with_format(file.path(), image::ImageFormat::Png)?;

        let tsv = self.run(file.path(), options, "tsv")?;
        let (text, mean_confidence) = parse_tsv(&tsv);
        debug!(engine = %self.name, psm = options.psm, %text, mean_confidence, "recognized");

        let char_boxes = if options.collect_boxes {
            let boxes = self.run(file.path(), options, "makebox")?;
            parse_box_lines(&boxes, image.height())
        } else {
            Vec::new()
        };

        Ok(Recognition {
            text,
            mean_confidence,
            char_boxes,
        })
    }
}

/// Parses Tesseract TSV output into `(joined_text, mean_confidence)`.
///
/// Word rows are level 5; the confidence column is -1 for non-word rows.
pub(crate) fn parse_tsv(tsv: &str) -> (String, f32) {
    let mut words: Vec<&str> = Vec::new();
    let mut conf_sum = 0.0f32;
    let mut conf_count = 0usize;

    for line in tsv.lines().skip(1) {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let word = cols[11].trim();
        if word.is_empty() {
            continue;
        }
        words.push(word);
        if let Ok(conf) = cols[10].parse::<f32>() {
            if conf >= 0.0 {
                conf_sum += conf;
                conf_count += 1;
            }
        }
    }

    let mean = if conf_count > 0 {
        conf_sum / conf_count as f32
    } else {
        0.0
    };
    (words.join(" ").trim().to_string(), mean)
}

/// Parses `makebox` output (`c x1 y1 x2 y2 page`, bottom-left origin)
/// into top-left-origin character boxes.
pub(crate) fn parse_box_lines(output: &str, image_height: u32) -> Vec<CharBox> {
    let mut boxes = Vec::new();
    for line in output.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 5 {
            continue;
        }
        let Some(ch) = cols[0].chars().next() else {
            continue;
        };
        let coords: Option<Vec<u32>> = cols[1..5].iter().map(|c| c.parse().ok()).collect();
        let Some(coords) = coords else {
            continue;
        };
        let (x1, y1, x2, y2) = (coords[0], coords[1], coords[2], coords[3]);
        if x2 <= x1 || y2 <= y1 || y2 > image_height {
            continue;
        }
        boxes.push(CharBox {
            ch,
            left: x1,
            top: image_height - y2,
            width: x2 - x1,
            height: y2 - y1,
        });
    }
    boxes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tsv_joins_words_and_averages_confidence() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
                   1\t1\t0\t0\t0\t0\t0\t0\t100\t40\t-1\t\n\
                   5\t1\t1\t1\t1\t1\t2\t4\t40\t20\t92\tB-HK-WFE\n\
                   5\t1\t1\t1\t1\t2\t50\t4\t60\t20\t88\tS17975643\n";
        let (text, conf) = parse_tsv(tsv);
        assert_eq!(text, "B-HK-WFE S17975643");
        assert!((conf - 90.0).abs() < 0.01);
    }

    #[test]
    fn parse_tsv_empty_output_is_zero_confidence() {
        let (text, conf) = parse_tsv("level\tconf\ttext\n");
        assert!(text.is_empty());
        assert_eq!(conf, 0.0);
    }

    #[test]
    fn parse_box_lines_flips_origin() {
        let output = "B 10 80 20 100 0\n- 22 80 26 100 0\n";
        let boxes = parse_box_lines(output, 120);
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].ch, 'B');
        assert_eq!(boxes[0].left, 10);
        assert_eq!(boxes[0].top, 20);
        assert_eq!(boxes[0].width, 10);
        assert_eq!(boxes[0].height, 20);
    }

    #[test]
    fn parse_box_lines_skips_malformed_rows() {
        let output = "B 10 80\nX a b c d 0\nC 5 10 15 20 0\n";
        let boxes = parse_box_lines(output, 100);
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].ch, 'C');
    }

    #[test]
    fn options_builders_compose() {
        let opts = OcrOptions::single_line("AB-").with_psm(8).with_boxes();
        assert_eq!(opts.psm, 8);
        assert!(opts.collect_boxes);
        assert_eq!(opts.whitelist.as_deref(), Some("AB-"));
        let pair = OcrOptions::single_char_pair(('O', '0'));
        assert_eq!(pair.psm, 10);
        assert_eq!(pair.whitelist.as_deref(), Some("O0"));
    }
}
