//! Extraction configuration.
//!
//! One validated configuration struct for the whole pipeline, replacing the
//! scattered toggle reads of earlier designs. All range checks happen in
//! [`ExtractionConfig::validate`] so a bad setting fails at construction,
//! not mid-job.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::errors::{ExtractError, ExtractResult};

/// Centralized configuration for parallel processing behavior.
///
/// The method bank's per-method calls are independent pure functions, but the
/// external OCR engine may not be reentrant; the conservative default is a
/// single worker (sequential). Raising `method_workers` opts into concurrent
/// engine calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelPolicy {
    /// Maximum number of threads for the global rayon pool.
    /// If None, rayon uses its default (typically the CPU core count).
    pub max_threads: Option<usize>,

    /// Worker width for the per-page method fan-out. 1 means sequential,
    /// which is also the only safe setting for a non-reentrant OCR engine.
    pub method_workers: usize,
}

impl ParallelPolicy {
    /// Install the global rayon thread pool with the configured thread count.
    ///
    /// Call once at startup. Returns `Ok(false)` when `max_threads` is None
    /// (nothing to configure).
    pub fn install_global_thread_pool(&self) -> Result<bool, rayon::ThreadPoolBuildError> {
        if let Some(num_threads) = self.max_threads {
            rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build_global()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Whether the method fan-out may run concurrently.
    pub fn methods_parallel(&self) -> bool {
        self.method_workers > 1
    }
}

impl Default for ParallelPolicy {
    fn default() -> Self {
        Self {
            max_threads: None,
            method_workers: 1,
        }
    }
}

/// Type-safe configuration for header extraction and document splitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    // Header region, as a fraction of page size in percent. Values above
    // 100 are interpreted as absolute page units.
    pub header_area_top: f32,
    pub header_area_left: f32,
    pub header_area_width: f32,
    pub header_area_height: f32,

    /// 1-based page numbers to read headers from. Empty means all pages.
    pub pages_to_read: Vec<usize>,

    // Header pattern structure.
    pub expected_parts: usize,
    pub min_expected_parts: usize,
    pub expected_separator: char,
    pub pattern_prefix_length: usize,
    pub pattern_country_min: usize,
    pub pattern_country_max: usize,
    pub pattern_code_min: usize,
    pub pattern_code_max: usize,
    /// Serial segment length bounds, including the prefix letter.
    pub pattern_serial_min: usize,
    pub pattern_serial_max: usize,
    /// Letters a strictly valid serial may start with.
    pub serial_allowed_prefixes: Vec<char>,
    /// Digit-run bounds for a strictly valid serial.
    pub min_serial_digits: usize,
    pub expected_serial_digits: usize,
    /// OCR confusion substitutions applied to the serial digit run during
    /// normalization, as `FROM:TO` pairs.
    pub serial_substitutions: String,
    /// Full-header regex; a normalized header matching it earns
    /// `header_pattern_bonus`.
    pub header_pattern: String,
    pub header_pattern_bonus: i32,
    /// Hard ceiling on the score of any header without a strictly valid
    /// serial.
    pub invalid_serial_score_cap: i32,
    /// Digit-run similarity required to merge a strict header with a close
    /// non-strict neighbor.
    pub serial_close_ratio: f64,
    /// Whole-string similarity threshold used by `headers_match` callers.
    /// 1.0 disables the similarity fallback entirely.
    pub header_similarity_threshold: f64,

    // Adaptive rendering.
    pub adaptive_rendering: bool,
    pub initial_render_scale: f32,
    pub mid_render_scale: f32,
    pub max_render_scale: f32,
    /// Scale for the targeted anchor-rescue re-render.
    pub rescue_render_scale: f32,
    pub score_threshold_for_escalation: i32,
    pub early_exit_score: i32,

    // OCR budget and stability guards.
    pub max_ocr_attempts: usize,
    pub method_early_exit_min_attempts: usize,
    pub method_early_exit_min_confirmations: usize,
    pub ocr_confidence_threshold: f32,

    // OCR input conditioning.
    pub filter_black_text: bool,
    pub black_text_threshold: u8,
    pub char_whitelist: String,
    pub psm_mode: u8,

    // Per-scale vote weights.
    pub vote_score_weight: f32,
    pub vote_confidence_weight: f32,

    // Secondary-engine fallback gates.
    pub enable_secondary_fallback: bool,
    pub fallback_confidence_threshold: f32,
    /// Structural score at or above which the fallback is skipped outright.
    pub fallback_skip_score: i32,
    pub enable_pattern_check: bool,

    // Glyph ambiguity resolution.
    pub code_ambiguity_pairs: String,
    pub box_alignment_ambiguity_pairs: String,
    pub ambiguity_requires_mixed_code: bool,
    pub enable_code_char_classifier: bool,
    pub classifier_min_vote_support: usize,
    pub allow_leading_zero_to_letter: bool,
    pub enable_glyph_width_fallback: bool,
    pub glyph_width_ratio: f32,
    pub enable_image_support_rescue: bool,
    pub image_support_min_votes: usize,
    pub enable_anchor_harmonize: bool,
    pub harmonize_min_evidence: usize,
    pub enable_anchor_rescue: bool,

    // Splitting and output.
    pub enable_splitting: bool,
    pub min_pages_per_split: usize,
    pub split_naming_pattern: String,
    pub max_filename_length: usize,
    pub replace_spaces_with: char,
    pub output_dir: String,

    // Telemetry.
    pub enable_telemetry: bool,
    pub telemetry_queue_size: usize,
    pub circuit_breaker_threshold: usize,
    pub telemetry_path: String,

    pub parallel: ParallelPolicy,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            header_area_top: 0.0,
            header_area_left: 0.0,
            header_area_width: 100.0,
            header_area_height: 15.0,
            pages_to_read: Vec::new(),
            expected_parts: 4,
            min_expected_parts: 3,
            expected_separator: '-',
            pattern_prefix_length: 1,
            pattern_country_min: 1,
            pattern_country_max: 2,
            pattern_code_min: 2,
            pattern_code_max: 6,
            pattern_serial_min: 7,
            pattern_serial_max: 10,
            serial_allowed_prefixes: vec!['S', 'R'],
            min_serial_digits: 6,
            expected_serial_digits: 8,
            serial_substitutions: "S:5,B:8,O:0,I:1,Z:2".to_string(),
            header_pattern: r"^[A-Z]-[A-Z]{1,2}-[A-Z0-9]{2,6}-[SR][0-9]{6,8}$".to_string(),
            header_pattern_bonus: 25,
            invalid_serial_score_cap: 89,
            serial_close_ratio: 0.85,
            header_similarity_threshold: 1.0,
            adaptive_rendering: true,
            initial_render_scale: 2.0,
            mid_render_scale: 3.0,
            max_render_scale: 6.0,
            rescue_render_scale: 8.0,
            score_threshold_for_escalation: 70,
            early_exit_score: 90,
            max_ocr_attempts: 8,
            method_early_exit_min_attempts: 2,
            method_early_exit_min_confirmations: 2,
            ocr_confidence_threshold: 82.0,
            filter_black_text: true,
            black_text_threshold: 100,
            char_whitelist: "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-".to_string(),
            psm_mode: 7,
            vote_score_weight: 1.0,
            vote_confidence_weight: 0.5,
            enable_secondary_fallback: false,
            fallback_confidence_threshold: 85.0,
            fallback_skip_score: 100,
            enable_pattern_check: true,
            code_ambiguity_pairs: "O:0".to_string(),
            box_alignment_ambiguity_pairs: "O:0,I:1,S:5,B:8,E:F,L:I".to_string(),
            ambiguity_requires_mixed_code: true,
            enable_code_char_classifier: true,
            classifier_min_vote_support: 2,
            allow_leading_zero_to_letter: false,
            enable_glyph_width_fallback: true,
            glyph_width_ratio: 1.12,
            enable_image_support_rescue: true,
            image_support_min_votes: 1,
            enable_anchor_harmonize: true,
            harmonize_min_evidence: 1,
            enable_anchor_rescue: true,
            enable_splitting: true,
            min_pages_per_split: 1,
            split_naming_pattern: "{header}_pages_{start}-{end}".to_string(),
            max_filename_length: 100,
            replace_spaces_with: '_',
            output_dir: "output".to_string(),
            enable_telemetry: false,
            telemetry_queue_size: 1000,
            circuit_breaker_threshold: 5,
            telemetry_path: "extraction_log.jsonl".to_string(),
            parallel: ParallelPolicy::default(),
        }
    }
}

impl ExtractionConfig {
    /// Loads and validates a configuration from a TOML file.
    pub fn from_toml_path(path: &Path) -> ExtractResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| ExtractError::config_error("parsing config file", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates field ranges and cross-field constraints.
    pub fn validate(&self) -> ExtractResult<()> {
        if self.header_area_width <= 0.0 || self.header_area_height <= 0.0 {
            return Err(ExtractError::invalid_field(
                "header_area_width/height",
                "> 0",
                format!("{}x{}", self.header_area_width, self.header_area_height),
            ));
        }
        if self.header_area_top < 0.0 || self.header_area_left < 0.0 {
            return Err(ExtractError::invalid_field(
                "header_area_top/left",
                ">= 0",
                format!("{}/{}", self.header_area_top, self.header_area_left),
            ));
        }
        if self.min_expected_parts < 2 || self.min_expected_parts > self.expected_parts {
            return Err(ExtractError::invalid_field(
                "min_expected_parts",
                format!("2..={}", self.expected_parts),
                self.min_expected_parts.to_string(),
            ));
        }
        if self.min_serial_digits > self.expected_serial_digits {
            return Err(ExtractError::invalid_field(
                "min_serial_digits",
                format!("<= {}", self.expected_serial_digits),
                self.min_serial_digits.to_string(),
            ));
        }
        if self.initial_render_scale <= 0.0 || self.initial_render_scale > self.max_render_scale {
            return Err(ExtractError::invalid_field(
                "initial_render_scale",
                format!("0.0..={}", self.max_render_scale),
                self.initial_render_scale.to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.serial_close_ratio) {
            return Err(ExtractError::invalid_field(
                "serial_close_ratio",
                "0.0..=1.0",
                self.serial_close_ratio.to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.header_similarity_threshold) {
            return Err(ExtractError::invalid_field(
                "header_similarity_threshold",
                "0.0..=1.0",
                self.header_similarity_threshold.to_string(),
            ));
        }
        if self.glyph_width_ratio < 1.0 {
            return Err(ExtractError::invalid_field(
                "glyph_width_ratio",
                ">= 1.0",
                self.glyph_width_ratio.to_string(),
            ));
        }
        if self.max_ocr_attempts == 0 {
            return Err(ExtractError::invalid_field(
                "max_ocr_attempts",
                ">= 1",
                "0",
            ));
        }
        if self.serial_allowed_prefixes.is_empty() {
            return Err(ExtractError::invalid_field(
                "serial_allowed_prefixes",
                "at least one letter",
                "empty",
            ));
        }
        Ok(())
    }

    /// The render scale ladder for adaptive extraction, ascending.
    pub fn scale_ladder(&self) -> Vec<f32> {
        if self.adaptive_rendering {
            vec![
                self.initial_render_scale,
                self.mid_render_scale,
                self.max_render_scale,
            ]
        } else {
            vec![self.max_render_scale]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ExtractionConfig::default().validate().expect("defaults must validate");
    }

    #[test]
    fn rejects_inverted_scale_ladder() {
        let config = ExtractionConfig {
            initial_render_scale: 8.0,
            max_render_scale: 6.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_close_ratio() {
        let config = ExtractionConfig {
            serial_close_ratio: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn scale_ladder_collapses_when_not_adaptive() {
        let config = ExtractionConfig {
            adaptive_rendering: false,
            ..Default::default()
        };
        assert_eq!(config.scale_ladder(), vec![6.0]);
    }

    #[test]
    fn parallel_policy_defaults_to_sequential_methods() {
        let policy = ParallelPolicy::default();
        assert!(!policy.methods_parallel());
    }

    #[test]
    fn parses_partial_toml() {
        let parsed: ExtractionConfig =
            toml::from_str("early_exit_score = 95\nmax_ocr_attempts = 4\n").unwrap();
        assert_eq!(parsed.early_exit_score, 95);
        assert_eq!(parsed.max_ocr_attempts, 4);
        assert_eq!(parsed.expected_parts, 4);
    }
}
