//! OCR orchestration: adaptive rendering, method-bank voting, early
//! exits, secondary-engine fallback, and glyph-level refinement.
//!
//! The orchestrator drives the method bank across an increasing ladder of
//! render scales, votes over per-method results, and stops escalating as
//! soon as a result is good enough — unless the result looks structurally
//! suspicious, in which case escalation continues. A single
//! lucky-but-wrong high-confidence method cannot end the search: early
//! exit inside a scale requires a minimum number of attempts and repeated
//! identical confirmations.

use std::collections::BTreeMap;
use std::sync::Arc;

use image::GrayImage;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::ambiguity::{
    self, inspect_code_ambiguity, resolve_code_ambiguity_by_support, CodeAmbiguity,
};
use crate::core::config::ExtractionConfig;
use crate::core::context::PageContext;
use crate::core::errors::{ExtractError, ExtractResult};
use crate::extract::{PageSource, RegionSpec};
use crate::ocr::engine::{CharBox, OcrEngine, OcrOptions};
use crate::ocr::methods::{filter_black_text, PreprocessMethod};
use crate::validator::HeaderValidator;

/// The outcome of one (method, OCR) attempt.
#[derive(Debug, Clone)]
pub struct MethodOutcome {
    pub method: PreprocessMethod,
    pub text: String,
    pub score: i32,
    pub confidence: f32,
}

/// Page-level extraction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    Success,
    NoTextFound,
    Error,
}

impl PageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageStatus::Success => "success",
            PageStatus::NoTextFound => "no_text_found",
            PageStatus::Error => "error",
        }
    }
}

/// The final product of per-page OCR extraction.
#[derive(Debug, Clone)]
pub struct PageExtraction {
    pub text: String,
    pub status: PageStatus,
    pub method_outcomes: Vec<MethodOutcome>,
    pub frequency_ratio: f32,
    /// Semicolon-joined quality annotations (ambiguity, rescue events).
    pub quality_flags: String,
}

impl PageExtraction {
    fn unreadable() -> Self {
        Self {
            text: String::new(),
            status: PageStatus::Error,
            method_outcomes: Vec::new(),
            frequency_ratio: 0.0,
            quality_flags: String::new(),
        }
    }
}

/// One scale's best result, fed into cross-scale selection.
#[derive(Debug, Clone)]
pub struct ScaleCandidate {
    pub text: String,
    pub score: i32,
    pub strict: bool,
    pub freq_ratio: f32,
    pub confidence: f32,
    pub scale: f32,
}

/// The OCR pipeline. Holds the engine(s) and the validator; all per-call
/// state travels in [`PageContext`].
pub struct OcrPipeline {
    config: Arc<ExtractionConfig>,
    validator: HeaderValidator,
    engine: Arc<dyn OcrEngine>,
    secondary: Option<Arc<dyn OcrEngine>>,
    code_pairs: BTreeMap<char, char>,
    alignment_pairs: BTreeMap<char, char>,
}

impl OcrPipeline {
    pub fn new(
        config: Arc<ExtractionConfig>,
        validator: HeaderValidator,
        engine: Arc<dyn OcrEngine>,
        secondary: Option<Arc<dyn OcrEngine>>,
    ) -> Self {
        let code_pairs = ambiguity::parse_pair_map(&config.code_ambiguity_pairs);
        let alignment_pairs = ambiguity::parse_pair_map(&config.box_alignment_ambiguity_pairs);
        Self {
            config,
            validator,
            engine,
            secondary,
            code_pairs,
            alignment_pairs,
        }
    }

    /// Extracts the best-available header text for a page region, walking
    /// the render scale ladder and voting across methods and scales.
    ///
    /// Never raises for an unreadable page: an unavailable engine or a
    /// total recognition failure degrades to an empty-text result with
    /// `PageStatus::Error` / `NoTextFound`.
    pub fn extract_adaptive(
        &self,
        source: &dyn PageSource,
        page_index: usize,
        region: &RegionSpec,
        ctx: &PageContext,
    ) -> PageExtraction {
        if !self.engine.is_available() {
            warn!(
                engine = self.engine.name(),
                page = ctx.page_num,
                "primary OCR engine unavailable, page marked unreadable"
            );
            return PageExtraction::unreadable();
        }

        let mut candidates: Vec<ScaleCandidate> = Vec::new();
        let mut best_outcomes: Vec<MethodOutcome> = Vec::new();
        let mut best_score_so_far = i32::MIN;
        let mut last_image: Option<GrayImage> = None;

        for scale in self.config.scale_ladder() {
            let scaled_ctx = ctx.with_scale(scale);
            info!(page = ctx.page_num, scale, "running OCR at scale");

            let gray = match source.render_region(page_index, region, scale) {
                Ok(img) => img,
                Err(e) => {
                    warn!(page = ctx.page_num, scale, error = %e, "render failed, skipping scale");
                    continue;
                }
            };

            let (text, outcomes, freq_ratio) = self.run_methods(&gray, &scaled_ctx);
            let (score, corrected) = self.validator.validate_and_score(&text);
            let strict = !corrected.is_empty() && self.validator.is_strict_header(&corrected);
            let confidence = mean_confidence(&outcomes, &text);
            debug!(page = ctx.page_num, scale, %corrected, score, "scale result");

            if score > best_score_so_far {
                best_outcomes = outcomes.clone();
                best_score_so_far = score;
            }
            candidates.push(ScaleCandidate {
                text: corrected.clone(),
                score,
                strict,
                freq_ratio,
                confidence,
                scale,
            });
            last_image = Some(gray);

            if score >= self.config.early_exit_score {
                let (suspicious, reason) = self.is_suspicious_for_early_exit(&corrected);
                if suspicious {
                    debug!(page = ctx.page_num, %reason, "early exit vetoed, escalating");
                } else {
                    info!(page = ctx.page_num, score, "early exit on excellent score");
                    break;
                }
            } else if score >= self.config.score_threshold_for_escalation {
                let (suspicious, _) = self.is_suspicious_for_early_exit(&corrected);
                if !suspicious {
                    info!(page = ctx.page_num, score, "good score, skipping escalation");
                    break;
                }
            }
        }

        let Some(best_index) = Self::select_cross_scale_result(&candidates) else {
            return PageExtraction {
                text: String::new(),
                status: PageStatus::NoTextFound,
                method_outcomes: best_outcomes,
                frequency_ratio: 0.0,
                quality_flags: String::new(),
            };
        };
        let best = candidates[best_index].clone();
        let mut text = best.text.clone();
        let mut flags: Vec<String> = Vec::new();

        // Secondary-engine fallback on quality-gate failures.
        if let Some(image) = &last_image {
            if let Some((replacement, reason)) = self.try_secondary_fallback(&best, image) {
                flags.push(format!("secondary_engine:{reason}"));
                text = replacement;
            }
        }

        // Glyph-level refinement of the customer-code segment.
        if let Some(image) = &last_image {
            let inspection = self.inspect(&text);
            if inspection.is_ambiguous {
                let (refined, reason) = self.refine_code_glyphs(&text, image);
                if refined != text {
                    flags.push(format!("{}:{reason}", ambiguity::FLAG_GLYPH_DISAMBIGUATED));
                    text = refined;
                } else {
                    flags.push(format!("{}:{reason}", ambiguity::FLAG_GLYPH_SKIPPED));
                    flags.push(format!(
                        "{}:{}->{}",
                        ambiguity::FLAG_CODE_AMBIGUITY,
                        inspection.code_segment,
                        inspection.alternative_codes.join("|")
                    ));
                }
            }
        }

        let status = if text.is_empty() {
            PageStatus::NoTextFound
        } else {
            PageStatus::Success
        };
        PageExtraction {
            text,
            status,
            method_outcomes: best_outcomes,
            frequency_ratio: best.freq_ratio,
            quality_flags: flags.join(";"),
        }
    }

    /// Runs the method bank over one rendered image and votes for the best
    /// result. Returns `(best_text, outcomes, frequency_ratio)`.
    pub fn run_methods(
        &self,
        gray: &GrayImage,
        ctx: &PageContext,
    ) -> (String, Vec<MethodOutcome>, f32) {
        let input = if self.config.filter_black_text {
            filter_black_text(gray, self.config.black_text_threshold)
        } else {
            gray.clone()
        };

        let order: Vec<PreprocessMethod> = PreprocessMethod::priority_order()
            .iter()
            .copied()
            .take(self.config.max_ocr_attempts)
            .collect();

        let outcomes: Vec<MethodOutcome> = if self.config.parallel.methods_parallel() {
            order
                .par_iter()
                .map(|method| self.run_single(*method, &input, ctx))
                .collect()
        } else {
            let mut collected: Vec<MethodOutcome> = Vec::with_capacity(order.len());
            for method in order {
                let outcome = self.run_single(method, &input, ctx);
                collected.push(outcome);
                if self.can_stop_method_loop(&collected) {
                    debug!(page = ctx.page_num, "method loop early exit");
                    break;
                }
            }
            collected
        };

        let (best, freq_ratio) = self.vote(&outcomes);
        (best, outcomes, freq_ratio)
    }

    fn run_single(
        &self,
        method: PreprocessMethod,
        input: &GrayImage,
        ctx: &PageContext,
    ) -> MethodOutcome {
        let processed = method.apply(input);
        let options = OcrOptions {
            psm: self.config.psm_mode,
            whitelist: Some(self.config.char_whitelist.clone()),
            collect_boxes: false,
        };
        match self.engine.recognize(&processed, &options) {
            Ok(recognition) => {
                let (score, corrected) = self.validator.validate_and_score(&recognition.text);
                debug!(
                    page = ctx.page_num,
                    method = method.id(),
                    text = %corrected,
                    score,
                    confidence = recognition.mean_confidence,
                    "method result"
                );
                MethodOutcome {
                    method,
                    text: corrected,
                    score,
                    confidence: recognition.mean_confidence,
                }
            }
            Err(e) => {
                warn!(page = ctx.page_num, method = method.id(), error = %e, "method failed");
                MethodOutcome {
                    method,
                    text: String::new(),
                    score: 0,
                    confidence: 0.0,
                }
            }
        }
    }

    /// Early exit inside a scale's method loop requires a minimum number
    /// of attempts and a minimum number of repeated identical
    /// high-confidence results.
    fn can_stop_method_loop(&self, outcomes: &[MethodOutcome]) -> bool {
        let attempts = Self::count_non_empty_method_results(outcomes);
        if attempts < self.config.method_early_exit_min_attempts {
            return false;
        }
        let Some(last) = outcomes.last() else {
            return false;
        };
        if !self.qualifies_for_early_exit(last) {
            return false;
        }
        let confirmations = outcomes
            .iter()
            .filter(|o| o.text == last.text && self.qualifies_for_early_exit(o))
            .count();
        confirmations >= self.config.method_early_exit_min_confirmations
    }

    fn qualifies_for_early_exit(&self, outcome: &MethodOutcome) -> bool {
        !outcome.text.is_empty()
            && outcome.score >= self.config.early_exit_score
            && outcome.confidence >= self.config.ocr_confidence_threshold
    }

    /// Counts outcomes that produced any text.
    pub fn count_non_empty_method_results(outcomes: &[MethodOutcome]) -> usize {
        outcomes.iter().filter(|o| !o.text.trim().is_empty()).count()
    }

    /// Weighted vote over one scale's method outcomes: structural score
    /// and OCR confidence combine, ties break on exact-string frequency,
    /// then the shorter and lexicographically smaller text.
    fn vote(&self, outcomes: &[MethodOutcome]) -> (String, f32) {
        let results: Vec<&MethodOutcome> = outcomes
            .iter()
            .filter(|o| !o.text.trim().is_empty() && o.score >= 0)
            .collect();
        if results.is_empty() {
            return (String::new(), 0.0);
        }

        let mut tally: BTreeMap<&str, (usize, i32, f32)> = BTreeMap::new();
        for outcome in &results {
            let entry = tally.entry(outcome.text.as_str()).or_insert((0, 0, 0.0));
            entry.0 += 1;
            entry.1 = entry.1.max(outcome.score);
            entry.2 += outcome.confidence;
        }

        let mut ranked: Vec<(&str, usize, f32)> = tally
            .into_iter()
            .map(|(text, (count, best_score, conf_sum))| {
                let mean_conf = conf_sum / count as f32;
                let weight = best_score as f32 * self.config.vote_score_weight
                    + mean_conf * self.config.vote_confidence_weight;
                (text, count, weight)
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.cmp(&a.1))
                .then(a.0.len().cmp(&b.0.len()))
                .then(a.0.cmp(b.0))
        });

        let (text, count, _) = ranked[0];
        (text.to_string(), count as f32 / results.len() as f32)
    }

    /// A structurally odd result must not stop scale escalation even when
    /// its score clears the early-exit bar. Returns `(suspicious, reason)`.
    pub fn is_suspicious_for_early_exit(&self, text: &str) -> (bool, String) {
        let normalized = self.validator.normalize(text);
        if normalized.is_empty() {
            return (true, "empty".to_string());
        }
        let parts: Vec<&str> = normalized.split(self.config.expected_separator).collect();
        let n = parts.len();
        if n < self.config.min_expected_parts || n > self.config.expected_parts {
            return (true, format!("part_count={n}"));
        }
        if n == self.config.expected_parts {
            let country = parts[1];
            if !(self.config.pattern_country_min..=self.config.pattern_country_max)
                .contains(&country.len())
            {
                return (true, format!("country_len={}", country.len()));
            }
        }
        let code = parts[n - 2];
        if !(self.config.pattern_code_min..=self.config.pattern_code_max).contains(&code.len()) {
            return (true, format!("code_len={}", code.len()));
        }
        (false, String::new())
    }

    /// Picks the winner among per-scale candidates: strict validity first,
    /// then cross-scale agreement, then score, frequency ratio, and the
    /// lowest (cheapest) scale.
    pub fn select_cross_scale_result(candidates: &[ScaleCandidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let occurrences = |text: &str| candidates.iter().filter(|c| c.text == text).count();
        let mut indices: Vec<usize> = (0..candidates.len())
            .filter(|&i| !candidates[i].text.is_empty())
            .collect();
        if indices.is_empty() {
            return None;
        }
        indices.sort_by(|&a, &b| {
            let ca = &candidates[a];
            let cb = &candidates[b];
            cb.strict
                .cmp(&ca.strict)
                .then(occurrences(&cb.text).cmp(&occurrences(&ca.text)))
                .then(cb.score.cmp(&ca.score))
                .then(
                    cb.freq_ratio
                        .partial_cmp(&ca.freq_ratio)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(
                    ca.scale
                        .partial_cmp(&cb.scale)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });
        Some(indices[0])
    }

    /// Invokes the secondary engine when the primary result fails a
    /// quality gate, and keeps whichever result wins the weighted
    /// score/confidence comparison. Returns the replacement, if any.
    fn try_secondary_fallback(
        &self,
        best: &ScaleCandidate,
        image: &GrayImage,
    ) -> Option<(String, String)> {
        if !self.config.enable_secondary_fallback {
            return None;
        }
        let secondary = self.secondary.as_ref()?;
        if best.score >= self.config.fallback_skip_score {
            return None;
        }
        let (should, reason) = self.should_fallback(&best.text, best.confidence);
        if !should {
            return None;
        }
        if !secondary.is_available() {
            debug!(engine = secondary.name(), "secondary engine unavailable, keeping primary");
            return None;
        }

        let options = OcrOptions {
            psm: self.config.psm_mode,
            whitelist: Some(self.config.char_whitelist.clone()),
            collect_boxes: false,
        };
        let recognition = match secondary.recognize(image, &options) {
            Ok(r) => r,
            Err(e) => {
                warn!(engine = secondary.name(), error = %e, "secondary engine failed");
                return None;
            }
        };
        let (score, corrected) = self.validator.validate_and_score(&recognition.text);
        if corrected.is_empty() {
            return None;
        }

        let primary_weight = best.score as f32 * self.config.vote_score_weight
            + best.confidence * self.config.vote_confidence_weight;
        let secondary_weight = score as f32 * self.config.vote_score_weight
            + recognition.mean_confidence * self.config.vote_confidence_weight;
        if secondary_weight > primary_weight {
            info!(
                engine = secondary.name(),
                %reason, %corrected, "secondary engine result adopted"
            );
            return Some((corrected, reason));
        }
        None
    }

    /// The fallback gates: pattern mismatch, low confidence, characters
    /// outside the whitelist, or visually ambiguous characters.
    pub fn should_fallback(&self, text: &str, confidence: f32) -> (bool, String) {
        if text.is_empty() {
            return (true, "empty_text".to_string());
        }
        let mut reasons: Vec<String> = Vec::new();
        if self.config.enable_pattern_check && !self.validator.matches_pattern(text) {
            reasons.push("pattern_failed".to_string());
        }
        if confidence < self.config.fallback_confidence_threshold {
            reasons.push(format!("low_confidence({confidence:.1})"));
        }
        let invalid: String = text
            .chars()
            .filter(|c| !self.config.char_whitelist.contains(*c))
            .collect();
        if !invalid.is_empty() {
            reasons.push(format!("invalid_chars({invalid})"));
        }
        let ambiguous: Vec<String> = text
            .chars()
            .filter_map(|c| self.code_pairs.get(&c).map(|p| format!("{c}->{p}")))
            .collect();
        if !ambiguous.is_empty() {
            reasons.push(format!("ambiguous({})", ambiguous.join(",")));
        }
        let should = !reasons.is_empty();
        (should, reasons.join(", "))
    }

    fn inspect(&self, header: &str) -> CodeAmbiguity {
        inspect_code_ambiguity(
            header,
            self.config.expected_separator,
            &self.code_pairs,
            self.config.ambiguity_requires_mixed_code,
        )
    }

    /// Glyph-level refinement ladder for the code segment, most-trusted
    /// evidence first: per-glyph pair-constrained OCR votes, then the
    /// glyph-width rule, then cross-method image support. Whatever cannot
    /// gather enough evidence leaves the header unchanged and reports why.
    pub fn refine_code_glyphs(&self, header: &str, image: &GrayImage) -> (String, String) {
        let inspection = self.inspect(header);
        if !inspection.is_ambiguous {
            return (header.to_string(), "not_ambiguous".to_string());
        }

        let boxes = self.extract_char_boxes(header, image);
        if boxes.is_empty() {
            if self.config.enable_image_support_rescue {
                let candidates = self.collect_support_candidates(image);
                let (resolved, meta) = resolve_code_ambiguity_by_support(
                    header,
                    &candidates,
                    self.config.image_support_min_votes,
                    self.config.expected_separator,
                    &self.code_pairs,
                    self.config.ambiguity_requires_mixed_code,
                );
                if meta.applied {
                    return (resolved, format!("image_support({})", meta.reason));
                }
            }
            return (header.to_string(), ambiguity::REASON_NO_CHAR_BOXES.to_string());
        }

        let mut last_reason = String::new();

        if self.config.enable_code_char_classifier {
            let (refined, reason) = self.refine_with_pair_votes(header, &inspection, image, &boxes);
            if refined != header {
                return (refined, reason);
            }
            debug!(%reason, "pair-vote classifier made no change");
            last_reason = reason;
        }

        if self.config.enable_glyph_width_fallback {
            let widths: BTreeMap<usize, f32> = boxes
                .iter()
                .map(|(pos, b)| (*pos, b.width as f32))
                .collect();
            let (refined, reason) = self.apply_code_glyph_width_rule(header, &inspection, &widths);
            if refined != header {
                return (refined, reason);
            }
            if last_reason.is_empty() {
                last_reason = reason;
            }
        }

        if self.config.enable_image_support_rescue {
            let candidates = self.collect_support_candidates(image);
            let (resolved, meta) = resolve_code_ambiguity_by_support(
                header,
                &candidates,
                self.config.image_support_min_votes,
                self.config.expected_separator,
                &self.code_pairs,
                self.config.ambiguity_requires_mixed_code,
            );
            if meta.applied {
                return (resolved, format!("image_support({})", meta.reason));
            }
        }

        if last_reason.is_empty() {
            last_reason = "classifier_no_change(no_strategies)".to_string();
        }
        (header.to_string(), last_reason)
    }

    /// Votes each ambiguous code glyph against its pair by re-recognizing
    /// the cropped glyph constrained to the two characters. A flip needs
    /// `classifier_min_vote_support` votes, and a leading code zero is
    /// structurally protected unless explicitly allowed.
    fn refine_with_pair_votes(
        &self,
        header: &str,
        inspection: &CodeAmbiguity,
        image: &GrayImage,
        boxes: &BTreeMap<usize, CharBox>,
    ) -> (String, String) {
        let Some(code_offset) = inspection.char_offset else {
            return (header.to_string(), "classifier_no_change(no_code)".to_string());
        };
        let chars: Vec<char> = header.chars().collect();

        let mut refined = chars.clone();
        let mut details: Vec<String> = Vec::new();
        let mut flipped = false;

        for (i, ch) in inspection.code_segment.chars().enumerate() {
            let Some(&partner) = self.code_pairs.get(&ch) else {
                continue;
            };
            let pos = code_offset + i;
            if i == 0
                && ch == '0'
                && partner.is_ascii_alphabetic()
                && !self.config.allow_leading_zero_to_letter
            {
                details.push(format!("pos{i}=leading_protected"));
                continue;
            }
            let Some(glyph_box) = boxes.get(&pos) else {
                details.push(format!("pos{i}=no_box"));
                continue;
            };
            let Some(glyph) = crop_glyph(image, glyph_box) else {
                details.push(format!("pos{i}=bad_crop"));
                continue;
            };
            let (votes, vote_details) = self.pair_votes(&glyph, (ch, partner));
            details.extend(vote_details);
            let own = votes.get(&ch).copied().unwrap_or(0);
            let alt = votes.get(&partner).copied().unwrap_or(0);
            if alt >= self.config.classifier_min_vote_support && alt > own {
                refined[pos] = partner;
                flipped = true;
                details.push(format!("pos{i}:{ch}->{partner}({alt} votes)"));
            }
        }

        let refined: String = refined.into_iter().collect();
        if flipped {
            (refined, format!("classifier({})", details.join(",")))
        } else {
            (
                header.to_string(),
                format!("classifier_no_change({})", details.join(",")),
            )
        }
    }

    /// Re-recognizes a single glyph constrained to an ambiguous pair,
    /// across a few segmentation modes, and tallies the votes.
    fn pair_votes(
        &self,
        glyph: &GrayImage,
        pair: (char, char),
    ) -> (BTreeMap<char, usize>, Vec<String>) {
        let mut votes: BTreeMap<char, usize> = BTreeMap::new();
        let mut details: Vec<String> = Vec::new();
        let base = OcrOptions::single_char_pair(pair);
        for psm in [10u8, 8, 7] {
            match self.engine.recognize(glyph, &base.with_psm(psm)) {
                Ok(recognition) => {
                    if let Some(ch) = recognition.text.chars().find(|c| *c == pair.0 || *c == pair.1)
                    {
                        *votes.entry(ch).or_insert(0) += 1;
                        details.push(format!(
                            "psm{psm}={ch}@{:.1}",
                            recognition.mean_confidence
                        ));
                    }
                }
                Err(e) => {
                    debug!(error = %e, psm, "pair vote failed");
                }
            }
        }
        (votes, details)
    }

    /// Width-based fallback: among the ambiguous code glyphs with measured
    /// widths, a glyph sufficiently wider than the narrowest one is
    /// evidence for the wider pair member (the letter).
    pub fn apply_code_glyph_width_rule(
        &self,
        header: &str,
        inspection: &CodeAmbiguity,
        widths: &BTreeMap<usize, f32>,
    ) -> (String, String) {
        let Some(code_offset) = inspection.char_offset else {
            return (header.to_string(), "no_code_segment".to_string());
        };

        let mut measured: Vec<(usize, char, char, f32)> = Vec::new();
        for (i, ch) in inspection.code_segment.chars().enumerate() {
            let Some(&partner) = self.code_pairs.get(&ch) else {
                continue;
            };
            let pos = code_offset + i;
            if let Some(width) = widths.get(&pos) {
                measured.push((i, ch, partner, *width));
            }
        }
        if measured.len() < 2 {
            return (header.to_string(), "insufficient_width_samples".to_string());
        }

        let baseline = measured
            .iter()
            .map(|(_, _, _, w)| *w)
            .fold(f32::INFINITY, f32::min);
        let Some((i, ch, partner, width)) = measured
            .iter()
            .max_by(|a, b| a.3.partial_cmp(&b.3).unwrap_or(std::cmp::Ordering::Equal))
            .copied()
        else {
            return (header.to_string(), "no_width_outlier".to_string());
        };

        let ratio = width / baseline;
        if ratio < self.config.glyph_width_ratio {
            return (header.to_string(), "no_width_outlier".to_string());
        }
        if i == 0
            && ch == '0'
            && partner.is_ascii_alphabetic()
            && !self.config.allow_leading_zero_to_letter
        {
            return (header.to_string(), "leading_protected".to_string());
        }
        // The wider glyph reads as the letter member of the pair.
        let target = if partner.is_ascii_alphabetic() { partner } else { ch };
        if target == ch {
            return (header.to_string(), "no_width_outlier".to_string());
        }

        let pos = code_offset + i;
        let mut chars: Vec<char> = header.chars().collect();
        chars[pos] = target;
        (
            chars.into_iter().collect(),
            format!("width_ratio>={:.2}", self.config.glyph_width_ratio),
        )
    }

    /// Recognizes the image once more with boxes enabled and aligns the
    /// character stream to the chosen header text, tolerating
    /// substitutions from the alignment pair map.
    fn extract_char_boxes(&self, header: &str, image: &GrayImage) -> BTreeMap<usize, CharBox> {
        let options = OcrOptions {
            psm: self.config.psm_mode,
            whitelist: Some(self.config.char_whitelist.clone()),
            collect_boxes: true,
        };
        match self.engine.recognize(image, &options) {
            Ok(recognition) => {
                align_char_boxes(header, &recognition.char_boxes, &self.alignment_pairs)
            }
            Err(e) => {
                debug!(error = %e, "char box extraction failed");
                BTreeMap::new()
            }
        }
    }

    /// Collects alternative readings of the same image from a small subset
    /// of methods, for support-based resolution.
    fn collect_support_candidates(&self, image: &GrayImage) -> Vec<String> {
        let methods = [
            PreprocessMethod::HighThreshold,
            PreprocessMethod::Adaptive,
            PreprocessMethod::OtsuDenoise,
        ];
        let options = OcrOptions {
            psm: self.config.psm_mode,
            whitelist: Some(self.config.char_whitelist.clone()),
            collect_boxes: false,
        };
        let mut candidates = Vec::new();
        for method in methods {
            let processed = method.apply(image);
            if let Ok(recognition) = self.engine.recognize(&processed, &options) {
                let (_, corrected) = self.validator.validate_and_score(&recognition.text);
                if !corrected.is_empty() {
                    candidates.push(corrected);
                }
            }
        }
        candidates
    }

    /// One additional high-scale re-render and re-OCR targeting an
    /// ambiguous code segment, for anchors whose pages never produced
    /// character boxes. Returns the (possibly unchanged) header and a
    /// reason string.
    pub fn rescue_ambiguous_header(
        &self,
        source: &dyn PageSource,
        page_index: usize,
        region: &RegionSpec,
        ctx: &PageContext,
        base_header: &str,
    ) -> ExtractResult<(String, String)> {
        if !self.engine.is_available() {
            return Err(ExtractError::EngineUnavailable {
                engine: self.engine.name().to_string(),
                reason: "rescue pass requires the primary engine".to_string(),
            });
        }
        let gray = source.render_region(page_index, region, self.config.rescue_render_scale)?;
        let input = if self.config.filter_black_text {
            filter_black_text(&gray, self.config.black_text_threshold)
        } else {
            gray
        };

        let candidates = self.collect_support_candidates(&input);
        debug!(
            page = ctx.page_num,
            candidates = candidates.len(),
            "rescue candidates collected"
        );
        let (resolved, meta) = resolve_code_ambiguity_by_support(
            base_header,
            &candidates,
            self.config.image_support_min_votes,
            self.config.expected_separator,
            &self.code_pairs,
            self.config.ambiguity_requires_mixed_code,
        );
        let reason = if meta.applied {
            format!("rescue({})", meta.reason)
        } else {
            format!("rescue_no_change({})", meta.reason)
        };
        Ok((resolved, reason))
    }

    pub fn validator(&self) -> &HeaderValidator {
        &self.validator
    }
}

/// Mean confidence of the outcomes that agreed on the winning text.
fn mean_confidence(outcomes: &[MethodOutcome], text: &str) -> f32 {
    let matching: Vec<f32> = outcomes
        .iter()
        .filter(|o| o.text == text && !text.is_empty())
        .map(|o| o.confidence)
        .collect();
    if matching.is_empty() {
        0.0
    } else {
        matching.iter().sum::<f32>() / matching.len() as f32
    }
}

/// Crops one glyph box out of the page image, with a small margin.
fn crop_glyph(image: &GrayImage, glyph_box: &CharBox) -> Option<GrayImage> {
    const MARGIN: u32 = 2;
    let x = glyph_box.left.saturating_sub(MARGIN);
    let y = glyph_box.top.saturating_sub(MARGIN);
    let w = (glyph_box.width + 2 * MARGIN).min(image.width().saturating_sub(x));
    let h = (glyph_box.height + 2 * MARGIN).min(image.height().saturating_sub(y));
    if w < 2 || h < 2 {
        return None;
    }
    Some(image::imageops::crop_imm(image, x, y, w, h).to_image())
}

/// Aligns an OCR character-box stream to a target string, tolerating
/// single-character substitutions from the alignment pair map as well as
/// occasional insertions and deletions. Returns target-position → box.
pub fn align_char_boxes(
    target: &str,
    stream: &[CharBox],
    alignment_pairs: &BTreeMap<char, char>,
) -> BTreeMap<usize, CharBox> {
    let chars: Vec<char> = target.chars().collect();
    let matches = |a: char, b: char| a == b || alignment_pairs.get(&a) == Some(&b);

    let mut aligned = BTreeMap::new();
    let mut i = 0usize;
    let mut j = 0usize;
    while i < chars.len() && j < stream.len() {
        if matches(chars[i], stream[j].ch) {
            aligned.insert(i, stream[j].clone());
            i += 1;
            j += 1;
        } else if j + 1 < stream.len() && matches(chars[i], stream[j + 1].ch) {
            // The stream has an extra character.
            j += 1;
        } else if i + 1 < chars.len() && matches(chars[i + 1], stream[j].ch) {
            // The stream missed a character.
            i += 1;
        } else {
            i += 1;
            j += 1;
        }
    }
    aligned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::engine::Recognition;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Engine that replays a scripted sequence of recognitions.
    #[derive(Debug)]
    struct ScriptedEngine {
        responses: Mutex<VecDeque<Recognition>>,
        available: bool,
    }

    impl ScriptedEngine {
        fn new(responses: Vec<Recognition>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().collect()),
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

        fn recognize(&self, _image: &GrayImage, _options: &OcrOptions) -> ExtractResult<Recognition> {
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default())
        }
    }

    fn recognition(text: &str, confidence: f32) -> Recognition {
        Recognition {
            text: text.to_string(),
            mean_confidence: confidence,
            char_boxes: Vec::new(),
        }
    }

    fn pipeline_with(engine: ScriptedEngine, config: ExtractionConfig) -> OcrPipeline {
        let config = Arc::new(config);
        let validator = HeaderValidator::new(config.clone()).unwrap();
        OcrPipeline::new(config, validator, Arc::new(engine), None)
    }

    fn context() -> PageContext {
        PageContext::new("scan.pdf", 1, "job-1")
    }

    fn blank_image() -> GrayImage {
        GrayImage::from_pixel(140, 24, image::Luma([255]))
    }

    #[test]
    fn suspicious_guard_flags_country_length() {
        let p = pipeline_with(ScriptedEngine::new(vec![]), ExtractionConfig::default());
        let (suspicious, reason) = p.is_suspicious_for_early_exit("B-CHK-WEE-S17991790");
        assert!(suspicious);
        assert!(reason.contains("country_len"));
    }

    #[test]
    fn suspicious_guard_accepts_normal_header() {
        let p = pipeline_with(ScriptedEngine::new(vec![]), ExtractionConfig::default());
        let (suspicious, reason) = p.is_suspicious_for_early_exit("B-HK-WFE-S17991790");
        assert!(!suspicious);
        assert!(reason.is_empty());
    }

    #[test]
    fn cross_scale_vote_prefers_repeated_candidate() {
        let candidates = vec![
            ScaleCandidate {
                text: "B-E-UUY-R4092533EE".into(),
                score: 89,
                strict: false,
                freq_ratio: 0.50,
                confidence: 80.0,
                scale: 2.0,
            },
            ScaleCandidate {
                text: "B-E-UUY-R4092533".into(),
                score: 89,
                strict: false,
                freq_ratio: 0.50,
                confidence: 80.0,
                scale: 3.0,
            },
            ScaleCandidate {
                text: "B-E-UUY-R4092533".into(),
                score: 89,
                strict: false,
                freq_ratio: 0.75,
                confidence: 80.0,
                scale: 6.0,
            },
        ];
        let picked = OcrPipeline::select_cross_scale_result(&candidates).unwrap();
        assert_eq!(candidates[picked].text, "B-E-UUY-R4092533");
    }

    #[test]
    fn cross_scale_vote_prefers_strict_candidate() {
        let candidates = vec![
            ScaleCandidate {
                text: "B-HK-ZN1-S179780077".into(),
                score: 89,
                strict: false,
                freq_ratio: 0.90,
                confidence: 95.0,
                scale: 2.0,
            },
            ScaleCandidate {
                text: "B-HK-ZN1-S17978007".into(),
                score: 130,
                strict: true,
                freq_ratio: 0.40,
                confidence: 70.0,
                scale: 3.0,
            },
        ];
        let picked = OcrPipeline::select_cross_scale_result(&candidates).unwrap();
        assert_eq!(candidates[picked].text, "B-HK-ZN1-S17978007");
    }

    #[test]
    fn cross_scale_vote_skips_empty_candidates() {
        let candidates = vec![ScaleCandidate {
            text: String::new(),
            score: 0,
            strict: false,
            freq_ratio: 0.0,
            confidence: 0.0,
            scale: 2.0,
        }];
        assert!(OcrPipeline::select_cross_scale_result(&candidates).is_none());
    }

    #[test]
    fn method_loop_waits_for_repeated_strong_result() {
        let config = ExtractionConfig {
            max_ocr_attempts: 4,
            early_exit_score: 90,
            ocr_confidence_threshold: 82.0,
            method_early_exit_min_attempts: 2,
            method_early_exit_min_confirmations: 2,
            ..Default::default()
        };
        // First method is wrong but still "excellent"; the next two agree
        // on the correct value.
        let engine = ScriptedEngine::new(vec![
            recognition("B-TW-UEL-S18011737", 95.0),
            recognition("B-TW-UEI-S18011757", 95.0),
            recognition("B-TW-UEI-S18011757", 95.0),
            recognition("", 0.0),
        ]);
        let p = pipeline_with(engine, config);
        let (best, outcomes, _freq) = p.run_methods(&blank_image(), &context());
        assert_eq!(best, "B-TW-UEI-S18011757");
        assert!(OcrPipeline::count_non_empty_method_results(&outcomes) >= 3);
    }

    #[test]
    fn method_loop_stops_after_confirmed_result() {
        let config = ExtractionConfig {
            max_ocr_attempts: 8,
            method_early_exit_min_attempts: 2,
            method_early_exit_min_confirmations: 2,
            ..Default::default()
        };
        let engine = ScriptedEngine::new(vec![
            recognition("B-HK-WFE-S17975643", 96.0),
            recognition("B-HK-WFE-S17975643", 96.0),
            recognition("B-HK-WFE-S17975643", 96.0),
        ]);
        let p = pipeline_with(engine, config);
        let (best, outcomes, freq) = p.run_methods(&blank_image(), &context());
        assert_eq!(best, "B-HK-WFE-S17975643");
        // Two confirmations suffice; the bank must not run all 8 methods.
        assert_eq!(outcomes.len(), 2);
        assert!((freq - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn count_non_empty_ignores_blank_results() {
        let outcomes = vec![
            MethodOutcome {
                method: PreprocessMethod::HighThreshold,
                text: "B-TW-UEI-S18011757".into(),
                score: 130,
                confidence: 92.0,
            },
            MethodOutcome {
                method: PreprocessMethod::Adaptive,
                text: "".into(),
                score: 0,
                confidence: 0.0,
            },
        ];
        assert_eq!(OcrPipeline::count_non_empty_method_results(&outcomes), 1);
    }

    #[test]
    fn width_rule_converts_wider_internal_zero() {
        let p = pipeline_with(ScriptedEngine::new(vec![]), ExtractionConfig::default());
        let header = "B-FD-020H-S18020267";
        let inspection = p.inspect(header);
        let widths: BTreeMap<usize, f32> = [(5, 10.0), (7, 13.0)].into_iter().collect();
        let (refined, reason) = p.apply_code_glyph_width_rule(header, &inspection, &widths);
        assert_eq!(refined, "B-FD-02OH-S18020267");
        assert!(reason.contains("width_ratio"));
    }

    #[test]
    fn width_rule_keeps_header_without_outlier() {
        let p = pipeline_with(ScriptedEngine::new(vec![]), ExtractionConfig::default());
        let header = "B-FD-020H-S18020267";
        let inspection = p.inspect(header);
        let widths: BTreeMap<usize, f32> = [(5, 10.0), (7, 10.5)].into_iter().collect();
        let (refined, reason) = p.apply_code_glyph_width_rule(header, &inspection, &widths);
        assert_eq!(refined, header);
        assert_eq!(reason, "no_width_outlier");
    }

    #[test]
    fn width_rule_protects_leading_zero() {
        let p = pipeline_with(ScriptedEngine::new(vec![]), ExtractionConfig::default());
        let header = "B-FD-020H-S18020267";
        let inspection = p.inspect(header);
        // The leading zero is the wide one this time.
        let widths: BTreeMap<usize, f32> = [(5, 14.0), (7, 10.0)].into_iter().collect();
        let (refined, reason) = p.apply_code_glyph_width_rule(header, &inspection, &widths);
        assert_eq!(refined, header);
        assert_eq!(reason, "leading_protected");
    }

    fn boxes_from_text(text: &str) -> Vec<CharBox> {
        text.chars()
            .enumerate()
            .map(|(i, ch)| CharBox {
                ch,
                left: (i as u32) * 7,
                top: 0,
                width: 6,
                height: 10,
            })
            .collect()
    }

    #[test]
    fn align_tolerates_zero_o_substitution() {
        let pairs = ambiguity::parse_pair_map("O:0,I:1,S:5,B:8,E:F,L:I");
        let target = "B-FD-020H-S18018435";
        let stream = boxes_from_text("B-FD-02OH-S18018435");
        let aligned = align_char_boxes(target, &stream, &pairs);
        assert!(aligned.len() >= target.chars().count() - 2);
    }

    #[test]
    fn align_tolerates_multiple_substitutions() {
        let pairs = ambiguity::parse_pair_map("O:0,I:1,S:5,B:8,E:F,L:I");
        let target = "B-FD-SF5-S18018435";
        let stream = boxes_from_text("B-FD-5E5-S18018435");
        let aligned = align_char_boxes(target, &stream, &pairs);
        assert!(aligned.len() >= target.chars().count() - 2);
    }

    #[test]
    fn align_survives_one_insertion() {
        let pairs = ambiguity::parse_pair_map("O:0");
        let target = "B-FD-020H";
        let stream = boxes_from_text("B--FD-020H");
        let aligned = align_char_boxes(target, &stream, &pairs);
        assert!(aligned.len() >= target.chars().count() - 2);
    }

    #[test]
    fn pair_vote_classifier_flips_internal_zero() {
        // Call order inside refine_code_glyphs: one boxes pass, then three
        // pair votes for the single unprotected ambiguous position.
        let header = "B-FD-020H-S18020267";
        let engine = ScriptedEngine::new(vec![
            Recognition {
                text: header.to_string(),
                mean_confidence: 90.0,
                char_boxes: boxes_from_text(header),
            },
            recognition("O", 91.0),
            recognition("O", 92.0),
            recognition("O", 90.0),
        ]);
        let p = pipeline_with(engine, ExtractionConfig::default());
        let (refined, reason) = p.refine_code_glyphs(header, &blank_image());
        assert_eq!(refined, "B-FD-02OH-S18020267");
        assert!(reason.contains("classifier("), "reason: {reason}");
    }

    #[test]
    fn pair_vote_classifier_requires_min_support() {
        let header = "B-FD-020H-S18020267";
        let engine = ScriptedEngine::new(vec![
            Recognition {
                text: header.to_string(),
                mean_confidence: 90.0,
                char_boxes: boxes_from_text(header),
            },
            recognition("O", 80.0),
            recognition("0", 80.0),
            recognition("0", 80.0),
        ]);
        let config = ExtractionConfig {
            classifier_min_vote_support: 2,
            enable_glyph_width_fallback: false,
            enable_image_support_rescue: false,
            ..Default::default()
        };
        let p = pipeline_with(engine, config);
        let (refined, reason) = p.refine_code_glyphs(header, &blank_image());
        assert_eq!(refined, header);
        assert!(reason.starts_with("classifier_no_change"), "reason: {reason}");
    }

    #[test]
    fn pair_vote_classifier_never_flips_leading_zero() {
        // Code "0AB2": the only ambiguous position is the leading zero.
        let header = "B-FD-0AB2-S18020267";
        let engine = ScriptedEngine::new(vec![Recognition {
            text: header.to_string(),
            mean_confidence: 90.0,
            char_boxes: boxes_from_text(header),
        }]);
        let config = ExtractionConfig {
            enable_glyph_width_fallback: false,
            enable_image_support_rescue: false,
            ..Default::default()
        };
        let p = pipeline_with(engine, config);
        let (refined, reason) = p.refine_code_glyphs(header, &blank_image());
        assert_eq!(refined, header);
        assert!(reason.contains("leading_protected"), "reason: {reason}");
    }

    #[test]
    fn refine_falls_back_to_image_support_without_boxes() {
        let header = "B-TW-UE1-S18011737";
        // Boxes pass returns nothing; the three support candidates then
        // agree on the I spelling.
        let engine = ScriptedEngine::new(vec![
            recognition("", 0.0),
            recognition("B-TW-UEI-S18011737", 88.0),
            recognition("B-TW-UEI-S18011737", 87.0),
            recognition("B-TW-UE1-S18011737", 60.0),
        ]);
        let config = ExtractionConfig {
            code_ambiguity_pairs: "I:1".to_string(),
            enable_code_char_classifier: true,
            enable_glyph_width_fallback: false,
            enable_image_support_rescue: true,
            image_support_min_votes: 1,
            ..Default::default()
        };
        let p = pipeline_with(engine, config);
        let (refined, reason) = p.refine_code_glyphs(header, &blank_image());
        assert_eq!(refined, "B-TW-UEI-S18011737");
        assert!(reason.starts_with("image_support("), "reason: {reason}");
    }

    #[test]
    fn fallback_gates_catch_low_confidence_and_ambiguity() {
        let p = pipeline_with(ScriptedEngine::new(vec![]), ExtractionConfig::default());
        let (should, reason) = p.should_fallback("B-FD-020H-S18020267", 60.0);
        assert!(should);
        assert!(reason.contains("low_confidence"));
        assert!(reason.contains("ambiguous"));
    }

    #[test]
    fn fallback_gates_pass_clean_result() {
        let p = pipeline_with(ScriptedEngine::new(vec![]), ExtractionConfig::default());
        let (should, reason) = p.should_fallback("B-HK-WFE-S17975643", 96.0);
        assert!(!should, "unexpected fallback: {reason}");
    }

    #[test]
    fn unavailable_engine_degrades_to_error_status() {
        let p = pipeline_with(ScriptedEngine::unavailable(), ExtractionConfig::default());
        let source = crate::extract::testing::StaticPageSource::blank(1);
        let region = RegionSpec::default();
        let out = p.extract_adaptive(&source, 0, &region, &context());
        assert_eq!(out.status, PageStatus::Error);
        assert!(out.text.is_empty());
    }

    #[test]
    fn extract_adaptive_early_exits_on_clean_read() {
        let config = ExtractionConfig {
            method_early_exit_min_attempts: 1,
            method_early_exit_min_confirmations: 1,
            ..Default::default()
        };
        let engine = ScriptedEngine::new(vec![
            recognition("B-HK-WFE-S17975643", 96.0),
            recognition("B-HK-WFE-S17975643", 96.0),
        ]);
        let p = pipeline_with(engine, config);
        let source = crate::extract::testing::StaticPageSource::blank(1);
        let region = RegionSpec::default();
        let out = p.extract_adaptive(&source, 0, &region, &context());
        assert_eq!(out.status, PageStatus::Success);
        assert_eq!(out.text, "B-HK-WFE-S17975643");
        assert!(out.quality_flags.is_empty());
    }
}
