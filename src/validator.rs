//! Header validation and scoring.
//!
//! Turns raw OCR output into a normalized header plus a plausibility
//! score, and decides whether two headers refer to the same logical
//! document. Pure functions over the configuration; no I/O.
//!
//! The scoring contract that the rest of the pipeline leans on:
//! - a header without a strictly valid serial can never score above
//!   `invalid_serial_score_cap`, so weak reads cannot masquerade as
//!   high-confidence results;
//! - two strictly valid headers with different serials never match,
//!   because a false merge of two physical documents is costlier than an
//!   extra split a human can undo.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use strsim::normalized_levenshtein;

use crate::core::config::ExtractionConfig;
use crate::core::errors::{ExtractError, ExtractResult};

/// Obvious double-prefix OCR artifacts and their repairs.
const DOUBLE_PREFIX_FIXES: &[(&str, &str)] = &[("BL", "B"), ("RB", "B"), ("PL", "P")];

/// Leading `letter + digit run` of a serial segment, for over-long serial
/// truncation.
static SERIAL_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Z])([0-9]+)").expect("serial run pattern"));

/// Validates and scores extracted header text.
///
/// Supports both the 4-part form `Prefix-Country-Code-Serial` and the
/// 3-part fallback `Prefix-Code-Serial`.
#[derive(Debug, Clone)]
pub struct HeaderValidator {
    config: Arc<ExtractionConfig>,
    pattern: Regex,
    substitutions: Vec<(char, char)>,
}

impl HeaderValidator {
    /// Builds a validator over the given configuration.
    ///
    /// Fails if the configured header pattern is not a valid regex.
    pub fn new(config: Arc<ExtractionConfig>) -> ExtractResult<Self> {
        let pattern = Regex::new(&config.header_pattern).map_err(|e| {
            ExtractError::config_error("compiling header_pattern", e.to_string())
        })?;
        let substitutions = parse_substitutions(&config.serial_substitutions);
        Ok(Self {
            config,
            pattern,
            substitutions,
        })
    }

    /// Normalizes a raw header string for scoring and comparison.
    ///
    /// Uppercases, drops everything outside the character whitelist
    /// (whitespace included), collapses separator runs, trims separator
    /// ends, then applies the structural repairs: fused prefix+code split,
    /// double-prefix fix, serial `8…` → `S…` fix, serial-digit confusion
    /// substitutions, and over-long serial truncation.
    pub fn normalize(&self, text: &str) -> String {
        let sep = self.config.expected_separator;
        let mut cleaned = String::with_capacity(text.len());
        for ch in text.chars() {
            let up = ch.to_ascii_uppercase();
            if self.config.char_whitelist.contains(up) {
                // Collapse separator runs as we go.
                if up == sep && cleaned.ends_with(sep) {
                    continue;
                }
                cleaned.push(up);
            }
        }
        let cleaned = cleaned.trim_matches(sep);
        if cleaned.is_empty() {
            return String::new();
        }

        let mut parts: Vec<String> = cleaned.split(sep).map(str::to_string).collect();

        // Repair a dropped separator that fused prefix and the following
        // segment: 3 parts where the first looks like letter + payload.
        if parts.len() == self.config.min_expected_parts {
            let first = &parts[0];
            if first.len() >= 4
                && first.chars().all(|c| c.is_ascii_alphanumeric())
                && first.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            {
                let split_at = self.config.pattern_prefix_length.min(first.len() - 1);
                let rest = first[split_at..].to_string();
                let prefix = first[..split_at].to_string();
                parts[0] = prefix;
                parts.insert(1, rest);
            }
        }

        if parts.len() >= self.config.min_expected_parts {
            if let Some(fixed) = DOUBLE_PREFIX_FIXES
                .iter()
                .find(|(from, _)| *from == parts[0])
                .map(|(_, to)| (*to).to_string())
            {
                parts[0] = fixed;
            }

            let last = parts.len() - 1;
            let repaired = self.repair_serial(&parts[last]);
            parts[last] = repaired;
        }

        parts.join(&sep.to_string())
    }

    /// Serial-segment repairs: `8` misread for the `S` prefix, configured
    /// digit confusions in the tail, and truncation of over-long serials.
    fn repair_serial(&self, serial: &str) -> String {
        let mut chars: Vec<char> = serial.chars().collect();
        if chars.len() >= 8 && chars[0] == '8' && chars[1..].iter().all(|c| c.is_ascii_digit()) {
            chars[0] = 'S';
        }

        let tail_start = if chars.first().is_some_and(|c| c.is_ascii_alphabetic()) {
            1
        } else {
            0
        };
        for ch in chars.iter_mut().skip(tail_start) {
            if let Some((_, to)) = self.substitutions.iter().find(|(from, _)| from == ch) {
                *ch = *to;
            }
        }

        let repaired: String = chars.into_iter().collect();
        if repaired.len() > self.config.pattern_serial_max {
            if let Some(truncated) = self.truncate_serial(&repaired) {
                return truncated;
            }
        }
        repaired
    }

    /// Reduces an over-long serial to `allowed-prefix + expected digits`
    /// when a valid prefix+digit run leads it.
    fn truncate_serial(&self, serial: &str) -> Option<String> {
        let captures = SERIAL_RUN.captures(serial)?;
        let prefix = captures.get(1)?.as_str().chars().next()?;
        if !self.config.serial_allowed_prefixes.contains(&prefix) {
            return None;
        }
        let digits: String = captures
            .get(2)?
            .as_str()
            .chars()
            .take(self.config.expected_serial_digits)
            .collect();
        if digits.len() < self.config.min_serial_digits {
            return None;
        }
        Some(format!("{prefix}{digits}"))
    }

    /// Validates and scores a raw OCR result.
    ///
    /// Returns `(score, normalized_text)`; `(0, "")` for input that
    /// normalizes to nothing. The score of any header whose serial is not
    /// strictly valid is capped at `invalid_serial_score_cap`.
    pub fn validate_and_score(&self, text: &str) -> (i32, String) {
        let normalized = self.normalize(text);
        if normalized.is_empty() {
            return (0, String::new());
        }

        let sep = self.config.expected_separator;
        let parts: Vec<&str> = normalized.split(sep).collect();
        let n = parts.len();
        let in_range = n >= self.config.min_expected_parts && n <= self.config.expected_parts;

        let mut score = 5;
        if in_range {
            score += 15;
            if n == self.config.expected_parts {
                score += 20;
            } else {
                score += 10;
            }

            if parts[0].len() == self.config.pattern_prefix_length
                && parts[0].chars().all(|c| c.is_ascii_alphabetic())
            {
                score += 10;
            }
            if n == self.config.expected_parts {
                let country = parts[1];
                if (self.config.pattern_country_min..=self.config.pattern_country_max)
                    .contains(&country.len())
                    && country.chars().all(|c| c.is_ascii_alphabetic())
                {
                    score += 10;
                }
            }
            let code = parts[n - 2];
            if (self.config.pattern_code_min..=self.config.pattern_code_max).contains(&code.len())
                && code.chars().all(|c| c.is_ascii_alphanumeric())
            {
                score += 10;
            }
        }

        let serial = parts[n - 1];
        let strict = in_range && self.serial_is_strict(serial);
        if strict {
            score += 35;
        } else if self.looks_serial_like(serial) {
            score += 10;
        }

        if self.config.enable_pattern_check && self.pattern.is_match(&normalized) {
            score += self.config.header_pattern_bonus;
        }

        if !strict {
            score = score.min(self.config.invalid_serial_score_cap);
        }

        (score, normalized)
    }

    /// The highest score a perfectly formed strict header can reach.
    pub fn max_score(&self) -> i32 {
        5 + 15 + 20 + 10 + 10 + 10 + 35 + self.config.header_pattern_bonus
    }

    /// Whether a serial segment satisfies the full strict format:
    /// an allowed prefix letter followed by a digit run of the configured
    /// length, nothing else.
    fn serial_is_strict(&self, serial: &str) -> bool {
        let clean: String = serial.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        let mut chars = clean.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        if !self.config.serial_allowed_prefixes.contains(&first) {
            return false;
        }
        let rest: Vec<char> = chars.collect();
        if rest.is_empty() || !rest.iter().all(|c| c.is_ascii_digit()) {
            return false;
        }
        (self.config.min_serial_digits..=self.config.expected_serial_digits)
            .contains(&rest.len())
    }

    /// A weaker test than strictness: enough digits present and a segment
    /// length within the configured serial bounds, regardless of format.
    fn looks_serial_like(&self, serial: &str) -> bool {
        let clean_len = serial
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .count();
        count_digits(serial) >= self.config.min_serial_digits
            && (self.config.pattern_serial_min..=self.config.pattern_serial_max)
                .contains(&clean_len)
    }

    /// Whether the normalized form of `text` matches the configured
    /// full-header regex.
    pub fn matches_pattern(&self, text: &str) -> bool {
        let normalized = self.normalize(text);
        !normalized.is_empty() && self.pattern.is_match(&normalized)
    }

    /// Whether the normalized form of `text` is a strict header: enough
    /// segments and a strictly valid serial.
    pub fn is_strict_header(&self, text: &str) -> bool {
        let normalized = self.normalize(text);
        if normalized.is_empty() {
            return false;
        }
        let parts: Vec<&str> = normalized.split(self.config.expected_separator).collect();
        parts.len() >= self.config.min_expected_parts
            && self.serial_is_strict(parts[parts.len() - 1])
    }

    /// Extracts the serial segment (alphanumeric-cleaned) of a normalized
    /// header, if it has enough segments.
    pub fn extract_serial(&self, header: &str) -> Option<String> {
        let parts: Vec<&str> = header.split(self.config.expected_separator).collect();
        if parts.len() < self.config.min_expected_parts {
            return None;
        }
        let clean: String = parts[parts.len() - 1]
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        (!clean.is_empty()).then_some(clean)
    }

    /// Decides whether two headers refer to the same logical document.
    ///
    /// Policy, most conservative first:
    /// - normalized equality matches;
    /// - two strict headers match only on exact serial equality;
    /// - with identical non-serial segments, a strict header absorbs a
    ///   non-strict neighbor whose digit run is close
    ///   (`serial_close_ratio`), while two non-strict headers still need
    ///   exact serial equality;
    /// - otherwise whole-string similarity against `threshold`
    ///   (`threshold >= 1.0` disables that fallback).
    pub fn headers_match(&self, header1: &str, header2: &str, threshold: f64) -> bool {
        if header1.is_empty() || header2.is_empty() {
            return header1 == header2;
        }
        if header1 == header2 {
            return true;
        }

        let n1 = self.normalize(header1);
        let n2 = self.normalize(header2);
        if n1 == n2 {
            return true;
        }

        let strict1 = self.is_strict_header(&n1);
        let strict2 = self.is_strict_header(&n2);
        let serial1 = self.extract_serial(&n1);
        let serial2 = self.extract_serial(&n2);

        if strict1 && strict2 {
            return match (&serial1, &serial2) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            };
        }

        if let (Some(serial1), Some(serial2)) = (&serial1, &serial2) {
            if self.non_serial_key(&n1) == self.non_serial_key(&n2) {
                if strict1 != strict2 {
                    let d1: String = serial1.chars().filter(|c| c.is_ascii_digit()).collect();
                    let d2: String = serial2.chars().filter(|c| c.is_ascii_digit()).collect();
                    if d1.is_empty() || d2.is_empty() {
                        return false;
                    }
                    return normalized_levenshtein(&d1, &d2) >= self.config.serial_close_ratio;
                }
                // Neither strict: never merge two weak reads on fuzzy
                // similarity alone.
                return serial1 == serial2;
            }
        }

        if threshold >= 1.0 {
            return false;
        }
        normalized_levenshtein(&n1, &n2) >= threshold
    }

    /// Everything before the serial segment, used as the match key for
    /// serial-centric comparisons.
    fn non_serial_key(&self, header: &str) -> String {
        let sep = self.config.expected_separator;
        match header.rfind(sep) {
            Some(idx) => header[..idx].to_string(),
            None => String::new(),
        }
    }

    /// Structural fitness of a header's shape, independent of the main
    /// score. Used as a tie-breaker when picking a group's representative
    /// header: a valid 2-letter country segment outranks a 3-letter one
    /// even when both strings carry the same serial.
    pub fn header_shape_fitness(&self, header: &str) -> i32 {
        let normalized = self.normalize(header);
        if normalized.is_empty() {
            return 0;
        }
        let parts: Vec<&str> = normalized.split(self.config.expected_separator).collect();
        let n = parts.len();

        let mut score = 0;
        if n >= self.config.min_expected_parts && n <= self.config.expected_parts {
            score += 20;
        } else {
            score -= 50;
        }
        if parts[0].len() == self.config.pattern_prefix_length
            && parts[0].chars().all(|c| c.is_ascii_alphabetic())
        {
            score += 10;
        }
        if n == self.config.expected_parts {
            let country = parts[1];
            if (self.config.pattern_country_min..=self.config.pattern_country_max)
                .contains(&country.len())
                && country.chars().all(|c| c.is_ascii_alphabetic())
            {
                score += 10;
            }
            let code = parts[2];
            if (self.config.pattern_code_min..=self.config.pattern_code_max).contains(&code.len())
                && code.chars().all(|c| c.is_ascii_alphanumeric())
            {
                score += 15;
            } else if code.len() > self.config.pattern_code_max {
                score -= 20;
            }
        }
        if n >= 2 {
            let serial: String = parts[n - 1]
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect();
            let mut chars = serial.chars();
            if let Some(first) = chars.next() {
                if self.config.serial_allowed_prefixes.contains(&first) {
                    score += 15;
                }
                let rest: Vec<char> = chars.collect();
                if !rest.is_empty() && rest.iter().all(|c| c.is_ascii_digit()) {
                    score += 20;
                }
                if (8..=9).contains(&serial.len()) {
                    score += 10;
                }
            }
        }
        score
    }

    /// The configuration this validator was built from.
    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }
}

/// Parses a `FROM:TO,FROM:TO` substitution spec.
fn parse_substitutions(spec: &str) -> Vec<(char, char)> {
    spec.split(',')
        .filter_map(|pair| {
            let mut it = pair.trim().split(':');
            let from = it.next()?.trim().chars().next()?;
            let to = it.next()?.trim().chars().next()?;
            Some((from.to_ascii_uppercase(), to.to_ascii_uppercase()))
        })
        .collect()
}

fn count_digits(text: &str) -> usize {
    text.chars().filter(|c| c.is_ascii_digit()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> HeaderValidator {
        HeaderValidator::new(Arc::new(ExtractionConfig::default())).unwrap()
    }

    #[test]
    fn normalize_is_idempotent() {
        let v = validator();
        for raw in [
            "b-hk-wfe-s17975643",
            " B - HK - WFE - S17975643 ",
            "--B--HK--WFE--817975643--",
            "BL-HK-WFE-S17975643",
            "BHKX-WFE-S17975643",
            "B-HK-WFE-S17975643COA2",
            "",
            "@@##",
        ] {
            let once = v.normalize(raw);
            assert_eq!(v.normalize(&once), once, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn normalize_strips_noise_and_collapses_separators() {
        let v = validator();
        assert_eq!(v.normalize(" b-hk--wfe-s17975643 "), "B-HK-WFE-S17975643");
    }

    #[test]
    fn normalize_repairs_serial_eight_prefix() {
        let v = validator();
        assert_eq!(v.normalize("B-HK-WFE-817975643"), "B-HK-WFE-S17975643");
    }

    #[test]
    fn normalize_repairs_double_prefix() {
        let v = validator();
        assert_eq!(v.normalize("BL-HK-WFE-S17975643"), "B-HK-WFE-S17975643");
    }

    #[test]
    fn normalize_substitutes_confusions_in_serial_tail_only() {
        let v = validator();
        // The serial's leading letter survives; tail confusions resolve to
        // digits. The code segment is left alone.
        assert_eq!(v.normalize("B-HK-WSO-S179756I3"), "B-HK-WSO-S17975613");
    }

    #[test]
    fn normalize_truncates_overlong_serial() {
        let v = validator();
        assert_eq!(
            v.normalize("P-F-W1A-S17995875COA2"),
            "P-F-W1A-S17995875"
        );
    }

    #[test]
    fn normalize_splits_fused_prefix() {
        let v = validator();
        assert_eq!(v.normalize("BWFE2-XX-S17975643"), "B-WFE2-XX-S17975643");
    }

    #[test]
    fn empty_input_scores_zero() {
        let v = validator();
        assert_eq!(v.validate_and_score(""), (0, String::new()));
        assert_eq!(v.validate_and_score("   "), (0, String::new()));
        assert_eq!(v.validate_and_score("@!#"), (0, String::new()));
    }

    #[test]
    fn clean_header_round_trips_at_max_score() {
        let v = validator();
        let header = "B-HK-WFE-S17975643";
        let (score, normalized) = v.validate_and_score(header);
        assert_eq!(normalized, header);
        assert_eq!(score, v.max_score());
    }

    #[test]
    fn non_strict_serial_is_capped() {
        let v = validator();
        for raw in [
            "B-HK-WFE-X17975643",  // bad prefix letter
            "B-HK-WFE-S179756431", // 9 digits
            "B-HK-WFE-S1797",     // too few digits
            "B-HK-WFE",           // no serial at all
            "JUNKJUNKJUNK",
        ] {
            let (score, _) = v.validate_and_score(raw);
            assert!(
                score <= v.config().invalid_serial_score_cap,
                "{raw:?} scored {score} above the cap"
            );
            assert!(!v.is_strict_header(raw));
        }
    }

    #[test]
    fn strict_header_outscores_the_cap() {
        let v = validator();
        let (score, _) = v.validate_and_score("B-HK-WFE-S17975643");
        assert!(score > v.config().invalid_serial_score_cap);
    }

    #[test]
    fn seven_digit_r_serial_is_strict() {
        let v = validator();
        assert!(v.is_strict_header("B-E-UUY-R4092533"));
    }

    #[test]
    fn nine_digit_serial_is_not_strict() {
        let v = validator();
        assert!(!v.is_strict_header("B-E-UUY-R409253380"));
    }

    #[test]
    fn strict_headers_with_different_serials_never_match() {
        let v = validator();
        let a = "B-TW-UET-S18010794";
        let b = "B-TW-UEI-S18010792";
        assert!(v.is_strict_header(a) && v.is_strict_header(b));
        for threshold in [0.5, 0.85, 1.0] {
            assert!(!v.headers_match(a, b, threshold));
        }
    }

    #[test]
    fn strict_headers_with_same_serial_match_across_code_drift() {
        let v = validator();
        assert!(v.headers_match("B-TW-UET-S18010794", "B-TW-UEI-S18010794", 0.85));
    }

    #[test]
    fn strict_absorbs_close_non_strict_neighbor() {
        let v = validator();
        // One extra trailing digit on an otherwise identical header.
        assert!(v.headers_match("B-HK-ZN1-S179780077", "B-HK-ZN1-S17978007", 0.85));
    }

    #[test]
    fn non_strict_one_digit_apart_do_not_merge() {
        let v = validator();
        assert!(!v.headers_match("B-E-UUY-R4092558", "B-E-UUY-R4092528", 0.85));
    }

    #[test]
    fn identical_headers_always_match() {
        let v = validator();
        assert!(v.headers_match("B-E-UUY-R4092533", "B-E-UUY-R4092533", 0.85));
        assert!(v.headers_match("", "", 0.85));
        assert!(!v.headers_match("B-E-UUY-R4092533", "", 0.85));
    }

    #[test]
    fn shape_fitness_prefers_valid_country_length() {
        let v = validator();
        let hk = v.header_shape_fitness("B-HK-WFE-S17991790");
        let chk = v.header_shape_fitness("B-CHK-WEE-S17991790");
        assert!(hk > chk, "expected {hk} > {chk}");
    }

    #[test]
    fn shape_fitness_penalizes_wrong_part_count() {
        let v = validator();
        assert!(v.header_shape_fitness("B-HK-WFE-S17991790") > v.header_shape_fitness("S17991790"));
    }

    #[test]
    fn extract_serial_cleans_noise() {
        let v = validator();
        assert_eq!(
            v.extract_serial("B-HK-WFE-S17975643").as_deref(),
            Some("S17975643")
        );
        assert_eq!(v.extract_serial("NOPARTS"), None);
    }
}
