//! Document boundary detection.
//!
//! Given one (possibly noisy) header per page, groups consecutive pages
//! into documents by header equivalence, picks each group's best
//! representative spelling, and then runs a conservative correction pass
//! that absorbs single-page OCR outliers into their neighbors.
//!
//! The correction pass never merges two independently strict headers with
//! different serials — with one narrow exception: a serial that is
//! exactly its neighbor plus one trailing digit, the signature of a
//! digit-duplication misread at the end of a scan line.

use std::collections::BTreeMap;
use std::sync::Arc;

use strsim::levenshtein;
use tracing::{debug, info};

use crate::core::config::ExtractionConfig;
use crate::validator::HeaderValidator;

/// A contiguous page range that belongs to one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentGroup {
    /// First page of the group (0-based, inclusive).
    pub start_page: usize,
    /// Last page of the group (0-based, inclusive).
    pub end_page: usize,
    /// The group's representative header.
    pub header: String,
}

impl DocumentGroup {
    pub fn new(start_page: usize, end_page: usize, header: impl Into<String>) -> Self {
        Self {
            start_page,
            end_page,
            header: header.into(),
        }
    }

    pub fn page_count(&self) -> usize {
        self.end_page - self.start_page + 1
    }
}

/// Groups pages into documents by header equivalence.
#[derive(Debug, Clone)]
pub struct DocumentSplitter {
    config: Arc<ExtractionConfig>,
    validator: HeaderValidator,
}

impl DocumentSplitter {
    pub fn new(config: Arc<ExtractionConfig>, validator: HeaderValidator) -> Self {
        Self { config, validator }
    }

    /// Runs the full boundary-detection pass: grouping, outlier
    /// correction, and minimum-page filtering.
    pub fn plan(&self, page_headers: &[(usize, String)]) -> Vec<DocumentGroup> {
        let groups = self.detect_groups(page_headers);
        let initial = groups.len();
        let corrected = self.apply_context_correction(groups);
        if corrected.len() != initial {
            info!(
                merged = initial - corrected.len(),
                "context correction merged outlier group(s)"
            );
        }
        self.filter_groups(corrected)
    }

    /// The grouping state machine: each page either extends the current
    /// group (its header matches the group's representative) or closes it
    /// and starts a new one. The last group always closes at end of input.
    pub fn detect_groups(&self, page_headers: &[(usize, String)]) -> Vec<DocumentGroup> {
        let Some(((first_page, first_header), rest)) = page_headers.split_first() else {
            return Vec::new();
        };

        let threshold = self.config.header_similarity_threshold;
        let mut groups: Vec<DocumentGroup> = Vec::new();
        let mut start = *first_page;
        let mut last_page = *first_page;
        let mut representative = first_header.clone();
        let mut members: Vec<String> = vec![first_header.clone()];

        for (page, header) in rest {
            if self.validator.headers_match(header, &representative, threshold) {
                members.push(header.clone());
            } else {
                let best = self.select_best_header(&members);
                debug!(start, end = last_page, header = %best, "closed group");
                groups.push(DocumentGroup::new(start, last_page, best));
                start = *page;
                representative = header.clone();
                members = vec![header.clone()];
            }
            last_page = *page;
        }

        let best = self.select_best_header(&members);
        debug!(start, end = last_page, header = %best, "closed final group");
        groups.push(DocumentGroup::new(start, last_page, best));
        groups
    }

    /// Picks a group's representative spelling: the one most members agree
    /// on, ties broken by strict validity, score, shape fitness, shorter
    /// text, and finally lexicographic order — fully deterministic for a
    /// given member multiset.
    pub fn select_best_header(&self, headers: &[String]) -> String {
        let Some(first) = headers.first() else {
            return String::new();
        };
        if headers.len() == 1 {
            let (score, normalized) = self.validator.validate_and_score(first);
            return if score > 0 && !normalized.is_empty() {
                normalized
            } else {
                first.clone()
            };
        }

        struct Bucket {
            count: usize,
            strict: bool,
            best_score: i32,
            fitness: i32,
        }

        let mut buckets: BTreeMap<String, Bucket> = BTreeMap::new();
        for header in headers {
            let (score, normalized) = self.validator.validate_and_score(header);
            let key = if normalized.is_empty() {
                header.clone()
            } else {
                normalized
            };
            let strict = self.validator.is_strict_header(&key);
            let fitness = self.validator.header_shape_fitness(&key);
            let bucket = buckets.entry(key).or_insert(Bucket {
                count: 0,
                strict: false,
                best_score: i32::MIN,
                fitness,
            });
            bucket.count += 1;
            bucket.strict |= strict;
            bucket.best_score = bucket.best_score.max(score);
        }

        let mut ranked: Vec<(String, Bucket)> = buckets.into_iter().collect();
        ranked.sort_by(|(text_a, a), (text_b, b)| {
            b.count
                .cmp(&a.count)
                .then(b.strict.cmp(&a.strict))
                .then(b.best_score.cmp(&a.best_score))
                .then(b.fitness.cmp(&a.fitness))
                .then(text_a.len().cmp(&text_b.len()))
                .then(text_a.cmp(text_b))
        });
        ranked[0].0.clone()
    }

    /// Absorbs single-page outlier groups that look like OCR misreads of a
    /// neighbor, then collapses adjacent groups that ended up with the
    /// same representative header.
    pub fn apply_context_correction(&self, groups: Vec<DocumentGroup>) -> Vec<DocumentGroup> {
        if groups.len() <= 1 {
            return groups;
        }

        let mut working = groups;
        let mut corrected: Vec<DocumentGroup> = Vec::new();
        let mut i = 0;

        while i < working.len() {
            let current = working[i].clone();

            if current.page_count() == 1 {
                let prev_match = corrected
                    .last()
                    .is_some_and(|prev| self.is_likely_ocr_error(&current.header, &prev.header));
                let next_match = working
                    .get(i + 1)
                    .is_some_and(|next| self.is_likely_ocr_error(&current.header, &next.header));

                if prev_match || next_match {
                    let side = self.select_merge_side(
                        corrected.last(),
                        working.get(i + 1),
                        prev_match,
                        next_match,
                    );
                    match side {
                        Some(MergeSide::Prev) => {
                            let prev = corrected.last_mut().expect("prev exists on prev merge");
                            info!(
                                page = current.start_page + 1,
                                outlier = %current.header,
                                into = %prev.header,
                                "context correction: merged into previous group"
                            );
                            prev.end_page = current.end_page;
                            i += 1;
                            continue;
                        }
                        Some(MergeSide::Next) => {
                            let next = &mut working[i + 1];
                            info!(
                                page = current.start_page + 1,
                                outlier = %current.header,
                                into = %next.header,
                                "context correction: merged into next group"
                            );
                            next.start_page = current.start_page;
                            i += 1;
                            continue;
                        }
                        None => {}
                    }
                }
            }

            corrected.push(current);
            i += 1;
        }

        merge_adjacent_groups(corrected)
    }

    fn select_merge_side(
        &self,
        prev: Option<&DocumentGroup>,
        next: Option<&DocumentGroup>,
        prev_match: bool,
        next_match: bool,
    ) -> Option<MergeSide> {
        match (prev_match, next_match) {
            (true, false) => Some(MergeSide::Prev),
            (false, true) => Some(MergeSide::Next),
            (false, false) => None,
            (true, true) => {
                let prev_rank = prev.map(|g| self.neighbor_rank(g)).unwrap_or(i32::MIN);
                let next_rank = next.map(|g| self.neighbor_rank(g)).unwrap_or(i32::MIN);
                if next_rank > prev_rank {
                    Some(MergeSide::Next)
                } else {
                    Some(MergeSide::Prev)
                }
            }
        }
    }

    /// Ranks a neighbor's trustworthiness when both sides could absorb an
    /// outlier: structural score, strict validity, then page count.
    fn neighbor_rank(&self, group: &DocumentGroup) -> i32 {
        let (score, normalized) = self.validator.validate_and_score(&group.header);
        let target = if normalized.is_empty() {
            group.header.as_str()
        } else {
            normalized.as_str()
        };
        let strict_bonus = if self.validator.is_strict_header(target) {
            20
        } else {
            0
        };
        score + strict_bonus + (group.page_count().min(10) as i32)
    }

    /// Whether two headers differ in a way that suggests an OCR misread
    /// rather than a genuine document boundary.
    pub fn is_likely_ocr_error(&self, header1: &str, header2: &str) -> bool {
        let (_, n1) = self.validator.validate_and_score(header1);
        let (_, n2) = self.validator.validate_and_score(header2);
        let n1 = if n1.is_empty() { header1.to_string() } else { n1 };
        let n2 = if n2.is_empty() { header2.to_string() } else { n2 };

        // Never collapse two different strict headers, except the very
        // specific trailing-digit misread.
        let strict1 = self.validator.is_strict_header(&n1);
        let strict2 = self.validator.is_strict_header(&n2);
        if strict1 && strict2 && n1 != n2 {
            return self.is_serial_tail_digit_variant(&n1, &n2);
        }

        if header1.len().abs_diff(header2.len()) > 5 {
            return false;
        }

        // Compare the longest digit runs, the likeliest serials.
        let d1 = longest_digit_run(&n1);
        let d2 = longest_digit_run(&n2);
        if d1.len() >= 7 && d2.len() >= 7 {
            if d1 == d2 {
                debug!(%n1, %n2, "likely OCR error: identical serial digits");
                return true;
            }
            if (d1.contains(&d2) || d2.contains(&d1)) && d1.len().abs_diff(d2.len()) <= 2 {
                debug!(%n1, %n2, "likely OCR error: serial digit run containment");
                return true;
            }
            let dist = levenshtein(&d1, &d2);
            let max_len = d1.len().max(d2.len());
            if dist <= 2 && (dist as f64) < max_len as f64 * 0.25 {
                debug!(%n1, %n2, dist, "likely OCR error: close serial digits");
                return true;
            }
        }

        // Structural fallback over the segments.
        let sep = self.config.expected_separator;
        let parts1: Vec<&str> = n1.split(sep).collect();
        let parts2: Vec<&str> = n2.split(sep).collect();
        if parts1.len().abs_diff(parts2.len()) > 1 {
            return false;
        }
        if parts1.len() >= 3 && parts2.len() >= 3 {
            if parts1[0] != parts2[0] {
                return false;
            }
            if parts1[1] != parts2[1] && !strings_similar(parts1[1], parts2[1], 0.7) {
                return false;
            }
            if !strings_similar(parts1[2], parts2[2], 0.5) {
                return false;
            }
            let digits1: String = parts1[parts1.len() - 1]
                .chars()
                .filter(|c| c.is_ascii_digit())
                .collect();
            let digits2: String = parts2[parts2.len() - 1]
                .chars()
                .filter(|c| c.is_ascii_digit())
                .collect();
            if digits1.is_empty() || digits2.is_empty() {
                return false;
            }
            let dist = levenshtein(&digits1, &digits2);
            let max_len = digits1.len().max(digits2.len());
            if dist <= 3 && (dist as f64) < max_len as f64 * 0.3 {
                debug!(%n1, %n2, dist, "likely OCR error: structural serial match");
                return true;
            }
        }

        false
    }

    /// Detects strict headers where one serial is exactly the other plus
    /// one trailing digit (same prefix segments, same serial letter).
    pub fn is_serial_tail_digit_variant(&self, header1: &str, header2: &str) -> bool {
        let sep = self.config.expected_separator;
        let parts1: Vec<&str> = header1.split(sep).collect();
        let parts2: Vec<&str> = header2.split(sep).collect();
        if parts1.len() < 3 || parts2.len() < 3 {
            return false;
        }
        if parts1[..parts1.len() - 1] != parts2[..parts2.len() - 1] {
            return false;
        }

        let serial1 = parts1[parts1.len() - 1];
        let serial2 = parts2[parts2.len() - 1];
        let (Some(p1), Some(p2)) = (serial1.chars().next(), serial2.chars().next()) else {
            return false;
        };
        if p1 != p2 {
            return false;
        }

        let digits1: String = serial1.chars().skip(1).filter(|c| c.is_ascii_digit()).collect();
        let digits2: String = serial2.chars().skip(1).filter(|c| c.is_ascii_digit()).collect();
        if digits1.is_empty() || digits2.is_empty() {
            return false;
        }
        let (long, short) = if digits1.len() >= digits2.len() {
            (&digits1, &digits2)
        } else {
            (&digits2, &digits1)
        };
        long.len() - short.len() == 1 && long.starts_with(short.as_str())
    }

    /// Drops groups below the configured minimum page count. A minimum of
    /// zero keeps everything.
    pub fn filter_groups(&self, groups: Vec<DocumentGroup>) -> Vec<DocumentGroup> {
        if self.config.min_pages_per_split == 0 {
            return groups;
        }
        let before = groups.len();
        let filtered: Vec<DocumentGroup> = groups
            .into_iter()
            .filter(|g| {
                let keep = g.page_count() >= self.config.min_pages_per_split;
                if !keep {
                    info!(
                        header = %g.header,
                        pages = g.page_count(),
                        "skipping group below minimum page count"
                    );
                }
                keep
            })
            .collect();
        if filtered.len() != before {
            info!(removed = before - filtered.len(), "filtered small groups");
        }
        filtered
    }
}

#[derive(Debug, Clone, Copy)]
enum MergeSide {
    Prev,
    Next,
}

/// Collapses adjacent groups that share an identical representative.
fn merge_adjacent_groups(groups: Vec<DocumentGroup>) -> Vec<DocumentGroup> {
    let mut merged: Vec<DocumentGroup> = Vec::with_capacity(groups.len());
    for group in groups {
        match merged.last_mut() {
            Some(last) if group.start_page == last.end_page + 1 && group.header == last.header => {
                last.end_page = group.end_page;
            }
            _ => merged.push(group),
        }
    }
    merged
}

fn longest_digit_run(text: &str) -> String {
    let mut best = String::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else {
            if current.len() > best.len() {
                best = current.clone();
            }
            current.clear();
        }
    }
    if current.len() > best.len() {
        best = current;
    }
    best
}

fn strings_similar(a: &str, b: &str, threshold: f64) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let max_len = a.len().max(b.len());
    let dist = levenshtein(a, b);
    1.0 - dist as f64 / max_len as f64 >= threshold
}
