//! Glyph ambiguity detection and resolution over header strings.
//!
//! The customer-code segment is the only header segment whose alphabet
//! legitimately mixes letters and digits, which makes it the home of the
//! classic `O`/`0` confusion. This module holds the string-level half of
//! the resolver: pair maps, ambiguity inspection, support-gated
//! resolution, and document-level harmonization planning. Image-level
//! evidence gathering (char boxes, glyph widths, pair-constrained OCR
//! votes) lives in the OCR pipeline.
//!
//! Every operation here either applies a change backed by sufficient
//! evidence or returns the input unchanged with a reason; nothing guesses.

use std::collections::BTreeMap;

/// Quality-flag vocabulary recorded per page and consumed by the
/// harmonization and rescue passes. Flags are joined with `;` in a page's
/// quality string.
pub const FLAG_CODE_AMBIGUITY: &str = "code_ambiguity";
pub const FLAG_GLYPH_DISAMBIGUATED: &str = "glyph_disambiguated";
pub const FLAG_GLYPH_SKIPPED: &str = "glyph_disambiguation_skipped";
pub const REASON_NO_CHAR_BOXES: &str = "no_char_boxes";
pub const FLAG_ANCHOR_RESCUED: &str = "anchor_rescued";
pub const FLAG_HARMONIZED: &str = "harmonized";

/// Parses an `A:B,C:D` pair spec into a bidirectional map.
pub fn parse_pair_map(spec: &str) -> BTreeMap<char, char> {
    let mut map = BTreeMap::new();
    for pair in spec.split(',') {
        let mut it = pair.trim().split(':');
        let (Some(a), Some(b)) = (it.next(), it.next()) else {
            continue;
        };
        let (Some(a), Some(b)) = (
            a.trim().chars().next().map(|c| c.to_ascii_uppercase()),
            b.trim().chars().next().map(|c| c.to_ascii_uppercase()),
        ) else {
            continue;
        };
        map.insert(a, b);
        map.insert(b, a);
    }
    map
}

/// The canonical member of a char's ambiguity pair: the smaller codepoint,
/// so `O` canonicalizes to `0` and `L` to `I`. Characters outside the map
/// canonicalize to themselves.
pub fn canonical_char(ch: char, pairs: &BTreeMap<char, char>) -> char {
    match pairs.get(&ch) {
        Some(&partner) if partner < ch => partner,
        _ => ch,
    }
}

/// Result of inspecting a header's code segment for ambiguous glyphs.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeAmbiguity {
    /// Whether the code segment contains at least one ambiguous character
    /// (and passes the mixed-alphanumeric gate when required).
    pub is_ambiguous: bool,
    /// The code segment text, when the header has enough parts.
    pub code_segment: String,
    /// Index of the code segment among the dash-separated parts.
    pub part_index: Option<usize>,
    /// Character offset of the code segment within the whole header.
    pub char_offset: Option<usize>,
    /// Every single-position substitution of the code segment.
    pub alternative_codes: Vec<String>,
    /// The full header with each alternative code spliced in.
    pub alternative_headers: Vec<String>,
}

impl CodeAmbiguity {
    fn not_ambiguous() -> Self {
        Self {
            is_ambiguous: false,
            code_segment: String::new(),
            part_index: None,
            char_offset: None,
            alternative_codes: Vec::new(),
            alternative_headers: Vec::new(),
        }
    }
}

/// Locates the code segment by header shape (index 2 for 4-part, index 1
/// for 3-part — always second from the end) and enumerates the
/// single-position alternatives under the pair map.
///
/// With `require_mixed`, only a segment that mixes letters and digits is
/// flagged; an all-letter code such as `ABCD` cannot be ambiguous.
pub fn inspect_code_ambiguity(
    header: &str,
    separator: char,
    pairs: &BTreeMap<char, char>,
    require_mixed: bool,
) -> CodeAmbiguity {
    if pairs.is_empty() {
        return CodeAmbiguity::not_ambiguous();
    }
    let parts: Vec<&str> = header.split(separator).collect();
    if parts.len() < 3 {
        return CodeAmbiguity::not_ambiguous();
    }
    let part_index = parts.len() - 2;
    let code = parts[part_index];

    let has_alpha = code.chars().any(|c| c.is_ascii_alphabetic());
    let has_digit = code.chars().any(|c| c.is_ascii_digit());
    if require_mixed && !(has_alpha && has_digit) {
        return CodeAmbiguity {
            code_segment: code.to_string(),
            part_index: Some(part_index),
            char_offset: Some(segment_offset(&parts, part_index)),
            ..CodeAmbiguity::not_ambiguous()
        };
    }

    let chars: Vec<char> = code.chars().collect();
    let mut alternative_codes = Vec::new();
    for (pos, ch) in chars.iter().enumerate() {
        if let Some(&partner) = pairs.get(ch) {
            let mut alt: Vec<char> = chars.clone();
            alt[pos] = partner;
            let alt: String = alt.into_iter().collect();
            if alt != code && !alternative_codes.contains(&alt) {
                alternative_codes.push(alt);
            }
        }
    }

    if alternative_codes.is_empty() {
        return CodeAmbiguity {
            code_segment: code.to_string(),
            part_index: Some(part_index),
            char_offset: Some(segment_offset(&parts, part_index)),
            ..CodeAmbiguity::not_ambiguous()
        };
    }

    let alternative_headers = alternative_codes
        .iter()
        .map(|alt| splice_code(&parts, part_index, alt, separator))
        .collect();

    CodeAmbiguity {
        is_ambiguous: true,
        code_segment: code.to_string(),
        part_index: Some(part_index),
        char_offset: Some(segment_offset(&parts, part_index)),
        alternative_codes,
        alternative_headers,
    }
}

/// Character offset of `parts[index]` within the joined header.
fn segment_offset(parts: &[&str], index: usize) -> usize {
    parts[..index].iter().map(|p| p.chars().count() + 1).sum()
}

fn splice_code(parts: &[&str], index: usize, code: &str, separator: char) -> String {
    let mut out: Vec<&str> = parts.to_vec();
    out[index] = code;
    out.join(&separator.to_string())
}

/// Outcome of a support-gated resolution attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SupportResolution {
    /// Whether an alternative spelling replaced the original.
    pub applied: bool,
    /// Candidate occurrences backing the chosen spelling.
    pub support: usize,
    /// Why the resolution did or did not happen.
    pub reason: String,
}

/// Resolves a code ambiguity by counting how many already-collected
/// candidate strings agree on each alternative spelling.
///
/// An alternative wins only when its support meets `min_support` and
/// strictly exceeds the original spelling's own support; otherwise the
/// original is kept unchanged.
pub fn resolve_code_ambiguity_by_support(
    header: &str,
    candidates: &[String],
    min_support: usize,
    separator: char,
    pairs: &BTreeMap<char, char>,
    require_mixed: bool,
) -> (String, SupportResolution) {
    let inspection = inspect_code_ambiguity(header, separator, pairs, require_mixed);
    if !inspection.is_ambiguous {
        return (
            header.to_string(),
            SupportResolution {
                applied: false,
                support: 0,
                reason: "not_ambiguous".to_string(),
            },
        );
    }

    let base_support = candidates.iter().filter(|c| c.as_str() == header).count();
    let mut best: Option<(&String, usize)> = None;
    let mut tied = false;
    for alt in &inspection.alternative_headers {
        let support = candidates.iter().filter(|c| c.as_str() == alt).count();
        match best {
            Some((_, s)) if support > s => {
                best = Some((alt, support));
                tied = false;
            }
            Some((_, s)) if support == s && support > 0 => tied = true,
            None => best = Some((alt, support)),
            _ => {}
        }
    }

    match best {
        Some((alt, support)) if !tied && support >= min_support && support > base_support => (
            alt.clone(),
            SupportResolution {
                applied: true,
                support,
                reason: format!("support={support}>base={base_support}"),
            },
        ),
        Some((_, support)) if tied => (
            header.to_string(),
            SupportResolution {
                applied: false,
                support,
                reason: "tied_support".to_string(),
            },
        ),
        Some((_, support)) => (
            header.to_string(),
            SupportResolution {
                applied: false,
                support,
                reason: format!("insufficient_support={support}"),
            },
        ),
        None => (
            header.to_string(),
            SupportResolution {
                applied: false,
                support: 0,
                reason: "no_alternatives".to_string(),
            },
        ),
    }
}

/// Anchor key for a header: every segment as-is except the code segment,
/// which is canonicalized under the pair map. Pages that differ only in
/// an ambiguous code glyph share an anchor.
pub fn anchor_key(header: &str, separator: char, pairs: &BTreeMap<char, char>) -> String {
    let parts: Vec<&str> = header.split(separator).collect();
    if parts.len() < 3 {
        return header.to_string();
    }
    let code_index = parts.len() - 2;
    let canonical: String = parts[code_index]
        .chars()
        .map(|c| canonical_char(c, pairs))
        .collect();
    splice_code(&parts, code_index, &canonical, separator)
}

/// Whether a page's quality-flag string carries glyph-level evidence for
/// its current spelling.
pub fn has_glyph_evidence(flags: &str) -> bool {
    flags.contains(FLAG_GLYPH_DISAMBIGUATED)
}

/// Whether a page was flagged ambiguous but skipped for lack of char
/// boxes — the precondition for the anchor rescue pass.
pub fn skipped_for_missing_boxes(flags: &str) -> bool {
    flags.contains(FLAG_GLYPH_SKIPPED) && flags.contains(REASON_NO_CHAR_BOXES)
}

/// Plans the document-level harmonization pass.
///
/// Pages are grouped by anchor; when an anchor carries more than one raw
/// spelling, the spelling backed by the strongest per-page glyph evidence
/// wins and is propagated to every page of the anchor. Majority vote
/// alone never decides (the more-frequent-but-wrong OCR reading must not
/// win), and ties are left unresolved.
///
/// Returns the page-index → corrected-header updates.
pub fn plan_harmonization(
    page_headers: &[(usize, String)],
    page_flags: &BTreeMap<usize, String>,
    separator: char,
    pairs: &BTreeMap<char, char>,
    min_evidence: usize,
) -> BTreeMap<usize, String> {
    let mut anchors: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    let by_page: BTreeMap<usize, &str> = page_headers
        .iter()
        .map(|(page, header)| (*page, header.as_str()))
        .collect();

    for (page, header) in page_headers {
        anchors
            .entry(anchor_key(header, separator, pairs))
            .or_default()
            .push(*page);
    }

    let mut updates = BTreeMap::new();
    for pages in anchors.values() {
        let spellings: Vec<&str> = pages.iter().map(|p| by_page[p]).collect();
        let mut distinct: Vec<&str> = spellings.clone();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() < 2 {
            continue;
        }

        // Tally only spellings with glyph evidence behind them.
        let mut evidence: BTreeMap<&str, usize> = BTreeMap::new();
        for page in pages {
            let flags = page_flags.get(page).map(String::as_str).unwrap_or("");
            if has_glyph_evidence(flags) {
                *evidence.entry(by_page[page]).or_insert(0) += 1;
            }
        }

        let Some((&winner, &count)) = evidence.iter().max_by_key(|(_, c)| **c) else {
            continue;
        };
        if count < min_evidence.max(1) {
            continue;
        }
        let tied = evidence.values().filter(|&&c| c == count).count() > 1;
        if tied {
            continue;
        }

        for page in pages {
            if by_page[page] != winner {
                updates.insert(*page, winner.to_string());
            }
        }
    }
    updates
}
