use serde::{Deserialize, Serialize};

use crate::braces::brace_delta;
use crate::levenshtein::line_similarity;

/// Literal form models emit inside SEARCH blocks; rewritten to the
/// canonical `...` marker before matching so the engine has one contract.
pub const ELISION_TOKEN: &str = "<<<elided>>>";
pub const ELISION_MARKER: &str = "...";

const SIMILARITY_THRESHOLD: f64 = 0.8;
const CANDIDATE_THRESHOLD: f64 = 0.3;
const MAX_CANDIDATES: usize = 3;
const PREVIEW_LIMIT: usize = 100;

/// The tier at which the engine succeeded; surfaced as an indicator of
/// approximation risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchLevel {
    Exact,
    TrimmedWhitespace,
    Similarity,
    Elision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub start_byte: usize,
    pub end_byte: usize,
    /// Equals `source[start_byte..end_byte]` at the moment of matching.
    pub original_text: String,
    pub match_level: MatchLevel,
}

/// Permitted 1-indexed inclusive line range for guarded matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineGuard {
    pub lo: usize,
    pub hi: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchError {
    #[error("search block is empty after trimming blank lines")]
    EmptySearch,
    #[error("no match found for: {preview}")]
    NoMatch {
        preview: String,
        candidates: Vec<String>,
    },
    #[error("guard range {lo}..{hi} lies outside the file")]
    GuardOutOfRange { lo: usize, hi: usize },
}

impl MatchError {
    /// Full failure text for retry prompts: the truncated search plus the
    /// closest candidate lines.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::NoMatch {
                preview,
                candidates,
            } if !candidates.is_empty() => {
                let mut out = format!("no match found for: {preview}\nclosest lines:");
                for candidate in candidates {
                    out.push('\n');
                    out.push_str(candidate);
                }
                out
            }
            other => other.to_string(),
        }
    }
}

/// Locate `search` in `source`, trying each level in order: exact,
/// per-line trimmed whitespace, per-line similarity, elision. With a
/// guard, all levels run against the guarded line window only.
///
/// A search consisting entirely of blank lines is rejected rather than
/// matched against the empty prefix; degenerate emissions route through
/// the retry path instead of editing at offset zero.
pub fn find_match(
    source: &str,
    search: &str,
    guard: Option<LineGuard>,
) -> Result<MatchResult, MatchError> {
    let search = search.replace(ELISION_TOKEN, ELISION_MARKER);
    if search.lines().all(|line| line.trim().is_empty()) {
        return Err(MatchError::EmptySearch);
    }

    let (window, offset) = match guard {
        None => (source, 0usize),
        Some(g) => guard_window(source, g)?,
    };

    if let Some(result) = match_in_window(window, &search) {
        return Ok(MatchResult {
            start_byte: result.start_byte + offset,
            end_byte: result.end_byte + offset,
            original_text: result.original_text,
            match_level: result.match_level,
        });
    }

    Err(no_match_error(window, &search))
}

fn match_in_window(source: &str, search: &str) -> Option<MatchResult> {
    if let Some(start) = source.find(search) {
        let end = start + search.len();
        return Some(MatchResult {
            start_byte: start,
            end_byte: end,
            original_text: search.to_string(),
            match_level: MatchLevel::Exact,
        });
    }

    let spans = line_spans(source);
    let search_lines: Vec<&str> = search.lines().collect();

    if let Some((first, last)) = find_window(source, &spans, &search_lines, |src, q| {
        src.trim() == q.trim()
    }) {
        return Some(span_result(
            source,
            &spans,
            first,
            last,
            MatchLevel::TrimmedWhitespace,
        ));
    }

    if let Some((first, last)) = find_similarity_window(source, &spans, &search_lines) {
        return Some(span_result(source, &spans, first, last, MatchLevel::Similarity));
    }

    if search_lines.iter().any(|line| line.trim() == ELISION_MARKER) {
        if let Some((start, end)) = find_elision(source, &spans, &search_lines) {
            return Some(MatchResult {
                start_byte: start,
                end_byte: end,
                original_text: source[start..end].to_string(),
                match_level: MatchLevel::Elision,
            });
        }
    }

    None
}

// ── Line windows ─────────────────────────────────────────────────────────────

/// Byte spans of each line, end exclusive of the newline (and of a
/// preceding `\r`).
fn line_spans(s: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let bytes = s.as_bytes();
    let mut start = 0usize;
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'\n' {
            let mut end = i;
            if end > start && bytes[end - 1] == b'\r' {
                end -= 1;
            }
            spans.push((start, end));
            start = i + 1;
        }
    }
    if start < s.len() {
        spans.push((start, s.len()));
    }
    spans
}

fn line_at<'a>(source: &'a str, spans: &[(usize, usize)], idx: usize) -> &'a str {
    let (start, end) = spans[idx];
    &source[start..end]
}

fn find_window(
    source: &str,
    spans: &[(usize, usize)],
    query: &[&str],
    eq: impl Fn(&str, &str) -> bool,
) -> Option<(usize, usize)> {
    if query.is_empty() || spans.len() < query.len() {
        return None;
    }
    'outer: for start in 0..=(spans.len() - query.len()) {
        for (i, q) in query.iter().enumerate() {
            if !eq(line_at(source, spans, start + i), q) {
                continue 'outer;
            }
        }
        return Some((start, start + query.len() - 1));
    }
    None
}

fn find_similarity_window(
    source: &str,
    spans: &[(usize, usize)],
    query: &[&str],
) -> Option<(usize, usize)> {
    if query.is_empty() || spans.len() < query.len() {
        return None;
    }
    'outer: for start in 0..=(spans.len() - query.len()) {
        let mut total = 0.0f64;
        for (i, q) in query.iter().enumerate() {
            let sim = line_similarity(line_at(source, spans, start + i).trim(), q.trim());
            if sim < SIMILARITY_THRESHOLD {
                continue 'outer;
            }
            total += sim;
        }
        if total / query.len() as f64 >= SIMILARITY_THRESHOLD {
            return Some((start, start + query.len() - 1));
        }
    }
    None
}

fn span_result(
    source: &str,
    spans: &[(usize, usize)],
    first: usize,
    last: usize,
    level: MatchLevel,
) -> MatchResult {
    let start = spans[first].0;
    let end = spans[last].1;
    MatchResult {
        start_byte: start,
        end_byte: end,
        original_text: source[start..end].to_string(),
        match_level: level,
    }
}

// ── Elision ──────────────────────────────────────────────────────────────────

/// Split at the first `...` line; locate the pre-anchor region exactly or
/// per-line trimmed, then scan forward tracking brace depth for the end
/// anchor. With a bare `}` anchor the first depth-zero closing brace
/// wins. That is deliberately best-effort: a wrong pick surfaces as a
/// failed search on the next attempt, not silent corruption.
fn find_elision(
    source: &str,
    spans: &[(usize, usize)],
    search_lines: &[&str],
) -> Option<(usize, usize)> {
    let marker = search_lines
        .iter()
        .position(|line| line.trim() == ELISION_MARKER)?;
    let pre: Vec<&str> = search_lines[..marker].to_vec();
    let anchor = search_lines[marker + 1..]
        .iter()
        .find(|line| !line.trim().is_empty())?;
    if pre.is_empty() {
        return None;
    }

    let (pre_first, pre_last) = find_window(source, spans, &pre, |src, q| src == q)
        .or_else(|| find_window(source, spans, &pre, |src, q| src.trim() == q.trim()))?;

    let mut depth: i32 = (pre_first..=pre_last)
        .map(|idx| brace_delta(line_at(source, spans, idx)))
        .sum();
    let anchor_trimmed = anchor.trim();

    for idx in (pre_last + 1)..spans.len() {
        let line = line_at(source, spans, idx);
        let trimmed = line.trim();
        if depth <= 0
            && !anchor_trimmed.is_empty()
            && (trimmed == anchor_trimmed || trimmed.starts_with(anchor_trimmed))
        {
            return Some((spans[pre_first].0, spans[idx].1));
        }
        depth += brace_delta(line);
        if depth <= 0 && anchor_trimmed == "}" {
            return Some((spans[pre_first].0, spans[idx].1));
        }
    }
    None
}

// ── Guards ───────────────────────────────────────────────────────────────────

fn guard_window(source: &str, guard: LineGuard) -> Result<(&str, usize), MatchError> {
    let spans = line_spans(source);
    if guard.lo == 0 || guard.lo > guard.hi || guard.lo > spans.len() {
        return Err(MatchError::GuardOutOfRange {
            lo: guard.lo,
            hi: guard.hi,
        });
    }
    let hi = guard.hi.min(spans.len());
    let start = spans[guard.lo - 1].0;
    let end = spans[hi - 1].1;
    Ok((&source[start..end], start))
}

// ── Diagnostics ──────────────────────────────────────────────────────────────

fn no_match_error(source: &str, search: &str) -> MatchError {
    let preview: String = if search.chars().count() > PREVIEW_LIMIT {
        let cut: String = search.chars().take(PREVIEW_LIMIT).collect();
        format!("{cut}…")
    } else {
        search.to_string()
    };
    let first_query = search
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
        .trim();

    let mut scored: Vec<(f64, usize, &str)> = source
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| (line_similarity(line.trim(), first_query), i, line))
        .filter(|(sim, _, _)| *sim >= CANDIDATE_THRESHOLD)
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    let candidates = scored
        .into_iter()
        .take(MAX_CANDIDATES)
        .map(|(_, i, line)| format!("line {}: {}", i + 1, line))
        .collect();

    MatchError::NoMatch {
        preview,
        candidates,
    }
}
