use serde::{Deserialize, Serialize};

use crate::matcher::{ELISION_MARKER, LineGuard, MatchError, find_match};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HunkLineKind {
    Context,
    Add,
    Remove,
    Elision,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HunkLine {
    pub kind: HunkLineKind,
    pub text: String,
}

impl HunkLine {
    fn context(text: impl Into<String>) -> Self {
        Self {
            kind: HunkLineKind::Context,
            text: text.into(),
        }
    }
}

/// A contiguous edit region. The header context (text after the trailing
/// `@@`) is informational; anchoring comes from the body lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub context: String,
    pub lines: Vec<HunkLine>,
}

/// Ordered hunks against one file; later hunks see the content produced
/// by earlier ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub hunks: Vec<Hunk>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiffError {
    #[error("elision marker lacks an end anchor in hunk {hunk}")]
    ElisionWithoutAnchor { hunk: usize },
    #[error("hunk {hunk} failed to apply: {source}")]
    HunkFailed {
        hunk: usize,
        #[source]
        source: MatchError,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub content: String,
    pub warnings: Vec<String>,
}

// ── Parsing ──────────────────────────────────────────────────────────────────

/// Strip `a/`/`b/` prefixes from a diff header path; `/dev/null` and empty
/// paths yield `None`.
pub fn parse_patch_path(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw == "/dev/null" {
        return None;
    }
    let normalized = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    if normalized.is_empty() {
        return None;
    }
    Some(normalized.to_string())
}

/// Drop the blank lines LLM streams inject between diff lines: every blank
/// line before the first `@@`, and inside hunks only lines that are the
/// empty string (`" "` stays, it is a legitimate blank context line).
pub fn filter_stream_blanks(lines: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen_hunk = false;
    for line in lines {
        if line.starts_with("@@") {
            seen_hunk = true;
        }
        if !seen_hunk && line.trim().is_empty() {
            continue;
        }
        if seen_hunk && line.is_empty() {
            continue;
        }
        out.push(line.clone());
    }
    out
}

/// Parse a complete model-emitted unified diff, possibly spanning files.
pub fn parse_unified_diff(text: &str) -> Result<Vec<FileDiff>, DiffError> {
    let raw: Vec<String> = text.lines().map(str::to_string).collect();
    let lines = filter_stream_blanks(&raw);
    let mut files: Vec<FileDiff> = Vec::new();
    let mut builder = FileBuilder::default();

    for line in &lines {
        if let Some(raw) = line.strip_prefix("--- ") {
            if let Some(done) = builder.finish()? {
                files.push(done);
            }
            builder = FileBuilder::default();
            builder.path = parse_patch_path(raw);
            continue;
        }
        builder.feed(line);
    }
    if let Some(done) = builder.finish()? {
        files.push(done);
    }
    Ok(files)
}

/// Parse the body lines of a single-file diff (as collected by the stream
/// parser); `path` seeds the target and `---`/`+++` headers inside the
/// body may refine it.
pub fn parse_file_diff(path: &str, lines: &[String]) -> Result<FileDiff, DiffError> {
    let filtered = filter_stream_blanks(lines);
    let mut builder = FileBuilder {
        path: Some(path.to_string()),
        ..FileBuilder::default()
    };
    for line in &filtered {
        if let Some(raw) = line.strip_prefix("--- ") {
            if builder.current.is_none()
                && builder.hunks.is_empty()
                && let Some(p) = parse_patch_path(raw)
            {
                builder.path = Some(p);
            }
            continue;
        }
        builder.feed(line);
    }
    Ok(builder.finish()?.unwrap_or(FileDiff {
        path: path.to_string(),
        hunks: Vec::new(),
    }))
}

#[derive(Default)]
struct FileBuilder {
    path: Option<String>,
    hunks: Vec<Hunk>,
    current: Option<Hunk>,
}

impl FileBuilder {
    fn feed(&mut self, line: &str) {
        if let Some(raw) = line.strip_prefix("+++ ") {
            if let Some(p) = parse_patch_path(raw) {
                self.path = Some(p);
            }
            return;
        }
        if line.starts_with("@@") {
            self.flush_hunk();
            self.current = Some(Hunk {
                context: hunk_header_context(line),
                lines: Vec::new(),
            });
            return;
        }
        let Some(hunk) = self.current.as_mut() else {
            // Junk between the headers and the first @@ (index lines,
            // `diff --git`, stream noise).
            return;
        };
        hunk.lines.push(classify_body_line(line));
    }

    fn flush_hunk(&mut self) {
        if let Some(hunk) = self.current.take() {
            self.hunks.push(hunk);
        }
    }

    fn finish(&mut self) -> Result<Option<FileDiff>, DiffError> {
        self.flush_hunk();
        if self.path.is_none() && self.hunks.is_empty() {
            return Ok(None);
        }
        let diff = FileDiff {
            path: self.path.take().unwrap_or_default(),
            hunks: std::mem::take(&mut self.hunks),
        };
        validate_elisions(&diff)?;
        Ok(Some(diff))
    }
}

fn hunk_header_context(line: &str) -> String {
    match line[2..].find("@@") {
        Some(pos) => line[2 + pos + 2..].trim().to_string(),
        None => String::new(),
    }
}

fn classify_body_line(line: &str) -> HunkLine {
    if line.trim() == ELISION_MARKER {
        return HunkLine {
            kind: HunkLineKind::Elision,
            text: String::new(),
        };
    }
    if let Some(rest) = line.strip_prefix('+') {
        return HunkLine {
            kind: HunkLineKind::Add,
            text: rest.to_string(),
        };
    }
    if let Some(rest) = line.strip_prefix('-') {
        return HunkLine {
            kind: HunkLineKind::Remove,
            text: rest.to_string(),
        };
    }
    if let Some(rest) = line.strip_prefix(' ') {
        return HunkLine::context(rest);
    }
    // Models drop the space prefix often enough that rejecting here would
    // halt streams a human reader parses without trouble.
    HunkLine::context(line)
}

fn validate_elisions(diff: &FileDiff) -> Result<(), DiffError> {
    for (i, hunk) in diff.hunks.iter().enumerate() {
        let mut pending_elision = false;
        for line in &hunk.lines {
            match line.kind {
                HunkLineKind::Elision => pending_elision = true,
                HunkLineKind::Context | HunkLineKind::Remove => pending_elision = false,
                HunkLineKind::Add => {}
            }
        }
        if pending_elision {
            return Err(DiffError::ElisionWithoutAnchor { hunk: i + 1 });
        }
    }
    Ok(())
}

// ── Application ──────────────────────────────────────────────────────────────

/// Strict application: the first hunk failure aborts.
pub fn apply(source: &str, diff: &FileDiff, guard: Option<LineGuard>) -> Result<String, DiffError> {
    let mut content = source.to_string();
    for (i, hunk) in diff.hunks.iter().enumerate() {
        content = apply_hunk(&content, hunk, guard)
            .map_err(|source| DiffError::HunkFailed { hunk: i + 1, source })?;
    }
    Ok(content)
}

/// Tolerant application: failed hunks are skipped and recorded as
/// warnings; subsequent hunks attempt against content unmodified by the
/// failures. An empty-hunk diff for a named file is a warning-free no-op.
pub fn apply_with_warnings(source: &str, diff: &FileDiff, guard: Option<LineGuard>) -> ApplyReport {
    let mut content = source.to_string();
    let mut warnings = Vec::new();
    for (i, hunk) in diff.hunks.iter().enumerate() {
        match apply_hunk(&content, hunk, guard) {
            Ok(next) => content = next,
            Err(err) => warnings.push(format!("hunk {}: {}", i + 1, err.diagnostic())),
        }
    }
    ApplyReport { content, warnings }
}

fn apply_hunk(content: &str, hunk: &Hunk, guard: Option<LineGuard>) -> Result<String, MatchError> {
    let search_lines: Vec<&str> = hunk
        .lines
        .iter()
        .filter_map(|line| match line.kind {
            HunkLineKind::Context | HunkLineKind::Remove => Some(line.text.as_str()),
            HunkLineKind::Elision => Some(ELISION_MARKER),
            HunkLineKind::Add => None,
        })
        .collect();

    if search_lines.is_empty() {
        // Add-only hunk: no anchor, so the start position is the head of
        // the file; the remainder is untouched.
        let adds: Vec<&str> = hunk.lines.iter().map(|line| line.text.as_str()).collect();
        let rendered = adds.join("\n");
        return Ok(if content.is_empty() {
            format!("{rendered}\n")
        } else {
            format!("{rendered}\n{content}")
        });
    }

    let search = search_lines.join("\n");
    let found = find_match(content, &search, guard)?;

    let replacement = if hunk
        .lines
        .iter()
        .any(|line| line.kind == HunkLineKind::Elision)
    {
        render_elision_replacement(hunk, &found.original_text)
    } else {
        render_plain_replacement(&hunk.lines)
    };

    let mut next = String::with_capacity(content.len());
    next.push_str(&content[..found.start_byte]);
    next.push_str(&replacement);
    next.push_str(&content[found.end_byte..]);
    Ok(next)
}

fn render_plain_replacement(lines: &[HunkLine]) -> String {
    let kept: Vec<&str> = lines
        .iter()
        .filter_map(|line| match line.kind {
            HunkLineKind::Context | HunkLineKind::Add => Some(line.text.as_str()),
            HunkLineKind::Remove | HunkLineKind::Elision => None,
        })
        .collect();
    kept.join("\n")
}

/// Rebuild an elided hunk: the rendered start region, the original elided
/// middle verbatim, then the rendered lines through the end anchor (plus
/// any trailing adds).
fn render_elision_replacement(hunk: &Hunk, matched: &str) -> String {
    let marker = hunk
        .lines
        .iter()
        .position(|line| line.kind == HunkLineKind::Elision)
        .unwrap_or(hunk.lines.len());

    let pre_search_len = hunk.lines[..marker]
        .iter()
        .filter(|line| matches!(line.kind, HunkLineKind::Context | HunkLineKind::Remove))
        .count();

    let matched_lines: Vec<&str> = matched.lines().collect();
    let middle = if matched_lines.len() > pre_search_len + 1 {
        &matched_lines[pre_search_len..matched_lines.len() - 1]
    } else {
        &[][..]
    };

    let mut out: Vec<String> = hunk.lines[..marker]
        .iter()
        .filter(|line| matches!(line.kind, HunkLineKind::Context | HunkLineKind::Add))
        .map(|line| line.text.clone())
        .collect();
    out.extend(middle.iter().map(|line| line.to_string()));

    let mut anchor_seen = false;
    for line in &hunk.lines[(marker + 1).min(hunk.lines.len())..] {
        match line.kind {
            HunkLineKind::Context if !anchor_seen => {
                anchor_seen = true;
                out.push(line.text.clone());
            }
            HunkLineKind::Remove if !anchor_seen => anchor_seen = true,
            HunkLineKind::Add => out.push(line.text.clone()),
            // Context beyond the anchor lies outside the matched span;
            // emitting it here would duplicate file content.
            _ => break,
        }
    }
    out.join("\n")
}
