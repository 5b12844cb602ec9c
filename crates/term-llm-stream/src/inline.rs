use regex::Regex;
use std::sync::OnceLock;

/// An inline edit directive embedded in ordinary model prose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InlineEdit {
    Insert { after: String, text: String },
    Delete { from: usize, to: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InlineApplyError {
    #[error("insert anchor not found: {0}")]
    AnchorNotFound(String),
    #[error("delete range {from}..{to} is outside the file ({len} lines)")]
    RangeOutOfBounds { from: usize, to: usize, len: usize },
}

impl InlineEdit {
    /// Apply to `content`: an insert lands on a new line after the first
    /// line matching the anchor (exact, then trimmed); a delete removes
    /// the 1-indexed inclusive line range.
    pub fn apply(&self, content: &str) -> Result<String, InlineApplyError> {
        match self {
            Self::Insert { after, text } => {
                let lines: Vec<&str> = content.lines().collect();
                let idx = lines
                    .iter()
                    .position(|line| *line == after)
                    .or_else(|| lines.iter().position(|line| line.trim() == after.trim()))
                    .ok_or_else(|| InlineApplyError::AnchorNotFound(after.clone()))?;
                let mut out: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
                let inserted: Vec<String> = text.lines().map(str::to_string).collect();
                out.splice(idx + 1..idx + 1, inserted);
                Ok(rejoin(&out, content))
            }
            Self::Delete { from, to } => {
                let (from, to) = (*from, *to);
                let lines: Vec<&str> = content.lines().collect();
                let len = lines.len();
                if from == 0 || from > to || to > len {
                    return Err(InlineApplyError::RangeOutOfBounds { from, to, len });
                }
                let kept: Vec<String> = lines
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i < from - 1 || *i > to - 1)
                    .map(|(_, line)| line.to_string())
                    .collect();
                Ok(rejoin(&kept, content))
            }
        }
    }
}

fn rejoin(lines: &[String], original: &str) -> String {
    let mut out = lines.join("\n");
    if original.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Streaming callbacks. `on_partial_insert_line` fires once per newline
/// inside an open INSERT block so the UI can render progress; the edit
/// itself is only emitted when the closing tag arrives.
pub trait InlineSink {
    fn on_text(&mut self, _text: &str) {}
    fn on_partial_insert_line(&mut self, _line: &str) {}
    fn on_edit(&mut self, _edit: InlineEdit) {}
}

fn insert_open_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<insert\s+after\s*=\s*"([^"]*)"\s*>"#).expect("insert regex")
    })
}

fn delete_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<delete\s+from\s*=\s*"(\d+)"\s+to\s*=\s*"(\d+)"\s*/\s*>"#)
            .expect("delete regex")
    })
}

fn insert_close_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)</insert\s*>").expect("close regex"))
}

/// How many trailing bytes may be held back when a `<` near the buffer end
/// could be the start of a tag split across chunks.
const TAG_HOLDBACK: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Text,
    InInsert,
}

/// Streaming parser for inline INSERT/DELETE markers. Tags are
/// case-insensitive; an unclosed INSERT at end of stream is flushed back
/// as the plain text it arrived as.
pub struct InlineParser {
    buffer: String,
    mode: Mode,
    insert_after: String,
    insert_content: String,
    /// Raw consumed text since the open tag, for plain-text recovery.
    insert_raw: String,
}

impl Default for InlineParser {
    fn default() -> Self {
        Self::new()
    }
}

impl InlineParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            mode: Mode::Text,
            insert_after: String::new(),
            insert_content: String::new(),
            insert_raw: String::new(),
        }
    }

    pub fn feed(&mut self, chunk: &str, sink: &mut dyn InlineSink) {
        self.buffer.push_str(chunk);
        self.process(sink);
    }

    pub fn finalize(&mut self, sink: &mut dyn InlineSink) {
        self.process(sink);
        if self.mode == Mode::InInsert {
            // Stream ended mid-INSERT: recover the whole block as text.
            let mut raw = std::mem::take(&mut self.insert_raw);
            raw.push_str(&self.buffer);
            self.buffer.clear();
            if !raw.is_empty() {
                sink.on_text(&raw);
            }
            self.mode = Mode::Text;
            self.insert_content.clear();
        } else if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            sink.on_text(&rest);
        }
    }

    fn process(&mut self, sink: &mut dyn InlineSink) {
        loop {
            match self.mode {
                Mode::Text => {
                    if !self.process_text(sink) {
                        return;
                    }
                }
                Mode::InInsert => {
                    if !self.process_insert(sink) {
                        return;
                    }
                }
            }
        }
    }

    /// Returns true when a state change consumed input and processing
    /// should continue.
    fn process_text(&mut self, sink: &mut dyn InlineSink) -> bool {
        let insert_m = insert_open_re().find(&self.buffer);
        let delete_m = delete_re().find(&self.buffer);

        let first = match (&insert_m, &delete_m) {
            (Some(a), Some(b)) => Some(a.start().min(b.start())),
            (Some(a), None) => Some(a.start()),
            (None, Some(b)) => Some(b.start()),
            (None, None) => None,
        };

        let Some(tag_start) = first else {
            self.flush_text_with_holdback(sink);
            return false;
        };

        if tag_start > 0 {
            let before: String = self.buffer.drain(..tag_start).collect();
            sink.on_text(&before);
        }

        if let Some(m) = delete_re().find(&self.buffer)
            && m.start() == 0
        {
            let caps = delete_re().captures(&self.buffer).expect("delete captures");
            let from = caps[1].parse::<usize>().unwrap_or(0);
            let to = caps[2].parse::<usize>().unwrap_or(from);
            let end = caps.get(0).expect("whole match").end();
            self.buffer.drain(..end);
            sink.on_edit(InlineEdit::Delete { from, to });
            return true;
        }

        let caps = insert_open_re()
            .captures(&self.buffer)
            .expect("insert captures");
        let whole = caps.get(0).expect("whole match");
        if whole.start() != 0 {
            // The other tag matched first; loop re-dispatches.
            return true;
        }
        self.insert_after = caps[1].to_string();
        let end = whole.end();
        let raw: String = self.buffer.drain(..end).collect();
        self.insert_raw = raw;
        self.insert_content.clear();
        self.mode = Mode::InInsert;
        true
    }

    fn process_insert(&mut self, sink: &mut dyn InlineSink) -> bool {
        if let Some(m) = insert_close_re().find(&self.buffer) {
            let (start, end) = (m.start(), m.end());
            let content_part: String = self.buffer.drain(..start).collect();
            let tag: String = self.buffer.drain(..end - start).collect();
            self.drain_insert_lines(&content_part, sink);
            self.insert_content.push_str(&content_part);
            self.insert_raw.push_str(&content_part);
            self.insert_raw.push_str(&tag);

            let text = trim_block_newlines(&self.insert_content);
            sink.on_edit(InlineEdit::Insert {
                after: std::mem::take(&mut self.insert_after),
                text,
            });
            self.insert_content.clear();
            self.insert_raw.clear();
            self.mode = Mode::Text;
            return true;
        }

        // No close tag yet: move complete lines into the content so
        // partial-line notifications fire as each newline arrives, but
        // keep enough tail to recognize a split `</INSERT>`.
        if let Some(last_newline) = self.buffer.rfind('\n') {
            let complete: String = self.buffer.drain(..=last_newline).collect();
            self.drain_insert_lines(&complete, sink);
            self.insert_content.push_str(&complete);
            self.insert_raw.push_str(&complete);
        }
        false
    }

    fn drain_insert_lines(&self, part: &str, sink: &mut dyn InlineSink) {
        for line in part.split_inclusive('\n') {
            if let Some(stripped) = line.strip_suffix('\n') {
                let stripped = stripped.strip_suffix('\r').unwrap_or(stripped);
                // The line right after the open tag is empty when the tag
                // sits on its own line; skip the notification noise.
                if !(stripped.is_empty() && self.insert_content.is_empty()) {
                    sink.on_partial_insert_line(stripped);
                }
            }
        }
    }

    /// Emit buffered text, holding back a possible split tag: a `<` within
    /// the last [`TAG_HOLDBACK`] bytes with no `>` after it stays pending.
    fn flush_text_with_holdback(&mut self, sink: &mut dyn InlineSink) {
        if self.buffer.is_empty() {
            return;
        }
        let tail_start = self.buffer.len().saturating_sub(TAG_HOLDBACK);
        let hold_at = self.buffer[tail_start..]
            .rfind('<')
            .map(|i| tail_start + i)
            .filter(|&i| !self.buffer[i..].contains('>'));

        match hold_at {
            Some(0) => {}
            Some(i) => {
                let text: String = self.buffer.drain(..i).collect();
                sink.on_text(&text);
            }
            None => {
                let text = std::mem::take(&mut self.buffer);
                sink.on_text(&text);
            }
        }
    }
}

/// Strip one newline after the open tag and one before the close tag so
/// tags on their own lines do not pad the inserted text.
fn trim_block_newlines(content: &str) -> String {
    let content = content.strip_prefix("\r\n").unwrap_or(content);
    let content = content.strip_prefix('\n').unwrap_or(content);
    let content = content.strip_suffix('\n').unwrap_or(content);
    let content = content.strip_suffix('\r').unwrap_or(content);
    content.to_string()
}
