use anyhow::{Result, anyhow};
use term_llm_diff::{FileDiff, parse_file_diff, parse_patch_path};

/// A completed edit directive for one file.
#[derive(Debug, Clone, PartialEq)]
pub enum FileEdit {
    SearchReplace {
        path: String,
        edits: Vec<(String, String)>,
    },
    UnifiedDiff {
        path: String,
        diff: FileDiff,
    },
}

impl FileEdit {
    pub fn path(&self) -> &str {
        match self {
            Self::SearchReplace { path, .. } | Self::UnifiedDiff { path, .. } => path,
        }
    }
}

/// Callbacks invoked as directives complete. `on_search_ready` and
/// `on_diff_ready` validate mid-stream; a failure halts the parser and the
/// stored error is returned by every subsequent feed.
pub trait StreamSink {
    fn on_file_start(&mut self, _path: &str) {}
    fn on_search_ready(&mut self, path: &str, search: &str) -> Result<()>;
    fn on_replace_ready(&mut self, _path: &str, _search: &str, _replace: &str) {}
    fn on_diff_ready(&mut self, path: &str, diff_lines: &[String]) -> Result<()>;
    fn on_file_complete(&mut self, _edit: &FileEdit) {}
    fn on_about_complete(&mut self, _text: &str) {}
    fn on_text(&mut self, _text: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    InFile,
    InSearch,
    InReplace,
    InDiff,
    InAbout,
}

/// Line-at-a-time state machine over an append-only chunk sequence. At
/// most one partial trailing line is buffered, so callback order is
/// independent of chunk boundaries.
pub struct StreamParser {
    state: State,
    buffer: String,
    path: String,
    search_lines: Vec<String>,
    replace_lines: Vec<String>,
    current_search: String,
    pending_edits: Vec<(String, String)>,
    diff_lines: Vec<String>,
    about_lines: Vec<String>,
    halted: Option<String>,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            buffer: String::new(),
            path: String::new(),
            search_lines: Vec::new(),
            replace_lines: Vec::new(),
            current_search: String::new(),
            pending_edits: Vec::new(),
            diff_lines: Vec::new(),
            about_lines: Vec::new(),
            halted: None,
        }
    }

    /// The stored halt error, if a validation callback failed.
    pub fn halt_error(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Path of a file region left open mid-stream; surfaced by the
    /// executor when the stream ends early.
    pub fn unclosed_file(&self) -> Option<&str> {
        match self.state {
            State::InFile | State::InSearch | State::InReplace | State::InDiff => {
                Some(self.path.as_str())
            }
            State::Idle | State::InAbout => None,
        }
    }

    pub fn feed(&mut self, chunk: &str, sink: &mut dyn StreamSink) -> Result<()> {
        if let Some(err) = &self.halted {
            return Err(anyhow!("{err}"));
        }
        self.buffer.push_str(chunk);
        while let Some(pos) = self.buffer.find('\n') {
            let mut line: String = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            self.process_line(&line, sink)?;
        }
        Ok(())
    }

    /// Flush the buffered partial line and complete any open About region.
    /// Open file regions are NOT auto-closed; see [`unclosed_file`].
    pub fn finalize(&mut self, sink: &mut dyn StreamSink) -> Result<()> {
        if let Some(err) = &self.halted {
            return Err(anyhow!("{err}"));
        }
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            let line = line.strip_suffix('\r').unwrap_or(&line).to_string();
            self.process_line(&line, sink)?;
        }
        if self.state == State::InAbout {
            self.complete_about(sink);
        }
        Ok(())
    }

    fn process_line(&mut self, line: &str, sink: &mut dyn StreamSink) -> Result<()> {
        let trimmed = line.trim();
        match self.state {
            State::Idle => {
                if let Some(path) = parse_file_sentinel(trimmed) {
                    self.begin_file(path, sink);
                } else if let Some(path) = parse_diff_header(trimmed) {
                    self.begin_diff(path, line, sink);
                } else if trimmed == "[ABOUT]" {
                    self.state = State::InAbout;
                } else {
                    sink.on_text(line);
                }
            }
            State::InFile => {
                if trimmed == "<<<<<<< SEARCH" {
                    self.search_lines.clear();
                    self.state = State::InSearch;
                } else if trimmed == "[/FILE]" {
                    self.complete_search_replace_file(sink);
                } else if let Some(path) = parse_diff_header(trimmed) {
                    self.begin_diff_in_file(path, line);
                } else if trimmed == "[ABOUT]" {
                    self.state = State::InAbout;
                } else {
                    sink.on_text(line);
                }
            }
            State::InSearch => {
                if trimmed == "=======" {
                    let search = strip_blank_edges(&self.search_lines);
                    if let Err(err) = sink.on_search_ready(&self.path, &search) {
                        return self.halt(err);
                    }
                    self.current_search = search;
                    self.replace_lines.clear();
                    self.state = State::InReplace;
                } else {
                    self.search_lines.push(line.to_string());
                }
            }
            State::InReplace => {
                if trimmed == ">>>>>>> REPLACE" {
                    let replace = strip_blank_edges(&self.replace_lines);
                    let search = std::mem::take(&mut self.current_search);
                    sink.on_replace_ready(&self.path, &search, &replace);
                    self.pending_edits.push((search, replace));
                    self.state = State::InFile;
                } else {
                    self.replace_lines.push(line.to_string());
                }
            }
            State::InDiff => {
                if trimmed == "[/FILE]" {
                    self.complete_diff(sink)?;
                    self.reset_file();
                    self.state = State::Idle;
                } else if let Some(path) = parse_diff_header(trimmed) {
                    // A new `--- <path>` header finishes the prior diff.
                    self.complete_diff(sink)?;
                    self.begin_diff(path, line, sink);
                } else if trimmed == "<<<<<<< SEARCH" {
                    self.complete_diff(sink)?;
                    self.search_lines.clear();
                    self.state = State::InSearch;
                } else if trimmed == "[ABOUT]" {
                    self.complete_diff(sink)?;
                    self.reset_file();
                    self.state = State::InAbout;
                } else {
                    // A `--- /dev/null` old side leaves the target to the
                    // `+++` header.
                    if self.path.is_empty()
                        && let Some(rest) = trimmed.strip_prefix("+++ ")
                        && let Some(path) = parse_patch_path(rest)
                    {
                        self.path = path;
                        sink.on_file_start(&self.path);
                    }
                    self.diff_lines.push(line.to_string());
                }
            }
            State::InAbout => {
                if trimmed == "[/ABOUT]" {
                    self.complete_about(sink);
                } else {
                    self.about_lines.push(line.to_string());
                }
            }
        }
        Ok(())
    }

    fn begin_file(&mut self, path: String, sink: &mut dyn StreamSink) {
        self.path = path;
        self.pending_edits.clear();
        self.state = State::InFile;
        sink.on_file_start(&self.path);
    }

    fn begin_diff(&mut self, path: String, header_line: &str, sink: &mut dyn StreamSink) {
        self.path = path;
        self.diff_lines = vec![header_line.to_string()];
        self.state = State::InDiff;
        if !self.path.is_empty() {
            sink.on_file_start(&self.path);
        }
    }

    fn begin_diff_in_file(&mut self, path: String, header_line: &str) {
        // Inside a [FILE] block the diff inherits the block's target
        // unless the header names one.
        if !path.is_empty() {
            self.path = path;
        }
        self.diff_lines = vec![header_line.to_string()];
        self.state = State::InDiff;
    }

    fn complete_search_replace_file(&mut self, sink: &mut dyn StreamSink) {
        let edit = FileEdit::SearchReplace {
            path: std::mem::take(&mut self.path),
            edits: std::mem::take(&mut self.pending_edits),
        };
        sink.on_file_complete(&edit);
        self.state = State::Idle;
    }

    fn complete_diff(&mut self, sink: &mut dyn StreamSink) -> Result<()> {
        let lines = std::mem::take(&mut self.diff_lines);
        if lines.iter().all(|line| line.trim().is_empty()) {
            return Ok(());
        }
        if let Err(err) = sink.on_diff_ready(&self.path, &lines) {
            return self.halt(err);
        }
        let diff = match parse_file_diff(&self.path, &lines) {
            Ok(diff) => diff,
            Err(err) => return self.halt(anyhow!(err)),
        };
        let edit = FileEdit::UnifiedDiff {
            path: self.path.clone(),
            diff,
        };
        sink.on_file_complete(&edit);
        Ok(())
    }

    fn complete_about(&mut self, sink: &mut dyn StreamSink) {
        let text = self.about_lines.join("\n");
        sink.on_about_complete(&text);
        self.about_lines.clear();
        self.state = State::Idle;
    }

    fn reset_file(&mut self) {
        self.path.clear();
        self.pending_edits.clear();
        self.search_lines.clear();
        self.replace_lines.clear();
        self.diff_lines.clear();
    }

    fn halt(&mut self, err: anyhow::Error) -> Result<()> {
        let msg = err.to_string();
        self.halted = Some(msg.clone());
        Err(anyhow!("{msg}"))
    }
}

fn parse_file_sentinel(trimmed: &str) -> Option<String> {
    let inner = trimmed.strip_prefix("[FILE:")?.strip_suffix(']')?;
    let path = inner.trim();
    if path.is_empty() {
        return None;
    }
    Some(path.to_string())
}

/// `--- <path>` starts a diff body; `----` (horizontal rules and the like)
/// does not.
fn parse_diff_header(trimmed: &str) -> Option<String> {
    let rest = trimmed.strip_prefix("--- ")?;
    if rest.starts_with('-') || rest.trim().is_empty() {
        return None;
    }
    Some(parse_patch_path(rest).unwrap_or_default())
}

/// Strip leading and trailing blank lines; interior blanks are preserved
/// byte-for-byte.
fn strip_blank_edges(lines: &[String]) -> String {
    let start = lines
        .iter()
        .position(|line| !line.trim().is_empty())
        .unwrap_or(lines.len());
    let end = lines
        .iter()
        .rposition(|line| !line.trim().is_empty())
        .map(|i| i + 1)
        .unwrap_or(start);
    lines[start..end].join("\n")
}
