use anyhow::{Result, anyhow, bail};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::thread;
use term_llm_core::{
    CancelToken, ChatMessage, Provider, StreamEvent, StreamRequest, ToolCall, ToolDefinition,
    ToolErrorKind, tool_error,
};
use term_llm_diff::{LineGuard, MatchLevel, apply, apply_with_warnings, find_match, line_similarity};
use term_llm_stream::{FileEdit, StreamParser, StreamSink};
use term_llm_tools::{ToolContext, ToolRegistry, numbered_excerpt, write_atomic};

/// Path → current content. Ordered so basename/suffix resolution has a
/// deterministic first hit.
pub type WorkingSet = BTreeMap<PathBuf, String>;

const RETRY_WINDOW_LINES: usize = 12;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Stream passes per run, counting the first.
    pub max_attempts: usize,
    /// Expose the `read_context` side-channel tool.
    pub lazy_context: bool,
    /// Tool-call rounds before completion is forced.
    pub max_tool_rounds: usize,
    /// Hard cap on provider streams per run.
    pub max_turns: usize,
    /// Per-file permitted line ranges.
    pub guards: HashMap<PathBuf, LineGuard>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            lazy_context: false,
            max_tool_rounds: 5,
            max_turns: 12,
            guards: HashMap::new(),
        }
    }
}

/// What failed mid-stream, kept verbatim for the retry prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailedDirective {
    Search(String),
    Diff(Vec<String>),
    /// The stream ended inside an open file region.
    Truncated,
}

#[derive(Debug, Clone)]
pub struct RetryContext {
    pub file_path: String,
    pub failed: FailedDirective,
    pub current_file_content: String,
    pub reason: String,
    pub partial_output: String,
    pub attempt_number: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug)]
pub struct EditOutcome {
    pub files: WorkingSet,
    pub edits: Vec<FileEdit>,
    pub warnings: Vec<String>,
    pub about: Option<String>,
    /// Plain assistant text outside any directive.
    pub text: String,
    /// Match level per applied search block, an approximation-risk signal.
    pub match_levels: Vec<(String, MatchLevel)>,
    pub attempts: usize,
    pub usage: Usage,
}

/// Observer hooks for streaming progress. Tool hooks may be invoked from
/// whatever worker runs the call, so implementations must be thread-safe
/// and non-blocking.
pub trait ExecEvents: Sync {
    fn on_text(&self, _text: &str) {}
    fn on_tool_start(&self, _call: &ToolCall) {}
    fn on_tool_end(&self, _call: &ToolCall, _result: &str) {}
}

/// Default no-op sink.
pub struct NoEvents;

impl ExecEvents for NoEvents {}

/// Runs a bounded-retry outer loop around stream passes: each pass gets a
/// fresh working copy, a fresh parser, and the conversation so far; a
/// halted pass appends the partial assistant output plus a retry prompt
/// and goes again.
///
/// With a registry attached, tool calls arriving on the stream's side
/// channel are gated and dispatched through it; the calls of one round
/// run on parallel workers while the stream itself stays sequential.
pub struct EditExecutor {
    provider: Arc<dyn Provider>,
    cfg: ExecutorConfig,
    registry: Option<Arc<ToolRegistry>>,
    tool_ctx: Option<Arc<ToolContext>>,
}

impl EditExecutor {
    pub fn new(provider: Arc<dyn Provider>, cfg: ExecutorConfig) -> Self {
        Self {
            provider,
            cfg,
            registry: None,
            tool_ctx: None,
        }
    }

    pub fn with_registry(
        provider: Arc<dyn Provider>,
        cfg: ExecutorConfig,
        registry: Arc<ToolRegistry>,
        tool_ctx: Arc<ToolContext>,
    ) -> Self {
        Self {
            provider,
            cfg,
            registry: Some(registry),
            tool_ctx: Some(tool_ctx),
        }
    }

    pub fn run(
        &self,
        messages: Vec<ChatMessage>,
        files: WorkingSet,
        cancel: &CancelToken,
    ) -> Result<EditOutcome> {
        self.run_with_events(messages, files, cancel, &NoEvents)
    }

    pub fn run_with_events(
        &self,
        messages: Vec<ChatMessage>,
        files: WorkingSet,
        cancel: &CancelToken,
        events: &dyn ExecEvents,
    ) -> Result<EditOutcome> {
        let mut messages = messages;
        let mut usage = Usage::default();
        let mut turns = 0usize;
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            if let Err(reason) = cancel.check() {
                bail!("stream pass aborted: {reason}");
            }
            let mut working = files.clone();
            let pass = self.stream_pass(
                &messages,
                &mut working,
                cancel,
                attempt,
                &mut usage,
                &mut turns,
                events,
            )?;
            match pass {
                PassOutput::Complete(data) => {
                    return Ok(EditOutcome {
                        files: working,
                        edits: data.edits,
                        warnings: data.warnings,
                        about: data.about,
                        text: data.text,
                        match_levels: data.match_levels,
                        attempts: attempt,
                        usage,
                    });
                }
                PassOutput::Halted(retry) => {
                    if attempt >= self.cfg.max_attempts {
                        bail!(
                            "edit failed after {} attempts: {}",
                            self.cfg.max_attempts,
                            retry.reason
                        );
                    }
                    messages.push(ChatMessage::assistant(retry.partial_output.clone()));
                    messages.push(ChatMessage::user(build_retry_prompt(&retry)));
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn stream_pass(
        &self,
        base_messages: &[ChatMessage],
        working: &mut WorkingSet,
        cancel: &CancelToken,
        attempt: usize,
        usage: &mut Usage,
        turns: &mut usize,
        events: &dyn ExecEvents,
    ) -> Result<PassOutput> {
        let mut parser = StreamParser::new();
        let mut sink = PassSink {
            working,
            guards: &self.cfg.guards,
            edits: Vec::new(),
            warnings: Vec::new(),
            about: None,
            text: String::new(),
            match_levels: Vec::new(),
            failure: None,
        };
        let mut messages: Vec<ChatMessage> = base_messages.to_vec();
        let mut assistant_text = String::new();
        let mut round = 0usize;

        loop {
            *turns += 1;
            if *turns > self.cfg.max_turns {
                bail!("exceeded maximum turns ({})", self.cfg.max_turns);
            }
            let offer_tools = round < self.cfg.max_tool_rounds
                && (self.cfg.lazy_context || self.registry.is_some());
            let request = StreamRequest {
                messages: messages.clone(),
                tools: if offer_tools {
                    self.offered_tools()
                } else {
                    Vec::new()
                },
                model: None,
            };

            let mut stream = self.provider.stream(&request)?;
            let mut round_text = String::new();
            let mut round_calls: Vec<term_llm_core::ToolCall> = Vec::new();
            let mut halted = false;

            while let Some(event) = stream.next_event() {
                if let Err(reason) = cancel.check() {
                    stream.close();
                    bail!("stream pass aborted: {reason}");
                }
                match event {
                    StreamEvent::TextDelta(text) => {
                        assistant_text.push_str(&text);
                        round_text.push_str(&text);
                        events.on_text(&text);
                        if parser.feed(&text, &mut sink).is_err() {
                            stream.close();
                            halted = true;
                            break;
                        }
                    }
                    StreamEvent::ToolCall { id, name, args } => {
                        let args: Value =
                            serde_json::from_str(&args).unwrap_or(Value::Null);
                        round_calls.push(term_llm_core::ToolCall { id, name, args });
                    }
                    StreamEvent::Usage {
                        input_tokens,
                        output_tokens,
                    } => {
                        usage.input_tokens += input_tokens;
                        usage.output_tokens += output_tokens;
                    }
                    StreamEvent::Error(err) => {
                        bail!("provider error: {err}");
                    }
                    StreamEvent::Done => break,
                }
            }

            if halted {
                return Ok(PassOutput::Halted(retry_context(
                    &mut sink,
                    &parser,
                    assistant_text,
                    attempt,
                )));
            }

            if !round_calls.is_empty() && offer_tools {
                round += 1;
                messages.push(ChatMessage::Assistant {
                    content: round_text,
                    tool_calls: round_calls.clone(),
                });
                for (call_id, content) in self.dispatch_round(&round_calls, sink.working, events) {
                    messages.push(ChatMessage::tool(call_id, content));
                }
                continue;
            }

            if parser.finalize(&mut sink).is_err() {
                return Ok(PassOutput::Halted(retry_context(
                    &mut sink,
                    &parser,
                    assistant_text,
                    attempt,
                )));
            }
            if let Some(open) = parser.unclosed_file() {
                let open = open.to_string();
                let content = resolve_path(sink.working, &open)
                    .and_then(|path| sink.working.get(&path).cloned())
                    .unwrap_or_default();
                return Ok(PassOutput::Halted(RetryContext {
                    file_path: open.clone(),
                    failed: FailedDirective::Truncated,
                    current_file_content: content,
                    reason: format!("the stream ended inside an open file block for {open}"),
                    partial_output: assistant_text,
                    attempt_number: attempt,
                }));
            }

            return Ok(PassOutput::Complete(PassData {
                edits: sink.edits,
                warnings: sink.warnings,
                about: sink.about,
                text: sink.text,
                match_levels: sink.match_levels,
            }));
        }
    }

    fn offered_tools(&self) -> Vec<ToolDefinition> {
        let mut tools = Vec::new();
        if self.cfg.lazy_context {
            tools.push(read_context_definition());
        }
        if let Some(registry) = &self.registry {
            tools.extend(registry.definitions());
        }
        tools
    }

    /// Run one round's tool calls. `read_context` is answered against the
    /// working copy; everything else goes through the registry, each call
    /// on its own worker, with results returned in call order.
    fn dispatch_round(
        &self,
        calls: &[ToolCall],
        working: &WorkingSet,
        events: &dyn ExecEvents,
    ) -> Vec<(String, String)> {
        thread::scope(|scope| {
            let handles: Vec<_> = calls
                .iter()
                .map(|call| {
                    scope.spawn(move || {
                        events.on_tool_start(call);
                        let content = if call.name == "read_context" {
                            if self.cfg.lazy_context {
                                answer_read_context(&call.args, working)
                            } else {
                                tool_error(ToolErrorKind::InvalidParams, "unknown tool: read_context")
                            }
                        } else {
                            match (&self.registry, &self.tool_ctx) {
                                (Some(registry), Some(ctx)) => registry.dispatch(call, ctx),
                                _ => tool_error(
                                    ToolErrorKind::InvalidParams,
                                    format!("unknown tool: {}", call.name),
                                ),
                            }
                        };
                        events.on_tool_end(call, &content);
                        (call.id.clone(), content)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("tool worker panicked"))
                .collect()
        })
    }
}

struct PassData {
    edits: Vec<FileEdit>,
    warnings: Vec<String>,
    about: Option<String>,
    text: String,
    match_levels: Vec<(String, MatchLevel)>,
}

enum PassOutput {
    Complete(PassData),
    Halted(RetryContext),
}

fn retry_context(
    sink: &mut PassSink,
    parser: &StreamParser,
    partial_output: String,
    attempt: usize,
) -> RetryContext {
    match sink.failure.take() {
        Some(failure) => RetryContext {
            file_path: failure.path,
            failed: failure.directive,
            current_file_content: failure.content,
            reason: failure.reason,
            partial_output,
            attempt_number: attempt,
        },
        None => RetryContext {
            file_path: String::new(),
            failed: FailedDirective::Truncated,
            current_file_content: String::new(),
            reason: parser
                .halt_error()
                .unwrap_or("stream halted without a stored error")
                .to_string(),
            partial_output,
            attempt_number: attempt,
        },
    }
}

// ── Per-pass sink ────────────────────────────────────────────────────────────

struct PassFailure {
    path: String,
    directive: FailedDirective,
    content: String,
    reason: String,
}

struct PassSink<'a> {
    working: &'a mut WorkingSet,
    guards: &'a HashMap<PathBuf, LineGuard>,
    edits: Vec<FileEdit>,
    warnings: Vec<String>,
    about: Option<String>,
    text: String,
    match_levels: Vec<(String, MatchLevel)>,
    failure: Option<PassFailure>,
}

impl PassSink<'_> {
    fn guard_for(&self, path: &Path) -> Option<LineGuard> {
        self.guards.get(path).copied()
    }

    fn fail(
        &mut self,
        path: &str,
        directive: FailedDirective,
        content: String,
        reason: String,
    ) -> anyhow::Error {
        self.failure = Some(PassFailure {
            path: path.to_string(),
            directive,
            content,
            reason: reason.clone(),
        });
        anyhow!("{reason}")
    }
}

impl StreamSink for PassSink<'_> {
    fn on_search_ready(&mut self, path: &str, search: &str) -> Result<()> {
        let Some(resolved) = resolve_path(self.working, path) else {
            let reason = format!("file not found in working set: {path}");
            return Err(self.fail(
                path,
                FailedDirective::Search(search.to_string()),
                String::new(),
                reason,
            ));
        };
        let content = self.working[&resolved].clone();
        let guard = self.guard_for(&resolved);
        if let Err(err) = find_match(&content, search, guard) {
            let reason = err.diagnostic();
            return Err(self.fail(
                path,
                FailedDirective::Search(search.to_string()),
                content,
                reason,
            ));
        }
        Ok(())
    }

    fn on_replace_ready(&mut self, path: &str, search: &str, replace: &str) {
        let Some(resolved) = resolve_path(self.working, path) else {
            self.warnings
                .push(format!("replace for unknown file dropped: {path}"));
            return;
        };
        let guard = self.guard_for(&resolved);
        let content = self.working[&resolved].clone();
        match find_match(&content, search, guard) {
            Ok(found) => {
                let mut next = String::with_capacity(content.len());
                next.push_str(&content[..found.start_byte]);
                next.push_str(replace);
                next.push_str(&content[found.end_byte..]);
                self.working.insert(resolved, next);
                self.match_levels
                    .push((path.to_string(), found.match_level));
            }
            Err(err) => {
                // Validated moments ago against the same content; a miss
                // here still must not lose the rest of the stream.
                self.warnings
                    .push(format!("{path}: replace skipped: {err}"));
            }
        }
    }

    fn on_diff_ready(&mut self, path: &str, diff_lines: &[String]) -> Result<()> {
        let resolved = match resolve_path(self.working, path) {
            Some(resolved) => resolved,
            None => {
                // Diffs may create files (old side /dev/null).
                let fresh = PathBuf::from(path);
                self.working.insert(fresh.clone(), String::new());
                fresh
            }
        };
        let content = self.working[&resolved].clone();
        let guard = self.guard_for(&resolved);
        let diff = match term_llm_diff::parse_file_diff(path, diff_lines) {
            Ok(diff) => diff,
            Err(err) => {
                let reason = err.to_string();
                return Err(self.fail(
                    path,
                    FailedDirective::Diff(diff_lines.to_vec()),
                    content,
                    reason,
                ));
            }
        };
        if let Err(err) = apply(&content, &diff, guard) {
            let reason = err.to_string();
            return Err(self.fail(
                path,
                FailedDirective::Diff(diff_lines.to_vec()),
                content,
                reason,
            ));
        }
        Ok(())
    }

    fn on_file_complete(&mut self, edit: &FileEdit) {
        if let FileEdit::UnifiedDiff { path, diff } = edit
            && let Some(resolved) = resolve_path(self.working, path)
        {
            let guard = self.guard_for(&resolved);
            let content = self.working[&resolved].clone();
            let report = apply_with_warnings(&content, diff, guard);
            self.warnings
                .extend(report.warnings.iter().map(|w| format!("{path}: {w}")));
            self.working.insert(resolved, report.content);
        }
        self.edits.push(edit.clone());
    }

    fn on_about_complete(&mut self, text: &str) {
        self.about = Some(text.to_string());
    }

    fn on_text(&mut self, text: &str) {
        self.text.push_str(text);
        self.text.push('\n');
    }
}

// ── Path resolution ──────────────────────────────────────────────────────────

/// Resolve a model-emitted path against the working set: direct lookup,
/// then basename-only, then suffix match. First hit wins at each level.
pub fn resolve_path(working: &WorkingSet, raw: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(raw);
    if working.contains_key(&candidate) {
        return Some(candidate);
    }
    let file_name = candidate.file_name()?;
    if candidate.components().count() == 1 {
        if let Some(hit) = working
            .keys()
            .find(|key| key.file_name() == Some(file_name))
        {
            return Some(hit.clone());
        }
    }
    let relative: PathBuf = candidate
        .components()
        .filter(|component| !matches!(component, Component::RootDir))
        .collect();
    working.keys().find(|key| key.ends_with(&relative)).cloned()
}

/// Write every file whose content differs from the base set, through the
/// atomic writer.
pub fn commit_changes(files: &WorkingSet, base: &WorkingSet) -> Result<Vec<PathBuf>> {
    let mut changed = Vec::new();
    for (path, content) in files {
        if base.get(path).map(|existing| existing != content).unwrap_or(true) {
            write_atomic(path, content)?;
            changed.push(path.clone());
        }
    }
    Ok(changed)
}

// ── Lazy-context tool ────────────────────────────────────────────────────────

fn read_context_definition() -> ToolDefinition {
    ToolDefinition {
        name: "read_context".to_string(),
        description: "Read a line-numbered excerpt of a working-set file (1-indexed, inclusive)."
            .to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "start_line": {"type": "integer"},
                "end_line": {"type": "integer"}
            },
            "required": ["path"]
        }),
    }
}

fn answer_read_context(args: &Value, working: &WorkingSet) -> String {
    let Some(path) = args.get("path").and_then(Value::as_str) else {
        return tool_error(ToolErrorKind::InvalidParams, "path missing");
    };
    let Some(resolved) = resolve_path(working, path) else {
        return tool_error(
            ToolErrorKind::FileNotFound,
            format!("not in the working set: {path}"),
        );
    };
    let content = &working[&resolved];
    let start = args
        .get("start_line")
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .unwrap_or(1);
    let end = args.get("end_line").and_then(Value::as_u64).map(|v| v as usize);
    numbered_excerpt(content, start, end)
}

// ── Retry prompt ─────────────────────────────────────────────────────────────

/// Build the retry user-prompt: path, reason, the failed directive
/// verbatim, and a line-numbered excerpt centered on the best approximate
/// line (first-line similarity ≥ 0.5, else the file head).
pub fn build_retry_prompt(retry: &RetryContext) -> String {
    let mut out = format!(
        "The previous edit to {} could not be applied.\nReason: {}\n",
        retry.file_path, retry.reason
    );
    match &retry.failed {
        FailedDirective::Search(search) => {
            out.push_str(&format!(
                "\nThe SEARCH block that failed to match:\n{search}\n"
            ));
        }
        FailedDirective::Diff(lines) => {
            out.push_str(&format!(
                "\nThe diff that failed to apply:\n{}\n",
                lines.join("\n")
            ));
        }
        FailedDirective::Truncated => {}
    }
    if !retry.current_file_content.is_empty() {
        let excerpt = retry_excerpt(&retry.current_file_content, anchor_query(&retry.failed));
        out.push_str(&format!(
            "\nCurrent file content near the closest match:\n{excerpt}\n"
        ));
    }
    out.push_str("\nRe-emit a corrected edit block for this file.");
    out
}

fn anchor_query(failed: &FailedDirective) -> Option<String> {
    match failed {
        FailedDirective::Search(search) => search
            .lines()
            .find(|line| !line.trim().is_empty())
            .map(str::to_string),
        FailedDirective::Diff(lines) => lines
            .iter()
            .map(|line| {
                line.strip_prefix('-')
                    .or_else(|| line.strip_prefix(' '))
                    .unwrap_or(line)
            })
            .find(|line| {
                !line.trim().is_empty()
                    && !line.starts_with("--")
                    && !line.starts_with("++")
                    && !line.starts_with("@@")
            })
            .map(str::to_string),
        FailedDirective::Truncated => None,
    }
}

fn retry_excerpt(content: &str, query: Option<String>) -> String {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let center = query
        .and_then(|q| {
            let needle = q.trim();
            let mut best: Option<(usize, f64)> = None;
            for (i, line) in lines.iter().enumerate() {
                let sim = line_similarity(line.trim(), needle);
                if best.map(|(_, s)| sim > s).unwrap_or(true) {
                    best = Some((i, sim));
                }
            }
            best.filter(|(_, sim)| *sim >= 0.5).map(|(i, _)| i)
        })
        .unwrap_or(0);
    let start = center.saturating_sub(RETRY_WINDOW_LINES) + 1;
    let end = (center + RETRY_WINDOW_LINES + 1).min(lines.len());
    numbered_excerpt(content, start, Some(end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use term_llm_core::StreamEvent;
    use term_llm_testkit::{ScriptedProvider, chunked_text};

    fn files(entries: &[(&str, &str)]) -> WorkingSet {
        entries
            .iter()
            .map(|(path, content)| (PathBuf::from(path), content.to_string()))
            .collect()
    }

    fn run_with(
        provider: ScriptedProvider,
        cfg: ExecutorConfig,
        working: WorkingSet,
    ) -> (Result<EditOutcome>, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        let executor = EditExecutor::new(provider.clone(), cfg);
        let outcome = executor.run(
            vec![ChatMessage::user("apply the edit")],
            working,
            &CancelToken::new(),
        );
        (outcome, provider)
    }

    // ── Streamed search/replace end to end ──

    #[test]
    fn streamed_search_replace_applies() {
        let stream = "[FILE: a.txt]\n<<<<<<< SEARCH\nhello\n=======\nworld\n>>>>>>> REPLACE\n[/FILE]\n";
        let (outcome, _) = run_with(
            ScriptedProvider::text_once(stream, 7),
            ExecutorConfig::default(),
            files(&[("a.txt", "hello\n")]),
        );
        let outcome = outcome.expect("run");
        assert_eq!(outcome.files[&PathBuf::from("a.txt")], "world\n");
        assert_eq!(outcome.edits.len(), 1);
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.match_levels, vec![("a.txt".to_string(), MatchLevel::Exact)]);
    }

    #[test]
    fn elided_search_replace_guts_a_function() {
        let stream = "[FILE: f.go]\n<<<<<<< SEARCH\nfunc f() {\n<<<elided>>>\n}\n=======\nfunc f() { /* gutted */ }\n>>>>>>> REPLACE\n[/FILE]\n";
        let (outcome, _) = run_with(
            ScriptedProvider::text_once(stream, 11),
            ExecutorConfig::default(),
            files(&[("f.go", "func f() {\n  a()\n  b()\n  c()\n}\n")]),
        );
        let outcome = outcome.expect("run");
        assert_eq!(outcome.files[&PathBuf::from("f.go")], "func f() { /* gutted */ }\n");
        assert_eq!(
            outcome.match_levels,
            vec![("f.go".to_string(), MatchLevel::Elision)]
        );
    }

    #[test]
    fn streamed_unified_diff_applies() {
        let stream = "--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-hello\n+world\n[/FILE]\n";
        let (outcome, _) = run_with(
            ScriptedProvider::text_once(stream, 5),
            ExecutorConfig::default(),
            files(&[("a.txt", "hello\nrest\n")]),
        );
        let outcome = outcome.expect("run");
        assert_eq!(outcome.files[&PathBuf::from("a.txt")], "world\nrest\n");
    }

    // ── Retry loop (mismatched search then corrected) ──

    #[test]
    fn mismatched_search_triggers_retry_with_context() {
        let bad = "[FILE: a.txt]\n<<<<<<< SEARCH\nnot present anywhere\n=======\nx\n>>>>>>> REPLACE\n[/FILE]\n";
        let good = "[FILE: a.txt]\n<<<<<<< SEARCH\nhello line\n=======\nfixed line\n>>>>>>> REPLACE\n[/FILE]\n";
        let provider = ScriptedProvider::new(vec![chunked_text(bad, 9), chunked_text(good, 9)]);
        let (outcome, provider) = run_with(
            provider,
            ExecutorConfig::default(),
            files(&[("a.txt", "hello line\nsecond line\n")]),
        );
        let outcome = outcome.expect("run");
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.files[&PathBuf::from("a.txt")], "fixed line\nsecond line\n");

        // The second request carries the partial assistant output plus a
        // retry prompt with reason, failed search, and numbered excerpt.
        let requests = provider.requests.lock().expect("requests");
        assert_eq!(requests.len(), 2);
        let retry_messages = &requests[1].messages;
        let ChatMessage::User { content: prompt } = retry_messages.last().expect("retry prompt")
        else {
            panic!("expected trailing user retry prompt");
        };
        assert!(prompt.contains("a.txt"));
        assert!(prompt.contains("no match found"));
        assert!(prompt.contains("not present anywhere"));
        assert!(prompt.contains("1 | hello line"));
        assert!(matches!(
            retry_messages[retry_messages.len() - 2],
            ChatMessage::Assistant { .. }
        ));
    }

    #[test]
    fn retries_exhaust_after_three_attempts() {
        let bad = "[FILE: a.txt]\n<<<<<<< SEARCH\nmissing zz\n=======\nx\n>>>>>>> REPLACE\n[/FILE]\n";
        let provider = ScriptedProvider::new(vec![
            chunked_text(bad, 8),
            chunked_text(bad, 8),
            chunked_text(bad, 8),
        ]);
        let (outcome, provider) = run_with(
            provider,
            ExecutorConfig::default(),
            files(&[("a.txt", "content\n")]),
        );
        let err = outcome.expect_err("must exhaust");
        assert!(err.to_string().contains("after 3 attempts"), "{err}");
        assert_eq!(provider.request_count(), 3);
    }

    #[test]
    fn truncated_file_block_is_retried() {
        let truncated = "[FILE: a.txt]\n<<<<<<< SEARCH\nhel";
        let good = "[FILE: a.txt]\n<<<<<<< SEARCH\nhello\n=======\nbye\n>>>>>>> REPLACE\n[/FILE]\n";
        let provider =
            ScriptedProvider::new(vec![chunked_text(truncated, 6), chunked_text(good, 6)]);
        let (outcome, provider) = run_with(
            provider,
            ExecutorConfig::default(),
            files(&[("a.txt", "hello\n")]),
        );
        let outcome = outcome.expect("run");
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.files[&PathBuf::from("a.txt")], "bye\n");

        let requests = provider.requests.lock().expect("requests");
        let ChatMessage::User { content: prompt } = requests[1].messages.last().expect("prompt")
        else {
            panic!("expected retry prompt");
        };
        assert!(prompt.contains("ended inside an open file block"));
    }

    #[test]
    fn unknown_file_reports_working_set_miss() {
        let stream = "[FILE: ghost.txt]\n<<<<<<< SEARCH\nx\n=======\ny\n>>>>>>> REPLACE\n[/FILE]\n";
        let provider = ScriptedProvider::new(vec![chunked_text(stream, 10)]);
        let executor = EditExecutor::new(
            Arc::new(provider),
            ExecutorConfig {
                max_attempts: 1,
                ..ExecutorConfig::default()
            },
        );
        let err = executor
            .run(
                vec![ChatMessage::user("edit")],
                files(&[("real.txt", "content\n")]),
                &CancelToken::new(),
            )
            .expect_err("must fail");
        assert!(err.to_string().contains("file not found in working set"));
    }

    // ── Lazy context ──

    #[test]
    fn lazy_context_round_answers_read_context() {
        let call = vec![
            StreamEvent::ToolCall {
                id: "call-1".to_string(),
                name: "read_context".to_string(),
                args: r#"{"path": "a.txt", "start_line": 1, "end_line": 2}"#.to_string(),
            },
            StreamEvent::Done,
        ];
        let edit = chunked_text(
            "[FILE: a.txt]\n<<<<<<< SEARCH\nalpha\n=======\nomega\n>>>>>>> REPLACE\n[/FILE]\n",
            16,
        );
        let provider = ScriptedProvider::new(vec![call, edit]);
        let cfg = ExecutorConfig {
            lazy_context: true,
            ..ExecutorConfig::default()
        };
        let (outcome, provider) = run_with(provider, cfg, files(&[("a.txt", "alpha\nbeta\n")]));
        let outcome = outcome.expect("run");
        assert_eq!(outcome.files[&PathBuf::from("a.txt")], "omega\nbeta\n");
        assert_eq!(outcome.attempts, 1);

        let requests = provider.requests.lock().expect("requests");
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools.len(), 1);
        assert_eq!(requests[0].tools[0].name, "read_context");
        let ChatMessage::Tool { call_id, content } =
            requests[1].messages.last().expect("tool result")
        else {
            panic!("expected tool result message");
        };
        assert_eq!(call_id, "call-1");
        assert!(content.contains("1 | alpha"));
        assert!(content.contains("2 | beta"));
    }

    #[test]
    fn tool_rounds_are_capped() {
        let call_round = || {
            vec![
                StreamEvent::ToolCall {
                    id: "loop".to_string(),
                    name: "read_context".to_string(),
                    args: r#"{"path": "a.txt"}"#.to_string(),
                },
                StreamEvent::Done,
            ]
        };
        // Six call rounds scripted, but the cap (5) forces completion
        // after the fifth answer; the sixth stream gets no tools and its
        // calls are ignored.
        let mut scripts: Vec<Vec<StreamEvent>> = (0..6).map(|_| call_round()).collect();
        scripts.push(vec![StreamEvent::Done]);
        let provider = ScriptedProvider::new(scripts);
        let cfg = ExecutorConfig {
            lazy_context: true,
            max_turns: 20,
            ..ExecutorConfig::default()
        };
        let (outcome, provider) = run_with(provider, cfg, files(&[("a.txt", "x\n")]));
        let outcome = outcome.expect("run completes without edits");
        assert!(outcome.edits.is_empty());
        // Rounds 1..=5 re-stream; the sixth stream is final.
        assert_eq!(provider.request_count(), 6);
        let requests = provider.requests.lock().expect("requests");
        assert!(requests[5].tools.is_empty());
    }

    // ── Usage and cancellation ──

    #[test]
    fn usage_events_accumulate() {
        let mut events = chunked_text("no edits here\n", 50);
        events.insert(
            0,
            StreamEvent::Usage {
                input_tokens: 11,
                output_tokens: 7,
            },
        );
        let provider = ScriptedProvider::new(vec![events]);
        let (outcome, _) = run_with(provider, ExecutorConfig::default(), WorkingSet::new());
        let outcome = outcome.expect("run");
        assert_eq!(outcome.usage, Usage { input_tokens: 11, output_tokens: 7 });
    }

    #[test]
    fn cancelled_token_aborts_the_run() {
        let provider = Arc::new(ScriptedProvider::text_once("text\n", 4));
        let executor = EditExecutor::new(provider, ExecutorConfig::default());
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = executor
            .run(vec![ChatMessage::user("go")], WorkingSet::new(), &cancel)
            .expect_err("cancelled");
        assert!(err.to_string().contains("cancelled"));
    }

    // ── Path resolution ──

    #[test]
    fn path_resolution_prefers_direct_then_basename_then_suffix() {
        let working = files(&[
            ("/repo/src/lib.rs", ""),
            ("/repo/src/main.rs", ""),
            ("/repo/tests/lib.rs", ""),
        ]);
        // Direct.
        assert_eq!(
            resolve_path(&working, "/repo/src/main.rs"),
            Some(PathBuf::from("/repo/src/main.rs"))
        );
        // Basename-only: first hit in deterministic order.
        assert_eq!(
            resolve_path(&working, "main.rs"),
            Some(PathBuf::from("/repo/src/main.rs"))
        );
        // Suffix.
        assert_eq!(
            resolve_path(&working, "/tests/lib.rs"),
            Some(PathBuf::from("/repo/tests/lib.rs"))
        );
        assert_eq!(
            resolve_path(&working, "src/lib.rs"),
            Some(PathBuf::from("/repo/src/lib.rs"))
        );
        assert_eq!(resolve_path(&working, "absent.rs"), None);
    }

    // ── About passthrough ──

    #[test]
    fn about_section_is_captured() {
        let stream = "[ABOUT]\nRenamed the helper.\n[/ABOUT]\n";
        let (outcome, _) = run_with(
            ScriptedProvider::text_once(stream, 9),
            ExecutorConfig::default(),
            WorkingSet::new(),
        );
        assert_eq!(
            outcome.expect("run").about.as_deref(),
            Some("Renamed the helper.")
        );
    }

    // ── Commit ──

    #[test]
    fn commit_writes_only_changed_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let a = temp.path().join("a.txt");
        let b = temp.path().join("b.txt");
        let base = files(&[
            (a.to_str().expect("utf8"), "same\n"),
            (b.to_str().expect("utf8"), "old\n"),
        ]);
        let mut updated = base.clone();
        updated.insert(b.clone(), "new\n".to_string());

        let changed = commit_changes(&updated, &base).expect("commit");
        assert_eq!(changed, vec![b.clone()]);
        assert!(!a.exists());
        assert_eq!(std::fs::read_to_string(&b).expect("read"), "new\n");
    }
}
