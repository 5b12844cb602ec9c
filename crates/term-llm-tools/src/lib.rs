use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use term_llm_approval::ApprovalManager;
use term_llm_core::{CancelToken, ToolCall, ToolDefinition, ToolErrorKind, tool_error};

mod script;
mod shell;
mod writer;

pub use script::{ArgConvention, ScriptError, ScriptInvocation, resolve_script, run_agent_script};
pub use shell::{
    DEFAULT_OUTPUT_CAP, DEFAULT_TIMEOUT, MAX_TIMEOUT, PlatformShellRunner, ShellRequest,
    ShellRunResult, ShellRunner, clamp_timeout,
};
pub use writer::{PathLock, write_atomic};

const READ_MAX_BYTES_DEFAULT: usize = 1_000_000;
const BINARY_SNIFF_BYTES: usize = 8000;

/// What a tool call touches, for approval gating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolAccess {
    ReadPath(PathBuf),
    WritePath(PathBuf),
    Shell(String),
    None,
}

/// Shared state handed to every tool run.
pub struct ToolContext {
    pub workspace: PathBuf,
    pub approvals: ApprovalManager,
    pub cancel: CancelToken,
    pub runner: Arc<dyn ShellRunner>,
}

impl ToolContext {
    pub fn new(workspace: PathBuf, approvals: ApprovalManager) -> Self {
        Self {
            workspace,
            approvals,
            cancel: CancelToken::new(),
            runner: Arc::new(PlatformShellRunner),
        }
    }
}

/// A dispatchable tool. `run` never fails: every failure is rendered
/// into the returned string with its [`ToolErrorKind`] tag so the LLM can
/// see it and react.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value;
    /// Argument keys this tool understands; anything else is echoed back
    /// in a warning banner rather than rejected.
    fn known_keys(&self) -> &[&str];
    fn access(&self, args: &Value) -> ToolAccess;
    fn run(&self, args: &Value, ctx: &ToolContext) -> String;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in file and shell tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ReadFileTool));
        registry.register(Arc::new(WriteFileTool));
        registry.register(Arc::new(RunShellTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Gate through the approval manager, then run. The result is always a
    /// string for the tool-result message; a denial comes back as
    /// `PERMISSION_DENIED` content rather than an error.
    ///
    /// The originating call id is injected into the arguments as
    /// `call_id` (after the unknown-key scan) so tools that bubble events
    /// can key them to this call.
    pub fn dispatch(&self, call: &ToolCall, ctx: &ToolContext) -> String {
        let Some(tool) = self.get(&call.name) else {
            return tool_error(
                ToolErrorKind::InvalidParams,
                format!("unknown tool: {}", call.name),
            );
        };

        let banner = unknown_key_banner(tool.known_keys(), &call.args);

        let approved = match tool.access(&call.args) {
            ToolAccess::ReadPath(path) => ctx.approvals.approve_path(&path, false).allows(),
            ToolAccess::WritePath(path) => ctx.approvals.approve_path(&path, true).allows(),
            ToolAccess::Shell(command) => ctx.approvals.approve_shell(&command).allows(),
            ToolAccess::None => true,
        };
        if !approved {
            return tool_error(
                ToolErrorKind::PermissionDenied,
                format!("approval denied for {}", call.name),
            );
        }

        let mut args = call.args.clone();
        if let Some(object) = args.as_object_mut() {
            object.insert("call_id".to_string(), json!(call.id));
        }
        let output = tool.run(&args, ctx);
        match banner {
            Some(banner) => format!("{banner}\n{output}"),
            None => output,
        }
    }
}

/// Unknown argument keys are collected and echoed, never rejected, so the
/// model can self-correct without a failed call.
fn unknown_key_banner(known: &[&str], args: &Value) -> Option<String> {
    let object = args.as_object()?;
    let unknown: Vec<&str> = object
        .keys()
        .map(String::as_str)
        .filter(|key| !known.contains(key))
        .collect();
    if unknown.is_empty() {
        return None;
    }
    Some(format!(
        "Warning: ignored unrecognized argument keys: {}",
        unknown.join(", ")
    ))
}

// ── Path helpers ─────────────────────────────────────────────────────────────

/// Resolve a tool-supplied path against the workspace and refuse escapes,
/// including symlink escapes for paths that already exist.
pub fn workspace_path(workspace: &Path, raw: &str) -> Result<PathBuf, String> {
    let joined = if Path::new(raw).is_absolute() {
        PathBuf::from(raw)
    } else {
        workspace.join(raw)
    };
    let normalized = lexical_normalize(&joined);
    let workspace_abs =
        lexical_normalize(&std::path::absolute(workspace).unwrap_or_else(|_| workspace.into()));
    if !normalized.starts_with(&workspace_abs) {
        return Err(tool_error(
            ToolErrorKind::PathNotInWorkspace,
            format!("{raw} resolves outside the workspace"),
        ));
    }
    if let Ok(real) = normalized.canonicalize()
        && let Ok(real_ws) = workspace_abs.canonicalize()
        && !real.starts_with(&real_ws)
    {
        return Err(tool_error(
            ToolErrorKind::SymlinkEscape,
            format!("{raw} escapes the workspace through a symlink"),
        ));
    }
    Ok(normalized)
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

pub fn is_binary(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .take(BINARY_SNIFF_BYTES)
        .any(|byte| *byte == 0)
}

// ── Built-in tools ───────────────────────────────────────────────────────────

struct ReadFileTool;

impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace, optionally a 1-indexed inclusive line range."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "start_line": {"type": "integer"},
                "end_line": {"type": "integer"},
                "max_bytes": {"type": "integer"}
            },
            "required": ["path"]
        })
    }

    fn known_keys(&self) -> &[&str] {
        &["path", "start_line", "end_line", "max_bytes"]
    }

    fn access(&self, args: &Value) -> ToolAccess {
        match args.get("path").and_then(Value::as_str) {
            Some(path) => ToolAccess::ReadPath(PathBuf::from(path)),
            None => ToolAccess::None,
        }
    }

    fn run(&self, args: &Value, ctx: &ToolContext) -> String {
        let Some(raw) = args.get("path").and_then(Value::as_str) else {
            return tool_error(ToolErrorKind::InvalidParams, "path missing");
        };
        let path = match workspace_path(&ctx.workspace, raw) {
            Ok(path) => path,
            Err(rendered) => return rendered,
        };
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => {
                return tool_error(ToolErrorKind::FileNotFound, format!("no such file: {raw}"));
            }
        };
        if is_binary(&bytes) {
            return tool_error(ToolErrorKind::BinaryFile, format!("{raw} is binary"));
        }
        let max_bytes = args
            .get("max_bytes")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(READ_MAX_BYTES_DEFAULT);
        if bytes.len() > max_bytes {
            return tool_error(
                ToolErrorKind::FileTooLarge,
                format!("{raw} is {} bytes (limit {max_bytes})", bytes.len()),
            );
        }
        let Ok(content) = String::from_utf8(bytes) else {
            return tool_error(ToolErrorKind::UnsupportedFormat, format!("{raw} is not UTF-8"));
        };

        let start = args.get("start_line").and_then(Value::as_u64).map(|v| v as usize);
        let end = args.get("end_line").and_then(Value::as_u64).map(|v| v as usize);
        match (start, end) {
            (None, None) => content,
            (start, end) => numbered_excerpt(&content, start.unwrap_or(1), end),
        }
    }
}

/// 1-indexed inclusive line excerpt with line-number prefixes.
pub fn numbered_excerpt(content: &str, start: usize, end: Option<usize>) -> String {
    let start = start.max(1);
    let lines: Vec<&str> = content.lines().collect();
    let end = end.unwrap_or(lines.len()).min(lines.len());
    if start > end {
        return String::new();
    }
    lines[start - 1..end]
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{:>5} | {line}", start + i))
        .collect::<Vec<_>>()
        .join("\n")
}

struct WriteFileTool;

impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a file in the workspace atomically, creating parents as needed."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["path", "content"]
        })
    }

    fn known_keys(&self) -> &[&str] {
        &["path", "content"]
    }

    fn access(&self, args: &Value) -> ToolAccess {
        match args.get("path").and_then(Value::as_str) {
            Some(path) => ToolAccess::WritePath(PathBuf::from(path)),
            None => ToolAccess::None,
        }
    }

    fn run(&self, args: &Value, ctx: &ToolContext) -> String {
        let Some(raw) = args.get("path").and_then(Value::as_str) else {
            return tool_error(ToolErrorKind::InvalidParams, "path missing");
        };
        let Some(content) = args.get("content").and_then(Value::as_str) else {
            return tool_error(ToolErrorKind::InvalidParams, "content missing");
        };
        let path = match workspace_path(&ctx.workspace, raw) {
            Ok(path) => path,
            Err(rendered) => return rendered,
        };
        match write_atomic(&path, content) {
            Ok(()) => format!("wrote {} bytes to {raw}", content.len()),
            Err(err) => tool_error(ToolErrorKind::ExecutionFailed, err.to_string()),
        }
    }
}

struct RunShellTool;

impl Tool for RunShellTool {
    fn name(&self) -> &str {
        "run_shell"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace with a timeout; output is returned verbatim."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string"},
                "cwd": {"type": "string"},
                "timeout_secs": {"type": "integer"}
            },
            "required": ["command"]
        })
    }

    fn known_keys(&self) -> &[&str] {
        &["command", "cwd", "timeout_secs"]
    }

    fn access(&self, args: &Value) -> ToolAccess {
        match args.get("command").and_then(Value::as_str) {
            Some(command) => ToolAccess::Shell(command.to_string()),
            None => ToolAccess::None,
        }
    }

    fn run(&self, args: &Value, ctx: &ToolContext) -> String {
        let Some(command) = args.get("command").and_then(Value::as_str) else {
            return tool_error(ToolErrorKind::InvalidParams, "command missing");
        };
        let mut req = ShellRequest::new(command);
        req.cwd = Some(
            args.get("cwd")
                .and_then(Value::as_str)
                .map(|cwd| ctx.workspace.join(cwd))
                .unwrap_or_else(|| ctx.workspace.clone()),
        );
        req.timeout = args
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .map(Duration::from_secs);
        req.cancel = Some(ctx.cancel.clone());
        match ctx.runner.run(&req) {
            Ok(result) => result.render(),
            Err(err) if err.to_string().contains("cancelled") => {
                tool_error(ToolErrorKind::Timeout, "command cancelled")
            }
            Err(err) => tool_error(ToolErrorKind::ExecutionFailed, err.to_string()),
        }
    }
}

/// A tool backed by a script bundled in an agent directory.
pub struct ScriptTool {
    invocation: ScriptInvocation,
    description: String,
}

impl ScriptTool {
    pub fn new(invocation: ScriptInvocation, description: impl Into<String>) -> Self {
        Self {
            invocation,
            description: description.into(),
        }
    }
}

impl Tool for ScriptTool {
    fn name(&self) -> &str {
        &self.invocation.tool_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "additionalProperties": true})
    }

    fn known_keys(&self) -> &[&str] {
        // Scripts own their argument schema; every key is forwarded.
        &[]
    }

    fn access(&self, _args: &Value) -> ToolAccess {
        ToolAccess::Shell(format!(
            "agent-script:{}/{}",
            self.invocation.agent_dir.display(),
            self.invocation.script
        ))
    }

    fn run(&self, args: &Value, ctx: &ToolContext) -> String {
        // The registry's injected call_id is plumbing, not a script
        // argument.
        let mut args = args.clone();
        if let Some(object) = args.as_object_mut() {
            object.remove("call_id");
        }
        match run_agent_script(&self.invocation, &args, Some(&ctx.cancel)) {
            Ok(result) => result.render(),
            Err(err) => match err.downcast_ref::<ScriptError>() {
                Some(ScriptError::SymlinkEscape(_)) => {
                    tool_error(ToolErrorKind::SymlinkEscape, err.to_string())
                }
                Some(ScriptError::NotFound(_)) => {
                    tool_error(ToolErrorKind::FileNotFound, err.to_string())
                }
                Some(ScriptError::InvalidName(_) | ScriptError::NotAFile(_)) => {
                    tool_error(ToolErrorKind::InvalidParams, err.to_string())
                }
                None => tool_error(ToolErrorKind::ExecutionFailed, err.to_string()),
            },
        }
    }
}
