use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod cancel;
mod gitinfo;
mod observe;

pub use cancel::{CancelError, CancelToken};
pub use gitinfo::{GitInfo, detect_git_info};
pub use observe::Observer;

pub type Result<T> = anyhow::Result<T>;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".term-llm")
}

// ── Tool calls ───────────────────────────────────────────────────────────────

/// A tool invocation forwarded from the LLM stream.
///
/// Arguments arrive as opaque JSON; each tool owns its own parse step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            name: name.into(),
            args,
        }
    }
}

/// Declaration of a tool exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments object.
    pub parameters: serde_json::Value,
}

/// Structured categories for tool failures.
///
/// A failed tool call never surfaces as an `Err` to the model; it is
/// rendered into the result string via [`tool_error`] so the LLM can see
/// the category and react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolErrorKind {
    FileNotFound,
    InvalidParams,
    PathNotInWorkspace,
    ExecutionFailed,
    PermissionDenied,
    BinaryFile,
    FileTooLarge,
    UnsupportedFormat,
    Timeout,
    SymlinkEscape,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::PathNotInWorkspace => "PATH_NOT_IN_WORKSPACE",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::BinaryFile => "BINARY_FILE",
            Self::FileTooLarge => "FILE_TOO_LARGE",
            Self::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            Self::Timeout => "TIMEOUT",
            Self::SymlinkEscape => "SYMLINK_ESCAPE",
        }
    }
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format a categorized tool failure as the result string the LLM sees.
pub fn tool_error(kind: ToolErrorKind, msg: impl AsRef<str>) -> String {
    format!("[{}] {}", kind.as_str(), msg.as_ref())
}

// ── Sub-agent events ─────────────────────────────────────────────────────────

/// Events emitted during sub-agent execution, bubbled to the parent keyed
/// by the originating tool-call id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubagentEvent {
    Init {
        agent: String,
        model: Option<String>,
    },
    Text {
        text: String,
    },
    ToolStart {
        call_id: String,
        tool: String,
        summary: String,
    },
    ToolEnd {
        call_id: String,
        tool: String,
        output: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        diff: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },
    Phase {
        phase: String,
    },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
    Done {
        success: bool,
        output: String,
    },
}

// ── LLM provider seam ────────────────────────────────────────────────────────

/// A conversation message. Tool results go back as `Tool` entries carrying
/// the originating call id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Tool {
            call_id: call_id.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// One tagged event from a streaming completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCall {
        id: String,
        name: String,
        /// JSON-encoded arguments, exactly as the provider sent them.
        args: String,
    },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
    Error(String),
    Done,
}

/// Handle over one in-flight stream. `next_event` returns `None` after
/// `Done`, `Error`, or `close`.
pub trait EventStream: Send {
    fn next_event(&mut self) -> Option<StreamEvent>;

    /// Cancel in-flight streaming. Idempotent.
    fn close(&mut self);
}

/// Abstract streaming LLM provider. The HTTP transport lives outside this
/// workspace; tests drive the pipeline with a scripted implementation.
pub trait Provider: Send + Sync {
    fn stream(&self, req: &StreamRequest) -> Result<Box<dyn EventStream>>;
}
