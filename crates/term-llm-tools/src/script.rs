use anyhow::Result;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use term_llm_core::CancelToken;

use crate::shell::{DEFAULT_OUTPUT_CAP, ShellRunResult, run_child};

/// How a script receives its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgConvention {
    /// The JSON arguments object is written to the script's stdin.
    JsonStdin,
    /// Object fields become `--key value` flags; an `args` array becomes
    /// trailing positional arguments.
    CliFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("script name must not contain path separators or '..': {0}")]
    InvalidName(String),
    #[error("script not found: {0}")]
    NotFound(String),
    #[error("script resolves outside the agent directory: {0}")]
    SymlinkEscape(String),
    #[error("script is not a regular file: {0}")]
    NotAFile(String),
}

/// One tool backed by a script file bundled inside an agent directory.
#[derive(Debug, Clone)]
pub struct ScriptInvocation {
    pub agent_dir: PathBuf,
    pub script: String,
    pub tool_name: String,
    pub convention: ArgConvention,
    /// Optional interpreter line, e.g. `python3 -u`, split shell-style.
    pub interpreter: Option<String>,
    pub timeout: Option<Duration>,
}

/// Resolve a script name inside its agent directory. The name may not
/// contain separators or `..`; after symlink resolution the realpath must
/// stay within the agent directory's realpath, and the target must be a
/// regular file.
pub fn resolve_script(agent_dir: &Path, name: &str) -> Result<PathBuf, ScriptError> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(ScriptError::InvalidName(name.to_string()));
    }

    let candidate = agent_dir.join(name);
    let real_dir = agent_dir
        .canonicalize()
        .map_err(|_| ScriptError::NotFound(agent_dir.display().to_string()))?;
    let real_script = candidate
        .canonicalize()
        .map_err(|_| ScriptError::NotFound(name.to_string()))?;

    if !real_script.starts_with(&real_dir) {
        return Err(ScriptError::SymlinkEscape(name.to_string()));
    }
    let metadata = real_script
        .metadata()
        .map_err(|_| ScriptError::NotFound(name.to_string()))?;
    if !metadata.is_file() {
        return Err(ScriptError::NotAFile(name.to_string()));
    }
    Ok(real_script)
}

/// Execute an agent script with `AGENT_DIR` and `TOOL_NAME` injected and
/// arguments delivered per the tool's calling convention.
pub fn run_agent_script(
    invocation: &ScriptInvocation,
    args: &serde_json::Value,
    cancel: Option<&CancelToken>,
) -> Result<ShellRunResult> {
    let script_path = resolve_script(&invocation.agent_dir, &invocation.script)?;

    let mut cmd = match &invocation.interpreter {
        Some(line) => {
            let words = shell_words::split(line)
                .map_err(|err| anyhow::anyhow!("invalid interpreter line: {err}"))?;
            let Some((program, rest)) = words.split_first() else {
                return Err(anyhow::anyhow!("empty interpreter line"));
            };
            let mut cmd = Command::new(program);
            cmd.args(rest);
            cmd.arg(&script_path);
            cmd
        }
        None => Command::new(&script_path),
    };

    cmd.current_dir(&invocation.agent_dir);
    cmd.env("AGENT_DIR", &invocation.agent_dir);
    cmd.env("TOOL_NAME", &invocation.tool_name);

    let stdin_payload = match invocation.convention {
        ArgConvention::JsonStdin => Some(serde_json::to_vec(args)?),
        ArgConvention::CliFlags => {
            for arg in cli_args(args) {
                cmd.arg(arg);
            }
            None
        }
    };

    run_child(
        cmd,
        stdin_payload,
        invocation.timeout,
        cancel,
        DEFAULT_OUTPUT_CAP,
    )
}

/// `{"level": "high", "args": ["a", "b"]}` → `--level high a b`.
/// Field order is sorted for a stable argv.
fn cli_args(args: &serde_json::Value) -> Vec<String> {
    let Some(object) = args.as_object() else {
        return Vec::new();
    };
    let mut flags = Vec::new();
    let mut keys: Vec<&String> = object.keys().filter(|k| *k != "args").collect();
    keys.sort();
    for key in keys {
        let value = &object[key.as_str()];
        flags.push(format!("--{key}"));
        flags.push(scalar_to_string(value));
    }
    if let Some(positional) = object.get("args").and_then(|v| v.as_array()) {
        for value in positional {
            flags.push(scalar_to_string(value));
        }
    }
    flags
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
