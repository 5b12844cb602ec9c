use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use term_llm_core::{CancelError, CancelToken};
use wait_timeout::ChildExt;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_OUTPUT_CAP: usize = 200_000;

const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub command: String,
    pub cwd: Option<PathBuf>,
    /// Overrides applied on top of the inherited environment; a key both
    /// inherited and listed here takes the override's value.
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
    pub output_cap: usize,
}

impl ShellRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            env: Vec::new(),
            timeout: None,
            cancel: None,
            output_cap: DEFAULT_OUTPUT_CAP,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellRunResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ShellRunResult {
    /// Render the result the LLM sees. Non-zero exits are data, not
    /// errors; a timeout carries the `[Command timed out]` prefix.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.timed_out {
            out.push_str("[Command timed out]\n");
        }
        if !self.stdout.is_empty() {
            out.push_str(&self.stdout);
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }
        if self.stdout_truncated {
            out.push_str("[stdout truncated]\n");
        }
        if !self.stderr.is_empty() {
            out.push_str("--- stderr ---\n");
            out.push_str(&self.stderr);
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }
        if self.stderr_truncated {
            out.push_str("[stderr truncated]\n");
        }
        match self.exit_code {
            Some(code) => out.push_str(&format!("exit_code: {code}")),
            None => out.push_str("exit_code: killed"),
        }
        out
    }
}

pub trait ShellRunner: Send + Sync {
    fn run(&self, req: &ShellRequest) -> Result<ShellRunResult>;
}

/// Runs commands under `$SHELL -c` (default `bash`) in their own process
/// group, stdin from the null device, with a hard timeout that kills the
/// whole group.
#[derive(Debug, Default)]
pub struct PlatformShellRunner;

impl ShellRunner for PlatformShellRunner {
    fn run(&self, req: &ShellRequest) -> Result<ShellRunResult> {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "bash".to_string());
        let mut cmd = Command::new(&shell);
        cmd.arg("-c").arg(&req.command);
        if let Some(cwd) = &req.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &req.env {
            cmd.env(key, value);
        }
        run_child(cmd, None, req.timeout, req.cancel.as_ref(), req.output_cap)
            .with_context(|| format!("failed to run command under {shell}"))
    }
}

pub fn clamp_timeout(requested: Option<Duration>) -> Duration {
    requested.unwrap_or(DEFAULT_TIMEOUT).min(MAX_TIMEOUT)
}

/// Shared child-execution loop used by the shell runner and the agent
/// script runner: capped output readers, timeout enforcement via
/// process-group kill, and prompt cancellation.
pub(crate) fn run_child(
    mut cmd: Command,
    stdin_payload: Option<Vec<u8>>,
    timeout: Option<Duration>,
    cancel: Option<&CancelToken>,
    output_cap: usize,
) -> Result<ShellRunResult> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    if stdin_payload.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().context("failed to spawn child process")?;
    if let Some(payload) = stdin_payload {
        let mut stdin = child.stdin.take().context("child stdin missing")?;
        thread::spawn(move || {
            use std::io::Write;
            let _ = stdin.write_all(&payload);
            // Dropping the handle closes the pipe so the script sees EOF.
        });
    }
    let stdout = child.stdout.take().context("child stdout missing")?;
    let stderr = child.stderr.take().context("child stderr missing")?;
    let stdout_reader = spawn_capped_reader(stdout, output_cap);
    let stderr_reader = spawn_capped_reader(stderr, output_cap);

    let deadline = Instant::now() + clamp_timeout(timeout);
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.wait_timeout(WAIT_SLICE)? {
            break Some(status);
        }
        if let Some(token) = cancel
            && let Some(reason) = token.status()
        {
            kill_group(&mut child);
            let status = child.wait().ok();
            match reason {
                CancelError::TimedOut => {
                    timed_out = true;
                    break status;
                }
                CancelError::Cancelled => {
                    let _ = stdout_reader.join();
                    let _ = stderr_reader.join();
                    return Err(anyhow!("command cancelled"));
                }
            }
        }
        if Instant::now() >= deadline {
            kill_group(&mut child);
            timed_out = true;
            break child.wait().ok();
        }
    };

    let (stdout_bytes, stdout_truncated) = stdout_reader
        .join()
        .map_err(|_| anyhow!("stdout reader panicked"))?;
    let (stderr_bytes, stderr_truncated) = stderr_reader
        .join()
        .map_err(|_| anyhow!("stderr reader panicked"))?;

    Ok(ShellRunResult {
        exit_code: status.and_then(|s| s.code()),
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        timed_out,
        stdout_truncated,
        stderr_truncated,
    })
}

/// Reads to end so the child never blocks on a full pipe, keeping at most
/// `cap` bytes.
fn spawn_capped_reader<R: Read + Send + 'static>(
    mut reader: R,
    cap: usize,
) -> JoinHandle<(Vec<u8>, bool)> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        let mut truncated = false;
        loop {
            match reader.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if buf.len() < cap {
                        let take = (cap - buf.len()).min(n);
                        buf.extend_from_slice(&chunk[..take]);
                        if take < n {
                            truncated = true;
                        }
                    } else {
                        truncated = true;
                    }
                }
            }
        }
        (buf, truncated)
    })
}

#[cfg(unix)]
fn kill_group(child: &mut Child) {
    // The child leads its own group, so killing the group reaches every
    // descendant.
    let pid = child.id() as i32;
    unsafe {
        libc::killpg(pid, libc::SIGKILL);
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) {
    let _ = child.kill();
}
