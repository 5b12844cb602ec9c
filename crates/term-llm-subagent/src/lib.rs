use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;
use term_llm_core::{
    CancelError, CancelToken, SubagentEvent, ToolErrorKind, tool_error,
};
use term_llm_tools::{Tool, ToolAccess, ToolContext};

pub const DEFAULT_MAX_PARALLEL: usize = 3;
pub const DEFAULT_MAX_DEPTH: usize = 2;
pub const MIN_TIMEOUT_SECS: u64 = 10;
pub const MAX_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Out-of-range spawn timeouts map to the nearer bound.
pub fn clamp_spawn_timeout(secs: u64) -> u64 {
    secs.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS)
}

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub agent: String,
    pub prompt: String,
    pub timeout_secs: Option<u64>,
    /// Nesting level: 0 at top level, incremented per spawn.
    pub depth: usize,
    /// The parent's originating tool-call id; events bubble under it.
    pub call_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnState {
    WaitingForSlot,
    Running,
    Done,
    TimedOut,
    Cancelled,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("permission denied: spawn depth {depth} exceeds the limit of {max}")]
    DepthExceeded { depth: usize, max: usize },
    #[error("permission denied: agent '{0}' is not in the allowed list")]
    AgentNotAllowed(String),
    #[error("sub-agent timed out")]
    TimedOut,
    #[error("sub-agent cancelled")]
    Cancelled,
    #[error("sub-agent failed: {0}")]
    Failed(String),
}

/// The nested pipeline a spawn runs. The event sink may be invoked from
/// whatever thread the child is on; implementations must treat it as a
/// concurrent, non-blocking sink.
pub trait AgentRuntime: Send + Sync {
    fn run(
        &self,
        req: &SpawnRequest,
        cancel: &CancelToken,
        events: &(dyn Fn(SubagentEvent) + Sync),
    ) -> anyhow::Result<String>;
}

/// Callback for bubbled child events, keyed by the originating tool-call
/// id.
pub type EventCallback = dyn Fn(&str, &SubagentEvent) + Send + Sync;

#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    pub max_parallel: usize,
    pub max_depth: usize,
    /// Empty means every agent name is allowed.
    pub allowed_agents: Vec<String>,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            max_depth: DEFAULT_MAX_DEPTH,
            allowed_agents: Vec::new(),
        }
    }
}

/// Bounded-parallel, depth-limited, cancellable sub-agent dispatcher.
///
/// Per spawn: `WaitingForSlot → Running → (Done | TimedOut | Cancelled |
/// Failed)`; the semaphore permit is released on every terminal state.
pub struct Spawner {
    cfg: SpawnerConfig,
    semaphore: Semaphore,
    runtime: Arc<dyn AgentRuntime>,
    callback: RwLock<Option<Arc<EventCallback>>>,
    states: Mutex<HashMap<String, SpawnState>>,
}

impl Spawner {
    pub fn new(cfg: SpawnerConfig, runtime: Arc<dyn AgentRuntime>) -> Self {
        let permits = cfg.max_parallel.max(1);
        Self {
            cfg,
            semaphore: Semaphore::new(permits),
            runtime,
            callback: RwLock::new(None),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_event_callback(&self, callback: Arc<EventCallback>) {
        *self.callback.write().expect("callback slot") = Some(callback);
    }

    pub fn state(&self, call_id: &str) -> Option<SpawnState> {
        self.states.lock().expect("spawn states").get(call_id).copied()
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available()
    }

    pub fn spawn(&self, req: &SpawnRequest, parent: &CancelToken) -> Result<String, SpawnError> {
        // Depth and whitelist are permission checks and fail before a
        // semaphore slot is taken.
        if req.depth >= self.cfg.max_depth {
            return Err(SpawnError::DepthExceeded {
                depth: req.depth,
                max: self.cfg.max_depth,
            });
        }
        if !self.cfg.allowed_agents.is_empty()
            && !self.cfg.allowed_agents.contains(&req.agent)
        {
            return Err(SpawnError::AgentNotAllowed(req.agent.clone()));
        }

        self.set_state(&req.call_id, SpawnState::WaitingForSlot);
        let permit = match self.semaphore.acquire(parent) {
            Ok(permit) => permit,
            Err(reason) => {
                let state = self.terminal_for(reason);
                self.set_state(&req.call_id, state);
                return Err(match reason {
                    CancelError::TimedOut => SpawnError::TimedOut,
                    CancelError::Cancelled => SpawnError::Cancelled,
                });
            }
        };

        self.set_state(&req.call_id, SpawnState::Running);
        let timeout = clamp_spawn_timeout(req.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
        let child = parent.child_with_timeout(Duration::from_secs(timeout));

        let callback = self.callback.read().expect("callback slot").clone();
        let call_id = req.call_id.clone();
        let forward = move |event: SubagentEvent| {
            if let Some(callback) = &callback {
                callback(&call_id, &event);
            }
        };

        forward(SubagentEvent::Init {
            agent: req.agent.clone(),
            model: None,
        });
        let result = self.runtime.run(req, &child, &forward);
        drop(permit);

        match result {
            Ok(output) => {
                forward(SubagentEvent::Done {
                    success: true,
                    output: output.clone(),
                });
                self.set_state(&req.call_id, SpawnState::Done);
                Ok(output)
            }
            Err(err) => {
                // A deadline that had expired at the moment of failure
                // classifies as a timeout; a fired parent cancel as
                // cancellation; anything else is the child's own failure.
                let (state, spawn_err) = match child.status() {
                    Some(CancelError::TimedOut) => (SpawnState::TimedOut, SpawnError::TimedOut),
                    Some(CancelError::Cancelled) => {
                        (SpawnState::Cancelled, SpawnError::Cancelled)
                    }
                    None => (SpawnState::Failed, SpawnError::Failed(err.to_string())),
                };
                forward(SubagentEvent::Done {
                    success: false,
                    output: err.to_string(),
                });
                self.set_state(&req.call_id, state);
                Err(spawn_err)
            }
        }
    }

    fn set_state(&self, call_id: &str, state: SpawnState) {
        self.states
            .lock()
            .expect("spawn states")
            .insert(call_id.to_string(), state);
    }

    fn terminal_for(&self, reason: CancelError) -> SpawnState {
        match reason {
            CancelError::TimedOut => SpawnState::TimedOut,
            CancelError::Cancelled => SpawnState::Cancelled,
        }
    }
}

// ── Counting semaphore ───────────────────────────────────────────────────────

struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
    capacity: usize,
}

struct Permit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

impl Semaphore {
    fn new(capacity: usize) -> Self {
        Self {
            permits: Mutex::new(capacity),
            cond: Condvar::new(),
            capacity,
        }
    }

    /// Block for a permit, returning promptly when `cancel` fires.
    fn acquire(&self, cancel: &CancelToken) -> Result<Permit<'_>, CancelError> {
        let mut permits = self.permits.lock().expect("semaphore lock");
        loop {
            cancel.check()?;
            if *permits > 0 {
                *permits -= 1;
                return Ok(Permit { semaphore: self });
            }
            let (next, _) = self
                .cond
                .wait_timeout(permits, Duration::from_millis(25))
                .expect("semaphore lock");
            permits = next;
        }
    }

    fn release(&self) {
        let mut permits = self.permits.lock().expect("semaphore lock");
        *permits = (*permits + 1).min(self.capacity);
        self.cond.notify_one();
    }

    fn available(&self) -> usize {
        *self.permits.lock().expect("semaphore lock")
    }
}

// ── spawn_agent tool ─────────────────────────────────────────────────────────

/// Registry tool wrapping the spawner, one instance per nesting level.
pub struct SpawnAgentTool {
    spawner: Arc<Spawner>,
    depth: usize,
}

impl SpawnAgentTool {
    pub fn new(spawner: Arc<Spawner>, depth: usize) -> Self {
        Self { spawner, depth }
    }
}

impl Tool for SpawnAgentTool {
    fn name(&self) -> &str {
        "spawn_agent"
    }

    fn description(&self) -> &str {
        "Run a named sub-agent on a prompt and return its final output."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent": {"type": "string"},
                "prompt": {"type": "string"},
                "timeout_secs": {"type": "integer"}
            },
            "required": ["agent", "prompt"]
        })
    }

    fn known_keys(&self) -> &[&str] {
        &["agent", "prompt", "timeout_secs"]
    }

    fn access(&self, _args: &Value) -> ToolAccess {
        // Gating is depth/whitelist based, inside the spawner itself.
        ToolAccess::None
    }

    fn run(&self, args: &Value, ctx: &ToolContext) -> String {
        let Some(agent) = args.get("agent").and_then(Value::as_str) else {
            return tool_error(ToolErrorKind::InvalidParams, "agent missing");
        };
        let Some(prompt) = args.get("prompt").and_then(Value::as_str) else {
            return tool_error(ToolErrorKind::InvalidParams, "prompt missing");
        };
        let req = SpawnRequest {
            agent: agent.to_string(),
            prompt: prompt.to_string(),
            timeout_secs: args.get("timeout_secs").and_then(Value::as_u64),
            depth: self.depth,
            call_id: call_id_from(args),
        };
        match self.spawner.spawn(&req, &ctx.cancel) {
            Ok(output) => output,
            Err(err @ (SpawnError::DepthExceeded { .. } | SpawnError::AgentNotAllowed(_))) => {
                tool_error(ToolErrorKind::PermissionDenied, err.to_string())
            }
            Err(SpawnError::TimedOut) => {
                tool_error(ToolErrorKind::Timeout, "sub-agent timed out")
            }
            Err(err @ (SpawnError::Cancelled | SpawnError::Failed(_))) => {
                tool_error(ToolErrorKind::ExecutionFailed, err.to_string())
            }
        }
    }
}

/// The registry injects the originating tool-call id into the arguments;
/// direct callers may omit it.
fn call_id_from(args: &Value) -> String {
    args.get("call_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("spawn-{:x}", std::process::id()))
}
