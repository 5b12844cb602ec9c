use anyhow::Result;
use std::sync::{Arc, OnceLock, Weak};
use term_llm_core::{CancelToken, ChatMessage, Provider, SubagentEvent, ToolCall};
use term_llm_exec::{EditExecutor, ExecEvents, ExecutorConfig, Usage, WorkingSet};
use term_llm_stream::FileEdit;
use term_llm_subagent::{
    AgentRuntime, SpawnAgentTool, SpawnRequest, Spawner, SpawnerConfig,
};
use term_llm_tools::{ToolContext, ToolRegistry};

mod defs;

pub use defs::{AgentDef, ScriptToolDef, agents_dir, allowed_agent_names, load_agent_defs};

const TOOL_SUMMARY_LIMIT: usize = 120;

#[derive(Clone, Default)]
pub struct AgentConfig {
    pub system_prompt: Option<String>,
    pub executor: ExecutorConfig,
}

#[derive(Debug)]
pub struct AgentOutcome {
    /// The About section if one was emitted, otherwise the assistant's
    /// plain text.
    pub output: String,
    pub files: WorkingSet,
    pub edits: Vec<FileEdit>,
    pub warnings: Vec<String>,
    pub usage: Usage,
}

/// One agent over the whole pipeline: the executor drives the stream and
/// applies edits, the registry (gated by the approval manager) serves the
/// tool-call side channel, and progress is bubbled as [`SubagentEvent`]s.
pub struct Agent {
    provider: Arc<dyn Provider>,
    registry: Arc<ToolRegistry>,
    tool_ctx: Arc<ToolContext>,
    cfg: AgentConfig,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        tool_ctx: Arc<ToolContext>,
        cfg: AgentConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            tool_ctx,
            cfg,
        }
    }

    pub fn run(
        &self,
        prompt: &str,
        files: WorkingSet,
        cancel: &CancelToken,
        events: &(dyn Fn(SubagentEvent) + Sync),
    ) -> Result<AgentOutcome> {
        let executor = EditExecutor::with_registry(
            self.provider.clone(),
            self.cfg.executor.clone(),
            self.registry.clone(),
            self.tool_ctx.clone(),
        );
        let mut messages = Vec::new();
        if let Some(system) = &self.cfg.system_prompt {
            messages.push(ChatMessage::System {
                content: system.clone(),
            });
        }
        messages.push(ChatMessage::user(prompt));

        let bridge = EventBridge { events };
        let outcome = executor.run_with_events(messages, files, cancel, &bridge)?;
        events(SubagentEvent::Usage {
            input_tokens: outcome.usage.input_tokens,
            output_tokens: outcome.usage.output_tokens,
        });

        let output = outcome
            .about
            .clone()
            .unwrap_or_else(|| outcome.text.trim().to_string());
        Ok(AgentOutcome {
            output,
            files: outcome.files,
            edits: outcome.edits,
            warnings: outcome.warnings,
            usage: outcome.usage,
        })
    }
}

struct EventBridge<'a> {
    events: &'a (dyn Fn(SubagentEvent) + Sync),
}

impl ExecEvents for EventBridge<'_> {
    fn on_text(&self, text: &str) {
        (self.events)(SubagentEvent::Text {
            text: text.to_string(),
        });
    }

    fn on_tool_start(&self, call: &ToolCall) {
        (self.events)(SubagentEvent::ToolStart {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            summary: summarize_args(&call.args),
        });
    }

    fn on_tool_end(&self, call: &ToolCall, result: &str) {
        (self.events)(SubagentEvent::ToolEnd {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            output: result.to_string(),
            diff: None,
            image: None,
        });
    }
}

fn summarize_args(args: &serde_json::Value) -> String {
    let rendered = args.to_string();
    if rendered.chars().count() > TOOL_SUMMARY_LIMIT {
        let cut: String = rendered.chars().take(TOOL_SUMMARY_LIMIT).collect();
        format!("{cut}…")
    } else {
        rendered
    }
}

// ── Recursive wiring ─────────────────────────────────────────────────────────

/// The runtime a spawner nests: every spawn builds a fresh agent whose
/// registry carries a `spawn_agent` tool pointing back at the same
/// spawner, one level deeper. A spawn naming a loaded agent definition
/// picks up its system prompt, turn budget, and bundled script tools.
pub struct PipelineRuntime {
    provider: Arc<dyn Provider>,
    tool_ctx: Arc<ToolContext>,
    cfg: AgentConfig,
    defs: Vec<AgentDef>,
    spawner: OnceLock<Weak<Spawner>>,
}

impl PipelineRuntime {
    fn registry_for(&self, depth: usize, def: Option<&AgentDef>) -> ToolRegistry {
        let mut registry = ToolRegistry::with_builtins();
        if let Some(def) = def {
            def.register_tools(&mut registry);
        }
        if let Some(spawner) = self.spawner.get().and_then(Weak::upgrade) {
            registry.register(Arc::new(SpawnAgentTool::new(spawner, depth)));
        }
        registry
    }
}

impl AgentRuntime for PipelineRuntime {
    fn run(
        &self,
        req: &SpawnRequest,
        cancel: &CancelToken,
        events: &(dyn Fn(SubagentEvent) + Sync),
    ) -> Result<String> {
        events(SubagentEvent::Phase {
            phase: "running".to_string(),
        });
        let def = self.defs.iter().find(|def| def.name == req.agent);
        let cfg = match def {
            Some(def) => def.agent_config(&self.cfg),
            None => self.cfg.clone(),
        };
        let registry = Arc::new(self.registry_for(req.depth + 1, def));
        let agent = Agent::new(self.provider.clone(), registry, self.tool_ctx.clone(), cfg);
        let outcome = agent.run(&req.prompt, WorkingSet::new(), cancel, events)?;
        Ok(outcome.output)
    }
}

/// Build the recursive spawner and hand back both ends: children spawned
/// through it can spawn further children until `max_depth` cuts them off.
pub fn recursive_spawner(
    provider: Arc<dyn Provider>,
    tool_ctx: Arc<ToolContext>,
    agent_cfg: AgentConfig,
    spawner_cfg: SpawnerConfig,
) -> Arc<Spawner> {
    recursive_spawner_with_agents(provider, tool_ctx, agent_cfg, spawner_cfg, Vec::new())
}

/// As [`recursive_spawner`], with loaded agent definitions; their names
/// typically also feed the spawner's allowed-agents whitelist.
pub fn recursive_spawner_with_agents(
    provider: Arc<dyn Provider>,
    tool_ctx: Arc<ToolContext>,
    agent_cfg: AgentConfig,
    spawner_cfg: SpawnerConfig,
    defs: Vec<AgentDef>,
) -> Arc<Spawner> {
    let runtime = Arc::new(PipelineRuntime {
        provider,
        tool_ctx,
        cfg: agent_cfg,
        defs,
        spawner: OnceLock::new(),
    });
    let spawner = Arc::new(Spawner::new(spawner_cfg, runtime.clone()));
    let _ = runtime.spawner.set(Arc::downgrade(&spawner));
    spawner
}

/// The depth-0 agent: built-in tools plus `spawn_agent` wired to the
/// recursive spawner.
pub fn top_level_agent(
    provider: Arc<dyn Provider>,
    tool_ctx: Arc<ToolContext>,
    cfg: AgentConfig,
    spawner: Arc<Spawner>,
) -> Agent {
    let mut registry = ToolRegistry::with_builtins();
    registry.register(Arc::new(SpawnAgentTool::new(spawner, 0)));
    Agent::new(provider, Arc::new(registry), tool_ctx, cfg)
}
