use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use term_llm_core::runtime_dir;
use term_llm_tools::{ArgConvention, ScriptInvocation, ScriptTool, ToolRegistry};

use crate::AgentConfig;

/// A named agent loaded from `<workspace>/.term-llm/agents/<name>/agent.md`.
///
/// The markdown body becomes the agent's system prompt; the frontmatter
/// names the model, turn budget, and the script tools bundled alongside
/// the definition.
#[derive(Debug, Clone)]
pub struct AgentDef {
    pub name: String,
    pub description: String,
    pub prompt: String,
    pub model: Option<String>,
    pub max_turns: Option<usize>,
    pub tools: Vec<ScriptToolDef>,
    pub dir: PathBuf,
}

/// One `name:script:convention` entry from the `tools:` frontmatter list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptToolDef {
    pub name: String,
    pub script: String,
    pub convention: ArgConvention,
}

impl AgentDef {
    pub fn agent_config(&self, base: &AgentConfig) -> AgentConfig {
        let mut cfg = base.clone();
        if !self.prompt.is_empty() {
            cfg.system_prompt = Some(self.prompt.clone());
        }
        if let Some(max_turns) = self.max_turns {
            cfg.executor.max_turns = max_turns;
        }
        cfg
    }

    /// Register this agent's bundled scripts as tools.
    pub fn register_tools(&self, registry: &mut ToolRegistry) {
        for tool in &self.tools {
            let invocation = ScriptInvocation {
                agent_dir: self.dir.clone(),
                script: tool.script.clone(),
                tool_name: tool.name.clone(),
                convention: tool.convention,
                interpreter: None,
                timeout: None,
            };
            registry.register(Arc::new(ScriptTool::new(
                invocation,
                format!("{} (script tool of agent {})", tool.name, self.name),
            )));
        }
    }
}

pub fn agents_dir(workspace: &Path) -> PathBuf {
    runtime_dir(workspace).join("agents")
}

/// Scan the agents directory; each subdirectory with an `agent.md` yields
/// a definition. Malformed files are skipped rather than failing the scan.
pub fn load_agent_defs(workspace: &Path) -> Result<Vec<AgentDef>> {
    let dir = agents_dir(workspace);
    let mut defs = Vec::new();
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Ok(defs);
    };
    for entry in entries {
        let entry = entry?;
        let agent_dir = entry.path();
        if !agent_dir.is_dir() {
            continue;
        }
        let manifest = agent_dir.join("agent.md");
        let Ok(raw) = std::fs::read_to_string(&manifest) else {
            continue;
        };
        if let Some(def) = parse_agent_def(&raw, &agent_dir) {
            defs.push(def);
        }
    }
    defs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(defs)
}

/// Names for the spawner's allowed-agents whitelist.
pub fn allowed_agent_names(defs: &[AgentDef]) -> Vec<String> {
    defs.iter().map(|def| def.name.clone()).collect()
}

fn parse_agent_def(raw: &str, dir: &Path) -> Option<AgentDef> {
    let trimmed = raw.trim();
    let rest = trimmed.strip_prefix("---")?;
    let end = rest.find("---")?;
    let frontmatter = &rest[..end];
    let body = rest[end + 3..].trim().to_string();

    let mut name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "agent".to_string());
    let mut description = String::new();
    let mut model = None;
    let mut max_turns = None;
    let mut tools = Vec::new();

    for line in frontmatter.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("name:") {
            name = unquote(value);
        } else if let Some(value) = line.strip_prefix("description:") {
            description = unquote(value);
        } else if let Some(value) = line.strip_prefix("model:") {
            model = Some(unquote(value));
        } else if let Some(value) = line.strip_prefix("max_turns:") {
            max_turns = value.trim().parse().ok();
        } else if let Some(value) = line.strip_prefix("tools:") {
            tools = value
                .trim()
                .trim_matches(|c| c == '[' || c == ']')
                .split(',')
                .filter_map(|entry| parse_tool_entry(entry.trim()))
                .collect();
        }
    }

    Some(AgentDef {
        name,
        description,
        prompt: body,
        model,
        max_turns,
        tools,
        dir: dir.to_path_buf(),
    })
}

/// `lint_check:check.sh:json` or `search:find.sh:cli`; the convention
/// defaults to JSON-on-stdin when omitted.
fn parse_tool_entry(entry: &str) -> Option<ScriptToolDef> {
    let entry = entry.trim_matches('"').trim_matches('\'');
    if entry.is_empty() {
        return None;
    }
    let mut parts = entry.splitn(3, ':');
    let name = parts.next()?.trim().to_string();
    let script = parts.next()?.trim().to_string();
    if name.is_empty() || script.is_empty() {
        return None;
    }
    let convention = match parts.next().map(str::trim) {
        Some("cli") => ArgConvention::CliFlags,
        _ => ArgConvention::JsonStdin,
    };
    Some(ScriptToolDef {
        name,
        script,
        convention,
    })
}

fn unquote(value: &str) -> String {
    value.trim().trim_matches('"').trim_matches('\'').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn seed_agent(workspace: &Path, name: &str, manifest: &str) -> PathBuf {
        let dir = agents_dir(workspace).join(name);
        fs::create_dir_all(&dir).expect("agent dir");
        fs::write(dir.join("agent.md"), manifest).expect("manifest");
        dir
    }

    #[test]
    fn parses_frontmatter_and_body() {
        let raw = "---\nname: reviewer\ndescription: Reviews diffs\nmodel: big-model\nmax_turns: 9\ntools: [lint:check.sh:json, scan:scan.sh:cli]\n---\nReview carefully.\nBe terse.";
        let def = parse_agent_def(raw, Path::new("/ws/.term-llm/agents/reviewer")).expect("parse");
        assert_eq!(def.name, "reviewer");
        assert_eq!(def.description, "Reviews diffs");
        assert_eq!(def.model.as_deref(), Some("big-model"));
        assert_eq!(def.max_turns, Some(9));
        assert_eq!(def.prompt, "Review carefully.\nBe terse.");
        assert_eq!(
            def.tools,
            vec![
                ScriptToolDef {
                    name: "lint".to_string(),
                    script: "check.sh".to_string(),
                    convention: ArgConvention::JsonStdin,
                },
                ScriptToolDef {
                    name: "scan".to_string(),
                    script: "scan.sh".to_string(),
                    convention: ArgConvention::CliFlags,
                },
            ]
        );
    }

    #[test]
    fn name_defaults_to_the_directory() {
        let raw = "---\ndescription: no name line\n---\nbody";
        let def = parse_agent_def(raw, Path::new("/ws/.term-llm/agents/helper")).expect("parse");
        assert_eq!(def.name, "helper");
    }

    #[test]
    fn missing_frontmatter_is_rejected() {
        assert!(parse_agent_def("just a prompt", Path::new("/x")).is_none());
    }

    #[test]
    fn loads_defs_from_workspace_sorted() {
        let temp = tempfile::tempdir().expect("tempdir");
        seed_agent(
            temp.path(),
            "zeta",
            "---\nname: zeta\ndescription: last\n---\nprompt z",
        );
        seed_agent(
            temp.path(),
            "alpha",
            "---\nname: alpha\ndescription: first\n---\nprompt a",
        );
        // A directory without a manifest is skipped.
        fs::create_dir_all(agents_dir(temp.path()).join("empty")).expect("empty dir");

        let defs = load_agent_defs(temp.path()).expect("load");
        assert_eq!(allowed_agent_names(&defs), vec!["alpha", "zeta"]);
    }

    #[test]
    fn empty_agents_dir_yields_no_defs() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(load_agent_defs(temp.path()).expect("load").is_empty());
    }

    #[test]
    fn agent_config_overrides_prompt_and_turns() {
        let raw = "---\nname: fast\nmax_turns: 4\n---\nBe quick.";
        let def = parse_agent_def(raw, Path::new("/x/fast")).expect("parse");
        let cfg = def.agent_config(&AgentConfig::default());
        assert_eq!(cfg.system_prompt.as_deref(), Some("Be quick."));
        assert_eq!(cfg.executor.max_turns, 4);
    }

    #[test]
    fn register_tools_adds_script_tools() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = seed_agent(
            temp.path(),
            "scripted",
            "---\nname: scripted\ntools: [probe:probe.sh:cli]\n---\nprompt",
        );
        fs::write(dir.join("probe.sh"), "#!/bin/sh\necho probe\n").expect("script");

        let defs = load_agent_defs(temp.path()).expect("load");
        let mut registry = ToolRegistry::new();
        defs[0].register_tools(&mut registry);
        assert!(registry.get("probe").is_some());
        assert_eq!(registry.definitions().len(), 1);
    }
}
