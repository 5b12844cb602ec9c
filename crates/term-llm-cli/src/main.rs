use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::collections::VecDeque;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use term_llm_approval::{ProjectStore, default_store_dir};
use term_llm_core::{
    CancelToken, ChatMessage, EventStream, Observer, Provider, StreamEvent, StreamRequest,
    detect_git_info,
};
use term_llm_diff::parse_patch_path;
use term_llm_exec::{EditExecutor, ExecutorConfig, WorkingSet, commit_changes};

#[derive(Parser)]
#[command(
    name = "term-llm",
    about = "Core execution substrate for an LLM-driven terminal agent",
    version
)]
struct Cli {
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply a recorded LLM output stream to the workspace.
    Apply {
        /// Stream file to replay; `-` reads stdin.
        #[arg(default_value = "-")]
        input: String,
        /// Workspace root (defaults to the current directory).
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Extra files to load into the working set; files named by the
        /// stream itself are loaded automatically.
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        /// Parse and apply in memory, but do not write anything back.
        #[arg(long)]
        dry_run: bool,
    },
    /// Inspect or reset the persisted per-repository approvals.
    Approvals {
        #[command(subcommand)]
        action: ApprovalsAction,
    },
}

#[derive(Subcommand)]
enum ApprovalsAction {
    /// Print the approval record for the current repository.
    Show,
    /// Delete the approval record for the current repository.
    Clear,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Apply {
            input,
            workspace,
            files,
            dry_run,
        } => apply(&input, workspace, files, dry_run, cli.verbose),
        Command::Approvals { action } => approvals(action),
    }
}

fn apply(
    input: &str,
    workspace: Option<PathBuf>,
    extra_files: Vec<PathBuf>,
    dry_run: bool,
    verbose: bool,
) -> Result<()> {
    let workspace = match workspace {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let stream_text = read_input(input)?;
    let mut observer = Observer::new(&workspace)?;
    observer.set_verbose(verbose);

    let mut working = WorkingSet::new();
    for rel in stream_paths(&stream_text) {
        let path = workspace.join(&rel);
        if let Ok(content) = std::fs::read_to_string(&path) {
            working.insert(path, content);
        }
    }
    for path in extra_files {
        let path = if path.is_absolute() {
            path
        } else {
            workspace.join(path)
        };
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("load {}", path.display()))?;
        working.insert(path, content);
    }

    let base = working.clone();
    let provider = Arc::new(ReplayProvider::new(&stream_text));
    // A replayed stream cannot be re-prompted, so a halt is final.
    let executor = EditExecutor::new(
        provider,
        ExecutorConfig {
            max_attempts: 1,
            ..ExecutorConfig::default()
        },
    );
    observer.log(&format!("apply: {} file(s) in working set", working.len()));
    let outcome = executor.run(
        vec![ChatMessage::user("replayed stream")],
        working,
        &CancelToken::new(),
    )?;

    for (path, level) in &outcome.match_levels {
        observer.verbose_log(&format!("{path}: matched at level {level:?}"));
    }
    for warning in &outcome.warnings {
        observer.warn_log(warning);
    }
    if let Some(about) = &outcome.about {
        println!("{about}");
    }

    if dry_run {
        println!("dry run: {} edit(s) parsed, nothing written", outcome.edits.len());
        return Ok(());
    }
    let changed = commit_changes(&outcome.files, &base)?;
    for path in &changed {
        println!("updated {}", path.display());
    }
    observer.log(&format!("apply: committed {} file(s)", changed.len()));
    Ok(())
}

fn approvals(action: ApprovalsAction) -> Result<()> {
    let cwd = std::env::current_dir().context("resolve current directory")?;
    let info = detect_git_info(&cwd);
    let root = info
        .root
        .ok_or_else(|| anyhow!("not inside a git repository"))?;
    let store = ProjectStore::new(default_store_dir());
    match action {
        ApprovalsAction::Show => {
            let record = store.load(&root);
            print!("{}", serde_yaml::to_string(&record)?);
        }
        ApprovalsAction::Clear => {
            store.clear(&root)?;
            println!("cleared approvals for {}", root.display());
        }
    }
    Ok(())
}

fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("read stream from stdin")?;
        Ok(text)
    } else {
        std::fs::read_to_string(input).with_context(|| format!("read stream file {input}"))
    }
}

/// Paths named by the stream's `[FILE: …]` sentinels and diff headers, so
/// the working set can be pre-loaded without the caller listing files.
fn stream_paths(text: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(inner) = trimmed
            .strip_prefix("[FILE:")
            .and_then(|rest| rest.strip_suffix(']'))
        {
            push_unique(&mut paths, inner.trim());
        } else if let Some(rest) = trimmed.strip_prefix("--- ")
            && !rest.starts_with('-')
            && let Some(path) = parse_patch_path(rest)
        {
            push_unique(&mut paths, &path);
        }
    }
    paths
}

fn push_unique(paths: &mut Vec<String>, path: &str) {
    if !path.is_empty() && !paths.iter().any(|existing| existing == path) {
        paths.push(path.to_string());
    }
}

/// Provider that replays one recorded assistant turn.
struct ReplayProvider {
    chunks: Mutex<VecDeque<Vec<StreamEvent>>>,
}

impl ReplayProvider {
    fn new(text: &str) -> Self {
        let chars: Vec<char> = text.chars().collect();
        let mut events: Vec<StreamEvent> = chars
            .chunks(512)
            .map(|chunk| StreamEvent::TextDelta(chunk.iter().collect()))
            .collect();
        events.push(StreamEvent::Done);
        Self {
            chunks: Mutex::new(VecDeque::from([events])),
        }
    }
}

impl Provider for ReplayProvider {
    fn stream(&self, _req: &StreamRequest) -> Result<Box<dyn EventStream>> {
        let events = self
            .chunks
            .lock()
            .expect("replay chunks")
            .pop_front()
            .ok_or_else(|| anyhow!("replayed stream already consumed"))?;
        Ok(Box::new(ReplayStream {
            events: events.into(),
        }))
    }
}

struct ReplayStream {
    events: VecDeque<StreamEvent>,
}

impl EventStream for ReplayStream {
    fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.pop_front()
    }

    fn close(&mut self) {
        self.events.clear();
    }
}
