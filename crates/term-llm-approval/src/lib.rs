use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once, RwLock};

mod store;

pub use store::{ProjectApprovals, ProjectStore, default_store_dir, repo_id};

/// Outcome of an approval check or prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalDecision {
    ProceedOnce,
    ProceedAlways,
    ProceedAlwaysAndSave,
    Cancel,
}

impl ApprovalDecision {
    pub fn is_always(&self) -> bool {
        matches!(self, Self::ProceedAlways | Self::ProceedAlwaysAndSave)
    }

    pub fn allows(&self) -> bool {
        *self != Self::Cancel
    }
}

/// Request handed to the legacy prompt form.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub tool_name: String,
    pub target: String,
    pub is_write: bool,
    pub is_shell: bool,
}

/// Structured result from the new prompt form.
#[derive(Debug, Clone, Default)]
pub struct ApprovalResult {
    pub choice: Option<ApprovalDecision>,
    /// Directory scope the user chose for a path approval.
    pub path: Option<String>,
    /// Pattern the user chose for a shell approval.
    pub pattern: Option<String>,
    pub save_to_repo: bool,
    pub cancelled: bool,
}

/// New-form prompt UI. Exactly one of this or the legacy callback should
/// be configured; the legacy form is consulted only when this is absent.
pub trait ApprovalUi: Send + Sync {
    fn request(&self, target: &str, is_write: bool, is_shell: bool) -> ApprovalResult;
}

pub type LegacyUi = dyn Fn(&ApprovalRequest) -> (ApprovalDecision, String) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval manager parent chain would form a cycle")]
    ParentCycle,
}

/// Session pattern matching: `*` matches everything, the empty pattern
/// matches nothing, a trailing `*` is a prefix match, anything else is
/// exact.
pub fn match_pattern(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern.is_empty() {
        return false;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => value == pattern,
    }
}

/// Process-start allowlist (tier 1). Paths are directory prefixes; shell
/// entries are glob patterns.
#[derive(Debug, Clone, Default)]
pub struct PreApproved {
    pub read_dirs: Vec<PathBuf>,
    pub write_dirs: Vec<PathBuf>,
    pub shell_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ApprovalConfig {
    pub preapproved: PreApproved,
    pub repo_root: Option<PathBuf>,
    /// Short-circuit every check to `ProceedOnce`; a one-time warning goes
    /// to stderr.
    pub yolo: bool,
    /// Environment variable names whose presence auto-approves instead of
    /// prompting (non-interactive runs).
    pub auto_run_envs: Vec<String>,
}

struct Inner {
    cfg: ApprovalConfig,
    session_dirs: RwLock<HashMap<PathBuf, ApprovalDecision>>,
    session_shell: RwLock<Vec<String>>,
    store: RwLock<Option<Arc<ProjectStore>>>,
    ui: RwLock<Option<Arc<dyn ApprovalUi>>>,
    legacy_ui: RwLock<Option<Arc<LegacyUi>>>,
    parent: RwLock<Option<ApprovalManager>>,
    prompt_lock: Arc<Mutex<()>>,
    yolo_warned: Once,
}

/// Mediates every filesystem-touching or shell-executing tool call.
///
/// Tiers are checked in order: pre-approved allowlist, session caches
/// (walking the parent chain), persisted project approvals; all three
/// miss, the user is prompted. A single prompt mutex, shared with every
/// manager in the parent chain, serializes prompts across concurrent
/// tool calls, and all tiers are re-checked after acquiring it.
#[derive(Clone)]
pub struct ApprovalManager {
    inner: Arc<Inner>,
}

impl ApprovalManager {
    pub fn new(cfg: ApprovalConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                session_dirs: RwLock::new(HashMap::new()),
                session_shell: RwLock::new(Vec::new()),
                store: RwLock::new(None),
                ui: RwLock::new(None),
                legacy_ui: RwLock::new(None),
                parent: RwLock::new(None),
                prompt_lock: Arc::new(Mutex::new(())),
                yolo_warned: Once::new(),
            }),
        }
    }

    pub fn set_store(&self, store: Arc<ProjectStore>) {
        *self.inner.store.write().expect("store slot") = Some(store);
    }

    pub fn set_ui(&self, ui: Arc<dyn ApprovalUi>) {
        *self.inner.ui.write().expect("ui slot") = Some(ui);
    }

    pub fn set_legacy_ui(&self, ui: Arc<LegacyUi>) {
        *self.inner.legacy_ui.write().expect("legacy ui slot") = Some(ui);
    }

    /// Link this manager under `parent`. Cycles are rejected here, never
    /// discovered at lookup time.
    pub fn set_parent(&self, parent: &ApprovalManager) -> Result<(), ApprovalError> {
        let mut walk = Some(parent.clone());
        while let Some(manager) = walk {
            if Arc::ptr_eq(&manager.inner, &self.inner) {
                return Err(ApprovalError::ParentCycle);
            }
            walk = manager.parent();
        }
        *self.inner.parent.write().expect("parent slot") = Some(parent.clone());
        Ok(())
    }

    fn parent(&self) -> Option<ApprovalManager> {
        self.inner.parent.read().expect("parent slot").clone()
    }

    fn root(&self) -> ApprovalManager {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// The prompt mutex lives at the root of the parent chain so exactly
    /// one prompt is visible at a time across every inherited manager.
    pub fn prompt_mutex(&self) -> Arc<Mutex<()>> {
        self.root().inner.prompt_lock.clone()
    }

    // ── Path approvals ───────────────────────────────────────────────────────

    pub fn approve_path(&self, path: &Path, write: bool) -> ApprovalDecision {
        let abs = absolute(path);
        if let Some(decision) = self.tiered_path_decision(&abs, write) {
            return decision;
        }
        let lock = self.prompt_mutex();
        let _guard = lock.lock().expect("prompt lock");
        // A sibling may have cached a matching approval while this call
        // queued for the prompt.
        if let Some(decision) = self.tiered_path_decision(&abs, write) {
            return decision;
        }
        self.prompt_for_path(&abs, write)
    }

    fn tiered_path_decision(&self, abs: &Path, write: bool) -> Option<ApprovalDecision> {
        if self.yolo() {
            return Some(ApprovalDecision::ProceedOnce);
        }

        // Tier 1: process-start allowlist.
        let pre = &self.inner.cfg.preapproved;
        let allowed = if write {
            dir_covers(&pre.write_dirs, abs)
        } else {
            dir_covers(&pre.read_dirs, abs) || dir_covers(&pre.write_dirs, abs)
        };
        if allowed {
            return Some(ApprovalDecision::ProceedOnce);
        }

        // Tier 2: session caches, walking the parent chain. Approvals are
        // directory-scoped and tool-agnostic, so the write flag does not
        // narrow the lookup.
        if let Some(decision) = self.session_dir_lookup(abs) {
            return Some(decision);
        }

        // Tier 3: persisted project approvals.
        if let Some(record) = self.project_record()
            && record.covers_path(abs, write)
        {
            return Some(ApprovalDecision::ProceedAlways);
        }

        if self.auto_run_env_present() {
            return Some(ApprovalDecision::ProceedOnce);
        }
        None
    }

    fn session_dir_lookup(&self, abs: &Path) -> Option<ApprovalDecision> {
        let mut manager = Some(self.clone());
        while let Some(current) = manager {
            let snapshot: HashMap<PathBuf, ApprovalDecision> = current
                .inner
                .session_dirs
                .read()
                .expect("session dirs")
                .clone();
            for ancestor in abs.ancestors() {
                if let Some(decision) = snapshot.get(ancestor)
                    && decision.is_always()
                {
                    return Some(*decision);
                }
            }
            manager = current.parent();
        }
        None
    }

    fn prompt_for_path(&self, abs: &Path, write: bool) -> ApprovalDecision {
        let target = abs.to_string_lossy().to_string();
        let Some(result) = self.run_ui(&target, write, false, "file") else {
            return ApprovalDecision::Cancel;
        };
        if result.cancelled {
            return ApprovalDecision::Cancel;
        }
        let choice = result.choice.unwrap_or(ApprovalDecision::Cancel);
        match choice {
            ApprovalDecision::Cancel => ApprovalDecision::Cancel,
            ApprovalDecision::ProceedOnce => ApprovalDecision::ProceedOnce,
            ApprovalDecision::ProceedAlways | ApprovalDecision::ProceedAlwaysAndSave => {
                let scope = result
                    .path
                    .as_deref()
                    .map(|p| scope_dir(Path::new(p)))
                    .unwrap_or_else(|| scope_dir(abs));
                self.root()
                    .inner
                    .session_dirs
                    .write()
                    .expect("session dirs")
                    .insert(scope.clone(), choice);
                if choice == ApprovalDecision::ProceedAlwaysAndSave || result.save_to_repo {
                    self.persist_path(&scope, write);
                }
                choice
            }
        }
    }

    fn persist_path(&self, scope: &Path, write: bool) {
        let Some((store, root)) = self.store_and_root() else {
            return;
        };
        let scope_str = scope.to_string_lossy().to_string();
        let _ = store.update(&root, |record| {
            if scope == root {
                if write {
                    record.write_approved = true;
                } else {
                    record.read_approved = true;
                }
            } else if !record.approved_paths.contains(&scope_str) {
                record.approved_paths.push(scope_str.clone());
            }
        });
    }

    // ── Shell approvals ──────────────────────────────────────────────────────

    pub fn approve_shell(&self, command: &str) -> ApprovalDecision {
        if let Some(decision) = self.tiered_shell_decision(command) {
            return decision;
        }
        let lock = self.prompt_mutex();
        let _guard = lock.lock().expect("prompt lock");
        if let Some(decision) = self.tiered_shell_decision(command) {
            return decision;
        }
        self.prompt_for_shell(command)
    }

    fn tiered_shell_decision(&self, command: &str) -> Option<ApprovalDecision> {
        if self.yolo() {
            return Some(ApprovalDecision::ProceedOnce);
        }
        let pre = &self.inner.cfg.preapproved;
        let glob_hit = pre.shell_patterns.iter().any(|pattern| {
            glob::Pattern::new(pattern)
                .map(|p| p.matches(command))
                .unwrap_or(false)
        });
        if glob_hit {
            return Some(ApprovalDecision::ProceedOnce);
        }

        let mut manager = Some(self.clone());
        while let Some(current) = manager {
            let patterns: Vec<String> = current
                .inner
                .session_shell
                .read()
                .expect("session shell")
                .clone();
            if patterns
                .iter()
                .any(|pattern| match_pattern(pattern, command))
            {
                return Some(ApprovalDecision::ProceedAlways);
            }
            manager = current.parent();
        }

        if let Some(record) = self.project_record()
            && record.covers_shell(command)
        {
            return Some(ApprovalDecision::ProceedAlways);
        }

        if self.auto_run_env_present() {
            return Some(ApprovalDecision::ProceedOnce);
        }
        None
    }

    fn prompt_for_shell(&self, command: &str) -> ApprovalDecision {
        let Some(result) = self.run_ui(command, false, true, "shell") else {
            return ApprovalDecision::Cancel;
        };
        if result.cancelled {
            return ApprovalDecision::Cancel;
        }
        let choice = result.choice.unwrap_or(ApprovalDecision::Cancel);
        match choice {
            ApprovalDecision::Cancel => ApprovalDecision::Cancel,
            ApprovalDecision::ProceedOnce => ApprovalDecision::ProceedOnce,
            ApprovalDecision::ProceedAlways | ApprovalDecision::ProceedAlwaysAndSave => {
                let pattern = result
                    .pattern
                    .clone()
                    .unwrap_or_else(|| command.to_string());
                self.root()
                    .inner
                    .session_shell
                    .write()
                    .expect("session shell")
                    .push(pattern.clone());
                if choice == ApprovalDecision::ProceedAlwaysAndSave || result.save_to_repo {
                    if let Some((store, root)) = self.store_and_root() {
                        let _ = store.update(&root, |record| {
                            if !record.shell_patterns.contains(&pattern) {
                                record.shell_patterns.push(pattern.clone());
                            }
                        });
                    }
                }
                choice
            }
        }
    }

    // ── Shared plumbing ──────────────────────────────────────────────────────

    fn yolo(&self) -> bool {
        if !self.inner.cfg.yolo {
            return false;
        }
        self.inner.yolo_warned.call_once(|| {
            eprintln!("[term-llm WARN] YOLO mode enabled: all approval checks are bypassed");
        });
        true
    }

    fn auto_run_env_present(&self) -> bool {
        self.inner
            .cfg
            .auto_run_envs
            .iter()
            .any(|name| std::env::var_os(name).is_some())
    }

    fn project_record(&self) -> Option<ProjectApprovals> {
        let (store, root) = self.store_and_root()?;
        Some(store.load(&root))
    }

    fn store_and_root(&self) -> Option<(Arc<ProjectStore>, PathBuf)> {
        let mut manager = Some(self.clone());
        while let Some(current) = manager {
            let store = current.inner.store.read().expect("store slot").clone();
            if let Some(store) = store {
                let root = current.inner.cfg.repo_root.clone()?;
                return Some((store, root));
            }
            manager = current.parent();
        }
        None
    }

    /// Resolve the prompt callback by walking the parent chain; the new
    /// form wins over the legacy pair form on whichever manager carries
    /// one.
    fn run_ui(
        &self,
        target: &str,
        is_write: bool,
        is_shell: bool,
        tool_name: &str,
    ) -> Option<ApprovalResult> {
        let mut manager = Some(self.clone());
        while let Some(current) = manager {
            let ui = current.inner.ui.read().expect("ui slot").clone();
            if let Some(ui) = ui {
                return Some(ui.request(target, is_write, is_shell));
            }
            let legacy = current.inner.legacy_ui.read().expect("legacy ui slot").clone();
            if let Some(legacy) = legacy {
                let request = ApprovalRequest {
                    tool_name: tool_name.to_string(),
                    target: target.to_string(),
                    is_write,
                    is_shell,
                };
                let (decision, scope) = legacy(&request);
                return Some(ApprovalResult {
                    choice: Some(decision),
                    path: (!is_shell && !scope.is_empty()).then(|| scope.clone()),
                    pattern: (is_shell && !scope.is_empty()).then_some(scope),
                    save_to_repo: decision == ApprovalDecision::ProceedAlwaysAndSave,
                    cancelled: decision == ApprovalDecision::Cancel,
                });
            }
            manager = current.parent();
        }
        None
    }
}

/// Approvals are always directory-scoped: a file is recorded as its
/// containing directory.
fn scope_dir(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.to_path_buf()
    } else {
        path.parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(path)
            .to_path_buf()
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn dir_covers(dirs: &[PathBuf], path: &Path) -> bool {
    dirs.iter().any(|dir| path.starts_with(absolute(dir)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    struct CountingUi {
        prompts: AtomicUsize,
        result: ApprovalResult,
        delay: Duration,
    }

    impl CountingUi {
        fn approving(choice: ApprovalDecision) -> Self {
            Self {
                prompts: AtomicUsize::new(0),
                result: ApprovalResult {
                    choice: Some(choice),
                    ..ApprovalResult::default()
                },
                delay: Duration::ZERO,
            }
        }
    }

    impl ApprovalUi for CountingUi {
        fn request(&self, _target: &str, _is_write: bool, _is_shell: bool) -> ApprovalResult {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.result.clone()
        }
    }

    fn manager() -> ApprovalManager {
        ApprovalManager::new(ApprovalConfig::default())
    }

    // ── match_pattern boundaries ──

    #[test]
    fn star_matches_everything_and_empty_matches_nothing() {
        for value in ["", "ls", "rm -rf /", "cargo test"] {
            assert!(match_pattern("*", value));
            assert!(!match_pattern("", value));
        }
    }

    #[test]
    fn trailing_star_is_prefix_otherwise_exact() {
        assert!(match_pattern("git *", "git status"));
        assert!(!match_pattern("git *", "gif status"));
        assert!(match_pattern("ls", "ls"));
        assert!(!match_pattern("ls", "ls -la"));
    }

    // ── Tier 1 ──

    #[test]
    fn preapproved_read_dir_yields_proceed_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mgr = ApprovalManager::new(ApprovalConfig {
            preapproved: PreApproved {
                read_dirs: vec![temp.path().to_path_buf()],
                ..PreApproved::default()
            },
            ..ApprovalConfig::default()
        });
        let inside = temp.path().join("src/main.rs");
        assert_eq!(
            mgr.approve_path(&inside, false),
            ApprovalDecision::ProceedOnce
        );
        // Write is not covered by a read-only dir; with no UI, it denies.
        assert_eq!(mgr.approve_path(&inside, true), ApprovalDecision::Cancel);
    }

    #[test]
    fn preapproved_write_dir_also_satisfies_reads() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mgr = ApprovalManager::new(ApprovalConfig {
            preapproved: PreApproved {
                write_dirs: vec![temp.path().to_path_buf()],
                ..PreApproved::default()
            },
            ..ApprovalConfig::default()
        });
        let inside = temp.path().join("out.txt");
        assert_eq!(
            mgr.approve_path(&inside, true),
            ApprovalDecision::ProceedOnce
        );
        assert_eq!(
            mgr.approve_path(&inside, false),
            ApprovalDecision::ProceedOnce
        );
    }

    #[test]
    fn preapproved_shell_glob_matches() {
        let mgr = ApprovalManager::new(ApprovalConfig {
            preapproved: PreApproved {
                shell_patterns: vec!["cargo *".to_string()],
                ..PreApproved::default()
            },
            ..ApprovalConfig::default()
        });
        assert_eq!(
            mgr.approve_shell("cargo test"),
            ApprovalDecision::ProceedOnce
        );
        assert_eq!(mgr.approve_shell("rm -rf /"), ApprovalDecision::Cancel);
    }

    // ── Prompting and tier 2 ──

    #[test]
    fn approving_a_file_caches_its_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        std::fs::write(temp.path().join("src/a.rs"), "x").expect("seed");

        let mgr = manager();
        let ui = Arc::new(CountingUi::approving(ApprovalDecision::ProceedAlways));
        mgr.set_ui(ui.clone());

        let first = mgr.approve_path(&temp.path().join("src/a.rs"), true);
        assert_eq!(first, ApprovalDecision::ProceedAlways);
        assert_eq!(ui.prompts.load(Ordering::SeqCst), 1);

        // Sibling file in the same directory: served from the session
        // cache, no second prompt.
        let second = mgr.approve_path(&temp.path().join("src/b.rs"), false);
        assert!(second.is_always());
        assert_eq!(ui.prompts.load(Ordering::SeqCst), 1);

        // Nested path under the approved directory is covered too.
        let nested = mgr.approve_path(&temp.path().join("src/deep/c.rs"), true);
        assert!(nested.is_always());
        assert_eq!(ui.prompts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn session_dir_approval_is_tool_agnostic() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mgr = manager();
        mgr.set_ui(Arc::new(CountingUi::approving(
            ApprovalDecision::ProceedAlways,
        )));

        // Approve for read; a later write check under the same directory
        // hits the session cache.
        assert!(mgr.approve_path(&temp.path().join("data.txt"), false).allows());
        let write = mgr.approve_path(&temp.path().join("other.txt"), true);
        assert!(write.is_always());
    }

    #[test]
    fn proceed_once_is_not_cached() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mgr = manager();
        let ui = Arc::new(CountingUi::approving(ApprovalDecision::ProceedOnce));
        mgr.set_ui(ui.clone());

        mgr.approve_path(&temp.path().join("a.txt"), false);
        mgr.approve_path(&temp.path().join("b.txt"), false);
        assert_eq!(ui.prompts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancelled_prompt_denies() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mgr = manager();
        mgr.set_ui(Arc::new(CountingUi {
            prompts: AtomicUsize::new(0),
            result: ApprovalResult {
                cancelled: true,
                ..ApprovalResult::default()
            },
            delay: Duration::ZERO,
        }));
        assert_eq!(
            mgr.approve_path(&temp.path().join("a.txt"), true),
            ApprovalDecision::Cancel
        );
    }

    #[test]
    fn shell_session_pattern_from_prompt_is_reused() {
        let mgr = manager();
        let ui = Arc::new(CountingUi {
            prompts: AtomicUsize::new(0),
            result: ApprovalResult {
                choice: Some(ApprovalDecision::ProceedAlways),
                pattern: Some("npm run *".to_string()),
                ..ApprovalResult::default()
            },
            delay: Duration::ZERO,
        });
        mgr.set_ui(ui.clone());

        assert!(mgr.approve_shell("npm run build").allows());
        assert!(mgr.approve_shell("npm run test").is_always());
        assert_eq!(ui.prompts.load(Ordering::SeqCst), 1);
    }

    // ── Legacy prompt form ──

    #[test]
    fn legacy_prompt_is_used_when_new_form_absent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let scope = temp.path().to_string_lossy().to_string();
        let mgr = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        mgr.set_legacy_ui(Arc::new(move |req: &ApprovalRequest| {
            calls_in.fetch_add(1, Ordering::SeqCst);
            assert!(!req.is_shell);
            (ApprovalDecision::ProceedAlways, scope.clone())
        }));

        assert!(mgr.approve_path(&temp.path().join("x.txt"), true).allows());
        assert!(mgr.approve_path(&temp.path().join("y.txt"), true).is_always());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // ── Tier 3 ──

    #[test]
    fn persisted_record_approves_without_prompting() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        std::fs::create_dir_all(&repo).expect("repo");
        let store = Arc::new(ProjectStore::new(temp.path().join("config")));
        store
            .update(&repo, |record| record.write_approved = true)
            .expect("seed");

        let mgr = ApprovalManager::new(ApprovalConfig {
            repo_root: Some(repo.clone()),
            ..ApprovalConfig::default()
        });
        mgr.set_store(store);
        assert_eq!(
            mgr.approve_path(&repo.join("src/lib.rs"), true),
            ApprovalDecision::ProceedAlways
        );
    }

    #[test]
    fn save_to_repo_persists_the_scope() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        std::fs::create_dir_all(repo.join("src")).expect("repo");
        let store = Arc::new(ProjectStore::new(temp.path().join("config")));

        let mgr = ApprovalManager::new(ApprovalConfig {
            repo_root: Some(repo.clone()),
            ..ApprovalConfig::default()
        });
        mgr.set_store(store.clone());
        mgr.set_ui(Arc::new(CountingUi::approving(
            ApprovalDecision::ProceedAlwaysAndSave,
        )));

        mgr.approve_path(&repo.join("src/new.rs"), true);
        let record = store.load(&repo);
        let src = repo.join("src").to_string_lossy().to_string();
        assert!(record.approved_paths.contains(&src));

        // A fresh manager with the same store sees the persisted approval.
        let later = ApprovalManager::new(ApprovalConfig {
            repo_root: Some(repo.clone()),
            ..ApprovalConfig::default()
        });
        later.set_store(store);
        assert_eq!(
            later.approve_path(&repo.join("src/another.rs"), true),
            ApprovalDecision::ProceedAlways
        );
    }

    // ── Prompt serialization (scenario: concurrent requests, one prompt) ──

    #[test]
    fn concurrent_requests_for_same_dir_prompt_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mgr = manager();
        let ui = Arc::new(CountingUi {
            prompts: AtomicUsize::new(0),
            result: ApprovalResult {
                choice: Some(ApprovalDecision::ProceedAlways),
                ..ApprovalResult::default()
            },
            delay: Duration::from_millis(50),
        });
        mgr.set_ui(ui.clone());

        let dir = temp.path().to_path_buf();
        let handles: Vec<_> = (0..2)
            .map(|i| {
                let mgr = mgr.clone();
                let path = dir.join(format!("file{i}.txt"));
                thread::spawn(move || mgr.approve_path(&path, true))
            })
            .collect();

        for handle in handles {
            assert!(handle.join().expect("join").is_always());
        }
        assert_eq!(ui.prompts.load(Ordering::SeqCst), 1);
    }

    // ── Parent inheritance ──

    #[test]
    fn child_sees_parent_session_and_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let parent = manager();
        let ui = Arc::new(CountingUi::approving(ApprovalDecision::ProceedAlways));
        parent.set_ui(ui.clone());

        let child = manager();
        child.set_parent(&parent).expect("set parent");

        // Child prompts through the parent's callback and records at the
        // root, so the parent (and any sibling) sees the approval.
        assert!(child.approve_path(&temp.path().join("a.txt"), true).allows());
        assert_eq!(ui.prompts.load(Ordering::SeqCst), 1);
        assert!(
            parent
                .approve_path(&temp.path().join("b.txt"), true)
                .is_always()
        );
        assert_eq!(ui.prompts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parent_cycles_are_rejected_at_set_time() {
        let a = manager();
        let b = manager();
        let c = manager();
        b.set_parent(&a).expect("b under a");
        c.set_parent(&b).expect("c under b");
        assert_eq!(a.set_parent(&c), Err(ApprovalError::ParentCycle));
        assert_eq!(a.set_parent(&a), Err(ApprovalError::ParentCycle));
    }

    #[test]
    fn prompt_mutex_is_shared_through_the_chain() {
        let parent = manager();
        let child = manager();
        child.set_parent(&parent).expect("set parent");
        assert!(Arc::ptr_eq(&parent.prompt_mutex(), &child.prompt_mutex()));
    }

    // ── YOLO and auto-run ──

    #[test]
    fn yolo_short_circuits_everything() {
        let mgr = ApprovalManager::new(ApprovalConfig {
            yolo: true,
            ..ApprovalConfig::default()
        });
        assert_eq!(
            mgr.approve_path(Path::new("/anywhere/at/all"), true),
            ApprovalDecision::ProceedOnce
        );
        assert_eq!(
            mgr.approve_shell("rm -rf --no-preserve-root /"),
            ApprovalDecision::ProceedOnce
        );
    }

    #[test]
    fn auto_run_env_approves_without_prompting() {
        let mgr = ApprovalManager::new(ApprovalConfig {
            // PATH is always present in test environments.
            auto_run_envs: vec!["PATH".to_string()],
            ..ApprovalConfig::default()
        });
        assert_eq!(
            mgr.approve_shell("echo hi"),
            ApprovalDecision::ProceedOnce
        );

        let unset = ApprovalManager::new(ApprovalConfig {
            auto_run_envs: vec!["TERM_LLM_SURELY_UNSET_VAR".to_string()],
            ..ApprovalConfig::default()
        });
        assert_eq!(unset.approve_shell("echo hi"), ApprovalDecision::Cancel);
    }
}
