//! Full passes over the pipeline: streamed directives against seeded
//! files on disk, resolved through the working set and committed through
//! the atomic writer.

use std::sync::Arc;
use term_llm_core::{CancelToken, ChatMessage};
use term_llm_exec::{EditExecutor, ExecutorConfig, WorkingSet, commit_changes};
use term_llm_testkit::{ScriptedProvider, TempWorkspace, chunked_text};

fn load(workspace: &TempWorkspace, rels: &[&str]) -> WorkingSet {
    rels.iter()
        .map(|rel| {
            let path = workspace.root().join(rel);
            let content = std::fs::read_to_string(&path).expect("seeded file");
            (path, content)
        })
        .collect()
}

fn run_stream(stream: &str, files: WorkingSet) -> WorkingSet {
    let provider = Arc::new(ScriptedProvider::text_once(stream, 17));
    let executor = EditExecutor::new(provider, ExecutorConfig::default());
    executor
        .run(
            vec![ChatMessage::user("apply")],
            files,
            &CancelToken::new(),
        )
        .expect("run")
        .files
}

#[test]
fn streamed_search_replace_commits_to_disk() {
    let workspace = TempWorkspace::new();
    workspace.seed("a.txt", "hello\n");
    let base = load(&workspace, &["a.txt"]);

    // The stream names the file by basename; resolution finds the
    // absolute working-set entry.
    let stream = "[FILE: a.txt]\n<<<<<<< SEARCH\nhello\n=======\nworld\n>>>>>>> REPLACE\n[/FILE]\n";
    let updated = run_stream(stream, base.clone());

    let changed = commit_changes(&updated, &base).expect("commit");
    assert_eq!(changed.len(), 1);
    assert_eq!(workspace.read("a.txt"), "world\n");
    // The writer's advisory lock is cleaned up after the commit.
    assert!(!workspace.root().join("a.txt.lock").exists());
}

#[test]
fn multi_file_stream_edits_each_target() {
    let workspace = TempWorkspace::new();
    workspace.seed("src/one.rs", "fn one() {}\n");
    workspace.seed("src/two.rs", "fn two() {}\n");
    let base = load(&workspace, &["src/one.rs", "src/two.rs"]);

    let stream = "\
[FILE: src/one.rs]\n<<<<<<< SEARCH\nfn one() {}\n=======\nfn one() { run(); }\n>>>>>>> REPLACE\n[/FILE]\n\
[FILE: src/two.rs]\n<<<<<<< SEARCH\nfn two() {}\n=======\nfn two() { run(); }\n>>>>>>> REPLACE\n[/FILE]\n";
    let updated = run_stream(stream, base.clone());

    let changed = commit_changes(&updated, &base).expect("commit");
    assert_eq!(changed.len(), 2);
    assert_eq!(workspace.read("src/one.rs"), "fn one() { run(); }\n");
    assert_eq!(workspace.read("src/two.rs"), "fn two() { run(); }\n");
}

#[test]
fn diff_stream_creates_a_new_file() {
    let workspace = TempWorkspace::new();
    let new_path = workspace.root().join("fresh.txt");
    let stream = format!(
        "--- /dev/null\n+++ {}\n@@ -0,0 +1,2 @@\n+first line\n+second line\n[/FILE]\n",
        new_path.display()
    );
    let updated = run_stream(&stream, WorkingSet::new());

    let changed = commit_changes(&updated, &WorkingSet::new()).expect("commit");
    assert_eq!(changed, vec![new_path]);
    assert_eq!(workspace.read("fresh.txt"), "first line\nsecond line\n");
}

#[test]
fn failed_search_retries_and_then_commits() {
    let workspace = TempWorkspace::new();
    workspace.seed("config.toml", "timeout = 30\nretries = 3\n");
    let base = load(&workspace, &["config.toml"]);

    let bad = "[FILE: config.toml]\n<<<<<<< SEARCH\ntimeout = 99\n=======\ntimeout = 60\n>>>>>>> REPLACE\n[/FILE]\n";
    let good = "[FILE: config.toml]\n<<<<<<< SEARCH\ntimeout = 30\n=======\ntimeout = 60\n>>>>>>> REPLACE\n[/FILE]\n";
    let provider = Arc::new(ScriptedProvider::new(vec![
        chunked_text(bad, 11),
        chunked_text(good, 11),
    ]));
    let executor = EditExecutor::new(provider.clone(), ExecutorConfig::default());
    let outcome = executor
        .run(
            vec![ChatMessage::user("bump the timeout")],
            base.clone(),
            &CancelToken::new(),
        )
        .expect("run");
    assert_eq!(outcome.attempts, 2);

    commit_changes(&outcome.files, &base).expect("commit");
    assert_eq!(workspace.read("config.toml"), "timeout = 60\nretries = 3\n");

    // The retry prompt quoted the failed search against the real file.
    let requests = provider.requests.lock().expect("requests");
    let ChatMessage::User { content } = requests[1].messages.last().expect("retry prompt") else {
        panic!("expected retry prompt");
    };
    assert!(content.contains("timeout = 99"));
    assert!(content.contains("1 | timeout = 30"));
}

#[test]
fn elided_diff_rewrites_a_function_signature() {
    let workspace = TempWorkspace::new();
    workspace.seed(
        "lib.go",
        "func process(items []Item) {\n\tfor _, item := range items {\n\t\thandle(item)\n\t}\n}\n",
    );
    let base = load(&workspace, &["lib.go"]);
    let path = workspace.root().join("lib.go");
    let stream = format!(
        "--- {p}\n+++ {p}\n@@ @@\n-func process(items []Item) {{\n+func process(ctx Context, items []Item) {{\n...\n }}\n[/FILE]\n",
        p = path.display()
    );
    let updated = run_stream(&stream, base.clone());

    commit_changes(&updated, &base).expect("commit");
    let content = workspace.read("lib.go");
    assert!(content.starts_with("func process(ctx Context, items []Item) {"));
    assert!(content.contains("handle(item)"));
    assert!(content.ends_with("}\n"));
}
