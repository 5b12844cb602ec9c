use anyhow::{Result, anyhow};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use term_llm_core::{EventStream, Provider, StreamEvent, StreamRequest};

/// Provider that replays pre-scripted event sequences, one per `stream`
/// call, and records every request for assertions on retry prompts and
/// tool-result plumbing.
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    pub requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Single-turn provider streaming `text` in `chunk_size`-char pieces.
    pub fn text_once(text: &str, chunk_size: usize) -> Self {
        Self::new(vec![chunked_text(text, chunk_size)])
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }
}

impl Provider for ScriptedProvider {
    fn stream(&self, req: &StreamRequest) -> Result<Box<dyn EventStream>> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(req.clone());
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .ok_or_else(|| anyhow!("scripted provider exhausted"))?;
        Ok(Box::new(ScriptedStream {
            events: script.into(),
        }))
    }
}

struct ScriptedStream {
    events: VecDeque<StreamEvent>,
}

impl EventStream for ScriptedStream {
    fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.pop_front()
    }

    fn close(&mut self) {
        self.events.clear();
    }
}

/// Chop `text` into `TextDelta` chunks followed by `Done`, so parser
/// behavior is exercised across arbitrary chunk boundaries.
pub fn chunked_text(text: &str, chunk_size: usize) -> Vec<StreamEvent> {
    let chars: Vec<char> = text.chars().collect();
    let mut events: Vec<StreamEvent> = chars
        .chunks(chunk_size.max(1))
        .map(|chunk| StreamEvent::TextDelta(chunk.iter().collect()))
        .collect();
    events.push(StreamEvent::Done);
    events
}

/// Disposable workspace directory seeded with files.
pub struct TempWorkspace {
    dir: tempfile::TempDir,
}

impl TempWorkspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temp workspace"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn seed(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, content).expect("seed file");
        path
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.dir.path().join(rel)).expect("read seeded file")
    }
}

impl Default for TempWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
