use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::match_pattern;

/// Persisted per-repository approval record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectApprovals {
    pub repo_root: String,
    #[serde(default)]
    pub read_approved: bool,
    #[serde(default)]
    pub write_approved: bool,
    #[serde(default)]
    pub approved_paths: Vec<String>,
    #[serde(default)]
    pub shell_patterns: Vec<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProjectApprovals {
    /// Whether `path` is covered: repo-wide read/write approval, or any
    /// recorded directory containing it.
    pub fn covers_path(&self, path: &Path, write: bool) -> bool {
        let repo_wide = if write {
            self.write_approved
        } else {
            self.read_approved
        };
        if repo_wide && !self.repo_root.is_empty() && path.starts_with(&self.repo_root) {
            return true;
        }
        self.approved_paths
            .iter()
            .any(|approved| path.starts_with(approved))
    }

    pub fn covers_shell(&self, command: &str) -> bool {
        self.shell_patterns
            .iter()
            .any(|pattern| match_pattern(pattern, command))
    }
}

/// Stable identifier for a repository: the first 16 bytes of SHA-256 over
/// the absolute repo root, hex-encoded.
pub fn repo_id(root: &Path) -> String {
    let absolute = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
    let digest = Sha256::digest(absolute.to_string_lossy().as_bytes());
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

/// `$XDG_CONFIG_HOME/term-llm/projects`, falling back to
/// `$HOME/.config/term-llm/projects`.
pub fn default_store_dir() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("term-llm").join("projects")
}

/// On-disk store of per-repo approval records. Mutation is serialized
/// per-record; saves go through temp-file + rename so readers never see a
/// partial YAML document.
pub struct ProjectStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProjectStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn open_default() -> Self {
        Self::new(default_store_dir())
    }

    pub fn record_path(&self, repo_root: &Path) -> PathBuf {
        self.dir.join(format!("{}.yaml", repo_id(repo_root)))
    }

    /// Load the record for a repo, or a fresh default naming its root.
    pub fn load(&self, repo_root: &Path) -> ProjectApprovals {
        let path = self.record_path(repo_root);
        let Ok(raw) = fs::read_to_string(&path) else {
            return self.fresh(repo_root);
        };
        serde_yaml::from_str(&raw).unwrap_or_else(|_| self.fresh(repo_root))
    }

    fn fresh(&self, repo_root: &Path) -> ProjectApprovals {
        ProjectApprovals {
            repo_root: std::path::absolute(repo_root)
                .unwrap_or_else(|_| repo_root.to_path_buf())
                .to_string_lossy()
                .to_string(),
            ..ProjectApprovals::default()
        }
    }

    /// Load, mutate, stamp, and atomically save one record under its
    /// per-record mutex.
    pub fn update(
        &self,
        repo_root: &Path,
        mutate: impl FnOnce(&mut ProjectApprovals),
    ) -> Result<ProjectApprovals> {
        let lock = self.record_lock(repo_root);
        let _guard = lock.lock().expect("project record lock");

        let mut record = self.load(repo_root);
        mutate(&mut record);
        record.updated_at = Some(Utc::now());
        self.save(repo_root, &record)?;
        Ok(record)
    }

    pub fn clear(&self, repo_root: &Path) -> Result<()> {
        let lock = self.record_lock(repo_root);
        let _guard = lock.lock().expect("project record lock");
        let path = self.record_path(repo_root);
        if path.exists() {
            fs::remove_file(&path).context("remove approval record")?;
        }
        Ok(())
    }

    fn record_lock(&self, repo_root: &Path) -> Arc<Mutex<()>> {
        let id = repo_id(repo_root);
        let mut locks = self.locks.lock().expect("store lock registry");
        locks.entry(id).or_default().clone()
    }

    fn save(&self, repo_root: &Path, record: &ProjectApprovals) -> Result<()> {
        fs::create_dir_all(&self.dir).context("create approvals dir")?;
        let yaml = serde_yaml::to_string(record).context("serialize approvals")?;
        let mut temp =
            tempfile::NamedTempFile::new_in(&self.dir).context("create approvals temp file")?;
        temp.write_all(yaml.as_bytes())
            .context("write approvals temp file")?;
        temp.persist(self.record_path(repo_root))
            .context("persist approvals record")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_id_is_stable_32_hex_chars() {
        let a = repo_id(Path::new("/work/project"));
        let b = repo_id(Path::new("/work/project"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, repo_id(Path::new("/work/other")));
    }

    #[test]
    fn load_missing_record_yields_fresh_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ProjectStore::new(temp.path().join("projects"));
        let record = store.load(Path::new("/work/project"));
        assert!(!record.read_approved);
        assert!(record.approved_paths.is_empty());
        assert!(record.repo_root.ends_with("project"));
    }

    #[test]
    fn update_persists_and_reloads() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ProjectStore::new(temp.path().join("projects"));
        let repo = Path::new("/work/project");

        store
            .update(repo, |record| {
                record.write_approved = true;
                record.shell_patterns.push("cargo *".to_string());
            })
            .expect("update");

        let record = store.load(repo);
        assert!(record.write_approved);
        assert_eq!(record.shell_patterns, vec!["cargo *"]);
        assert!(record.updated_at.is_some());

        let on_disk = fs::read_to_string(store.record_path(repo)).expect("read yaml");
        assert!(on_disk.contains("write_approved: true"));
    }

    #[test]
    fn corrupt_record_falls_back_to_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ProjectStore::new(temp.path().join("projects"));
        let repo = Path::new("/work/project");
        fs::create_dir_all(temp.path().join("projects")).expect("dir");
        fs::write(store.record_path(repo), "{{{ not yaml").expect("corrupt");
        let record = store.load(repo);
        assert!(!record.read_approved);
    }

    #[test]
    fn clear_removes_the_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ProjectStore::new(temp.path().join("projects"));
        let repo = Path::new("/work/project");
        store
            .update(repo, |record| record.read_approved = true)
            .expect("update");
        assert!(store.record_path(repo).exists());
        store.clear(repo).expect("clear");
        assert!(!store.record_path(repo).exists());
    }

    #[test]
    fn covers_path_honors_repo_wide_and_listed_dirs() {
        let record = ProjectApprovals {
            repo_root: "/work/project".to_string(),
            read_approved: true,
            write_approved: false,
            approved_paths: vec!["/elsewhere/data".to_string()],
            shell_patterns: vec![],
            updated_at: None,
        };
        assert!(record.covers_path(Path::new("/work/project/src/main.rs"), false));
        assert!(!record.covers_path(Path::new("/work/project/src/main.rs"), true));
        assert!(record.covers_path(Path::new("/elsewhere/data/file.csv"), true));
        assert!(!record.covers_path(Path::new("/tmp/out.txt"), false));
    }

    #[test]
    fn covers_shell_uses_pattern_semantics() {
        let record = ProjectApprovals {
            shell_patterns: vec!["git status".to_string(), "cargo *".to_string()],
            ..ProjectApprovals::default()
        };
        assert!(record.covers_shell("git status"));
        assert!(!record.covers_shell("git push"));
        assert!(record.covers_shell("cargo test --all"));
    }
}
