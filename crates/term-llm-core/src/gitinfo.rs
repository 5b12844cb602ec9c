use std::path::{Path, PathBuf};

/// The repository triple the rest of the pipeline consumes. Deeper git
/// introspection (branches, status, remotes) is deliberately out of scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitInfo {
    pub is_repo: bool,
    pub root: Option<PathBuf>,
    pub name: Option<String>,
}

/// Walk up from `start` looking for a `.git` entry (directory or worktree
/// pointer file).
pub fn detect_git_info(start: &Path) -> GitInfo {
    let start = start
        .canonicalize()
        .unwrap_or_else(|_| start.to_path_buf());
    let mut dir = Some(start.as_path());
    while let Some(current) = dir {
        if current.join(".git").exists() {
            let name = current
                .file_name()
                .map(|n| n.to_string_lossy().to_string());
            return GitInfo {
                is_repo: true,
                root: Some(current.to_path_buf()),
                name,
            };
        }
        dir = current.parent();
    }
    GitInfo::default()
}
