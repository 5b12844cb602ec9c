use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Advisory lock on a path-adjacent `.lock` file. The target itself
/// cannot be locked because rename replaces its inode; the sibling lock
/// file survives the swap.
pub struct PathLock {
    file: File,
    lock_path: PathBuf,
}

impl PathLock {
    pub fn acquire(target: &Path) -> Result<Self> {
        let lock_path = lock_path_for(target);
        let mut options = OpenOptions::new();
        options.create(true).truncate(false).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o644);
        }
        let file = options
            .open(&lock_path)
            .with_context(|| format!("open lock file {}", lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("lock {}", lock_path.display()))?;
        Ok(Self { file, lock_path })
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        // Removal is best-effort; a racing writer may have re-created it.
        let _ = fs::remove_file(&self.lock_path);
    }
}

fn lock_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    target.with_file_name(format!("{name}.lock"))
}

/// Commit `content` to `path` via temp-file + same-directory rename. The
/// rename is the commit point: a failure before it leaves the original
/// untouched and the temp file is removed on drop.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .with_context(|| format!("create parent directory {}", parent.display()))?;

    let _lock = PathLock::acquire(path)?;
    let mut temp = tempfile::NamedTempFile::new_in(&parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    temp.write_all(content.as_bytes())
        .context("write temp file")?;
    temp.as_file().sync_all().context("sync temp file")?;
    temp.persist(path)
        .with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}
