use anyhow::Result;
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::runtime_dir;

/// Append-only runtime log plus optional stderr echo. One instance is
/// shared per pipeline; writes are line-at-a-time so interleaving from
/// worker threads stays readable.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("run.log"),
            verbose: false,
        })
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Record an event line in the run log.
    pub fn log(&self, msg: &str) {
        let _ = self.append_line(&format!("{} {msg}", Utc::now().to_rfc3339()));
    }

    /// Echo to stderr with the `[term-llm]` prefix when verbose mode is on.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[term-llm] {msg}");
        }
        self.log(msg);
    }

    /// Warnings always reach both stderr and the log file.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[term-llm WARN] {msg}");
        let _ = self.append_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}
