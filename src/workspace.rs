//! Per-run working directory, released on every exit path.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// `<clones_dir>/<run_id>`, removed when dropped.
#[derive(Debug)]
pub struct RunWorkspace {
    path: PathBuf,
    released: bool,
}

impl RunWorkspace {
    /// Reserve the directory. The parent is created; the leaf is left for
    /// `git clone` to create.
    pub fn create(clones_dir: &Path, run_id: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(clones_dir)?;
        let path = clones_dir.join(sanitize_component(run_id));
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leave the directory on disk and return its path.
    pub fn keep(mut self) -> PathBuf {
        self.released = true;
        self.path.clone()
    }

    /// Remove the directory now, reporting failures instead of swallowing them.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        remove(&self.path)
    }
}

impl Drop for RunWorkspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = remove(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove run workspace");
        }
    }
}

fn remove(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_dir_all(path)
            .with_context(|| format!("Failed to remove '{}'", path.display()))?;
        debug!(path = %path.display(), "run workspace removed");
    }
    Ok(())
}

fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "run".to_string()
    } else {
        cleaned
    }
}
