//! Project size auditor: file and line counts of a source tree, cached.

use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::heartbeat::{MetricsCollector, TickError};

const IGNORED_DIRS: &[&str] = &[".git", "node_modules", "dist", "target", ".next", "__pycache__"];
const COUNTED_EXTENSIONS: &[&str] = &["ts", "tsx", "rs", "py", "html", "css", "js", "json"];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProjectStats {
    pub files: u64,
    pub loc: u64,
}

/// Walk `root`, skipping vendored/build directories. Every file counts toward
/// `files`; only source extensions count toward `loc`. Unreadable entries are
/// skipped.
pub fn scan(root: &Path) -> ProjectStats {
    let mut stats = ProjectStats::default();
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(read_dir) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in read_dir.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            let path = entry.path();
            if file_type.is_dir() {
                let ignored = entry
                    .file_name()
                    .to_str()
                    .map_or(false, |name| IGNORED_DIRS.contains(&name));
                if !ignored {
                    pending.push(path);
                }
            } else if file_type.is_file() {
                stats.files += 1;
                if is_counted(&path) {
                    stats.loc += count_lines(&path).unwrap_or(0);
                }
            }
        }
    }
    stats
}

fn is_counted(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| COUNTED_EXTENSIONS.contains(&ext))
}

fn count_lines(path: &Path) -> io::Result<u64> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    let mut lines = 0;
    let mut buf = Vec::new();
    while reader.read_until(b'\n', &mut buf)? > 0 {
        lines += 1;
        buf.clear();
    }
    Ok(lines)
}

struct Cached {
    stats: ProjectStats,
    taken_at: Instant,
}

pub struct ProjectAuditor {
    root: PathBuf,
    cache_for: Duration,
    cached: Arc<Mutex<Option<Cached>>>,
}

impl ProjectAuditor {
    pub fn new(root: impl Into<PathBuf>, cache_for: Duration) -> Self {
        Self {
            root: root.into(),
            cache_for,
            cached: Arc::new(Mutex::new(None)),
        }
    }

    /// Cached stats, rescanning on the blocking pool once the cache expires.
    pub async fn audit(&self) -> Result<ProjectStats, TickError> {
        {
            let cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(c) = cached.as_ref() {
                if c.taken_at.elapsed() < self.cache_for {
                    return Ok(c.stats);
                }
            }
        }

        let root = self.root.clone();
        let stats = tokio::task::spawn_blocking(move || scan(&root))
            .await
            .map_err(|e| TickError::Collector {
                name: "project",
                reason: format!("audit task failed: {e}"),
            })?;
        debug!(files = stats.files, loc = stats.loc, "[AUDITOR] rescanned {}", self.root.display());

        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(Cached {
            stats,
            taken_at: Instant::now(),
        });
        Ok(stats)
    }
}

#[async_trait]
impl MetricsCollector for ProjectAuditor {
    fn name(&self) -> &'static str {
        "project"
    }

    async fn collect(&self) -> Result<Value, TickError> {
        let stats = self.audit().await?;
        Ok(serde_json::to_value(stats)?)
    }
}
