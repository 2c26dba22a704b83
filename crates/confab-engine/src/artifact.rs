use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use confab_core::Error;

/// Default size threshold for the artifact directory.
pub const DEFAULT_PAYLOAD_CAP: u64 = 1024 * 1024;

static NEXT_ARTIFACT: AtomicU64 = AtomicU64::new(0);

/// On-disk store for request payload artifacts. Bodies are written to
/// uniquely named files so the transport argv can reference them instead
/// of carrying JSON inline; the directory is pruned oldest-first when it
/// grows past the threshold.
#[derive(Debug, Clone)]
pub struct PayloadStore {
    dir: PathBuf,
    cap_bytes: u64,
}

impl PayloadStore {
    pub fn new(dir: impl Into<PathBuf>, cap_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            cap_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `body` to a fresh artifact file and return its path.
    pub fn write(&self, body: &str) -> Result<PathBuf, Error> {
        fs::create_dir_all(&self.dir)?;
        let seq = NEXT_ARTIFACT.fetch_add(1, Ordering::Relaxed);
        let name = format!("payload-{}-{}.json", std::process::id(), seq);
        let path = self.dir.join(name);
        fs::write(&path, body)?;
        debug!(path = %path.display(), bytes = body.len(), "wrote payload artifact");
        self.prune(&path);
        Ok(path)
    }

    /// Best-effort removal once the artifact has served its request.
    pub fn remove(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            debug!(path = %path.display(), error = %e, "failed to remove payload artifact");
        }
    }

    /// Delete oldest files until the directory fits the threshold. The
    /// just-written artifact is never pruned, even when it alone exceeds
    /// the cap.
    fn prune(&self, keep: &Path) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "cannot scan payload directory");
                return;
            }
        };

        let mut files = Vec::new();
        let mut total = 0u64;
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            total += meta.len();
            files.push((path, meta.len(), meta.modified().ok()));
        }

        if total <= self.cap_bytes {
            return;
        }

        files.sort_by_key(|(_, _, modified)| *modified);
        for (path, len, _) in files {
            if total <= self.cap_bytes {
                break;
            }
            if path == keep {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "pruned payload artifact");
                    total -= len;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to prune payload artifact");
                }
            }
        }
    }
}
