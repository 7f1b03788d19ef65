//! The process-global trash manager (§4.8).
//!
//! `rename` is typically O(1); recursively deleting a directory tree is
//! not. Doomed files and doomed cache directories are renamed into a
//! staging root under the system temp directory, and the staging root is
//! deleted off the hot path by a single serial background task. Emptying
//! detaches the current staging root before deleting it, so a mover that
//! races with a delete always lands in a fresh root rather than a
//! half-deleted one.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};

struct Inner {
    trash_url: Mutex<Option<PathBuf>>,
    sender: UnboundedSender<PathBuf>,
}

/// Process-wide singleton; see [`global`].
pub struct TrashManager {
    inner: Inner,
}

static TRASH: OnceLock<TrashManager> = OnceLock::new();

/// Returns the process-wide trash manager, spawning its background
/// deletion task on first use.
pub fn global() -> &'static TrashManager {
    TRASH.get_or_init(TrashManager::start)
}

impl TrashManager {
    fn start() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();

        tokio::spawn(async move {
            while let Some(doomed) = rx.recv().await {
                let result = tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&doomed))
                    .await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(error = %e, "failed to empty trash directory"),
                    Err(e) => tracing::warn!(error = %e, "trash deletion task panicked"),
                }
            }
        });

        Self {
            inner: Inner {
                trash_url: Mutex::new(None),
                sender: tx,
            },
        }
    }

    /// Renames `file` into the trash, lazily creating a fresh staging
    /// root if none exists. Returns `Ok(())` on success, leaving `file`
    /// untouched on failure.
    pub fn move_to_trash(&self, file: &Path) -> std::io::Result<()> {
        let dest_dir = {
            let mut guard = self.inner.trash_url.lock();
            if guard.is_none() {
                *guard = Some(Self::fresh_trash_root()?);
            }
            guard.as_ref().unwrap().clone()
        };

        let dest = dest_dir.join(Uuid4::new().to_string());
        std::fs::rename(file, &dest)
    }

    /// Same as [`move_to_trash`](Self::move_to_trash) but for an entire
    /// directory tree (used by remove-all at directory granularity).
    pub fn move_dir_to_trash(&self, dir: &Path) -> std::io::Result<()> {
        self.move_to_trash(dir)
    }

    /// Detaches the current staging root (if any) and schedules it for
    /// deletion on the background task. A subsequent `move_to_trash`
    /// call will lazily recreate a fresh root.
    pub fn empty_trash(&self) {
        let doomed = self.inner.trash_url.lock().take();
        if let Some(doomed) = doomed {
            if self.inner.sender.send(doomed).is_err() {
                tracing::warn!("trash worker task is gone; leaking staging directory");
            }
        }
    }

    fn fresh_trash_root() -> std::io::Result<PathBuf> {
        let root = std::env::temp_dir().join(format!("diskcache-trash-{}", Uuid4::new()));
        std::fs::create_dir_all(&root)?;
        Ok(root)
    }
}

/// Thin wrapper so the rest of this module doesn't need to know which
/// crate actually produces unique tokens.
struct Uuid4(uuid::Uuid);

impl Uuid4 {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for Uuid4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn move_then_empty_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doomed");
        fs::write(&file, b"bye").unwrap();

        let trash = global();
        trash.move_to_trash(&file).unwrap();
        assert!(!file.exists());

        trash.empty_trash();
        // give the background task a chance to run
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_move_during_empty_uses_fresh_root() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"a").unwrap();
        fs::write(&b, b"b").unwrap();

        let trash = global();
        trash.move_to_trash(&a).unwrap();
        trash.empty_trash();
        // a fresh root should be created here, distinct from the one
        // just detached and scheduled for deletion.
        trash.move_to_trash(&b).unwrap();
        assert!(!a.exists());
        assert!(!b.exists());
    }
}
