//! Build exclusion for one index key.
//!
//! Two layers: an in-process async mutex per key, shared by every session
//! using the same [`IndexStore`](super::store::IndexStore), and an on-disk
//! `<key>.building` marker for sessions in other processes. The marker is
//! created with `create_new`, so exactly one holder exists at a time.
//!
//! The marker holds a token naming its owner. While held, a heartbeat task
//! refreshes its mtime every [`HEARTBEAT_INTERVAL`]; a marker whose mtime is
//! older than [`STALE_AFTER`] belongs to a dead holder and may be removed.
//! On drop the marker is removed only if it still carries the holder's token.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How often a waiter checks whether the marker is gone.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How often a live holder refreshes its marker.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Age past which an unrefreshed marker is treated as abandoned.
pub const STALE_AFTER: Duration = Duration::from_secs(15);

/// Per-key async mutexes.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    /// The mutex guarding `key`, created on first use.
    pub fn get(&self, key: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key.to_path_buf()).or_default().clone()
    }
}

/// Marker file held while an index is being built. Removed on drop.
#[derive(Debug)]
pub struct BuildMarker {
    path: PathBuf,
    token: String,
    heartbeat: JoinHandle<()>,
}

/// Why a marker could not be taken.
#[derive(Debug, thiserror::Error)]
pub enum MarkerError {
    #[error("timed out after {waited:?} waiting for build marker {path}")]
    Timeout { path: PathBuf, waited: Duration },

    #[error("build marker I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildMarker {
    /// Marker path of the index stored in `key_dir`.
    pub fn path_for(key_dir: &Path) -> PathBuf {
        let mut name = key_dir
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".building");
        key_dir.with_file_name(name)
    }

    /// Take the marker, waiting up to `timeout` for another holder to let go.
    ///
    /// A marker not refreshed for `stale_after` is considered abandoned and
    /// removed. `stale_after` must be well above [`HEARTBEAT_INTERVAL`].
    pub async fn acquire(
        path: &Path,
        timeout: Duration,
        stale_after: Duration,
    ) -> Result<Self, MarkerError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let token = new_token();
        let started = Instant::now();
        let mut announced = false;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                Ok(mut file) => {
                    if let Err(err) = write_token(&mut file, &token).await {
                        let _ = tokio::fs::remove_file(path).await;
                        return Err(err.into());
                    }
                    debug!(marker = %path.display(), %token, "build marker taken");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        heartbeat: spawn_heartbeat(path.to_path_buf(), token.clone()),
                        token,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }

            if is_stale(path, stale_after).await {
                warn!(marker = %path.display(), "removing abandoned build marker");
                match tokio::fs::remove_file(path).await {
                    Ok(()) => continue,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(err.into()),
                }
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(MarkerError::Timeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }
            if !announced {
                debug!(marker = %path.display(), "index build in progress elsewhere, waiting");
                announced = true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Owner token written into the marker.
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for BuildMarker {
    fn drop(&mut self) {
        self.heartbeat.abort();
        match std::fs::read_to_string(&self.path) {
            Ok(current) if current == self.token => {
                if let Err(err) = std::fs::remove_file(&self.path) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(marker = %self.path.display(), error = %err, "could not remove build marker");
                    }
                }
            }
            Ok(_) => {
                warn!(marker = %self.path.display(), "build marker taken over by another holder, leaving it");
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(marker = %self.path.display(), error = %err, "could not read build marker");
            }
        }
    }
}

async fn write_token(file: &mut tokio::fs::File, token: &str) -> std::io::Result<()> {
    file.write_all(token.as_bytes()).await?;
    file.sync_all().await
}

/// `pid:nanos:counter`, unique across processes and within one.
fn new_token() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!(
        "{}:{nanos}:{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Refresh the marker's mtime until aborted or until the marker stops
/// carrying `token`.
fn spawn_heartbeat(path: PathBuf, token: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let path = path.clone();
            let token = token.clone();
            let touched = tokio::task::spawn_blocking(move || touch_if_owned(&path, &token)).await;
            match touched {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    warn!("build marker no longer ours, heartbeat stopped");
                    return;
                }
                Ok(Err(err)) => warn!(error = %err, "build marker heartbeat failed"),
                Err(_) => return,
            }
        }
    })
}

fn touch_if_owned(path: &Path, token: &str) -> std::io::Result<bool> {
    match std::fs::read_to_string(path) {
        Ok(current) if current == token => {}
        Ok(_) => return Ok(false),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    }
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(SystemTime::now())?;
    Ok(true)
}

async fn is_stale(path: &Path, max_age: Duration) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > max_age)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_marker_path_is_a_sibling() {
        let path = BuildMarker::path_for(Path::new("/store/docs-abc/model"));
        assert_eq!(path, PathBuf::from("/store/docs-abc/model.building"));
    }

    #[test]
    fn test_key_locks_are_shared_per_key() {
        let locks = KeyLocks::default();
        let a = locks.get(Path::new("/k1"));
        let b = locks.get(Path::new("/k1"));
        let c = locks.get(Path::new("/k2"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(new_token(), new_token());
    }

    #[tokio::test]
    async fn test_marker_is_exclusive_and_released_on_drop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("key.building");
        let held = BuildMarker::acquire(&path, Duration::from_secs(5), STALE_AFTER).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), held.token());

        let err = BuildMarker::acquire(&path, Duration::from_millis(120), STALE_AFTER)
            .await
            .unwrap_err();
        assert!(matches!(err, MarkerError::Timeout { .. }));

        drop(held);
        assert!(!path.exists());
        assert!(BuildMarker::acquire(&path, Duration::from_secs(1), STALE_AFTER).await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_proceeds_once_marker_released() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("key.building");
        let held = BuildMarker::acquire(&path, Duration::from_secs(5), STALE_AFTER).await.unwrap();

        let waiter_path = path.clone();
        let waiter = tokio::spawn(async move {
            BuildMarker::acquire(&waiter_path, Duration::from_secs(5), STALE_AFTER).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_stale_marker_is_removed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("key.building");
        std::fs::write(&path, "999:0:0").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let marker = BuildMarker::acquire(&path, Duration::from_secs(1), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(marker.path(), path.as_path());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), marker.token());
    }

    #[tokio::test]
    async fn test_held_marker_outlives_the_stale_age() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("key.building");
        // Stale age just above one heartbeat: only the heartbeat keeps it fresh.
        let stale = HEARTBEAT_INTERVAL + Duration::from_millis(700);
        let held = BuildMarker::acquire(&path, Duration::from_secs(1), stale).await.unwrap();

        let err = BuildMarker::acquire(&path, stale * 2, stale).await.unwrap_err();
        assert!(matches!(err, MarkerError::Timeout { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), held.token());
    }

    #[tokio::test]
    async fn test_drop_spares_a_marker_taken_over() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("key.building");
        let held = BuildMarker::acquire(&path, Duration::from_secs(1), STALE_AFTER).await.unwrap();
        std::fs::write(&path, "another-holder").unwrap();
        drop(held);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "another-holder");
    }
}
