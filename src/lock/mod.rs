//! Generation-token coordinator
//!
//! Turns "the `lock.json` in a directory changed" into a token stream that any
//! number of callers can wait on. Each directory gets exactly one native
//! filesystem watch no matter how many callers observe it.
//!
//! ```text
//! let lock = LockCoordinator::new()?;
//! let mut token = String::new();
//! loop {
//!     token = lock.watch("dist/assets", &token).await;
//!     if token.is_empty() { break; } // coordinator closed
//!     // ... the build output was rewritten ...
//! }
//! ```
//!
//! A caller presenting the current token waits for the next one. A caller
//! presenting anything else, including the empty string, gets the current
//! token straight away ("catch-up"). A marker that is missing, half-written or
//! malformed counts as "no value yet" and is read again on the next event.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use rustc_hash::FxHashMap as HashMap;
use serde::Deserialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::{absolutize, LOCK_FILE};
use crate::error::Result;

/// Observed state of one directory's generation marker
#[derive(Debug, Clone, Default)]
struct Snapshot {
    /// Current token, empty while no valid marker exists
    value: String,
    /// Bumped every time a new non-empty token is observed
    seq: u64,
    closed: bool,
}

struct DirWatch {
    state: Arc<watch::Sender<Snapshot>>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    dirs: HashMap<PathBuf, DirWatch>,
    closed: bool,
}

/// Shared per-directory token watcher
pub struct LockCoordinator {
    inner: Mutex<Inner>,
    runtime: Handle,
}

impl std::fmt::Debug for LockCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LockCoordinator")
            .field("dirs", &inner.dirs.keys().collect::<Vec<_>>())
            .field("closed", &inner.closed)
            .finish()
    }
}

#[derive(Deserialize)]
struct Marker {
    token: Option<serde_json::Value>,
}

impl LockCoordinator {
    /// Create a coordinator bound to the current tokio runtime
    pub fn new() -> Result<Self> {
        Ok(Self::with_handle(Handle::try_current()?))
    }

    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            runtime,
        }
    }

    /// Wait for the directory's token to differ from `token`.
    ///
    /// Resolves immediately with the current token when `token` is stale or
    /// empty and a token exists. After [`close`](Self::close) every call
    /// resolves immediately with an empty string.
    pub async fn watch(&self, dir: impl AsRef<Path>, token: &str) -> String {
        let Some(mut rx) = self.subscribe(dir.as_ref()) else {
            return String::new();
        };

        let start = {
            let snap = rx.borrow_and_update();
            if snap.closed {
                return String::new();
            }

            if !snap.value.is_empty() && snap.value != token {
                return snap.value.clone();
            }

            snap.seq
        };

        loop {
            if rx.changed().await.is_err() {
                return String::new();
            }

            let snap = rx.borrow_and_update();
            if snap.closed {
                return String::new();
            }

            if snap.seq > start && !snap.value.is_empty() {
                return snap.value.clone();
            }
        }
    }

    /// Current token of a directory that is already being observed
    pub fn peek(&self, dir: impl AsRef<Path>) -> Option<String> {
        let dir = absolutize(dir.as_ref());
        let inner = self.inner.lock();
        inner
            .dirs
            .get(&dir)
            .map(|watch| watch.state.borrow().value.clone())
            .filter(|value| !value.is_empty())
    }

    /// Number of directories with a live native watch
    pub fn watched_dirs(&self) -> usize {
        self.inner.lock().dirs.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Cancel every watch. Irreversible: later `watch()` calls resolve to "".
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }

        inner.closed = true;
        for (dir, watch) in inner.dirs.drain() {
            watch.reader.abort();
            watch.state.send_modify(|snap| snap.closed = true);
            debug!(dir = %dir.display(), "lock watch closed");
        }
    }

    fn subscribe(&self, dir: &Path) -> Option<watch::Receiver<Snapshot>> {
        let dir = absolutize(dir);
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }

        if let Some(existing) = inner.dirs.get(&dir) {
            return Some(existing.state.subscribe());
        }

        let (tx, rx) = watch::channel(Snapshot::default());
        let state = Arc::new(tx);
        let reader = self.runtime.spawn(observe(dir.clone(), state.clone()));
        inner.dirs.insert(dir, DirWatch { state, reader });

        Some(rx)
    }
}

impl Drop for LockCoordinator {
    fn drop(&mut self) {
        for watch in self.inner.get_mut().dirs.values() {
            watch.reader.abort();
        }
    }
}

/// Owns the native watch for one directory and feeds its snapshot
async fn observe(dir: PathBuf, state: Arc<watch::Sender<Snapshot>>) {
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        warn!(dir = %dir.display(), error = %e, "could not create lock directory");
    }

    let (events_tx, mut events) = mpsc::unbounded_channel::<()>();
    let _watcher = match install_watcher(&dir, events_tx.clone()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "native watch unavailable");
            None
        }
    };

    // initial read
    let _ = events_tx.send(());
    drop(events_tx);

    let path = dir.join(LOCK_FILE);
    while events.recv().await.is_some() {
        loop {
            while events.try_recv().is_ok() {}

            let token = read_token(&path).await;

            // a change landed while reading: take another pass instead of
            // publishing a value that is already out of date
            if events.try_recv().is_ok() {
                continue;
            }

            state.send_if_modified(|snap| apply(snap, token));
            break;
        }
    }

    trace!(dir = %dir.display(), "lock observer finished");
}

fn install_watcher(dir: &Path, events: mpsc::UnboundedSender<()>) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            let touches_marker = event
                .paths
                .iter()
                .any(|p| p.file_name().is_some_and(|name| name == LOCK_FILE));
            if touches_marker {
                let _ = events.send(());
            }
        }
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Read a marker; anything unusable is "no value yet"
async fn read_token(path: &Path) -> Option<String> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    parse_marker(&content)
}

fn parse_marker(content: &str) -> Option<String> {
    let marker: Marker = serde_json::from_str(content).ok()?;
    match marker.token? {
        serde_json::Value::String(token) if !token.is_empty() => Some(token),
        _ => None,
    }
}

fn apply(snap: &mut Snapshot, token: Option<String>) -> bool {
    match token {
        Some(token) if token != snap.value => {
            debug!(token = %token, "generation token changed");
            snap.value = token;
            snap.seq += 1;
            true
        }
        None if !snap.value.is_empty() => {
            snap.value.clear();
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    fn write_marker(dir: &Path, token: &str) {
        let tmp = dir.join("lock.json.tmp");
        std::fs::write(&tmp, format!("{{\"token\":\"{}\"}}", token)).unwrap();
        std::fs::rename(&tmp, dir.join(LOCK_FILE)).unwrap();
    }

    #[test]
    fn test_parse_marker() {
        assert_eq!(parse_marker(r#"{"token":"123"}"#), Some("123".to_string()));
        assert_eq!(parse_marker(r#"{"token":""}"#), None);
        assert_eq!(parse_marker(r#"{"token":5}"#), None);
        assert_eq!(parse_marker("{}"), None);
        assert_eq!(parse_marker(r#"{"tok"#), None);
    }

    #[test]
    fn test_apply_only_counts_new_tokens() {
        let mut snap = Snapshot::default();
        assert!(apply(&mut snap, Some("a".into())));
        assert_eq!(snap.seq, 1);
        assert!(!apply(&mut snap, Some("a".into())));
        assert!(apply(&mut snap, None));
        assert_eq!(snap.value, "");
        assert_eq!(snap.seq, 1);
        assert!(!apply(&mut snap, None));
    }

    #[tokio::test]
    async fn test_catch_up_with_empty_token() {
        let dir = tempdir().unwrap();
        write_marker(dir.path(), "100");

        let lock = LockCoordinator::new().unwrap();
        let token = timeout(Duration::from_secs(5), lock.watch(dir.path(), ""))
            .await
            .unwrap();
        assert_eq!(token, "100");

        // a stale token also catches up
        let token = timeout(Duration::from_secs(5), lock.watch(dir.path(), "99"))
            .await
            .unwrap();
        assert_eq!(token, "100");
        assert_eq!(lock.peek(dir.path()).as_deref(), Some("100"));
    }

    #[tokio::test]
    async fn test_one_native_watch_per_directory() {
        let dir = tempdir().unwrap();
        write_marker(dir.path(), "1");

        let lock = LockCoordinator::new().unwrap();
        let _ = timeout(Duration::from_secs(5), lock.watch(dir.path(), ""))
            .await
            .unwrap();
        let _ = timeout(Duration::from_secs(5), lock.watch(dir.path(), "x"))
            .await
            .unwrap();
        assert_eq!(lock.watched_dirs(), 1);
    }

    #[tokio::test]
    async fn test_close_resolves_waiters_with_empty_token() {
        let dir = tempdir().unwrap();
        write_marker(dir.path(), "7");

        let lock = Arc::new(LockCoordinator::new().unwrap());
        let current = timeout(Duration::from_secs(5), lock.watch(dir.path(), ""))
            .await
            .unwrap();

        let waiter = tokio::spawn({
            let lock = lock.clone();
            let dir = dir.path().to_path_buf();
            async move { lock.watch(dir, &current).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        lock.close();

        let token = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert_eq!(token, "");
        assert!(lock.is_closed());
        assert_eq!(lock.watch(dir.path(), "").await, "");
        assert_eq!(lock.watched_dirs(), 0);
    }
}
