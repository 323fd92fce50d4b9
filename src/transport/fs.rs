//! Co-located filesystem transport
//!
//! For `file:` manifests. Waits on the generation marker of the manifest's
//! directory through the shared [`LockCoordinator`] and re-reads the manifest
//! every time the token moves.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use url::Url;

use super::{deliver, Claim, Transport, WatchSet};
use crate::error::Result;
use crate::hmr::RuntimeGraph;
use crate::lock::LockCoordinator;

/// Token presented on the first wait; never a real token, so the first
/// wait catches up with whatever marker already exists
const INITIAL_TOKEN: &str = "_";

pub struct FsTransport {
    graph: Arc<RuntimeGraph>,
    lock: Arc<LockCoordinator>,
    watches: WatchSet,
    runtime: Handle,
}

impl std::fmt::Debug for FsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsTransport")
            .field("shut_down", &self.watches.is_shut_down())
            .finish()
    }
}

impl FsTransport {
    pub fn new(graph: Arc<RuntimeGraph>, lock: Arc<LockCoordinator>) -> Result<Self> {
        Ok(Self {
            graph,
            lock,
            watches: WatchSet::default(),
            runtime: Handle::try_current()?,
        })
    }

    /// Whether the manifest file at `path` is being observed
    pub fn is_watching(&self, path: &Path) -> bool {
        self.watches.contains(&path.to_string_lossy())
    }
}

impl Transport for FsTransport {
    fn name(&self) -> &'static str {
        "connect-fs"
    }

    fn start(&self, asset: &Url) -> bool {
        if self.watches.is_shut_down() || asset.scheme() != "file" {
            return false;
        }

        let Ok(path) = asset.to_file_path() else {
            debug!(url = %asset, "file url has no local path");
            return false;
        };

        match self.watches.claim(&path.to_string_lossy()) {
            Claim::Inert => false,
            Claim::Existing => true,
            Claim::New => {
                info!(file = %path.display(), "hmr fs watch");
                self.runtime.spawn(watch_loop(
                    self.graph.clone(),
                    self.lock.clone(),
                    path,
                    asset.clone(),
                    self.watches.token(),
                ));
                true
            }
        }
    }

    /// Stops this transport's loops. The lock coordinator is shared and
    /// closed by its owner.
    fn shutdown(&self) {
        self.watches.shutdown();
    }

    fn is_shut_down(&self) -> bool {
        self.watches.is_shut_down()
    }
}

async fn watch_loop(
    graph: Arc<RuntimeGraph>,
    lock: Arc<LockCoordinator>,
    path: PathBuf,
    base: Url,
    cancel: CancellationToken,
) {
    let Some(dir) = path.parent().map(Path::to_path_buf) else {
        return;
    };

    let mut token = INITIAL_TOKEN.to_string();
    loop {
        token = tokio::select! {
            _ = cancel.cancelled() => break,
            next = lock.watch(&dir, &token) => next,
        };

        if token.is_empty() {
            break;
        }

        // the marker moves before a half-written manifest can be observed;
        // a failed read just means the next token brings it
        match tokio::fs::read_to_string(&path).await {
            Ok(body) => {
                let loaded = deliver(&graph, &body, &base);
                debug!(file = %path.display(), %token, loaded, "manifest changed");
            }
            Err(e) => trace!(file = %path.display(), error = %e, "manifest unreadable"),
        }
    }

    trace!(file = %path.display(), "fs watch finished");
}
