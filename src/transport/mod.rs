//! Change-notification transports
//!
//! Three interchangeable ways of learning that a tracked manifest changed:
//!
//! | Transport | Scheme | Mechanism |
//! |-----------|--------|-----------|
//! | [`FsTransport`] | `file:` | shared directory watch on the generation marker |
//! | [`FetchTransport`] | `http(s):` | `POST <base>?<token>` long-poll, following `Location` |
//! | [`WsTransport`] | `http(s):` → `ws(s):` | server push over the `hmr` subprotocol |
//!
//! Each one dedupes by base URL (the first `start()` wins), feeds every
//! changed chunk into [`RuntimeGraph::load`], and owns exactly one
//! cancellation token that makes it permanently inert once fired.

mod fetch;
mod fs;
mod ws;

pub use fetch::FetchTransport;
pub use fs::FsTransport;
pub use ws::WsTransport;

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashSet as HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::hmr::RuntimeGraph;
use crate::manifest::Manifest;

/// A way of observing manifest changes for a set of base addresses
pub trait Transport: Send + Sync + 'static {
    /// Observer key this transport registers under
    fn name(&self) -> &'static str;

    /// Begin observing the manifest at `asset` if its scheme belongs to this
    /// transport. Returns `true` when the URL is (already) being observed.
    fn start(&self, asset: &Url) -> bool;

    /// Abort all in-flight work; later `start()` calls return `false`
    fn shutdown(&self);

    fn is_shut_down(&self) -> bool;
}

/// Hook a transport up to the graph's tracked-set notifications.
///
/// Every notification starts the transport on each tracked URL; once the set
/// is frozen and none of its URLs belongs to the transport, it shuts down.
pub fn connect(transport: &Arc<dyn Transport>, graph: &Arc<RuntimeGraph>) -> bool {
    let weak_transport: Weak<dyn Transport> = Arc::downgrade(transport);
    let weak_graph = Arc::downgrade(graph);
    graph.observe(transport.name(), move || {
        let (Some(transport), Some(graph)) = (weak_transport.upgrade(), weak_graph.upgrade())
        else {
            return;
        };

        let mut accepted = false;
        for url in &graph.urls() {
            accepted |= transport.start(url);
        }

        if !accepted && graph.is_frozen() && !transport.is_shut_down() {
            debug!(transport = transport.name(), "no tracked url left, shutting down");
            transport.shutdown();
        }
    })
}

/// Outcome of claiming a base URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    /// First start for this base: the caller must spawn the loop
    New,
    /// Already observed
    Existing,
    /// Transport has been shut down
    Inert,
}

/// Dedup set plus the single cancellation token of one transport instance
#[derive(Debug, Default)]
pub(crate) struct WatchSet {
    cancel: CancellationToken,
    watches: Mutex<HashSet<String>>,
}

impl WatchSet {
    pub fn claim(&self, key: &str) -> Claim {
        if self.cancel.is_cancelled() {
            return Claim::Inert;
        }

        if self.watches.lock().insert(key.to_string()) {
            Claim::New
        } else {
            Claim::Existing
        }
    }

    /// Forget a base whose loop ended on its own, so a fresh `start()` reopens it
    pub fn release(&self, key: &str) {
        self.watches.lock().remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.watches.lock().contains(key)
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.watches.lock().clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Sleep for the retry delay, returning early (with `false`) on cancellation
pub(crate) async fn backoff(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Parse a manifest body and load every chunk it lists, resolved against `base`
pub(crate) fn deliver(graph: &RuntimeGraph, body: &str, base: &Url) -> usize {
    let Some(manifest) = Manifest::parse(body) else {
        trace!(base = %base, "ignoring manifest without chunks");
        return 0;
    };

    let urls = manifest.resolve(base);
    for url in &urls {
        graph.load(url);
    }
    urls.len()
}
