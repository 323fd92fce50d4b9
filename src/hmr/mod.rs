//! Hot Module Replacement runtime
//!
//! Swap the implementation of a running module in place while giving the
//! module a lifecycle contract for cleanup and state carry-over.
//!
//! # Example
//! ```text
//! // what a hot module does when it is evaluated
//! let hot = graph.create("src/counter.tsx", ModuleVersion(build_started_at));
//! let count = hot.meta_as::<u32>().unwrap_or(0);
//!
//! hot.on(Event::Start, || mount());
//! hot.on(Event::Stop, || unmount());
//! hot.keep(json!(count)); // the next version starts from here
//! ```
//!
//! Delivery is idempotent per module id: a version equal to or older than the
//! one already running yields an inert context and changes nothing.

mod context;
mod graph;

pub use context::{Event, HandlerId, HotModuleContext, Meta, State};
pub use graph::{ChunkLoader, RuntimeGraph};

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::TransportConfig;
use crate::error::Result;
use crate::lock::LockCoordinator;
use crate::task::TaskQueue;
use crate::transport::{self, FetchTransport, FsTransport, Transport, WsTransport};

/// Module version: the build-start timestamp in milliseconds.
///
/// Only ever compared numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ModuleVersion(pub u64);

impl ModuleVersion {
    /// Version for a build starting now
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self(millis)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-side wiring: graph, task queue, lock coordinator and all transports
pub struct HmrClient {
    graph: Arc<RuntimeGraph>,
    lock: Arc<LockCoordinator>,
    transports: Vec<Arc<dyn Transport>>,
}

impl fmt::Debug for HmrClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HmrClient")
            .field("graph", &self.graph)
            .field("transports", &self.transports.iter().map(|t| t.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl HmrClient {
    /// Build the client inside the current tokio runtime
    pub fn new(loader: Arc<dyn ChunkLoader>, config: TransportConfig) -> Result<Self> {
        let tasks = Arc::new(TaskQueue::new());
        let graph = Arc::new(RuntimeGraph::new(tasks, loader));
        let lock = Arc::new(LockCoordinator::new()?);

        let transports: Vec<Arc<dyn Transport>> = vec![
            Arc::new(FsTransport::new(graph.clone(), lock.clone())?),
            Arc::new(FetchTransport::new(graph.clone(), config.clone())?),
            Arc::new(WsTransport::new(graph.clone(), config)?),
        ];

        Ok(Self {
            graph,
            lock,
            transports,
        })
    }

    pub fn graph(&self) -> &Arc<RuntimeGraph> {
        &self.graph
    }

    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }

    /// Register every transport with the graph's tracked-set observer
    pub fn connect(&self) -> bool {
        let mut connected = false;
        for transport in &self.transports {
            connected |= transport::connect(transport, &self.graph);
        }
        connected
    }

    /// Drive deferred notifications until `cancel` fires, then shut down
    pub async fn run(&self, cancel: CancellationToken) {
        info!(tracked = self.graph.urls().len(), "hmr client running");
        self.graph.tasks().drive(cancel).await;
        self.shutdown();
    }

    /// Stop all transports and release the filesystem watches
    pub fn shutdown(&self) {
        for transport in &self.transports {
            transport.shutdown();
        }
        self.lock.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        let v1 = ModuleVersion(1_700_000_000_000);
        assert!(v1.next() > v1);
        assert!(ModuleVersion::now() > v1);
        assert_eq!(v1.to_string(), "1700000000000");
    }
}
