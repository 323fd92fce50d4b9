//! Runtime module graph
//!
//! The authoritative table of live module ids, their current version and
//! their active [`HotModuleContext`]. `create` is the only writer. The graph
//! also owns the set of tracked manifest URLs that the transports observe.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use tracing::{debug, warn};
use url::Url;

use super::context::{HotModuleContext, Meta, SharedUpdate, State, Update};
use super::ModuleVersion;
use crate::manifest::manifest_url;
use crate::task::TaskQueue;

/// Host capability that brings a chunk into the running program
pub trait ChunkLoader: Send + Sync {
    fn load(&self, url: &Url) -> anyhow::Result<()>;
}

impl<F> ChunkLoader for F
where
    F: Fn(&Url) -> anyhow::Result<()> + Send + Sync,
{
    fn load(&self, url: &Url) -> anyhow::Result<()> {
        self(url)
    }
}

struct Entry {
    context: HotModuleContext,
    version: ModuleVersion,
    update: SharedUpdate,
}

#[derive(Default)]
struct Tracked {
    urls: Vec<Url>,
    keys: HashSet<String>,
    frozen: bool,
}

type Observer = Arc<dyn Fn() + Send + Sync>;

/// Versioned module-replacement graph
pub struct RuntimeGraph {
    table: Mutex<HashMap<String, Entry>>,
    tracked: Mutex<Tracked>,
    observers: Mutex<Vec<(String, Observer)>>,
    sentinel: HotModuleContext,
    tasks: Arc<TaskQueue>,
    loader: Arc<dyn ChunkLoader>,
}

impl fmt::Debug for RuntimeGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracked = self.tracked.lock();
        f.debug_struct("RuntimeGraph")
            .field("modules", &self.table.lock().len())
            .field("tracked", &tracked.urls.len())
            .field("frozen", &tracked.frozen)
            .field("observers", &self.observers.lock().len())
            .finish()
    }
}

impl RuntimeGraph {
    pub fn new(tasks: Arc<TaskQueue>, loader: Arc<dyn ChunkLoader>) -> Self {
        Self {
            table: Mutex::new(HashMap::default()),
            tracked: Mutex::new(Tracked::default()),
            observers: Mutex::new(Vec::new()),
            sentinel: HotModuleContext::sentinel(tasks.clone()),
            tasks,
            loader,
        }
    }

    pub fn tasks(&self) -> &Arc<TaskQueue> {
        &self.tasks
    }

    /// Mint the context for `id` at `version`.
    ///
    /// An equal or older version gets the shared upgrade-state sentinel and
    /// leaves the table untouched. A newer version supersedes the previous
    /// context (its `stop` listeners fire) and inherits whatever it kept.
    pub fn create(&self, id: &str, version: ModuleVersion) -> HotModuleContext {
        let mut table = self.table.lock();

        let mut meta: Option<Meta> = None;
        if let Some(current) = table.get(id) {
            if current.version >= version {
                debug!(id, %version, current = %current.version, "stale module version ignored");
                return self.sentinel.clone();
            }

            current.context.invalidate();
            let mut previous = current.update.lock();
            previous.state = State::Upgrade;
            meta = previous.meta.clone();
        }

        let update = Arc::new(Mutex::new(Update {
            meta: meta.clone(),
            state: State::Pending,
        }));
        let context =
            HotModuleContext::with_update(id, meta, update.clone(), self.tasks.clone());
        table.insert(
            id.to_string(),
            Entry {
                context: context.clone(),
                version,
                update: update.clone(),
            },
        );

        update.lock().state = State::Running;
        context.invalidate();

        debug!(id, %version, "module context created");
        context
    }

    /// Start tracking the manifest that belongs to an entry asset.
    ///
    /// Returns `false` once the tracked set is frozen.
    pub fn track(&self, asset: &Url, hint: Option<&str>) -> bool {
        let url = match manifest_url(asset, hint) {
            Ok(url) => url,
            Err(e) => {
                warn!(asset = %asset, error = %e, "cannot derive manifest url");
                return false;
            }
        };

        let mut tracked = self.tracked.lock();
        if tracked.frozen {
            return false;
        }

        if tracked.keys.insert(url.to_string()) {
            debug!(url = %url, "tracking manifest");
            tracked.urls.push(url);
            drop(tracked);
            self.notify();
        }

        true
    }

    /// Register a tracked-set observer once per key
    pub fn observe<F>(&self, key: &str, observer: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        {
            let mut observers = self.observers.lock();
            if observers.iter().any(|(k, _)| k == key) {
                return false;
            }

            observers.push((key.to_string(), Arc::new(observer)));
        }

        self.notify();
        true
    }

    /// Make the tracked set immutable and give observers a final look at it
    pub fn freeze(&self) -> bool {
        {
            let mut tracked = self.tracked.lock();
            if tracked.frozen {
                return false;
            }

            tracked.frozen = true;
        }

        self.notify();
        true
    }

    pub fn is_frozen(&self) -> bool {
        self.tracked.lock().frozen
    }

    /// Snapshot of the tracked manifest URLs in insertion order
    pub fn urls(&self) -> Vec<Url> {
        self.tracked.lock().urls.clone()
    }

    /// Bring a chunk into the program. Failures are logged, never returned.
    pub fn load(&self, url: &Url) {
        debug!(url = %url, "loading chunk");
        if let Err(e) = self.loader.load(url) {
            warn!(url = %url, error = %e, "chunk load failed");
        }
    }

    /// Current version recorded for `id`
    pub fn version(&self, id: &str) -> Option<ModuleVersion> {
        self.table.lock().get(id).map(|entry| entry.version)
    }

    /// Current context recorded for `id`
    pub fn context(&self, id: &str) -> Option<HotModuleContext> {
        self.table.lock().get(id).map(|entry| entry.context.clone())
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    fn notify(&self) {
        {
            let tracked = self.tracked.lock();
            if tracked.urls.is_empty() && !tracked.frozen {
                return;
            }
        }

        let observers: Vec<Observer> = self
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            self.tasks.defer(move || observer());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn graph() -> RuntimeGraph {
        let loader = |_: &Url| -> anyhow::Result<()> { Ok(()) };
        RuntimeGraph::new(Arc::new(TaskQueue::new()), Arc::new(loader))
    }

    #[test]
    fn test_first_create_is_running_after_tick() {
        let graph = graph();
        let ctx = graph.create("a", ModuleVersion(10));
        assert_eq!(ctx.state(), State::Pending);
        graph.tasks().run_pending();
        assert_eq!(ctx.state(), State::Running);
        assert!(!ctx.is_static());
        assert_eq!(graph.version("a"), Some(ModuleVersion(10)));
    }

    #[test]
    fn test_stale_version_gets_sentinel() {
        let graph = graph();
        let live = graph.create("a", ModuleVersion(10));
        let same = graph.create("a", ModuleVersion(10));
        let older = graph.create("a", ModuleVersion(9));

        assert!(same.ptr_eq(&older));
        assert_eq!(same.state(), State::Upgrade);
        assert!(graph.context("a").unwrap().ptr_eq(&live));
    }

    #[test]
    fn test_observe_once_per_key_and_deferred() {
        let graph = graph();
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = calls.clone();

        graph.track(&Url::parse("http://h/assets/entry-a.1.mjs").unwrap(), None);
        assert!(graph.observe("k", move || {
            inner.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!graph.observe("k", || {}));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        graph.tasks().run_pending();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_track_dedupes_and_stops_after_freeze() {
        let graph = graph();
        let asset = Url::parse("http://h/assets/entry-a.1.mjs").unwrap();
        assert!(graph.track(&asset, None));
        assert!(graph.track(&asset, None));
        assert_eq!(graph.urls().len(), 1);

        assert!(graph.freeze());
        assert!(!graph.freeze());
        assert!(!graph.track(&Url::parse("http://h/assets/b.2.mjs").unwrap(), None));
        assert_eq!(graph.urls()[0].as_str(), "http://h/assets/entry-a.json");
    }

    #[test]
    fn test_load_swallows_errors() {
        let loader = |_: &Url| -> anyhow::Result<()> { anyhow::bail!("syntax error") };
        let graph = RuntimeGraph::new(Arc::new(TaskQueue::new()), Arc::new(loader));
        graph.load(&Url::parse("http://h/assets/broken.mjs").unwrap());
    }
}
