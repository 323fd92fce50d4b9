//! Per-module hot context
//!
//! The token a hot module receives from [`RuntimeGraph::create`]. It is a small
//! state machine:
//!
//! ```text
//! pending ──> running ──> upgrade (terminal)
//! ```
//!
//! plus a carry-over slot: [`keep`](HotModuleContext::keep) stores a value on
//! the *successor* record shared with the graph, and the next version of the
//! module receives it as its [`meta`](HotModuleContext::meta).
//!
//! [`RuntimeGraph::create`]: super::RuntimeGraph::create

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use crate::task::TaskQueue;

/// Value carried from one module version to the next
pub type Meta = serde_json::Value;

/// Lifecycle state of a hot context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Constructed, module body not finished yet
    Pending,
    /// Live and supersedable
    Running,
    /// Superseded by a newer version
    Upgrade,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Upgrade => "upgrade",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle events a module can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// First time the context leaves `pending` and lands on `running`
    Start,
    /// The context reached `upgrade`
    Stop,
}

/// Handle returned by [`HotModuleContext::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

/// Successor record shared between a context and its graph entry
#[derive(Debug)]
pub(crate) struct Update {
    pub meta: Option<Meta>,
    pub state: State,
}

pub(crate) type SharedUpdate = Arc<Mutex<Update>>;

type Listener = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
struct Status {
    state: State,
    /// `None` once nothing can supersede this context ("static")
    update: Option<SharedUpdate>,
}

struct Inner {
    id: String,
    meta: Option<Meta>,
    status: Mutex<Status>,
    handlers: Mutex<BTreeMap<HandlerId, (Event, Listener)>>,
    next_handler: AtomicU64,
    tasks: Arc<TaskQueue>,
}

/// Lifecycle token handed to a hot module.
///
/// Cloning is cheap and every clone refers to the same context.
#[derive(Clone)]
pub struct HotModuleContext {
    inner: Arc<Inner>,
}

impl fmt::Debug for HotModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotModuleContext")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("static", &self.is_static())
            .field("meta", &self.inner.meta)
            .field("handlers", &self.inner.handlers.lock().len())
            .finish()
    }
}

impl fmt::Display for HotModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state().as_str())
    }
}

impl HotModuleContext {
    fn build(
        id: impl Into<String>,
        meta: Option<Meta>,
        state: State,
        update: Option<SharedUpdate>,
        tasks: Arc<TaskQueue>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.into(),
                meta,
                status: Mutex::new(Status { state, update }),
                handlers: Mutex::new(BTreeMap::new()),
                next_handler: AtomicU64::new(1),
                tasks,
            }),
        }
    }

    /// A static, running context: no update will ever reach it.
    pub fn detached(id: impl Into<String>, meta: Option<Meta>, tasks: Arc<TaskQueue>) -> Self {
        Self::build(id, meta, State::Running, None, tasks)
    }

    /// The shared dead-on-arrival context handed out for stale versions
    pub(crate) fn sentinel(tasks: Arc<TaskQueue>) -> Self {
        Self::build("", None, State::Upgrade, None, tasks)
    }

    /// A context whose lifecycle is driven by a graph-owned successor record
    pub(crate) fn with_update(
        id: impl Into<String>,
        meta: Option<Meta>,
        update: SharedUpdate,
        tasks: Arc<TaskQueue>,
    ) -> Self {
        let state = update.lock().state;
        Self::build(id, meta, state, Some(update), tasks)
    }

    /// Module id this context was minted for (empty for the sentinel)
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Value the previous version handed over with `keep`
    pub fn meta(&self) -> Option<&Meta> {
        self.inner.meta.as_ref()
    }

    /// Decode `meta` into a concrete type
    pub fn meta_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.inner
            .meta
            .as_ref()
            .and_then(|meta| serde_json::from_value(meta.clone()).ok())
    }

    pub fn state(&self) -> State {
        self.inner.status.lock().state
    }

    /// `true` until the context has been superseded
    pub fn is_ready(&self) -> bool {
        self.state() != State::Upgrade
    }

    /// `true` when no successor can ever be pending for this context
    pub fn is_static(&self) -> bool {
        self.inner.status.lock().update.is_none()
    }

    /// Whether two handles refer to the same context
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Subscribe to a lifecycle event.
    ///
    /// Returns `None` without registering when asked for `Stop` on a static
    /// context, since nothing can ever stop it. Listeners run from the task
    /// queue, never inside this call.
    pub fn on<F>(&self, event: Event, listener: F) -> Option<HandlerId>
    where
        F: FnOnce() + Send + 'static,
    {
        if event == Event::Stop && self.is_static() {
            return None;
        }

        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .lock()
            .insert(id, (event, Box::new(listener)));

        if self.state() != State::Pending {
            schedule(&self.inner, id);
        }

        Some(id)
    }

    /// Remove a subscription that has not fired yet
    pub fn off(&self, handler: HandlerId) -> bool {
        self.inner.handlers.lock().remove(&handler).is_some()
    }

    /// Hand `value` to the next version of this module.
    ///
    /// Returns `false` and changes nothing when the context is static.
    pub fn keep(&self, value: Meta) -> bool {
        let status = self.inner.status.lock();
        match &status.update {
            Some(update) => {
                update.lock().meta = Some(value);
                true
            }
            None => false,
        }
    }

    /// Schedule a transition to whatever state the successor record holds
    pub(crate) fn invalidate(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.tasks.defer(move || transition(&inner));
    }
}

fn schedule(inner: &Arc<Inner>, handler: HandlerId) {
    let target = Arc::clone(inner);
    inner.tasks.defer(move || dispatch(&target, handler));
}

fn transition(inner: &Arc<Inner>) {
    let handlers: Vec<HandlerId> = {
        let mut status = inner.status.lock();
        let Some(update) = status.update.clone() else {
            return;
        };

        let next = update.lock().state;
        status.state = next;
        if next == State::Upgrade {
            status.update = None;
        }

        inner.handlers.lock().keys().copied().collect()
    };

    for handler in handlers {
        schedule(inner, handler);
    }
}

fn dispatch(inner: &Arc<Inner>, handler: HandlerId) {
    let state = inner.status.lock().state;
    let listener = {
        let mut handlers = inner.handlers.lock();
        let Some(event) = handlers.get(&handler).map(|(event, _)| *event) else {
            return;
        };

        match (event, state) {
            (_, State::Pending) => None,
            (Event::Start, State::Running) | (Event::Stop, State::Upgrade) => {
                handlers.remove(&handler).map(|(_, listener)| listener)
            }
            // a start listener that never saw `running` is dropped unfired
            (Event::Start, State::Upgrade) => {
                handlers.remove(&handler);
                None
            }
            (Event::Stop, State::Running) => None,
        }
    };

    if let Some(listener) = listener {
        listener();
    }
}
