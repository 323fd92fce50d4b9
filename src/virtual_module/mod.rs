//! Virtual module registry
//!
//! Build-time namespace for synthetic modules. Each module is registered
//! under a structural key (any serialisable value, compared by value) and
//! minted exactly once per key per build:
//!
//! ```text
//! let fs = registry.register(&("external", "fs"), || VirtualModule::External { .. })?;
//! let again = registry.register(&("external", "fs"), || unreachable!())?;
//! assert_eq!(fs.id, again.id);
//! ```
//!
//! Generated ids carry the registry's prefix (`\0<name>?<n>`), so the host can
//! send every id it does not recognise here first.

mod kind;

pub use kind::{
    ResolvedId, Targets, VirtualModule, HMR_INDEX_ID, HOOK_ID, RUNTIME_ID, SYNTHETIC_EXPORTS,
};

use parking_lot::Mutex;
use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use crate::error::{Error, Result};

/// Resolution capability of the bundler host, used for routed modules
pub trait ResolveHost {
    fn resolve(&self, id: &str, importer: Option<&str>) -> Option<ResolvedId>;
}

impl<F> ResolveHost for F
where
    F: Fn(&str, Option<&str>) -> Option<ResolvedId>,
{
    fn resolve(&self, id: &str, importer: Option<&str>) -> Option<ResolvedId> {
        self(id, importer)
    }
}

struct Slot {
    module: VirtualModule,
    code: Option<String>,
}

#[derive(Default)]
struct Inner {
    keys: HashMap<String, String>,
    modules: HashMap<String, Slot>,
}

/// Registry of synthetic modules for one build
pub struct VirtualModuleRegistry {
    prefix: String,
    inner: Mutex<Inner>,
    /// Never reset, so ids stay unique across builds
    next_id: Mutex<u64>,
}

impl std::fmt::Debug for VirtualModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualModuleRegistry")
            .field("prefix", &self.prefix)
            .field("modules", &self.len())
            .finish()
    }
}

/// Canonical form of a structural key: always a JSON array
fn canonical_key<K: Serialize + ?Sized>(key: &K) -> Result<String> {
    let value = serde_json::to_value(key).map_err(Error::InvalidKey)?;
    let value = match value {
        Value::Array(_) => value,
        other => Value::Array(vec![other]),
    };
    Ok(value.to_string())
}

impl VirtualModuleRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            prefix: format!("\0{}?", name),
            inner: Mutex::new(Inner::default()),
            next_id: Mutex::new(0),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether `id` belongs to this registry's namespace
    pub fn contains(&self, id: &str) -> bool {
        id.starts_with(&self.prefix)
    }

    /// Mint a fresh id in this namespace without registering anything
    pub fn alloc(&self) -> String {
        let mut next = self.next_id.lock();
        let id = format!("{}{}", self.prefix, *next);
        *next += 1;
        id
    }

    /// Register the module for `key`, building it with `factory` only if no
    /// equal key has been registered since the last [`clear`](Self::clear).
    pub fn register<K, F>(&self, key: &K, factory: F) -> Result<ResolvedId>
    where
        K: Serialize + ?Sized,
        F: FnOnce() -> VirtualModule,
    {
        let key = canonical_key(key)?;

        let mut inner = self.inner.lock();
        if let Some(id) = inner.keys.get(&key) {
            if let Some(slot) = inner.modules.get(id) {
                return Ok(slot.module.resolve(id));
            }
        }

        let id = self.alloc();
        let module = factory();
        trace!(id = %id.escape_debug(), kind = module.kind(), key = %key, "virtual module minted");

        let resolved = module.resolve(&id);
        inner.keys.insert(key, id.clone());
        inner.modules.insert(id, Slot { module, code: None });
        Ok(resolved)
    }

    /// Register a module that never dedupes: each call mints a new id
    pub fn register_unique(&self, module: VirtualModule) -> ResolvedId {
        let id = self.alloc();
        let resolved = module.resolve(&id);
        self.inner
            .lock()
            .modules
            .insert(id, Slot { module, code: None });
        resolved
    }

    pub fn add_external(&self, name: &str, hint: Option<&str>) -> Result<ResolvedId> {
        self.register(&("external", name, hint), || VirtualModule::External {
            name: name.to_string(),
            hint: hint.map(str::to_string),
        })
    }

    pub fn add_global(&self, name: &str, hint: Option<&str>) -> Result<ResolvedId> {
        self.register(&("global", name, hint), || VirtualModule::Global {
            name: name.to_string(),
            hint: hint.map(str::to_string),
        })
    }

    pub fn add_hot(&self, reference: &str) -> Result<ResolvedId> {
        self.register(&("hmr", reference), || VirtualModule::Hot {
            reference: reference.to_string(),
        })
    }

    /// Entries have no structural identity; every call is a new entry
    pub fn add_entry(&self, name: &str, targets: Targets, track: bool) -> ResolvedId {
        self.register_unique(VirtualModule::Entry {
            name: name.to_string(),
            targets,
            track,
        })
    }

    pub fn add_glob(&self, dir: &std::path::Path, pattern: &str) -> Result<ResolvedId> {
        self.register(&("glob", dir, pattern), || VirtualModule::Glob {
            dir: dir.to_path_buf(),
            pattern: pattern.to_string(),
        })
    }

    pub fn add_alias(&self, target: &str, importer: Option<&str>) -> Result<ResolvedId> {
        self.register(&("alias", target, importer), || VirtualModule::Alias {
            target: target.to_string(),
            importer: importer.map(str::to_string),
        })
    }

    /// Resolve a registered id.
    ///
    /// `Ok(None)` for ids outside this namespace. Routed modules are resolved
    /// by `host` against their target, and a target the host cannot resolve
    /// is an error.
    pub fn resolve(&self, id: &str, host: &dyn ResolveHost) -> Result<Option<ResolvedId>> {
        if !self.contains(id) {
            return Ok(None);
        }

        let (resolved, route) = {
            let inner = self.inner.lock();
            let slot = inner
                .modules
                .get(id)
                .ok_or_else(|| Error::UnknownVirtualModule(id.to_string()))?;
            let route = slot
                .module
                .route()
                .map(|(target, importer)| (target.to_string(), importer.map(str::to_string)));
            (slot.module.resolve(id), route)
        };

        // the host may call back into this registry
        match route {
            Some((target, importer)) => match host.resolve(&target, importer.as_deref()) {
                Some(resolved) => Ok(Some(resolved)),
                None => Err(Error::Unresolved {
                    id: target,
                    importer,
                }),
            },
            None => Ok(Some(resolved)),
        }
    }

    /// Source of a registered id, generated once and cached.
    ///
    /// `Ok(None)` for ids outside this namespace; an unknown id inside it is
    /// [`Error::UnknownVirtualModule`].
    pub fn load(&self, id: &str) -> Result<Option<String>> {
        if !self.contains(id) {
            return Ok(None);
        }

        let mut inner = self.inner.lock();
        let slot = inner
            .modules
            .get_mut(id)
            .ok_or_else(|| Error::UnknownVirtualModule(id.to_string()))?;

        if let Some(code) = &slot.code {
            return Ok(Some(code.clone()));
        }

        let code = slot.module.load()?;
        slot.code = Some(code.clone());
        Ok(Some(code))
    }

    /// The module registered under `id`
    pub fn get(&self, id: &str) -> Option<VirtualModule> {
        self.inner.lock().modules.get(id).map(|slot| slot.module.clone())
    }

    /// Forget everything; called at the start of every build
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.keys.clear();
        inner.modules.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
