//! Build-side integration
//!
//! The producer half of the protocol: what a bundler host calls while it
//! builds so that running clients can follow along.
//!
//! 1. [`HmrPlugin::build_start`] clears the virtual module registry and fixes
//!    the build's [`ModuleVersion`].
//! 2. Resolve/load/transform hooks turn `import hot from "hotswap:hmr"` into a
//!    per-module handshake.
//! 3. [`GenerationMarker::begin`] blanks the token before outputs are written,
//!    [`ManifestWriter`] writes one manifest per entry, and
//!    [`GenerationMarker::commit`] publishes a fresh token.

mod search;

pub use search::{Classification, EmittedEntry, EntrySearch, DEFAULT_ENTRY_PATTERN};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use globset::{Glob, GlobSet, GlobSetBuilder};
use parking_lot::Mutex;
use regex::Regex;
use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::LOCK_FILE;
use crate::error::{Error, Result};
use crate::hmr::ModuleVersion;
use crate::manifest::{manifest_file_name, Manifest};
use crate::virtual_module::{
    ResolveHost, ResolvedId, VirtualModuleRegistry, HMR_INDEX_ID, HOOK_ID, RUNTIME_ID,
};

/// Output naming pattern for entry chunks
pub const ENTRY_FILE_NAMES: &str = "assets/entry-[name].[hash].mjs";

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Write `content` to `path` through a sibling temp file and a rename
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, content).map_err(|e| Error::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| Error::io(path, e))
}

#[derive(Serialize)]
struct Marker<'a> {
    token: &'a str,
}

/// Writer of an output directory's generation marker
#[derive(Debug)]
pub struct GenerationMarker {
    path: PathBuf,
    last: Mutex<u64>,
}

impl GenerationMarker {
    /// Marker living in `dir` (normally `<out>/assets`)
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(LOCK_FILE),
            last: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blank the token: readers block until [`commit`](Self::commit)
    pub fn begin(&self) -> Result<()> {
        debug!(path = %self.path.display(), "output write started");
        write_atomic(&self.path, "{}")
    }

    /// Publish a new token, strictly different from the previous one
    pub fn commit(&self) -> Result<String> {
        let token = {
            let mut last = self.last.lock();
            *last = now_millis().max(*last + 1);
            last.to_string()
        };

        let content = serde_json::to_string(&Marker { token: &token })?;
        write_atomic(&self.path, &content)?;
        info!(path = %self.path.display(), %token, "generation committed");
        Ok(token)
    }
}

/// One chunk of build output, as far as manifests care
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Chunk name before file naming, e.g. `main` or `pages/home`
    pub name: String,
    /// Output path relative to the output dir
    pub file_name: String,
    pub is_entry: bool,
}

/// Groups entry chunks into manifests
#[derive(Debug, Clone)]
pub struct ManifestWriter {
    out_dir: PathBuf,
}

impl ManifestWriter {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    /// Manifest per output file name; chunks appear in output order
    pub fn collect(chunks: &[OutputChunk]) -> BTreeMap<String, Manifest> {
        let mut manifests: BTreeMap<String, Manifest> = BTreeMap::new();
        for chunk in chunks.iter().filter(|chunk| chunk.is_entry) {
            let base = Path::new(&chunk.file_name)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| chunk.file_name.clone());
            manifests
                .entry(manifest_file_name(&chunk.name))
                .or_default()
                .chunks
                .push(base);
        }
        manifests
    }

    /// Write every manifest; returns the paths written
    pub fn write(&self, chunks: &[OutputChunk]) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for (file_name, manifest) in Self::collect(chunks) {
            let path = self.out_dir.join(&file_name);
            write_atomic(&path, &manifest.to_pretty_json()?)?;
            debug!(path = %path.display(), chunks = manifest.chunks.len(), "manifest written");
            written.push(path);
        }
        Ok(written)
    }
}

fn vendor_pattern() -> &'static Regex {
    static VENDOR: OnceLock<Regex> = OnceLock::new();
    VENDOR.get_or_init(|| Regex::new(r"[\\/]node_modules[\\/]+@?(.*?)[\\/]").expect("static regex"))
}

fn word_pattern() -> &'static Regex {
    static WORD: OnceLock<Regex> = OnceLock::new();
    WORD.get_or_init(|| Regex::new(r"[A-Za-z\-]+").expect("static regex"))
}

/// Chunk a module is forced into, if any
pub fn manual_chunk(id: &str) -> Option<String> {
    if id.starts_with('\0') {
        return None;
    }

    if id == HOOK_ID {
        return Some("sys-hook".to_string());
    }

    if id == RUNTIME_ID {
        return Some("sys-runtime".to_string());
    }

    vendor_pattern()
        .captures(id)
        .and_then(|caps| caps.get(1))
        .map(|package| format!("vendor-{}", package.as_str()))
}

/// Output naming pattern for a non-entry chunk
pub fn chunk_file_name(name: &str) -> String {
    if name.starts_with("sys-") || name.starts_with("vendor-") {
        return "assets/[name].[hash].mjs".to_string();
    }

    match word_pattern().find(name) {
        Some(word) => format!("assets/app-{}.[hash].mjs", word.as_str().to_lowercase()),
        None => "assets/gen.[hash].mjs".to_string(),
    }
}

/// Hot-reload build hooks for sources under one directory
pub struct HmrPlugin {
    source_dir: PathBuf,
    mask: GlobSet,
    registry: Arc<VirtualModuleRegistry>,
    version: Mutex<ModuleVersion>,
    mtimes: Mutex<HashMap<String, u64>>,
}

impl std::fmt::Debug for HmrPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmrPlugin")
            .field("source_dir", &self.source_dir)
            .field("version", &*self.version.lock())
            .field("registry", &self.registry)
            .finish()
    }
}

pub(crate) fn glob_set(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| Error::Config(format!("glob {:?}: {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("glob set: {}", e)))
}

impl HmrPlugin {
    /// Hooks for sources under `source_dir` matching any of `mask` (all files if empty)
    pub fn new(source_dir: impl AsRef<Path>, mask: &[&str]) -> Result<Self> {
        let mask = if mask.is_empty() { &["**/*"][..] } else { mask };
        Ok(Self {
            source_dir: crate::config::absolutize(source_dir.as_ref()),
            mask: glob_set(mask)?,
            registry: Arc::new(VirtualModuleRegistry::new("hmr")),
            version: Mutex::new(ModuleVersion::default()),
            mtimes: Mutex::new(HashMap::default()),
        })
    }

    pub fn registry(&self) -> &Arc<VirtualModuleRegistry> {
        &self.registry
    }

    /// Reset per-build state and fix the version every hot module of this build gets
    pub fn build_start(&self) -> ModuleVersion {
        self.registry.clear();
        self.mtimes.lock().clear();

        let version = {
            let mut current = self.version.lock();
            *current = ModuleVersion::now().max(current.next());
            *current
        };
        debug!(%version, "build started");
        version
    }

    pub fn version(&self) -> ModuleVersion {
        *self.version.lock()
    }

    /// Source-relative reference of `id`, if it is a watched source
    fn reference(&self, id: &str) -> Option<String> {
        let relative = Path::new(id).strip_prefix(&self.source_dir).ok()?;
        let relative = relative.to_string_lossy().replace('\\', "/");
        self.mask.is_match(&relative).then_some(relative)
    }

    /// `resolveId` hook.
    ///
    /// Ids minted here are answered from the registry. An import that the host
    /// resolves to the HMR index, made from a watched source, becomes that
    /// source's hot handshake module.
    pub fn resolve_id(
        &self,
        id: &str,
        importer: Option<&str>,
        host: &dyn ResolveHost,
    ) -> Result<Option<ResolvedId>> {
        if self.registry.contains(id) {
            return self.registry.resolve(id, host);
        }

        let Some(importer) = importer else {
            return Ok(None);
        };
        let Some(reference) = self.reference(importer) else {
            return Ok(None);
        };

        match host.resolve(id, Some(importer)) {
            Some(resolved) if resolved.id == HMR_INDEX_ID && !resolved.external => {
                self.registry.add_hot(&reference).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// `load` hook
    pub fn load(&self, id: &str) -> Result<Option<String>> {
        self.registry.load(id)
    }

    /// `transform` hook: remember the source's mtime for chunk hashing
    pub fn transform(&self, id: &str) {
        if self.reference(id).is_none() {
            return;
        }

        let mtime = fs::metadata(id)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.mtimes.lock().insert(id.to_string(), mtime);
    }

    /// `augmentChunkHash` hook: newest mtime among a chunk's modules
    pub fn augment_chunk_hash<'a>(&self, modules: impl IntoIterator<Item = &'a str>) -> Option<String> {
        let mtimes = self.mtimes.lock();
        let newest = modules
            .into_iter()
            .filter_map(|id| mtimes.get(id).copied())
            .max()
            .unwrap_or_default();
        (newest > 0).then(|| newest.to_string())
    }

    /// `import.meta.<prop>` replacement: `ver` is the build version
    pub fn import_meta(&self, prop: &str) -> Option<String> {
        (prop == "ver").then(|| self.version().to_string())
    }
}
