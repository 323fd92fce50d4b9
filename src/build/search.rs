//! Entry point discovery
//!
//! Walks a source directory for files matching the entry patterns and lets
//! per-kind classifiers decide what each one becomes. A file's *kind* is its
//! stem (`browser-entry` for `app/browser-entry.tsx`) and its *name* is the
//! containing directory (`app`). Files sharing both are classified together:
//! the first one is the candidate, the rest are passed along as extras.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::GlobSet;
use tracing::debug;
use walkdir::WalkDir;

use super::glob_set;
use crate::error::Result;
use crate::virtual_module::{ResolvedId, Targets, VirtualModuleRegistry};

/// Pattern used when no entry patterns are given
pub const DEFAULT_ENTRY_PATTERN: &str = "**/*-entry.{cjs,mjs,js,jsx,ts,tsx}";

/// Verdict of a classifier on one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Not my call; try the next classifier
    Pass,
    /// Not an entry; stop classifying this candidate
    Skip,
    /// Entry that re-exports the candidate itself
    Accept,
    /// Entry built from these imports, named after the directory
    Imports(Targets),
    /// Entry with an explicit name
    Named { name: String, imports: Targets },
}

type Classifier = Box<dyn Fn(&str, &Path, &[PathBuf]) -> Classification + Send + Sync>;

/// An entry chunk the build should emit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedEntry {
    pub name: String,
    pub id: ResolvedId,
}

pub struct EntrySearch {
    dir: PathBuf,
    filter: GlobSet,
    classifiers: Vec<(String, Classifier)>,
    registry: Arc<VirtualModuleRegistry>,
    track: bool,
}

impl std::fmt::Debug for EntrySearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntrySearch")
            .field("dir", &self.dir)
            .field(
                "kinds",
                &self.classifiers.iter().map(|(kind, _)| kind).collect::<Vec<_>>(),
            )
            .field("track", &self.track)
            .finish()
    }
}

impl EntrySearch {
    pub fn new(
        dir: impl AsRef<Path>,
        patterns: &[&str],
        registry: Arc<VirtualModuleRegistry>,
    ) -> Result<Self> {
        let patterns = if patterns.is_empty() {
            &[DEFAULT_ENTRY_PATTERN][..]
        } else {
            patterns
        };

        Ok(Self {
            dir: crate::config::absolutize(dir.as_ref()),
            filter: glob_set(patterns)?,
            classifiers: Vec::new(),
            registry,
            track: false,
        })
    }

    /// Register a classifier for files of `kind`. Classifiers run in
    /// registration order until one decides.
    pub fn classify<F>(mut self, kind: &str, classifier: F) -> Self
    where
        F: Fn(&str, &Path, &[PathBuf]) -> Classification + Send + Sync + 'static,
    {
        self.classifiers.push((kind.to_string(), Box::new(classifier)));
        self
    }

    /// Accept every file of `kind` as an entry of its own
    pub fn accept(self, kind: &str) -> Self {
        self.classify(kind, |_, _, _| Classification::Accept)
    }

    /// Make emitted entries register themselves with the client runtime
    pub fn tracked(mut self, track: bool) -> Self {
        self.track = track;
        self
    }

    /// Candidate files grouped by `<name>/<kind>`, in path order
    fn groups(&self) -> BTreeMap<String, Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.dir)
                    .map(|relative| self.filter.is_match(relative))
                    .unwrap_or(false)
            })
            .map(|entry| entry.into_path())
            .collect();
        files.sort();

        let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for file in files {
            let key = format!("{}/{}", dir_name(&file), kind_of(&file));
            groups.entry(key).or_default().push(file);
        }
        groups
    }

    /// Discover and classify entries, registering one entry module per hit
    pub fn discover(&self) -> Vec<EmittedEntry> {
        let mut emitted = Vec::new();
        for files in self.groups().into_values() {
            let Some((candidate, extra)) = files.split_first() else {
                continue;
            };
            let kind = kind_of(candidate);
            let dir = dir_name(candidate);

            for (_, classifier) in self.classifiers.iter().filter(|(k, _)| *k == kind) {
                let (name, targets) = match classifier(&dir, candidate, extra) {
                    Classification::Pass => continue,
                    Classification::Skip => break,
                    Classification::Accept => {
                        (dir.clone(), Targets::Single(path_string(candidate)))
                    }
                    Classification::Imports(targets) => (dir.clone(), targets),
                    Classification::Named { name, imports } => (name, imports),
                };

                let id = self.registry.add_entry(&name, targets, self.track);
                debug!(%name, file = %candidate.display(), "entry discovered");
                emitted.push(EmittedEntry { name, id });
                break;
            }
        }

        emitted
    }
}

fn kind_of(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn dir_name(path: &Path) -> String {
    path.parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_name() {
        let path = Path::new("/src/app/browser-entry.tsx");
        assert_eq!(kind_of(path), "browser-entry");
        assert_eq!(dir_name(path), "app");
    }
}
