//! Manifest assets
//!
//! One small JSON document per tracked entry point, listing the chunk files
//! that currently make up that entry:
//!
//! ```text
//! { "chunks": ["entry-main.5f2a9c.mjs", "app-button.77e0d1.mjs"] }
//! ```
//!
//! Chunk entries are resolved relative to the manifest's own URL.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::MANIFEST_EXT;
use crate::error::{Error, Result};

/// The `{ "chunks": [...] }` document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub chunks: Vec<String>,
}

impl Manifest {
    pub fn new<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a manifest body.
    ///
    /// Anything other than an object whose `chunks` is an array of strings
    /// yields `None`; callers treat that as "nothing to load".
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Absolute chunk URLs, resolved against `base`. Unresolvable entries are skipped.
    pub fn resolve(&self, base: &Url) -> Vec<Url> {
        self.chunks
            .iter()
            .filter_map(|chunk| base.join(chunk).ok())
            .collect()
    }

    /// Pretty JSON with four-space indentation, as written to disk
    pub fn to_pretty_json(&self) -> Result<String> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut ser)?;
        String::from_utf8(out).map_err(|e| Error::Config(e.to_string()))
    }
}

fn hashed_asset_suffix() -> &'static Regex {
    static SUFFIX: OnceLock<Regex> = OnceLock::new();
    SUFFIX.get_or_init(|| Regex::new(r"\..*?\.[cm]?js$").expect("static regex"))
}

/// Derive the manifest URL that tracks an entry asset.
///
/// The asset filename's trailing `.<hash>.<ext>` becomes `.json`, query and
/// fragment are dropped, and `hint` (if any) is resolved against the result:
///
/// ```text
/// http://h/assets/entry-main.5f2a9c.mjs?x=1      -> http://h/assets/entry-main.json
/// http://h/assets/entry-main.5f2a9c.mjs + "main.json" -> http://h/assets/main.json
/// ```
pub fn manifest_url(asset: &Url, hint: Option<&str>) -> Result<Url> {
    let mut url = asset.clone();
    let rewritten = {
        let path = url.path();
        let (dir, file) = match path.rfind('/') {
            Some(i) => path.split_at(i + 1),
            None => ("", path),
        };
        let file = hashed_asset_suffix().replace(file, format!(".{}", MANIFEST_EXT));
        format!("{}{}", dir, file)
    };
    url.set_path(&rewritten);
    url.set_query(None);
    url.set_fragment(None);

    match hint {
        Some(hint) => url
            .join(hint)
            .map_err(|e| Error::invalid_url(hint, e)),
        None => Ok(url),
    }
}

/// File name (relative to the output dir) of the manifest for an entry
pub fn manifest_file_name(entry_name: &str) -> String {
    let name: String = entry_name
        .split(['/', '\\'])
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    format!("assets/{}.{}", name, MANIFEST_EXT)
}
