//! The kinds of synthetic module and the source each one generates

use std::path::{Path, PathBuf};

use globset::GlobBuilder;
use serde_json::Value;
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Import id of the client runtime (`create`, `track`)
pub const RUNTIME_ID: &str = "hotswap:runtime";

/// Import id of the host hooks (`__import`, `__global`)
pub const HOOK_ID: &str = "hotswap:hook";

/// Import id application modules use to ask for their hot context
pub const HMR_INDEX_ID: &str = "hotswap:hmr";

/// Export name that carries synthetic named exports
pub const SYNTHETIC_EXPORTS: &str = "__exports";

/// What an entry point aggregates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    /// Re-export one module, default export included
    Single(String),
    /// Await `boot(...lazy imports of the rest)`, the first element is `boot`
    Boot(Vec<String>),
}

impl From<&str> for Targets {
    fn from(value: &str) -> Self {
        Self::Single(value.to_string())
    }
}

impl From<Vec<String>> for Targets {
    fn from(value: Vec<String>) -> Self {
        Self::Boot(value)
    }
}

/// Answer to a resolution request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedId {
    pub id: String,
    /// Name of the export that provides missing named exports
    pub synthetic_named_exports: Option<String>,
    pub external: bool,
}

impl ResolvedId {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            synthetic_named_exports: None,
            external: false,
        }
    }

    pub fn synthetic(id: impl Into<String>) -> Self {
        Self {
            synthetic_named_exports: Some(SYNTHETIC_EXPORTS.to_string()),
            ..Self::new(id)
        }
    }
}

/// A synthetic module minted by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualModule {
    /// Shim that imports a package through the host loader
    External { name: String, hint: Option<String> },
    /// Shim that exposes an injected global as a default export
    Global { name: String, hint: Option<String> },
    /// Per-module handshake returning the module's hot context
    Hot { reference: String },
    /// Aggregate entry point, optionally tracked by the client runtime
    Entry {
        name: String,
        targets: Targets,
        track: bool,
    },
    /// Lazy import map of every file under `dir` that matches `pattern`
    Glob { dir: PathBuf, pattern: String },
    /// Delegates resolution to another id
    Alias {
        target: String,
        importer: Option<String>,
    },
}

/// Quote values as JS string literals, comma separated
fn expand<'a>(values: impl IntoIterator<Item = Option<&'a str>>) -> String {
    values
        .into_iter()
        .map(|value| value.map_or_else(|| Value::Null.to_string(), |v| Value::from(v).to_string()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn quote(value: &str) -> String {
    expand([Some(value)])
}

impl VirtualModule {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::External { .. } => "external",
            Self::Global { .. } => "global",
            Self::Hot { .. } => "hmr",
            Self::Entry { .. } => "entry",
            Self::Glob { .. } => "glob",
            Self::Alias { .. } => "alias",
        }
    }

    /// Resolution of this module under its minted `id`
    pub fn resolve(&self, id: &str) -> ResolvedId {
        match self {
            Self::External { .. } => ResolvedId::synthetic(id),
            Self::Entry {
                targets: Targets::Boot(_),
                ..
            } => ResolvedId::synthetic(id),
            _ => ResolvedId::new(id),
        }
    }

    /// Where resolution is delegated to, if anywhere
    pub fn route(&self) -> Option<(&str, Option<&str>)> {
        match self {
            Self::Alias { target, importer } => Some((target, importer.as_deref())),
            _ => None,
        }
    }

    /// Generate the module source
    pub fn load(&self) -> Result<String> {
        let code = match self {
            Self::External { name, hint } => format!(
                "import {{ __import }} from {};\nexport const __exports = await __import({});\n",
                quote(HOOK_ID),
                expand([Some(name.as_str()), hint.as_deref()]),
            ),
            Self::Global { name, hint } => format!(
                "import {{ __global }} from {};\nconst value = await __global({});\nexport default value;\n",
                quote(HOOK_ID),
                expand([Some(name.as_str()), hint.as_deref()]),
            ),
            Self::Hot { reference } => format!(
                "import {{ create }} from {};\nconst hmr = create({}, import.meta.ver);\nexport default hmr;\n",
                quote(RUNTIME_ID),
                quote(reference),
            ),
            Self::Entry {
                name,
                targets,
                track,
            } => entry_source(name, targets, *track),
            Self::Glob { dir, pattern } => glob_source(dir, pattern)?,
            Self::Alias { target, .. } => format!(
                "export * from {0};\nimport * as __module from {0};\nexport default __module.default;\n",
                quote(target),
            ),
        };

        Ok(code)
    }
}

fn entry_source(name: &str, targets: &Targets, track: bool) -> String {
    let mut code = String::new();
    if track {
        code.push_str(&format!(
            "import {{ track }} from {};\ntrack(import.meta.url, {});\n",
            quote(RUNTIME_ID),
            quote(&format!("{}.json", name)),
        ));
    }

    match targets {
        Targets::Single(target) => {
            let target = quote(target);
            code.push_str(&format!("export * from {};\n", target));
            code.push_str(&format!("import * as __module from {};\n", target));
            code.push_str("const { default: __default } = __module;\n");
            code.push_str("export default __default;\n");
        }
        Targets::Boot(targets) => {
            let (boot, rest) = match targets.split_first() {
                Some((boot, rest)) => (boot.as_str(), rest),
                None => ("", &[][..]),
            };
            code.push_str(&format!("import boot from {};\n", quote(boot)));
            code.push_str("export const __exports = await boot(\n");
            for target in rest {
                code.push_str(&format!("    () => import({}),\n", quote(target)));
            }
            code.push_str(");\n");
        }
    }

    code
}

fn glob_source(dir: &Path, pattern: &str) -> Result<String> {
    let matcher = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| Error::Config(format!("glob {:?}: {}", pattern, e)))?
        .compile_matcher();

    let mut files: Vec<String> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let relative = entry.path().strip_prefix(dir).ok()?;
            let relative = relative.to_string_lossy().replace('\\', "/");
            matcher.is_match(&relative).then_some(relative)
        })
        .collect();
    files.sort();

    let mut code = String::from("export default {\n");
    for file in files {
        let absolute = dir.join(&file).to_string_lossy().replace('\\', "/");
        code.push_str(&format!(
            "    {}: () => import({}),\n",
            quote(&format!("./{}", file)),
            quote(&absolute),
        ));
    }
    code.push_str("};\n");
    Ok(code)
}
