//! Error types for the hotswap runtime

use std::path::PathBuf;
use thiserror::Error;

/// Result type for hotswap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the build side, the dev server and transport setup.
///
/// Network failures inside a running transport and unreadable generation
/// markers never show up here: those are retried internally and only logged.
#[derive(Error, Debug)]
pub enum Error {
    /// `load`/`resolve` against an id the registry never minted. Fatal for the build.
    #[error("unknown virtual module: {0}")]
    UnknownVirtualModule(String),

    /// A routed virtual module pointed at something the host could not resolve
    #[error("could not resolve: {id}, importer = {importer:?}")]
    Unresolved { id: String, importer: Option<String> },

    /// Structural key could not be turned into a comparable value
    #[error("invalid structural key: {0}")]
    InvalidKey(#[source] serde_json::Error),

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The native filesystem watch could not be installed
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// A component that spawns tasks was constructed outside a tokio runtime
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dev server error: {0}")]
    Server(#[source] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Attach a path to an I/O error
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Build an `InvalidUrl` from anything displayable
    pub fn invalid_url(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error must abort the current build
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnknownVirtualModule(_) | Self::Unresolved { .. })
    }
}
