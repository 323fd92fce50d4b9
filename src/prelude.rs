//! Prelude module for convenient imports
//!
//! ```no_run
//! use hotswap::prelude::*;
//! ```

// Client runtime
pub use crate::hmr::{
    ChunkLoader, Event, HandlerId, HmrClient, HotModuleContext, Meta, ModuleVersion, RuntimeGraph,
    State,
};
pub use crate::task::TaskQueue;

// Transports
pub use crate::transport::{FetchTransport, FsTransport, Transport, WsTransport};

// Change detection
pub use crate::lock::LockCoordinator;
pub use crate::manifest::Manifest;

// Error handling
pub use crate::error::{Error, Result};

// Configuration
pub use crate::config::{ServerOptions, ServerOverrides, TransportConfig};

// Build side
pub use crate::build::{EntrySearch, GenerationMarker, HmrPlugin, ManifestWriter};
pub use crate::virtual_module::{ResolvedId, VirtualModule, VirtualModuleRegistry};

// Dev server
pub use crate::server::DevServer;

pub use tokio_util::sync::CancellationToken;
