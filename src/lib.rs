//! Hotswap: hot module replacement runtime, transports and dev server
//!
//! Hotswap swaps the implementation of a running module in place, without
//! restarting the host, and gives application code a precise lifecycle
//! contract for cleaning up and carrying state across versions. The hard part
//! is the change-notification and versioning machinery: noticing that a
//! rebuild happened, getting that fact to every running client once per
//! meaningful change, and sequencing replacement so stale or duplicate
//! notifications can never corrupt running state.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use hotswap::prelude::*;
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> hotswap::Result<()> {
//!     let loader = |url: &Url| -> anyhow::Result<()> {
//!         println!("import {}", url);
//!         Ok(())
//!     };
//!
//!     let client = HmrClient::new(Arc::new(loader), TransportConfig::default())?;
//!     client.connect();
//!     client
//!         .graph()
//!         .track(&Url::parse("http://localhost:4080/assets/entry-main.1a2b.mjs").unwrap(), None);
//!
//!     client.run(CancellationToken::new()).await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! Build output flows: [`build`] writes manifests and a generation marker →
//! [`lock`] notices → [`server`] / [`transport`] deliver → [`hmr`] swaps modules.
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Client** | [`hmr`], [`transport`], [`task`] |
//! | **Shared** | [`lock`], [`manifest`], [`config`], [`error`](Error) |
//! | **Producer** | [`build`], [`virtual_module`], [`server`] |

pub mod build;
pub mod config;
pub mod hmr;
pub mod lock;
pub mod manifest;
pub mod prelude;
pub mod server;
pub mod task;
pub mod transport;
pub mod virtual_module;

mod error;

pub use error::{Error, Result};
pub use hmr::{HmrClient, HotModuleContext, ModuleVersion, RuntimeGraph};
pub use lock::LockCoordinator;

/// Hotswap version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
