//! Hotswap CLI
//!
//! Dev server, a logging HMR client and a generation-marker writer.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hotswap::build::GenerationMarker;
use hotswap::config::{ServerOptions, ServerOverrides, TransportConfig};
use hotswap::server::DevServer;
use hotswap::{HmrClient, LockCoordinator, VERSION};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser)]
#[command(name = "hotswap")]
#[command(author, version, about = "Hot module replacement dev server and client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve build output with long-poll and WebSocket change notification
    Serve(ServeArgs),

    /// Follow entry assets and log every chunk a client would load
    Watch {
        /// Entry asset URLs (`file:`, `http:` or `https:`)
        #[arg(required = true)]
        assets: Vec<String>,

        /// Retry delay after a transport failure, in milliseconds
        #[arg(long, default_value_t = 1500)]
        retry_ms: u64,
    },

    /// Publish a fresh generation token in an output directory
    Mark {
        /// Directory holding the marker (usually `<out>/assets`)
        dir: PathBuf,

        /// Blank the token instead, as at the start of a build
        #[arg(long)]
        begin: bool,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// Host to bind (env: DEV_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (env: DEV_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Build output directory (env: DEV_ROOT)
    #[arg(long)]
    root: Option<PathBuf>,

    /// URL prefix to mount under (env: DEV_URL)
    #[arg(long)]
    url: Option<String>,
}

impl From<ServeArgs> for ServerOverrides {
    fn from(args: ServeArgs) -> Self {
        let mut pairs: Vec<(&str, String)> = Vec::new();
        if let Some(host) = args.host {
            pairs.push(("host", host));
        }
        if let Some(port) = args.port {
            pairs.push(("port", port.to_string()));
        }
        if let Some(root) = args.root {
            pairs.push(("root", root.to_string_lossy().into_owned()));
        }
        if let Some(url) = args.url {
            pairs.push(("url", url));
        }
        ServerOverrides::from_pairs("", pairs)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Serve(args) => serve(args.into()).await,
        Commands::Watch { assets, retry_ms } => watch(&assets, retry_ms).await,
        Commands::Mark { dir, begin } => mark(dir, begin),
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Cancelled on Ctrl-C
fn interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            return;
        }
        token.cancel();
    });
    cancel
}

async fn serve(cli: ServerOverrides) -> Result<()> {
    let options = ServerOptions::layered(cli);
    let lock = Arc::new(LockCoordinator::new()?);
    let server = DevServer::bind(options, lock.clone())
        .await
        .context("starting dev server")?;

    println!("hotswap {} dev server", VERSION);
    println!("    url:  {}", server.url()?);

    let result = server.run(interrupt()).await;
    lock.close();
    Ok(result?)
}

async fn watch(assets: &[String], retry_ms: u64) -> Result<()> {
    let cwd = std::env::current_dir().context("reading current directory")?;
    let base = Url::from_directory_path(&cwd)
        .map_err(|_| anyhow::anyhow!("current directory is not a valid base url"))?;

    let loader = |url: &Url| -> anyhow::Result<()> {
        println!("load {}", url);
        Ok(())
    };
    let config = TransportConfig {
        retry_delay: std::time::Duration::from_millis(retry_ms),
        ..TransportConfig::default()
    };
    let client = HmrClient::new(Arc::new(loader), config)?;

    for asset in assets {
        let url = base
            .join(asset)
            .with_context(|| format!("invalid asset url: {}", asset))?;
        if !client.graph().track(&url, None) {
            warn!(url = %url, "asset not tracked");
        }
    }
    client.connect();
    info!(tracked = client.graph().urls().len(), "watching");

    client.run(interrupt()).await;
    Ok(())
}

fn mark(dir: PathBuf, begin: bool) -> Result<()> {
    let marker = GenerationMarker::new(&dir);
    if begin {
        marker.begin()?;
        println!("{}: cleared", marker.path().display());
    } else {
        let token = marker.commit()?;
        println!("{}: {}", marker.path().display(), token);
    }
    Ok(())
}
