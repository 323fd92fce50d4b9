//! Development server
//!
//! One router mounted under the configured URL prefix:
//!
//! - `POST <manifest>.json?<token>`: long-poll. Blocks until the output
//!   directory's generation token differs from `<token>` (or the poll times
//!   out), then answers with the manifest and `Location: ?<next-token>`.
//! - `GET` with a WebSocket upgrade offering the `hmr` subprotocol: pushes the
//!   manifest as a text frame every time the token moves.
//! - `GET`/`HEAD`: static build output, held back while a build is writing.

mod socket;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State, WebSocketUpgrade};
use axum::http::header::{CACHE_CONTROL, CONNECTION, LOCATION, SEC_WEBSOCKET_PROTOCOL};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::{debug, info, trace};

use crate::config::{absolutize, ServerOptions, HMR_SUBPROTOCOL, LOCK_FILE, MANIFEST_EXT};
use crate::error::{Error, Result};
use crate::lock::LockCoordinator;

const IMMUTABLE: &str = "public, max-age=31536000, immutable";

pub(crate) struct Shared {
    pub options: ServerOptions,
    pub root: PathBuf,
    pub lock_dir: PathBuf,
    pub lock: Arc<LockCoordinator>,
    /// Fired when the server starts shutting down; releases blocked requests
    pub shutdown: CancellationToken,
}

type AppState = Arc<Shared>;

/// Dev server bound to its listening socket
pub struct DevServer {
    listener: TcpListener,
    shared: AppState,
}

impl std::fmt::Debug for DevServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevServer")
            .field("addr", &self.listener.local_addr().ok())
            .field("root", &self.shared.root)
            .field("url", &self.shared.options.url)
            .finish()
    }
}

impl DevServer {
    /// Bind the listener. The coordinator is shared; closing it is up to the caller.
    pub async fn bind(options: ServerOptions, lock: Arc<LockCoordinator>) -> Result<Self> {
        let addr = options.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;

        let root = absolutize(&options.root);
        let lock_dir = root.join(&options.lock_dir);
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                options,
                root,
                lock_dir,
                lock,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::Server)
    }

    /// Base URL clients should use, prefix included
    pub fn url(&self) -> Result<String> {
        Ok(format!("http://{}{}", self.local_addr()?, self.shared.options.url))
    }

    /// Serve until `cancel` fires, then let in-flight requests drain
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!(
            url = %self.url()?,
            root = %self.shared.root.display(),
            "dev server listening"
        );

        let shutdown = self.shared.shutdown.clone();
        let app = router(self.shared);
        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
                shutdown.cancel();
            })
            .await
            .map_err(Error::Server)?;

        info!("dev server stopped");
        Ok(())
    }
}

fn router(shared: AppState) -> Router {
    Router::new().fallback(dispatch).with_state(shared)
}

async fn dispatch(
    State(shared): State<AppState>,
    ws: Option<WebSocketUpgrade>,
    method: Method,
    headers: HeaderMap,
    request: Request,
) -> Response {
    let uri = request.uri().clone();
    let Some(relative) = strip_prefix(uri.path(), &shared.options.url) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(file) = contained_path(&shared.root, relative) else {
        debug!(path = %uri.path(), "path escapes root");
        return StatusCode::NOT_FOUND.into_response();
    };

    if let Some(ws) = ws {
        if method != Method::GET || !offers_protocol(&headers, HMR_SUBPROTOCOL) {
            return StatusCode::BAD_REQUEST.into_response();
        }

        let relative = relative.to_string();
        return ws
            .protocols([HMR_SUBPROTOCOL])
            .on_upgrade(move |socket| socket::push(socket, shared, file, relative));
    }

    match method {
        Method::POST if is_manifest(relative) => long_poll(&shared, &file, uri.query()).await,
        Method::GET | Method::HEAD => serve_static(&shared, relative, request).await,
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Answer one long-poll request
async fn long_poll(shared: &Shared, file: &Path, query: Option<&str>) -> Response {
    let mut token = query.unwrap_or_default().to_string();
    let next = tokio::select! {
        _ = shared.shutdown.cancelled() => String::new(),
        next = timeout(
            shared.options.poll_timeout,
            shared.lock.watch(&shared.lock_dir, &token),
        ) => next.unwrap_or_default(),
    };

    let mut body = Value::Object(Default::default());
    if !next.is_empty() {
        token = next;
        if let Some(manifest) = read_json(file).await {
            body = manifest;
        }
    }
    trace!(file = %file.display(), %token, "long-poll answered");

    let mut response = Json(body).into_response();
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    if let Ok(location) = HeaderValue::from_str(&format!("?{}", token)) {
        headers.insert(LOCATION, location);
    }
    response
}

/// Static output, served once no build is mid-write
async fn serve_static(shared: &Shared, relative: &str, request: Request) -> Response {
    // no marker at all means nothing ever writes this output
    let gated = tokio::fs::try_exists(shared.lock_dir.join(LOCK_FILE))
        .await
        .unwrap_or(false);
    let ready = !gated || tokio::select! {
        _ = shared.shutdown.cancelled() => false,
        token = timeout(shared.options.static_wait, shared.lock.watch(&shared.lock_dir, "")) => {
            // a timeout still serves whatever is on disk
            token.map(|token| !token.is_empty()).unwrap_or(true)
        }
    };
    if !ready {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let (mut parts, body) = request.into_parts();
    let target = match parts.uri.query() {
        Some(query) => format!("{}?{}", relative, query),
        None => relative.to_string(),
    };
    match target.parse::<Uri>() {
        Ok(uri) => parts.uri = uri,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    }

    let request = Request::from_parts(parts, body);
    let mut response = match ServeDir::new(&shared.root).oneshot(request).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    };

    if response.status().is_success() && relative.contains("/assets/") {
        response
            .headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static(IMMUTABLE));
    }
    response
}

async fn read_json(file: &Path) -> Option<Value> {
    let content = tokio::fs::read_to_string(file).await.ok()?;
    serde_json::from_str(&content).ok()
}

fn is_manifest(relative: &str) -> bool {
    Path::new(relative)
        .extension()
        .is_some_and(|ext| ext == MANIFEST_EXT)
}

fn offers_protocol(headers: &HeaderMap, protocol: &str) -> bool {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|offered| offered.trim() == protocol)
}

/// Path below the mount prefix, keeping its leading `/`
fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let trimmed = prefix.trim_end_matches('/');
    let rest = path.strip_prefix(trimmed)?;
    if rest.is_empty() {
        Some("/")
    } else if rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

/// Lexically join `relative` onto `root`, refusing anything that climbs out
pub(crate) fn contained_path(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in relative.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            segment => segments.push(segment),
        }
    }

    let mut path = root.to_path_buf();
    path.extend(segments);
    Some(path)
}
