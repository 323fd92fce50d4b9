//! WebSocket push transport
//!
//! One socket per manifest path, negotiated with the `hmr` subprotocol. Every
//! text frame is a manifest. The client pings on a fixed cadence and treats a
//! pong still outstanding at the next tick as a dead connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use tokio::runtime::Handle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use url::Url;

use super::{backoff, deliver, Claim, Transport, WatchSet};
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::hmr::RuntimeGraph;

pub struct WsTransport {
    graph: Arc<RuntimeGraph>,
    config: TransportConfig,
    watches: WatchSet,
    attempts: Arc<AtomicU64>,
    runtime: Handle,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("config", &self.config)
            .field("attempts", &self.connection_attempts())
            .field("shut_down", &self.watches.is_shut_down())
            .finish()
    }
}

/// Split an http(s) manifest URL into the socket URL and the chunk base
pub(crate) fn socket_urls(asset: &Url) -> Option<(Url, Url)> {
    let mut base = asset.clone();
    base.set_query(None);
    base.set_fragment(None);

    let mut socket = base.clone();
    let scheme = match base.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => return None,
    };
    socket.set_scheme(scheme).ok()?;
    Some((socket, base))
}

impl WsTransport {
    pub fn new(graph: Arc<RuntimeGraph>, config: TransportConfig) -> Result<Self> {
        HeaderValue::from_str(&config.subprotocol)
            .map_err(|e| Error::Config(format!("subprotocol {:?}: {}", config.subprotocol, e)))?;

        Ok(Self {
            graph,
            config,
            watches: WatchSet::default(),
            attempts: Arc::new(AtomicU64::new(0)),
            runtime: Handle::try_current()?,
        })
    }

    /// Connection attempts made so far, across all sockets
    pub fn connection_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Transport for WsTransport {
    fn name(&self) -> &'static str {
        "connect-ws"
    }

    fn start(&self, asset: &Url) -> bool {
        if self.watches.is_shut_down() {
            return false;
        }

        let Some((socket, base)) = socket_urls(asset) else {
            return false;
        };

        match self.watches.claim(socket.as_str()) {
            Claim::Inert => false,
            Claim::Existing => true,
            Claim::New => {
                info!(url = %socket, "hmr ws");
                let connection = Connection {
                    graph: self.graph.clone(),
                    config: self.config.clone(),
                    attempts: self.attempts.clone(),
                    cancel: self.watches.token(),
                };
                self.runtime.spawn(connection.run(socket, base));
                true
            }
        }
    }

    fn shutdown(&self) {
        self.watches.shutdown();
    }

    fn is_shut_down(&self) -> bool {
        self.watches.is_shut_down()
    }
}

struct Connection {
    graph: Arc<RuntimeGraph>,
    config: TransportConfig,
    attempts: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl Connection {
    async fn run(self, socket: Url, base: Url) {
        while !self.cancel.is_cancelled() {
            if let Err(e) = self.session(&socket, &base).await {
                debug!(url = %socket, error = %e, "socket closed");
            }

            if !backoff(&self.cancel, self.config.retry_delay).await {
                break;
            }
        }

        trace!(url = %socket, "ws loop finished");
    }

    fn request(&self, socket: &Url) -> tungstenite::Result<Request> {
        let mut request = socket.as_str().into_client_request()?;
        let protocol = HeaderValue::from_str(&self.config.subprotocol)
            .map_err(|e| tungstenite::Error::HttpFormat(e.into()))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);
        Ok(request)
    }

    /// One connection, from handshake to close
    async fn session(&self, socket: &Url, base: &Url) -> tungstenite::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let request = self.request(socket)?;

        let (stream, _) = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            connected = tokio_tungstenite::connect_async(request) => connected?,
        };
        debug!(url = %socket, "socket open");

        let (mut sink, mut stream) = stream.split();
        let period = self.config.keepalive_interval;
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.close().await;
                    return Ok(());
                }
                _ = keepalive.tick() => {
                    if awaiting_pong {
                        debug!(url = %socket, "pong overdue, dropping socket");
                        let _ = sink.close().await;
                        return Ok(());
                    }

                    awaiting_pong = true;
                    sink.send(Message::Ping(ping_payload())).await?;
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        let loaded = deliver(&self.graph, &text, base);
                        debug!(url = %socket, loaded, "manifest pushed");
                    }
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e),
                },
            }
        }
    }
}

fn ping_payload() -> Vec<u8> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
        .to_string()
        .into_bytes()
}
