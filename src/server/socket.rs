//! Server side of the push socket

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::Shared;

/// Push the manifest at `file` every time the output token moves.
///
/// Starts from an empty token, so a (re)connecting client immediately gets
/// the current manifest if a build has completed.
pub(super) async fn push(socket: WebSocket, shared: Arc<Shared>, file: PathBuf, path: String) {
    debug!(%path, "push socket open");
    let (mut sink, mut stream) = socket.split();

    let period = shared.options.keepalive;
    let mut keepalive = interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut outstanding: Option<Vec<u8>> = None;
    let mut token = String::new();

    loop {
        // dropping a pending watch is harmless: the next one catches up
        // with any token published in between
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            next = shared.lock.watch(&shared.lock_dir, &token) => {
                if next.is_empty() {
                    break;
                }

                token = next;
                match tokio::fs::read_to_string(&file).await {
                    Ok(content) => {
                        if sink.send(Message::Text(content)).await.is_err() {
                            break;
                        }
                        trace!(%path, %token, "manifest pushed");
                    }
                    Err(e) => trace!(%path, error = %e, "manifest unreadable"),
                }
            }
            _ = keepalive.tick() => {
                if outstanding.is_some() {
                    debug!(%path, "client missed a pong, closing");
                    break;
                }

                let stamp = stamp();
                outstanding = Some(stamp.clone());
                if sink.send(Message::Ping(stamp)).await.is_err() {
                    break;
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Pong(data))) => {
                    if outstanding.as_deref() == Some(data.as_slice()) {
                        outstanding = None;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sink.close().await;
    debug!(%path, "push socket closed");
}

fn stamp() -> Vec<u8> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
        .to_string()
        .into_bytes()
}
