//! HTTP long-poll transport
//!
//! `POST <manifest>?<token>` blocks on the server until the token moves or the
//! poll times out. A 200 carries the manifest body and `Location: ?<next>`,
//! which becomes the next poll URL.

use std::sync::Arc;

use reqwest::header::LOCATION;
use reqwest::Client;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use url::Url;

use super::{backoff, deliver, Claim, Transport, WatchSet};
use crate::config::TransportConfig;
use crate::error::Result;
use crate::hmr::RuntimeGraph;

pub struct FetchTransport {
    graph: Arc<RuntimeGraph>,
    client: Client,
    config: TransportConfig,
    watches: Arc<WatchSet>,
    runtime: Handle,
}

impl std::fmt::Debug for FetchTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchTransport")
            .field("config", &self.config)
            .field("shut_down", &self.watches.is_shut_down())
            .finish()
    }
}

/// Poll base of a manifest: same path, empty query, no fragment
pub(crate) fn poll_base(asset: &Url) -> Url {
    let mut base = asset.clone();
    base.set_query(Some(""));
    base.set_fragment(None);
    base
}

enum Step {
    Next(Url),
    Stop,
    Retry,
}

impl FetchTransport {
    pub fn new(graph: Arc<RuntimeGraph>, config: TransportConfig) -> Result<Self> {
        Ok(Self {
            graph,
            client: Client::builder().build()?,
            config,
            watches: Arc::new(WatchSet::default()),
            runtime: Handle::try_current()?,
        })
    }

    /// Whether a poll loop is live for the manifest at `asset`
    pub fn is_polling(&self, asset: &Url) -> bool {
        self.watches.contains(poll_base(asset).as_str())
    }
}

impl Transport for FetchTransport {
    fn name(&self) -> &'static str {
        "connect-fetch"
    }

    fn start(&self, asset: &Url) -> bool {
        if self.watches.is_shut_down() || !matches!(asset.scheme(), "http" | "https") {
            return false;
        }

        let base = poll_base(asset);
        match self.watches.claim(base.as_str()) {
            Claim::Inert => false,
            Claim::Existing => true,
            Claim::New => {
                info!(url = %base, "hmr fetch");
                let poller = Poller {
                    graph: self.graph.clone(),
                    client: self.client.clone(),
                    config: self.config.clone(),
                    watches: self.watches.clone(),
                    cancel: self.watches.token(),
                };
                self.runtime.spawn(poller.run(base));
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

struct Poller {
    graph: Arc<RuntimeGraph>,
    client: Client,
    config: TransportConfig,
    watches: Arc<WatchSet>,
    cancel: CancellationToken,
}

impl Poller {
    async fn run(self, base: Url) {
        let mut next = base.clone();
        while !self.cancel.is_cancelled() {
            let step = tokio::select! {
                _ = self.cancel.cancelled() => break,
                step = self.poll(&next, &base) => step,
            };

            match step {
                Step::Next(url) => next = url,
                Step::Stop => break,
                Step::Retry => {
                    if !backoff(&self.cancel, self.config.retry_delay).await {
                        break;
                    }
                }
            }
        }

        // a loop that ended on its own may be reopened by a later start()
        self.watches.release(base.as_str());
        trace!(url = %base, "fetch loop finished");
    }

    async fn poll(&self, url: &Url, base: &Url) -> Step {
        let response = match self.client.post(url.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %url, error = %e, "long-poll failed, retrying");
                return Step::Retry;
            }
        };

        let status = response.status();
        if !status.is_success() {
            debug!(url = %url, %status, "long-poll rejected, stopping");
            return Step::Stop;
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                debug!(url = %url, error = %e, "long-poll body failed, retrying");
                return Step::Retry;
            }
        };
        deliver(&self.graph, &body, base);

        let Some(location) = location else {
            return Step::Stop;
        };

        match url.join(&location) {
            Ok(next) => Step::Next(next),
            Err(e) => {
                debug!(location = %location, error = %e, "bad Location header");
                Step::Stop
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_base_strips_query_and_fragment() {
        let asset = Url::parse("http://h:1/assets/main.json?123#x").unwrap();
        assert_eq!(poll_base(&asset).as_str(), "http://h:1/assets/main.json?");
    }

    #[test]
    fn test_location_follows_relative_token() {
        let base = poll_base(&Url::parse("http://h/assets/main.json").unwrap());
        let next = base.join("?1700000000000").unwrap();
        assert_eq!(next.as_str(), "http://h/assets/main.json?1700000000000");
    }
}
